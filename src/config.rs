//! Configuration loading for both roles.
//!
//! A test config drives the conductor: trial count, player endpoints,
//! and the command list for each of the four phases. A player config is
//! just a bind address. Both are YAML, deserialized to typed structs
//! and validated before anything touches the network.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::phase::PhaseKind;

/// Default port a player's command listener binds.
pub const DEFAULT_CMD_PORT: u16 = 6970;

/// Default port the conductor's results listener binds.
pub const DEFAULT_RESULTS_PORT: u16 = 6971;

/// Default timeout for connects and acks, in seconds.
pub const DEFAULT_CMD_TIMEOUT_SECS: u64 = 30;

/// Default idle timeout while collecting results, in seconds.
pub const DEFAULT_COLLECT_TIMEOUT_SECS: u64 = 30;

/// Conductor-side test configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TestConfig {
    /// Number of trials to run.
    #[serde(default = "default_trials")]
    pub trials: u32,

    /// Where players deliver results.
    #[serde(default)]
    pub conductor: ConductorSection,

    /// Players taking part in the run.
    pub players: Vec<PlayerEndpoint>,

    /// Commands for each phase kind.
    #[serde(default)]
    pub phases: PhaseCommands,

    /// Timeout for connects and phase/run acks, in seconds.
    #[serde(default = "default_cmd_timeout")]
    pub cmd_timeout_secs: u64,

    /// Idle timeout while collecting results, in seconds.
    #[serde(default = "default_collect_timeout")]
    pub collect_timeout_secs: u64,
}

/// The conductor's own results endpoint, as players should see it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConductorSection {
    /// Address players connect back to with results.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port of the results listener.
    #[serde(default = "default_results_port")]
    pub results_port: u16,
}

impl Default for ConductorSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            results_port: default_results_port(),
        }
    }
}

/// One player: where to send commands and where its results land.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlayerEndpoint {
    /// Host the player listens on.
    pub host: String,

    /// Command port.
    #[serde(default = "default_cmd_port")]
    pub cmd_port: u16,

    /// Results port override; defaults to the conductor section's port.
    #[serde(default)]
    pub results_port: Option<u16>,
}

impl PlayerEndpoint {
    /// Returns the `host:port` name the conductor uses for this player.
    #[must_use]
    pub fn name(&self) -> String {
        format!("{}:{}", self.host, self.cmd_port)
    }
}

/// Raw command lists per phase kind.
///
/// Commands keep the step prefix grammar (`spawn:`, `timeout<N>:`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PhaseCommands {
    /// Startup phase commands.
    #[serde(default)]
    pub startup: Vec<String>,
    /// Run phase commands.
    #[serde(default)]
    pub run: Vec<String>,
    /// Collect phase commands.
    #[serde(default)]
    pub collect: Vec<String>,
    /// Reset phase commands.
    #[serde(default)]
    pub reset: Vec<String>,
}

impl PhaseCommands {
    /// Returns the command list for the given kind.
    #[must_use]
    pub fn for_kind(&self, kind: PhaseKind) -> &[String] {
        match kind {
            PhaseKind::Startup => &self.startup,
            PhaseKind::Run => &self.run,
            PhaseKind::Collect => &self.collect,
            PhaseKind::Reset => &self.reset,
        }
    }
}

impl TestConfig {
    /// Loads and validates a test configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read, parsed, or
    /// fails validation.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Unreadable {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let config: Self = serde_yaml::from_str(&raw).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validates field constraints that the type system cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] naming the offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.trials == 0 {
            return Err(ConfigError::InvalidValue {
                field: "trials".to_string(),
                value: "0".to_string(),
                expected: "at least 1".to_string(),
            });
        }
        if self.players.is_empty() {
            return Err(ConfigError::NoPlayers);
        }
        for player in &self.players {
            if player.host.is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "players.host".to_string(),
                    value: String::new(),
                    expected: "a non-empty host".to_string(),
                });
            }
            if player.cmd_port == 0 {
                return Err(ConfigError::InvalidValue {
                    field: "players.cmd_port".to_string(),
                    value: "0".to_string(),
                    expected: "a non-zero port".to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Player-side configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlayerConfig {
    /// Address the command listener binds.
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Port the command listener binds.
    #[serde(default = "default_cmd_port")]
    pub port: u16,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_cmd_port(),
        }
    }
}

impl PlayerConfig {
    /// Loads a player configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Unreadable {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        serde_yaml::from_str(&raw).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }
}

const fn default_trials() -> u32 {
    1
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

const fn default_cmd_port() -> u16 {
    DEFAULT_CMD_PORT
}

const fn default_results_port() -> u16 {
    DEFAULT_RESULTS_PORT
}

const fn default_cmd_timeout() -> u64 {
    DEFAULT_CMD_TIMEOUT_SECS
}

const fn default_collect_timeout() -> u64 {
    DEFAULT_COLLECT_TIMEOUT_SECS
}
