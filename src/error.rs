//! Error types for `conductor`.
//!
//! The error taxonomy mirrors how failures propagate through a run:
//! protocol errors are fatal to one connection, network errors are fatal
//! to one player for one phase, and configuration errors are fatal to the
//! whole invocation. Command failures never appear here; the step
//! executor degrades them to `RetVal` results instead.

use std::path::PathBuf;
use thiserror::Error;

// ============================================================================
// Exit Codes
// ============================================================================

/// Exit codes for `conductor` CLI operations.
pub struct ExitCode;

impl ExitCode {
    /// Successful execution
    pub const SUCCESS: i32 = 0;

    /// General error
    pub const ERROR: i32 = 1;

    /// Configuration error (invalid YAML, validation failure)
    pub const CONFIG_ERROR: i32 = 2;

    /// I/O error (file not found, bind failure)
    pub const IO_ERROR: i32 = 3;

    /// Protocol error (bad frame, version mismatch)
    pub const PROTOCOL_ERROR: i32 = 4;

    /// Network error (connect refused, idle timeout)
    pub const NETWORK_ERROR: i32 = 5;

    /// Phase engine error (invalid state transition)
    pub const PHASE_ERROR: i32 = 6;

    /// Usage error (invalid arguments)
    pub const USAGE_ERROR: i32 = 64;

    /// Interrupted by SIGINT (Ctrl+C)
    pub const INTERRUPTED: i32 = 130;

    /// Terminated by SIGTERM
    pub const TERMINATED: i32 = 143;
}

// ============================================================================
// Top-Level Error
// ============================================================================

/// Top-level error type for `conductor` operations.
///
/// Aggregates all domain-specific errors and provides a unified
/// interface for error handling and exit code mapping.
#[derive(Debug, Error)]
pub enum ConductorError {
    /// Configuration loading or validation error
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Wire protocol error
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Network error talking to a player
    #[error(transparent)]
    Network(#[from] NetworkError),

    /// Phase engine error
    #[error(transparent)]
    Phase(#[from] PhaseError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ConductorError {
    /// Returns the appropriate exit code for this error.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => ExitCode::CONFIG_ERROR,
            Self::Protocol(_) | Self::Json(_) => ExitCode::PROTOCOL_ERROR,
            Self::Network(_) => ExitCode::NETWORK_ERROR,
            Self::Phase(_) => ExitCode::PHASE_ERROR,
            Self::Io(_) => ExitCode::IO_ERROR,
        }
    }
}

// ============================================================================
// Protocol Errors
// ============================================================================

/// Wire protocol errors.
///
/// Fatal to the offending connection only; a player's listener loop and
/// the conductor's trial loop both survive them.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// I/O error during frame transmission
    #[error("protocol I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Declared frame length exceeds the configured limit
    #[error("message too large: {size} bytes (limit: {limit})")]
    FrameTooLarge {
        /// Declared body size in bytes
        size: usize,
        /// Configured size limit in bytes
        limit: usize,
    },

    /// Stream closed mid-header or mid-body
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// Frame body is structurally invalid (not an object, missing fields)
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Message carries an unsupported protocol version
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u64),

    /// Message type string is not one of the six known types
    #[error("unknown message type: {0}")]
    UnknownType(String),
}

// ============================================================================
// Network Errors
// ============================================================================

/// Network errors talking to a player.
///
/// These mark one player as failed for the current phase; the conductor
/// proceeds with the remaining players.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// Failed to establish a connection
    #[error("failed to connect to {addr}: {reason}")]
    ConnectFailed {
        /// Address we tried to reach
        addr: String,
        /// Underlying failure
        reason: String,
    },

    /// Timed out waiting for an acknowledgment
    #[error("timed out waiting for ack from {0}")]
    AckTimeout(String),

    /// Timed out waiting for results
    #[error("idle timeout collecting results from {0}")]
    IdleTimeout(String),

    /// Protocol failure on an established connection
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Player acknowledged with an error
    #[error("player {player} rejected the request: {message}")]
    Rejected {
        /// Player that sent the error ack
        player: String,
        /// Message from the error ack
        message: String,
    },
}

// ============================================================================
// Phase Engine Errors
// ============================================================================

/// Phase engine state machine errors.
#[derive(Debug, Error)]
pub enum PhaseError {
    /// Attempted an operation not valid in the current state
    #[error("invalid phase transition: {action} while {state}")]
    InvalidTransition {
        /// Operation that was attempted
        action: &'static str,
        /// State the phase was in
        state: &'static str,
    },
}

// ============================================================================
// Configuration Errors
// ============================================================================

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Configuration file could not be read
    #[error("cannot read {path}: {reason}")]
    Unreadable {
        /// Path to the configuration file
        path: PathBuf,
        /// Underlying I/O failure
        reason: String,
    },

    /// YAML parsing failed
    #[error("parse error in {path}: {message}")]
    ParseError {
        /// Path to the configuration file
        path: PathBuf,
        /// Error message from the parser
        message: String,
    },

    /// Field has an invalid value
    #[error("invalid value for '{field}': got '{value}', expected {expected}")]
    InvalidValue {
        /// Name of the field with the invalid value
        field: String,
        /// The actual value provided
        value: String,
        /// Description of what was expected
        expected: String,
    },

    /// No players configured for a run
    #[error("no players configured")]
    NoPlayers,
}

/// Result type alias for `conductor` operations.
pub type Result<T> = std::result::Result<T, ConductorError>;
