//! CLI argument definitions.
//!
//! All Clap derive structs for `conductor` command-line parsing.

use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};

use crate::phase::PhaseKind;

// ============================================================================
// Root CLI
// ============================================================================

/// Distributed shell-command orchestration for network tests.
#[derive(Parser, Debug)]
#[command(name = "conductor", author, version, about)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all non-error output.
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Color output control.
    #[arg(long, default_value = "auto", global = true, env = "CONDUCTOR_COLOR")]
    pub color: ColorChoice,
}

// ============================================================================
// Top-Level Commands
// ============================================================================

/// Top-level subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Drive a test run across the configured players.
    Conduct(ConductArgs),

    /// Run as a player, executing phases on the conductor's behalf.
    Player(PlayerArgs),
}

// ============================================================================
// Conduct Command
// ============================================================================

/// Arguments for `conduct`.
#[derive(Args, Debug)]
pub struct ConductArgs {
    /// Path to the YAML test configuration file.
    #[arg(short, long, env = "CONDUCTOR_CONFIG")]
    pub config: PathBuf,

    /// Override the config's trial count.
    #[arg(long)]
    pub trials: Option<u32>,

    /// Run only these phases each trial (comma-separated).
    #[arg(long, value_delimiter = ',')]
    pub phases: Option<Vec<PhaseKind>>,

    /// Print the plan the config describes, without touching the network.
    #[arg(long)]
    pub dry_run: bool,

    /// Report output format.
    #[arg(short, long, default_value = "human")]
    pub format: OutputFormat,
}

// ============================================================================
// Player Command
// ============================================================================

/// Arguments for `player`.
#[derive(Args, Debug)]
pub struct PlayerArgs {
    /// Path to the YAML player configuration file.
    #[arg(short, long, env = "CONDUCTOR_PLAYER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Override the bind address.
    #[arg(long)]
    pub bind: Option<String>,

    /// Override the command port.
    #[arg(short, long)]
    pub port: Option<u16>,
}

// ============================================================================
// CLI-Local Enums
// ============================================================================

/// Color output choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum ColorChoice {
    /// Auto-detect terminal support.
    #[default]
    Auto,
    /// Always use color.
    Always,
    /// Never use color.
    Never,
}

/// Output format for structured output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable output.
    #[default]
    Human,
    /// JSON output.
    Json,
}

// ============================================================================
// Tests
// ============================================================================
