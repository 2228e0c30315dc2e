//! CLI command dispatch and handlers.
//!
//! Routes parsed CLI arguments to the appropriate command handler.

pub mod conduct;
pub mod player;

use tokio_util::sync::CancellationToken;

use crate::cli::args::{Cli, Commands};
use crate::error::ConductorError;

/// Dispatch a parsed CLI invocation to the appropriate command handler.
///
/// # Errors
///
/// Returns an error if the dispatched command handler fails.
pub async fn dispatch(cli: Cli, cancel: CancellationToken) -> Result<(), ConductorError> {
    match cli.command {
        Commands::Conduct(args) => conduct::run(&args, cancel).await,
        Commands::Player(args) => player::run(&args, cancel).await,
    }
}
