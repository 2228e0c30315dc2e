//! The `player` command handler.

use tokio_util::sync::CancellationToken;

use crate::cli::args::PlayerArgs;
use crate::config::PlayerConfig;
use crate::error::ConductorError;
use crate::player::{Player, PlayerOptions};

/// Run the player until the cancellation token fires.
///
/// CLI flags override the config file, which overrides the defaults.
///
/// # Errors
///
/// Returns a config error if the file cannot be loaded, or an I/O error
/// if the command listener cannot be bound.
pub async fn run(args: &PlayerArgs, cancel: CancellationToken) -> Result<(), ConductorError> {
    let config = match &args.config {
        Some(path) => PlayerConfig::load(path)?,
        None => PlayerConfig::default(),
    };
    let bind = args.bind.clone().unwrap_or(config.bind);
    let port = args.port.unwrap_or(config.port);

    let mut opts = PlayerOptions::new(bind, port);
    opts.cancel = cancel;
    let mut player = Player::bind(opts).await?;
    player.run().await
}
