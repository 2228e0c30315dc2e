//! The `conduct` command handler.

use tokio_util::sync::CancellationToken;

use crate::cli::args::{ConductArgs, OutputFormat};
use crate::conduct::{ConductOptions, Conductor, render_plan};
use crate::config::TestConfig;
use crate::error::ConductorError;
use crate::phase::PhaseKind;

/// Drive a full test run, or print the plan under `--dry-run`.
///
/// Per-player failures land in the printed report and do not fail the
/// process; the error path is for conductor-side faults (unreadable
/// config, unbindable listener). Cancelling the token stops the run at
/// the next phase boundary and still prints the partial report.
///
/// # Errors
///
/// Returns a config error if the file cannot be loaded, or an I/O error
/// if a results listener cannot be bound.
pub async fn run(args: &ConductArgs, cancel: CancellationToken) -> Result<(), ConductorError> {
    let config = TestConfig::load(&args.config)?;
    let trials = args.trials.unwrap_or(config.trials);
    let phases = args
        .phases
        .clone()
        .unwrap_or_else(|| PhaseKind::ALL.to_vec());

    if args.dry_run {
        print!("{}", render_plan(&config, &phases, trials));
        return Ok(());
    }

    let opts = ConductOptions {
        trials: args.trials,
        phases: args.phases.clone(),
        cancel,
        ..ConductOptions::default()
    };
    let conductor = Conductor::bind(config, opts).await?;
    let report = conductor.run().await?;

    match args.format {
        OutputFormat::Human => print!("{}", report.render_human()),
        OutputFormat::Json => println!("{}", report.render_json()?),
    }
    if report.has_failures() {
        tracing::warn!("one or more players failed; see the report");
    }
    Ok(())
}
