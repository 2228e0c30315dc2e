//! End-to-end tests: a real conductor driving real players over TCP.
//!
//! Players bind ephemeral ports on loopback; the conductor's results
//! listener does the same. Nothing here touches well-known ports, so
//! the tests can run in parallel.

use tokio_util::sync::CancellationToken;

use conductor::conduct::{ConductOptions, Conductor};
use conductor::config::{ConductorSection, PhaseCommands, PlayerEndpoint, TestConfig};
use conductor::phase::PhaseKind;
use conductor::player::{Player, PlayerOptions};
use conductor::protocol::RetCode;
use conductor::report::{PhaseOutcome, RunReport};

/// Starts a player on an ephemeral loopback port.
async fn spawn_player() -> (u16, CancellationToken) {
    let opts = PlayerOptions::new("127.0.0.1", 0);
    let cancel = opts.cancel.clone();
    let mut player = Player::bind(opts).await.unwrap();
    let port = player.local_addr().unwrap().port();
    tokio::spawn(async move { player.run().await });
    (port, cancel)
}

fn config_for(ports: &[u16], phases: PhaseCommands) -> TestConfig {
    TestConfig {
        trials: 1,
        conductor: ConductorSection {
            host: "127.0.0.1".to_string(),
            results_port: 0,
        },
        players: ports
            .iter()
            .map(|&port| PlayerEndpoint {
                host: "127.0.0.1".to_string(),
                cmd_port: port,
                results_port: None,
            })
            .collect(),
        phases,
        cmd_timeout_secs: 5,
        collect_timeout_secs: 5,
    }
}

fn completed_results<'a>(report: &'a RunReport, kind: PhaseKind, player: usize) -> &'a [conductor::protocol::RetVal] {
    let phase = report
        .phases
        .iter()
        .find(|p| p.kind == kind)
        .unwrap_or_else(|| panic!("no {kind} phase in report"));
    match &phase.players[player].outcome {
        PhaseOutcome::Completed { results } => results,
        PhaseOutcome::Failed { reason } => panic!("{kind} failed: {reason}"),
    }
}

#[tokio::test]
async fn test_single_player_full_trial() {
    let (port, cancel) = spawn_player().await;
    let config = config_for(
        &[port],
        PhaseCommands {
            startup: vec!["echo hi".to_string()],
            run: vec!["spawn:sleep 1".to_string(), "echo done".to_string()],
            collect: vec![],
            reset: vec![],
        },
    );

    let conductor = Conductor::bind(config, ConductOptions::default())
        .await
        .unwrap();
    let report = conductor.run().await.unwrap();
    cancel.cancel();

    assert_eq!(report.phases.len(), 4);
    assert!(!report.has_failures(), "{}", report.render_human());

    let startup = completed_results(&report, PhaseKind::Startup, 0);
    assert_eq!(startup.len(), 1);
    assert_eq!(startup[0].code, RetCode::Ok);
    assert_eq!(startup[0].message.trim(), "hi");

    let run = completed_results(&report, PhaseKind::Run, 0);
    assert_eq!(run.len(), 2);
    assert_eq!(run[0].code, RetCode::Ok);
    assert_eq!(run[0].message, "spawned");
    assert_eq!(run[1].message.trim(), "done");

    // Phases with no steps still complete, with an empty result list.
    assert!(completed_results(&report, PhaseKind::Collect, 0).is_empty());
    assert!(completed_results(&report, PhaseKind::Reset, 0).is_empty());
}

#[tokio::test]
async fn test_two_players_both_collected() {
    let (port_a, cancel_a) = spawn_player().await;
    let (port_b, cancel_b) = spawn_player().await;
    let config = config_for(
        &[port_a, port_b],
        PhaseCommands {
            startup: vec!["echo ready".to_string()],
            run: vec![],
            collect: vec![],
            reset: vec![],
        },
    );

    let opts = ConductOptions {
        phases: Some(vec![PhaseKind::Startup]),
        ..ConductOptions::default()
    };
    let conductor = Conductor::bind(config, opts).await.unwrap();
    let report = conductor.run().await.unwrap();
    cancel_a.cancel();
    cancel_b.cancel();

    assert!(!report.has_failures(), "{}", report.render_human());
    let phase = &report.phases[0];
    assert_eq!(phase.players.len(), 2);
    for entry in &phase.players {
        let PhaseOutcome::Completed { results } = &entry.outcome else {
            panic!("{} did not complete", entry.player);
        };
        assert_eq!(results[0].message.trim(), "ready");
    }
}

#[tokio::test]
async fn test_dead_player_does_not_sink_the_run() {
    let (live_port, cancel) = spawn_player().await;

    // Reserve a port nothing listens on by binding and dropping it.
    let probe = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_port = probe.local_addr().unwrap().port();
    drop(probe);

    let mut config = config_for(
        &[live_port, dead_port],
        PhaseCommands {
            startup: vec!["echo alive".to_string()],
            run: vec![],
            collect: vec![],
            reset: vec![],
        },
    );
    config.cmd_timeout_secs = 2;
    config.collect_timeout_secs = 2;

    let opts = ConductOptions {
        phases: Some(vec![PhaseKind::Startup]),
        ..ConductOptions::default()
    };
    let conductor = Conductor::bind(config, opts).await.unwrap();
    let report = conductor.run().await.unwrap();
    cancel.cancel();

    let phase = &report.phases[0];
    assert!(matches!(
        phase.players[0].outcome,
        PhaseOutcome::Completed { .. }
    ));
    assert!(matches!(
        phase.players[1].outcome,
        PhaseOutcome::Failed { .. }
    ));
    assert!(report.has_failures());
}

#[tokio::test]
async fn test_multiple_trials_rerun_phases() {
    let (port, cancel) = spawn_player().await;
    let config = config_for(
        &[port],
        PhaseCommands {
            startup: vec!["echo again".to_string()],
            run: vec![],
            collect: vec![],
            reset: vec![],
        },
    );

    let opts = ConductOptions {
        trials: Some(3),
        phases: Some(vec![PhaseKind::Startup]),
        ..ConductOptions::default()
    };
    let conductor = Conductor::bind(config, opts).await.unwrap();
    let report = conductor.run().await.unwrap();
    cancel.cancel();

    assert_eq!(report.phases.len(), 3);
    for (i, phase) in report.phases.iter().enumerate() {
        assert_eq!(phase.trial, u32::try_from(i).unwrap() + 1);
        let results = match &phase.players[0].outcome {
            PhaseOutcome::Completed { results } => results,
            PhaseOutcome::Failed { reason } => panic!("trial {} failed: {reason}", phase.trial),
        };
        assert_eq!(results[0].message.trim(), "again");
    }
}

#[tokio::test]
async fn test_failing_command_reported_not_fatal() {
    let (port, cancel) = spawn_player().await;
    let config = config_for(
        &[port],
        PhaseCommands {
            startup: vec!["false".to_string(), "echo after".to_string()],
            run: vec![],
            collect: vec![],
            reset: vec![],
        },
    );

    let opts = ConductOptions {
        phases: Some(vec![PhaseKind::Startup]),
        ..ConductOptions::default()
    };
    let conductor = Conductor::bind(config, opts).await.unwrap();
    let report = conductor.run().await.unwrap();
    cancel.cancel();

    // A failing command is a result, not a player failure.
    assert!(!report.has_failures(), "{}", report.render_human());
    let results = completed_results(&report, PhaseKind::Startup, 0);
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].code, RetCode::Error);
    assert_eq!(results[1].code, RetCode::Ok);
    assert_eq!(results[1].message.trim(), "after");
}
