//! Run reporting.
//!
//! Every configured player appears in every phase report. A player
//! that failed or went silent shows up as an explicit failure entry
//! rather than a silent absence.

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::phase::PhaseKind;
use crate::protocol::RetVal;

/// Outcome of one phase on one player.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PhaseOutcome {
    /// The player delivered a complete result stream.
    Completed {
        /// Per-step results, in execution order (Done sentinel excluded).
        results: Vec<RetVal>,
    },
    /// The player was marked failed for this phase.
    Failed {
        /// Why it was marked failed.
        reason: String,
    },
}

/// One player's entry in a phase report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerPhaseReport {
    /// Player name (`host:port`).
    pub player: String,
    /// What happened.
    #[serde(flatten)]
    pub outcome: PhaseOutcome,
}

/// One phase of one trial, across all configured players.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseReport {
    /// Trial index, starting at 1.
    pub trial: u32,
    /// Which stage.
    pub kind: PhaseKind,
    /// One entry per configured player.
    pub players: Vec<PlayerPhaseReport>,
}

/// A full run: every phase of every trial.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    /// Phase reports in execution order.
    pub phases: Vec<PhaseReport>,
}

impl RunReport {
    /// Returns `true` if any player failed any phase.
    #[must_use]
    pub fn has_failures(&self) -> bool {
        self.phases.iter().any(|p| {
            p.players
                .iter()
                .any(|e| matches!(e.outcome, PhaseOutcome::Failed { .. }))
        })
    }

    /// Renders the report as human-readable text.
    #[must_use]
    pub fn render_human(&self) -> String {
        let mut out = String::new();
        for phase in &self.phases {
            let _ = writeln!(out, "trial {} {}:", phase.trial, phase.kind);
            for entry in &phase.players {
                match &entry.outcome {
                    PhaseOutcome::Completed { results } => {
                        if results.is_empty() {
                            let _ = writeln!(out, "  {}: (no steps)", entry.player);
                        }
                        for result in results {
                            let _ = writeln!(
                                out,
                                "  {}: [{}] {}",
                                entry.player,
                                result.code,
                                result.message.trim_end()
                            );
                        }
                    }
                    PhaseOutcome::Failed { reason } => {
                        let _ = writeln!(out, "  {}: failed: {reason}", entry.player);
                    }
                }
            }
        }
        out
    }

    /// Renders the report as pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Returns a JSON error if serialization fails (it does not for
    /// this data model; the signature follows `serde_json`).
    pub fn render_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RunReport {
        RunReport {
            phases: vec![PhaseReport {
                trial: 1,
                kind: PhaseKind::Startup,
                players: vec![
                    PlayerPhaseReport {
                        player: "10.0.0.1:6970".to_string(),
                        outcome: PhaseOutcome::Completed {
                            results: vec![RetVal::ok("hi\n")],
                        },
                    },
                    PlayerPhaseReport {
                        player: "10.0.0.2:6970".to_string(),
                        outcome: PhaseOutcome::Failed {
                            reason: "connect refused".to_string(),
                        },
                    },
                ],
            }],
        }
    }

    #[test]
    fn test_failed_player_is_explicit_in_human_output() {
        let text = sample().render_human();
        assert!(text.contains("trial 1 startup:"));
        assert!(text.contains("10.0.0.1:6970: [ok] hi"));
        assert!(text.contains("10.0.0.2:6970: failed: connect refused"));
    }

    #[test]
    fn test_has_failures() {
        assert!(sample().has_failures());
        assert!(!RunReport::default().has_failures());
    }

    #[test]
    fn test_json_round_trip() {
        let report = sample();
        let json = report.render_json().unwrap();
        let back: RunReport = serde_json::from_str(&json).unwrap();
        assert_eq!(back, report);
    }

    #[test]
    fn test_empty_phase_renders_placeholder() {
        let report = RunReport {
            phases: vec![PhaseReport {
                trial: 2,
                kind: PhaseKind::Collect,
                players: vec![PlayerPhaseReport {
                    player: "p".to_string(),
                    outcome: PhaseOutcome::Completed { results: vec![] },
                }],
            }],
        };
        assert!(report.render_human().contains("(no steps)"));
    }
}
