//! Phase engine: an ordered collection of steps with a fixed execution
//! policy.
//!
//! A [`Phase`] moves through `Empty → Loaded → Running → Complete`.
//! Steps execute in declared order; spawn steps return immediately and
//! do not block progression, normal and timeout steps do. Results
//! accumulate during one trial and are wiped by [`Phase::reset`] before
//! the next, so stale results never leak across trials.

use std::fmt;
use std::str::FromStr;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{PhaseError, ProtocolError};
use crate::protocol::{ResultSink, RetVal};
use crate::step::Step;

/// The four ordered stages of one trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum PhaseKind {
    /// Prepare the system under test.
    Startup,
    /// Exercise it.
    Run,
    /// Gather artifacts.
    Collect,
    /// Tear down for the next trial.
    Reset,
}

impl PhaseKind {
    /// All kinds, in trial order.
    pub const ALL: [Self; 4] = [Self::Startup, Self::Run, Self::Collect, Self::Reset];

    /// Returns the lowercase name of this kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Startup => "startup",
            Self::Run => "run",
            Self::Collect => "collect",
            Self::Reset => "reset",
        }
    }
}

impl fmt::Display for PhaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PhaseKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "startup" => Ok(Self::Startup),
            "run" => Ok(Self::Run),
            "collect" => Ok(Self::Collect),
            "reset" => Ok(Self::Reset),
            other => Err(format!("unknown phase: {other}")),
        }
    }
}

/// Lifecycle state of a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseStatus {
    /// No steps loaded yet.
    Empty,
    /// Steps appended, not yet run.
    Loaded,
    /// Steps executing.
    Running,
    /// All steps executed, results accumulated.
    Complete,
}

impl PhaseStatus {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::Loaded => "loaded",
            Self::Running => "running",
            Self::Complete => "complete",
        }
    }
}

/// An ordered group of steps for one stage of one trial.
#[derive(Debug)]
pub struct Phase {
    kind: PhaseKind,
    steps: Vec<Step>,
    results: Vec<RetVal>,
    status: PhaseStatus,
}

impl Phase {
    /// Creates an empty phase of the given kind.
    #[must_use]
    pub const fn new(kind: PhaseKind) -> Self {
        Self {
            kind,
            steps: Vec::new(),
            results: Vec::new(),
            status: PhaseStatus::Empty,
        }
    }

    /// Returns this phase's kind.
    #[must_use]
    pub const fn kind(&self) -> PhaseKind {
        self.kind
    }

    /// Returns the current lifecycle state.
    #[must_use]
    pub const fn status(&self) -> PhaseStatus {
        self.status
    }

    /// Returns the loaded steps in declared order.
    #[must_use]
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Returns the accumulated results in execution order.
    #[must_use]
    pub fn results(&self) -> &[RetVal] {
        &self.results
    }

    /// Appends a step, valid only before the phase has run.
    ///
    /// # Errors
    ///
    /// Returns [`PhaseError::InvalidTransition`] in `Running` or
    /// `Complete`.
    pub fn append(&mut self, step: Step) -> Result<(), PhaseError> {
        match self.status {
            PhaseStatus::Empty | PhaseStatus::Loaded => {
                self.steps.push(step);
                self.status = PhaseStatus::Loaded;
                Ok(())
            }
            status => Err(PhaseError::InvalidTransition {
                action: "append",
                state: status.as_str(),
            }),
        }
    }

    /// Executes every step in declared order, accumulating one result
    /// per step.
    ///
    /// Spawn steps return control immediately; normal and timeout steps
    /// block until done, so their side effects are strictly ordered. A
    /// failing step records an error result and the remaining steps
    /// still run. An empty phase completes with no results.
    ///
    /// # Errors
    ///
    /// Returns [`PhaseError::InvalidTransition`] if the phase is already
    /// running or complete.
    pub async fn run(&mut self) -> Result<(), PhaseError> {
        match self.status {
            PhaseStatus::Empty | PhaseStatus::Loaded => {}
            status => {
                return Err(PhaseError::InvalidTransition {
                    action: "run",
                    state: status.as_str(),
                });
            }
        }
        self.status = PhaseStatus::Running;
        debug!(kind = %self.kind, steps = self.steps.len(), "running phase");

        for step in &self.steps {
            let result = step.run().await;
            self.results.push(result);
        }

        self.status = PhaseStatus::Complete;
        Ok(())
    }

    /// Streams every accumulated result to the sink in order, then the
    /// terminal `Done` sentinel: exactly one, always last.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError`] if the sink fails.
    pub async fn deliver_results(&self, sink: &mut dyn ResultSink) -> Result<(), ProtocolError> {
        for result in &self.results {
            sink.send(result).await?;
        }
        sink.send(&RetVal::done()).await
    }

    /// Returns the phase to `Empty` with fresh results, ready to be
    /// reloaded for the next trial.
    pub fn reset(&mut self) {
        self.steps.clear();
        self.results.clear();
        self.status = PhaseStatus::Empty;
    }
}

/// Wire form of a phase, carried in a PHASE message.
///
/// Besides the step list it names the player (so results can be
/// attributed) and the conductor's results endpoint (so the player
/// knows where to deliver).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseSpec {
    /// Which trial stage this is.
    pub kind: PhaseKind,
    /// Name the conductor assigned to the receiving player.
    pub player: String,
    /// Host the player connects back to with results.
    pub result_host: String,
    /// Port the conductor's results listener is bound to.
    pub result_port: u16,
    /// Steps to execute, in order.
    pub steps: Vec<Step>,
}

impl PhaseSpec {
    /// Builds the executable phase described by this spec.
    ///
    /// The returned phase is `Loaded` (or `Empty` when the spec carries
    /// no steps).
    #[must_use]
    pub fn to_phase(&self) -> Phase {
        let mut phase = Phase::new(self.kind);
        for step in &self.steps {
            // append cannot fail on a fresh phase
            let _ = phase.append(step.clone());
        }
        phase
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::protocol::RetCode;
    use async_trait::async_trait;

    /// In-memory sink capturing everything a phase delivers.
    #[derive(Debug, Default)]
    pub(crate) struct VecSink(pub Vec<RetVal>);

    #[async_trait]
    impl ResultSink for VecSink {
        async fn send(&mut self, retval: &RetVal) -> Result<(), ProtocolError> {
            self.0.push(retval.clone());
            Ok(())
        }
    }

    #[test]
    fn test_kind_order() {
        assert_eq!(
            PhaseKind::ALL,
            [
                PhaseKind::Startup,
                PhaseKind::Run,
                PhaseKind::Collect,
                PhaseKind::Reset
            ]
        );
    }

    #[test]
    fn test_kind_parse() {
        assert_eq!("startup".parse::<PhaseKind>().unwrap(), PhaseKind::Startup);
        assert!("warmup".parse::<PhaseKind>().is_err());
    }

    #[test]
    fn test_append_transitions_to_loaded() {
        let mut phase = Phase::new(PhaseKind::Startup);
        assert_eq!(phase.status(), PhaseStatus::Empty);
        phase.append(Step::parse("echo hi")).unwrap();
        assert_eq!(phase.status(), PhaseStatus::Loaded);
    }

    #[tokio::test]
    async fn test_append_after_run_rejected() {
        let mut phase = Phase::new(PhaseKind::Startup);
        phase.append(Step::parse("true")).unwrap();
        phase.run().await.unwrap();
        let err = phase.append(Step::parse("echo late")).unwrap_err();
        assert!(matches!(
            err,
            PhaseError::InvalidTransition {
                action: "append",
                state: "complete"
            }
        ));
    }

    #[tokio::test]
    async fn test_double_run_rejected() {
        let mut phase = Phase::new(PhaseKind::Run);
        phase.append(Step::parse("true")).unwrap();
        phase.run().await.unwrap();
        assert!(phase.run().await.is_err());
    }

    #[tokio::test]
    async fn test_run_accumulates_results_in_order() {
        let mut phase = Phase::new(PhaseKind::Run);
        phase.append(Step::parse("echo one")).unwrap();
        phase.append(Step::parse("echo two")).unwrap();
        phase.run().await.unwrap();

        assert_eq!(phase.status(), PhaseStatus::Complete);
        let results = phase.results();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].message.trim(), "one");
        assert_eq!(results[1].message.trim(), "two");
    }

    #[tokio::test]
    async fn test_sequential_side_effects_ordered() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("x");
        let mut phase = Phase::new(PhaseKind::Run);
        phase
            .append(Step::parse(&format!("touch {}", marker.display())))
            .unwrap();
        phase
            .append(Step::parse(&format!("test -f {}", marker.display())))
            .unwrap();
        phase.run().await.unwrap();

        assert_eq!(phase.results()[0].code, RetCode::Ok);
        assert_eq!(phase.results()[1].code, RetCode::Ok, "step2 must see step1's file");
    }

    #[tokio::test]
    async fn test_failing_step_does_not_abort_phase() {
        let mut phase = Phase::new(PhaseKind::Run);
        phase.append(Step::parse("no-such-binary-zzz")).unwrap();
        phase.append(Step::parse("echo still-here")).unwrap();
        phase.run().await.unwrap();

        assert_eq!(phase.results()[0].code, RetCode::Error);
        assert_eq!(phase.results()[1].code, RetCode::Ok);
        assert_eq!(phase.results()[1].message.trim(), "still-here");
    }

    #[tokio::test]
    async fn test_empty_phase_runs_and_delivers_only_done() {
        let mut phase = Phase::new(PhaseKind::Collect);
        phase.run().await.unwrap();
        assert_eq!(phase.status(), PhaseStatus::Complete);

        let mut sink = VecSink::default();
        phase.deliver_results(&mut sink).await.unwrap();
        assert_eq!(sink.0.len(), 1);
        assert!(sink.0[0].is_done());
    }

    #[tokio::test]
    async fn test_delivery_ends_with_exactly_one_done() {
        let mut phase = Phase::new(PhaseKind::Run);
        phase.append(Step::parse("echo a")).unwrap();
        phase.append(Step::parse("echo b")).unwrap();
        phase.run().await.unwrap();

        let mut sink = VecSink::default();
        phase.deliver_results(&mut sink).await.unwrap();

        let done_count = sink.0.iter().filter(|r| r.is_done()).count();
        assert_eq!(done_count, 1);
        assert!(sink.0.last().unwrap().is_done(), "done must be last");
        assert!(!sink.0[..sink.0.len() - 1].iter().any(|r| r.is_done()));
    }

    #[tokio::test]
    async fn test_reset_discards_results() {
        let mut phase = Phase::new(PhaseKind::Run);
        phase.append(Step::parse("echo trial1")).unwrap();
        phase.run().await.unwrap();
        assert!(!phase.results().is_empty());

        phase.reset();
        assert_eq!(phase.status(), PhaseStatus::Empty);
        assert!(phase.results().is_empty());
        assert!(phase.steps().is_empty());

        // Reusable for the next trial
        phase.append(Step::parse("echo trial2")).unwrap();
        phase.run().await.unwrap();
        assert_eq!(phase.results().len(), 1);
        assert_eq!(phase.results()[0].message.trim(), "trial2");
    }

    #[test]
    fn test_phase_spec_round_trip() {
        let spec = PhaseSpec {
            kind: PhaseKind::Run,
            player: "10.0.0.1:6970".to_string(),
            result_host: "10.0.0.100".to_string(),
            result_port: 6971,
            steps: vec![Step::parse("spawn:sleep 1"), Step::parse("echo done")],
        };
        let value = serde_json::to_value(&spec).unwrap();
        let back: PhaseSpec = serde_json::from_value(value).unwrap();
        assert_eq!(back, spec);
    }

    #[test]
    fn test_spec_to_phase_is_loaded() {
        let spec = PhaseSpec {
            kind: PhaseKind::Startup,
            player: "p".to_string(),
            result_host: "h".to_string(),
            result_port: 1,
            steps: vec![Step::parse("echo hi")],
        };
        let phase = spec.to_phase();
        assert_eq!(phase.status(), PhaseStatus::Loaded);
        assert_eq!(phase.steps().len(), 1);
    }
}
