//! Conductor runtime: drives trials across the configured players.
//!
//! Each trial walks the phase kinds in order. For each kind the
//! conductor downloads the phase to every player, triggers execution
//! with RUN, then collects each player's result stream on its results
//! listener. A player that fails any of those steps is marked failed
//! for that phase and the run continues with the rest; failures only
//! ever narrow one phase of one trial.
//!
//! Results listeners are bound once, up front, so the port numbers
//! handed to players in phase specs are the ports actually in use
//! (configured port 0 binds an ephemeral port, which tests rely on).

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{PlayerEndpoint, TestConfig};
use crate::error::{ConductorError, NetworkError, ProtocolError};
use crate::net;
use crate::phase::{PhaseKind, PhaseSpec};
use crate::protocol::{
    DEFAULT_MAX_MESSAGE_SIZE, Message, MessageCodec, MessageType, RetCode, RetVal,
};
use crate::report::{PhaseOutcome, PhaseReport, PlayerPhaseReport, RunReport};
use crate::step::Step;

/// Options for constructing a [`Conductor`].
#[derive(Debug, Clone)]
pub struct ConductOptions {
    /// Overrides the config's trial count when set.
    pub trials: Option<u32>,
    /// Phase kinds to run each trial; `None` runs all four.
    pub phases: Option<Vec<PhaseKind>>,
    /// Frame size limit for all connections.
    pub max_message_size: usize,
    /// Token for cooperative shutdown; cancelling it stops the run at
    /// the next phase boundary, returning the report accumulated so far.
    pub cancel: CancellationToken,
}

impl Default for ConductOptions {
    fn default() -> Self {
        Self {
            trials: None,
            phases: None,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            cancel: CancellationToken::new(),
        }
    }
}

/// One bound results listener, keyed by its configured port.
#[derive(Debug)]
struct ResultsListener {
    listener: TcpListener,
    /// The port actually bound; differs from the key when that was 0.
    actual_port: u16,
}

/// The conductor runtime.
#[derive(Debug)]
pub struct Conductor {
    config: TestConfig,
    trials: u32,
    phases: Vec<PhaseKind>,
    max_message_size: usize,
    cancel: CancellationToken,
    /// Results listeners by configured port.
    listeners: HashMap<u16, ResultsListener>,
}

impl Conductor {
    /// Binds the results listeners and constructs the runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if any results listener cannot be bound.
    pub async fn bind(config: TestConfig, opts: ConductOptions) -> Result<Self, ConductorError> {
        let mut listeners = HashMap::new();
        for port in results_ports(&config) {
            let listener = net::bind_reuse(&format!("{}:{port}", config.conductor.host)).await?;
            let actual_port = listener.local_addr()?.port();
            info!(configured = port, actual = actual_port, "results listener bound");
            listeners.insert(
                port,
                ResultsListener {
                    listener,
                    actual_port,
                },
            );
        }
        let trials = opts.trials.unwrap_or(config.trials);
        let phases = opts.phases.unwrap_or_else(|| PhaseKind::ALL.to_vec());
        Ok(Self {
            config,
            trials,
            phases,
            max_message_size: opts.max_message_size,
            cancel: opts.cancel,
            listeners,
        })
    }

    /// Runs every trial and returns the accumulated report.
    ///
    /// Per-player failures are recorded in the report, not raised; the
    /// error path is reserved for conductor-side faults. Cancellation
    /// is checked at phase boundaries: a cancelled run finishes the
    /// phase in flight and returns the report accumulated so far.
    ///
    /// # Errors
    ///
    /// Currently infallible after construction; the signature leaves
    /// room for fatal listener errors.
    pub async fn run(&self) -> Result<RunReport, ConductorError> {
        let mut report = RunReport::default();
        if self.cancel.is_cancelled() {
            return Ok(report);
        }
        self.announce().await;

        'trials: for trial in 1..=self.trials {
            info!(trial, of = self.trials, "trial starting");
            for kind in &self.phases {
                if self.cancel.is_cancelled() {
                    info!(trial, "shutdown requested, stopping run");
                    break 'trials;
                }
                report.phases.push(self.run_phase(trial, *kind).await);
            }
        }
        Ok(report)
    }

    /// Sends a CONFIG frame to every player naming this conductor.
    ///
    /// Best-effort: an unreachable player will be reported when its
    /// first phase download fails.
    async fn announce(&self) {
        let data = serde_json::json!({ "conductor": self.config.conductor.host });
        for player in &self.config.players {
            let msg = Message::new(MessageType::Config, data.clone());
            match self.send_and_ack(&player.name(), msg).await {
                Ok(_) => debug!(player = %player.name(), "announced"),
                Err(e) => warn!(player = %player.name(), "announce failed: {e}"),
            }
        }
    }

    /// Runs one phase kind for one trial across all players.
    async fn run_phase(&self, trial: u32, kind: PhaseKind) -> PhaseReport {
        info!(trial, %kind, "phase starting");
        let mut failures: HashMap<String, String> = HashMap::new();
        let mut collected: HashMap<String, Vec<RetVal>> = HashMap::new();

        for player in &self.config.players {
            if let Err(e) = self.download(player, kind).await {
                warn!(player = %player.name(), %kind, "download failed: {e}");
                failures.insert(player.name(), e.to_string());
            }
        }

        for player in &self.config.players {
            if failures.contains_key(&player.name()) {
                continue;
            }
            if let Err(e) = self.trigger(player).await {
                warn!(player = %player.name(), %kind, "run trigger failed: {e}");
                failures.insert(player.name(), e.to_string());
            }
        }

        // Collect per listener: players sharing a configured results
        // port deliver on the same socket, in whatever order they
        // finish executing.
        for (port, names) in self.expected_by_port(&failures) {
            if let Some(results) = self.listeners.get(&port) {
                self.collect(&results.listener, names, &mut collected, &mut failures)
                    .await;
            }
        }

        let players = self
            .config
            .players
            .iter()
            .map(|player| {
                let name = player.name();
                let outcome = if let Some(reason) = failures.remove(&name) {
                    PhaseOutcome::Failed { reason }
                } else if let Some(results) = collected.remove(&name) {
                    PhaseOutcome::Completed { results }
                } else {
                    PhaseOutcome::Failed {
                        reason: "no results received".to_string(),
                    }
                };
                PlayerPhaseReport {
                    player: name,
                    outcome,
                }
            })
            .collect();

        PhaseReport {
            trial,
            kind,
            players,
        }
    }

    /// Sends one phase spec to one player and checks the ack.
    async fn download(&self, player: &PlayerEndpoint, kind: PhaseKind) -> Result<(), NetworkError> {
        let spec = PhaseSpec {
            kind,
            player: player.name(),
            result_host: self.config.conductor.host.clone(),
            result_port: self.actual_results_port(player),
            steps: self
                .config
                .phases
                .for_kind(kind)
                .iter()
                .map(|command| Step::parse(command))
                .collect(),
        };
        let data = serde_json::to_value(&spec).map_err(ProtocolError::from)?;
        let ack = self
            .send_and_ack(&player.name(), Message::new(MessageType::Phase, data))
            .await?;
        match ack.code {
            RetCode::Ok => Ok(()),
            _ => Err(NetworkError::Rejected {
                player: player.name(),
                message: ack.message,
            }),
        }
    }

    /// Sends the RUN trigger. There is no ack; execution results are the
    /// response, delivered on the results channel.
    async fn trigger(&self, player: &PlayerEndpoint) -> Result<(), NetworkError> {
        let mut framed = self.connect(&player.name()).await?;
        SinkExt::send(
            &mut framed,
            Message::new(MessageType::Run, serde_json::json!({})),
        )
        .await?;
        Ok(())
    }

    /// Accepts result streams on one listener until every expected
    /// player has delivered or the collect timeout expires.
    async fn collect(
        &self,
        listener: &TcpListener,
        mut expected: HashSet<String>,
        collected: &mut HashMap<String, Vec<RetVal>>,
        failures: &mut HashMap<String, String>,
    ) {
        let limit = Duration::from_secs(self.config.collect_timeout_secs);
        while !expected.is_empty() {
            let accepted = tokio::time::timeout(limit, listener.accept()).await;
            match accepted {
                Err(_) => {
                    for name in expected.drain() {
                        warn!(player = %name, "no results before collect timeout");
                        failures
                            .insert(name.clone(), NetworkError::IdleTimeout(name).to_string());
                    }
                    return;
                }
                Ok(Err(e)) => warn!("results accept failed: {e}"),
                Ok(Ok((stream, peer))) => match self.read_results(stream).await {
                    Ok((name, results)) => {
                        if expected.remove(&name) {
                            debug!(player = %name, results = results.len(), "results collected");
                            collected.insert(name, results);
                        } else {
                            warn!(%peer, player = %name, "results from unexpected player");
                        }
                    }
                    Err(e) => warn!(%peer, "results stream failed: {e}"),
                },
            }
        }
    }

    /// Reads one player's result stream: a CONFIG hello naming the
    /// player, then RESULT frames up to and including the Done sentinel.
    async fn read_results(
        &self,
        stream: TcpStream,
    ) -> Result<(String, Vec<RetVal>), NetworkError> {
        let idle = Duration::from_secs(self.config.collect_timeout_secs);
        let mut framed = net::framed(stream, self.max_message_size);

        let hello = next_frame(&mut framed, idle).await?;
        if hello.msg_type != MessageType::Config {
            return Err(ProtocolError::InvalidMessage(format!(
                "results stream opened with {}, expected a config hello",
                hello.msg_type
            ))
            .into());
        }
        let name = hello.data["player"]
            .as_str()
            .ok_or_else(|| {
                ProtocolError::InvalidMessage("config hello names no player".to_string())
            })?
            .to_string();

        let mut results = Vec::new();
        loop {
            let msg = next_frame(&mut framed, idle).await?;
            if msg.msg_type != MessageType::Result {
                return Err(ProtocolError::InvalidMessage(format!(
                    "unexpected {} on results stream",
                    msg.msg_type
                ))
                .into());
            }
            let retval = RetVal::from_data(&msg.data).map_err(NetworkError::from)?;
            if retval.is_done() {
                return Ok((name, results));
            }
            results.push(retval);
        }
    }

    /// Connects to a player's command port within the command timeout.
    async fn connect(
        &self,
        addr: &str,
    ) -> Result<Framed<TcpStream, MessageCodec>, NetworkError> {
        let limit = Duration::from_secs(self.config.cmd_timeout_secs);
        let stream = tokio::time::timeout(limit, TcpStream::connect(addr))
            .await
            .map_err(|_| NetworkError::ConnectFailed {
                addr: addr.to_string(),
                reason: "connect timed out".to_string(),
            })?
            .map_err(|e| NetworkError::ConnectFailed {
                addr: addr.to_string(),
                reason: e.to_string(),
            })?;
        Ok(net::framed(stream, self.max_message_size))
    }

    /// Sends one message on a fresh connection and awaits the RESULT ack.
    async fn send_and_ack(&self, addr: &str, msg: Message) -> Result<RetVal, NetworkError> {
        let limit = Duration::from_secs(self.config.cmd_timeout_secs);
        let mut framed = self.connect(addr).await?;
        SinkExt::send(&mut framed, msg).await?;

        let reply = tokio::time::timeout(limit, framed.next())
            .await
            .map_err(|_| NetworkError::AckTimeout(addr.to_string()))?
            .ok_or_else(|| {
                NetworkError::Protocol(ProtocolError::ConnectionClosed(
                    "connection closed before ack".to_string(),
                ))
            })??;
        if reply.msg_type != MessageType::Result {
            return Err(ProtocolError::InvalidMessage(format!(
                "expected a result ack, got {}",
                reply.msg_type
            ))
            .into());
        }
        Ok(RetVal::from_data(&reply.data)?)
    }

    /// Returns the bound results port this player should deliver to.
    fn actual_results_port(&self, player: &PlayerEndpoint) -> u16 {
        let configured = player
            .results_port
            .unwrap_or(self.config.conductor.results_port);
        self.listeners
            .get(&configured)
            .map_or(configured, |l| l.actual_port)
    }

    /// Groups the players still in play by configured results port.
    fn expected_by_port(&self, failures: &HashMap<String, String>) -> HashMap<u16, HashSet<String>> {
        let mut by_port: HashMap<u16, HashSet<String>> = HashMap::new();
        for player in &self.config.players {
            let name = player.name();
            if failures.contains_key(&name) {
                continue;
            }
            let port = player
                .results_port
                .unwrap_or(self.config.conductor.results_port);
            by_port.entry(port).or_default().insert(name);
        }
        by_port
    }
}

/// Reads one frame with an idle timeout.
async fn next_frame(
    framed: &mut Framed<TcpStream, MessageCodec>,
    idle: Duration,
) -> Result<Message, NetworkError> {
    let frame = tokio::time::timeout(idle, framed.next())
        .await
        .map_err(|_| NetworkError::IdleTimeout("results stream".to_string()))?
        .ok_or_else(|| {
            NetworkError::Protocol(ProtocolError::ConnectionClosed(
                "results stream closed before done".to_string(),
            ))
        })??;
    Ok(frame)
}

/// Distinct configured results ports across the whole config.
fn results_ports(config: &TestConfig) -> HashSet<u16> {
    let mut ports = HashSet::new();
    for player in &config.players {
        ports.insert(
            player
                .results_port
                .unwrap_or(config.conductor.results_port),
        );
    }
    ports
}

/// Renders the plan a config describes without touching the network.
#[must_use]
pub fn render_plan(config: &TestConfig, phases: &[PhaseKind], trials: u32) -> String {
    use std::fmt::Write as _;

    let mut out = String::new();
    let _ = writeln!(out, "trials: {trials}");
    let _ = writeln!(out, "players:");
    for player in &config.players {
        let _ = writeln!(out, "  - {}", player.name());
    }
    for kind in phases {
        let _ = writeln!(out, "{kind}:");
        let commands = config.phases.for_kind(*kind);
        if commands.is_empty() {
            let _ = writeln!(out, "  (no steps)");
        }
        for command in commands {
            let step = Step::parse(command);
            let _ = writeln!(out, "  - {step}");
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConductorSection, PhaseCommands, PlayerEndpoint};

    fn config_for(players: Vec<PlayerEndpoint>) -> TestConfig {
        TestConfig {
            trials: 1,
            conductor: ConductorSection {
                host: "127.0.0.1".to_string(),
                results_port: 0,
            },
            players,
            phases: PhaseCommands::default(),
            cmd_timeout_secs: 2,
            collect_timeout_secs: 2,
        }
    }

    fn endpoint(port: u16) -> PlayerEndpoint {
        PlayerEndpoint {
            host: "127.0.0.1".to_string(),
            cmd_port: port,
            results_port: None,
        }
    }

    #[tokio::test]
    async fn test_bind_records_actual_port() {
        let config = config_for(vec![endpoint(6970)]);
        let conductor = Conductor::bind(config, ConductOptions::default())
            .await
            .unwrap();
        let port = conductor.actual_results_port(&endpoint(6970));
        assert_ne!(port, 0, "ephemeral bind must resolve to a real port");
    }

    #[tokio::test]
    async fn test_unreachable_player_reported_failed() {
        // Reserve a port nothing listens on by binding and dropping it.
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_port = probe.local_addr().unwrap().port();
        drop(probe);

        let mut config = config_for(vec![endpoint(dead_port)]);
        config.cmd_timeout_secs = 1;
        config.collect_timeout_secs = 1;
        let conductor = Conductor::bind(config, ConductOptions::default())
            .await
            .unwrap();
        let report = conductor.run().await.unwrap();

        assert_eq!(report.phases.len(), 4);
        assert!(report.has_failures());
        for phase in &report.phases {
            assert_eq!(phase.players.len(), 1);
            assert!(matches!(
                phase.players[0].outcome,
                PhaseOutcome::Failed { .. }
            ));
        }
    }

    #[tokio::test]
    async fn test_phase_subset_filters_report() {
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_port = probe.local_addr().unwrap().port();
        drop(probe);

        let mut config = config_for(vec![endpoint(dead_port)]);
        config.cmd_timeout_secs = 1;
        let opts = ConductOptions {
            phases: Some(vec![PhaseKind::Startup, PhaseKind::Reset]),
            ..ConductOptions::default()
        };
        let conductor = Conductor::bind(config, opts).await.unwrap();
        let report = conductor.run().await.unwrap();

        let kinds: Vec<PhaseKind> = report.phases.iter().map(|p| p.kind).collect();
        assert_eq!(kinds, vec![PhaseKind::Startup, PhaseKind::Reset]);
    }

    #[tokio::test]
    async fn test_trials_override() {
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_port = probe.local_addr().unwrap().port();
        drop(probe);

        let mut config = config_for(vec![endpoint(dead_port)]);
        config.cmd_timeout_secs = 1;
        let opts = ConductOptions {
            trials: Some(2),
            phases: Some(vec![PhaseKind::Startup]),
            ..ConductOptions::default()
        };
        let conductor = Conductor::bind(config, opts).await.unwrap();
        let report = conductor.run().await.unwrap();

        assert_eq!(report.phases.len(), 2);
        assert_eq!(report.phases[0].trial, 1);
        assert_eq!(report.phases[1].trial, 2);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_runs_no_phases() {
        let config = config_for(vec![endpoint(6970)]);
        let opts = ConductOptions::default();
        opts.cancel.cancel();
        let conductor = Conductor::bind(config, opts).await.unwrap();
        let report = conductor.run().await.unwrap();
        assert!(report.phases.is_empty());
    }

    #[test]
    fn test_render_plan() {
        let mut config = config_for(vec![endpoint(6970)]);
        config.phases.startup = vec!["echo hi".to_string()];
        config.phases.run = vec!["spawn:sleep 1".to_string()];
        let plan = render_plan(&config, &PhaseKind::ALL, 3);
        assert!(plan.contains("trials: 3"));
        assert!(plan.contains("127.0.0.1:6970"));
        assert!(plan.contains("startup:"));
        assert!(plan.contains("(no steps)"));
    }

    #[test]
    fn test_results_ports_distinct() {
        let mut players = vec![endpoint(1), endpoint(2), endpoint(3)];
        players[1].results_port = Some(7000);
        players[2].results_port = Some(7000);
        let mut config = config_for(players);
        config.conductor.results_port = 6971;
        let ports = results_ports(&config);
        assert_eq!(ports, HashSet::from([6971, 7000]));
    }
}
