//! Player runtime: the long-lived listener that executes phases.
//!
//! A [`Player`] accepts control connections one at a time, reads exactly
//! one frame per connection, and dispatches on the message type. PHASE
//! messages buffer work; RUN executes everything buffered, in receipt
//! order, streaming each phase's results back to the conductor's results
//! endpoint. The listener loop survives every per-connection failure;
//! a bad frame costs that connection its ack, nothing more.
//!
//! Each player owns its own state (pending queue, recorded conductor
//! identity); there are no process-wide singletons, so several players
//! can share one process in tests.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ConductorError, ProtocolError};
use crate::net;
use crate::phase::{Phase, PhaseSpec};
use crate::protocol::{DEFAULT_MAX_MESSAGE_SIZE, Message, MessageCodec, MessageType, RetVal};

/// How long a control connection may sit idle before its frame read is
/// abandoned. Bounds the damage a faulty connection can do to the loop.
const FRAME_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Options for constructing a [`Player`].
#[derive(Debug, Clone)]
pub struct PlayerOptions {
    /// Address the command listener binds.
    pub bind: String,
    /// Port the command listener binds (0 picks an ephemeral port).
    pub port: u16,
    /// Frame size limit for all connections.
    pub max_message_size: usize,
    /// Token for cooperative shutdown; cancelling it stops the accept
    /// loop. Background processes launched by spawn steps are not
    /// tracked and are never reaped here; that cleanup belongs to the
    /// test's Reset phase.
    pub cancel: CancellationToken,
}

impl PlayerOptions {
    /// Creates options with the given bind address and defaults for the
    /// rest.
    pub fn new(bind: impl Into<String>, port: u16) -> Self {
        Self {
            bind: bind.into(),
            port,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            cancel: CancellationToken::new(),
        }
    }
}

/// One buffered phase awaiting a RUN trigger.
#[derive(Debug)]
struct PendingPhase {
    phase: Phase,
    /// Name the conductor knows us by, echoed on the results channel.
    player: String,
    /// Where the results stream connects.
    results_addr: String,
}

/// The player runtime.
pub struct Player {
    listener: TcpListener,
    pending: VecDeque<PendingPhase>,
    conductor: Option<String>,
    max_message_size: usize,
    cancel: CancellationToken,
}

impl Player {
    /// Binds the command listener and constructs the runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot be bound.
    pub async fn bind(opts: PlayerOptions) -> Result<Self, ConductorError> {
        let listener = net::bind_reuse(&format!("{}:{}", opts.bind, opts.port)).await?;
        info!(addr = %listener.local_addr()?, "player listening");
        Ok(Self {
            listener,
            pending: VecDeque::new(),
            conductor: None,
            max_message_size: opts.max_message_size,
            cancel: opts.cancel,
        })
    }

    /// Returns the bound address of the command listener.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket has no local address.
    pub fn local_addr(&self) -> Result<SocketAddr, ConductorError> {
        Ok(self.listener.local_addr()?)
    }

    /// Runs the accept loop until cancelled.
    ///
    /// Per-connection failures are logged and do not stop the loop.
    ///
    /// # Errors
    ///
    /// Currently only returns `Ok` at cancellation; the signature leaves
    /// room for fatal listener errors.
    pub async fn run(&mut self) -> Result<(), ConductorError> {
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    info!("player shutting down");
                    return Ok(());
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => self.handle_connection(stream, peer).await,
                        Err(e) => warn!("accept failed: {e}"),
                    }
                }
            }
        }
    }

    /// Handles one control connection: one frame, one dispatch.
    async fn handle_connection(&mut self, stream: TcpStream, peer: SocketAddr) {
        debug!(%peer, "control connection");
        let mut framed = net::framed(stream, self.max_message_size);

        let msg = match tokio::time::timeout(FRAME_READ_TIMEOUT, framed.next()).await {
            Err(_) => {
                warn!(%peer, "idle control connection, dropping");
                return;
            }
            Ok(None) => {
                debug!(%peer, "connection closed without a frame");
                return;
            }
            Ok(Some(Err(e))) => {
                warn!(%peer, "bad frame: {e}");
                ack(&mut framed, &retval_for_protocol_error(&e)).await;
                return;
            }
            Ok(Some(Ok(msg))) => msg,
        };

        match msg.msg_type {
            MessageType::Config => {
                let identity = msg.data["conductor"].as_str().unwrap_or("unknown").to_string();
                info!(conductor = %identity, "recorded conductor identity");
                self.conductor = Some(identity);
                ack(&mut framed, &RetVal::ok("config recorded")).await;
            }
            MessageType::Phase => match serde_json::from_value::<PhaseSpec>(msg.data.clone()) {
                Ok(spec) => {
                    info!(kind = %spec.kind, steps = spec.steps.len(), "phase buffered");
                    self.pending.push_back(PendingPhase {
                        phase: spec.to_phase(),
                        player: spec.player,
                        results_addr: format!("{}:{}", spec.result_host, spec.result_port),
                    });
                    ack(&mut framed, &RetVal::ok("phase loaded")).await;
                }
                Err(e) => {
                    warn!(%peer, "malformed phase: {e}");
                    ack(&mut framed, &RetVal::error(format!("malformed phase: {e}"))).await;
                }
            },
            MessageType::Run => {
                // Executed synchronously; results are the response, the
                // control connection gets no ack.
                drop(framed);
                self.run_pending().await;
            }
            MessageType::Result | MessageType::Done | MessageType::Error => {
                warn!(%peer, msg_type = %msg.msg_type, "unexpected message type on command port");
                ack(
                    &mut framed,
                    &RetVal::bad_cmd(format!("unexpected message type: {}", msg.msg_type)),
                )
                .await;
            }
        }
    }

    /// Executes every pending phase in receipt order and streams each
    /// phase's results back, then clears the queue.
    async fn run_pending(&mut self) {
        let pending = std::mem::take(&mut self.pending);
        info!(phases = pending.len(), "run triggered");

        for mut entry in pending {
            let kind = entry.phase.kind();
            if let Err(e) = entry.phase.run().await {
                warn!(%kind, "phase failed to run: {e}");
            }
            if let Err(e) = self.deliver(&entry).await {
                warn!(%kind, results_addr = %entry.results_addr, "result delivery failed: {e}");
            }
        }
    }

    /// Opens a results connection, identifies itself, and streams the
    /// phase's results followed by the Done sentinel.
    async fn deliver(&self, entry: &PendingPhase) -> Result<(), ProtocolError> {
        let stream = TcpStream::connect(&entry.results_addr).await?;
        let mut framed = net::framed(stream, self.max_message_size);
        SinkExt::send(
            &mut framed,
            Message::new(
                MessageType::Config,
                serde_json::json!({ "player": entry.player }),
            ),
        )
        .await?;
        entry.phase.deliver_results(&mut framed).await
    }
}

impl std::fmt::Debug for Player {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Player")
            .field("pending", &self.pending.len())
            .field("conductor", &self.conductor)
            .finish_non_exhaustive()
    }
}

/// Sends an acknowledgment, best-effort: a peer that hangs up before
/// reading its ack is its own problem.
async fn ack(framed: &mut Framed<TcpStream, MessageCodec>, retval: &RetVal) {
    let msg = Message::new(MessageType::Result, retval.to_data());
    if let Err(e) = SinkExt::send(framed, msg).await {
        debug!("ack not delivered: {e}");
    }
}

/// Maps a decode failure to the ack the protocol calls for: unknown
/// message types are bad commands, everything else is an error.
fn retval_for_protocol_error(err: &ProtocolError) -> RetVal {
    match err {
        ProtocolError::UnknownType(t) => RetVal::bad_cmd(format!("unknown message type: {t}")),
        other => RetVal::error(other.to_string()),
    }
}
