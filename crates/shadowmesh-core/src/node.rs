//! Lifecycle controller (C9): owns one tunnel end to end — handshake,
//! session install, pipeline workers, heartbeat and rekey timers, and
//! strict-order shutdown (§4.9).
//!
//! Five concurrent units share one [`CancellationToken`] (§5): the outbound
//! and inbound pipeline workers (C8), the heartbeat timer, and the rekey
//! timer. `Tunnel` itself does not read or write frames; it only drives the
//! handshake to completion and supervises the workers it spawns.
//!
//! Once a session is installed, [`pipeline::run_inbound_worker`] is the sole
//! reader of `transport.recv()`. Every other task that needs an inbound
//! message — the heartbeat timer waiting on an ack, the rekey timer driving
//! a fresh handshake, shutdown noticing a peer-initiated CLOSE — receives it
//! from a dedicated control dispatcher task that owns the inbound worker's
//! [`pipeline::ControlMessage`] channel and fans it out to per-purpose
//! channels, so no two consumers ever fight over the same receiver.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand_core::OsRng;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use shadowmesh_crypto::hybrid::{HybridKeypair, HybridVerifyKey, PeerId};
use shadowmesh_nic::NicPort;
use shadowmesh_transport::Transport;

use crate::error::{Error, HandshakeError, PipelineError};
use crate::frame::{CloseReason, WireMessage};
use crate::handshake::{EstablishedSession, Handshake, HandshakeRole};
use crate::pipeline::{self, ControlMessage, PipelineMetrics, PipelineStats};
use crate::session::{Session, REKEY_GRACE_WINDOW};

/// Heartbeat send interval once established (§4.9).
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);
/// Deadline to observe a HEARTBEAT_ACK before counting it missed (§4.9).
pub const HEARTBEAT_ACK_TIMEOUT: Duration = Duration::from_secs(5);
/// Consecutive missed heartbeats before the tunnel closes as idle (§4.9).
pub const HEARTBEAT_MISS_LIMIT: u32 = 3;
/// Budget for a rekey handshake to complete before it is abandoned (§4.9).
pub const REKEY_TIMEOUT: Duration = Duration::from_secs(60);
/// Deadline to drain in-flight frames during shutdown (§4.9, §5).
pub const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
/// Hard-kill deadline for spawned tasks after cancellation (§5).
pub const HARD_KILL_DEADLINE: Duration = Duration::from_secs(5);

/// Static configuration for one tunnel, supplied once at construction.
pub struct TunnelConfig {
    /// Which side of the handshake this endpoint plays.
    pub role: HandshakeRole,
    /// This endpoint's hybrid identity keypair. Held as `Arc` so the same
    /// long-term identity can be reused across a rekey, which builds a
    /// fresh [`Handshake`] without consuming the original.
    pub local_identity: Arc<HybridKeypair>,
    /// The configured peer's verify key (no trust-on-first-use).
    pub peer_verify_key: HybridVerifyKey,
    /// Capability bits this endpoint offers.
    pub capabilities: u32,
    /// Frame-payload MTU to negotiate (responder's choice wins).
    pub mtu: u16,
    /// Heartbeat interval to negotiate, seconds (responder's choice wins).
    pub heartbeat_interval_s: u32,
    /// Time-triggered rekey interval to negotiate, seconds (responder's
    /// choice wins).
    pub rekey_interval_s: u32,
}

/// The parts of [`TunnelConfig`] a rekey needs to reconstruct a fresh
/// [`Handshake`] that reuses the same long-term identity.
struct RekeyTemplate {
    role: HandshakeRole,
    local_identity: Arc<HybridKeypair>,
    peer_verify_key: HybridVerifyKey,
    capabilities: u32,
    mtu: u16,
    heartbeat_interval_s: u32,
    rekey_interval_s: u32,
}

impl From<&TunnelConfig> for RekeyTemplate {
    fn from(config: &TunnelConfig) -> Self {
        Self {
            role: config.role,
            local_identity: Arc::clone(&config.local_identity),
            peer_verify_key: config.peer_verify_key.clone(),
            capabilities: config.capabilities,
            mtu: config.mtu,
            heartbeat_interval_s: config.heartbeat_interval_s,
            rekey_interval_s: config.rekey_interval_s,
        }
    }
}

/// Lifecycle and diagnostic events a caller can subscribe to via
/// [`Tunnel::subscribe`].
#[derive(Debug, Clone)]
pub enum TunnelEvent {
    /// The handshake completed and the session is installed.
    Established {
        /// Negotiated session identifier.
        session_id: [u8; 16],
        /// The peer's identity.
        peer_id: PeerId,
    },
    /// A heartbeat went unanswered within [`HEARTBEAT_ACK_TIMEOUT`].
    HeartbeatMissed {
        /// Consecutive misses so far, reset on the next acknowledged beat.
        consecutive: u32,
    },
    /// A time- or counter-triggered rekey handshake began.
    RekeyStarted,
    /// A rekey handshake installed a new key generation.
    RekeyCompleted {
        /// The newly negotiated session identifier.
        session_id: [u8; 16],
    },
    /// A rekey handshake did not complete within [`REKEY_TIMEOUT`]; the
    /// prior key generation remains in force.
    RekeyFailed,
    /// The peer sent CLOSE; the tunnel is tearing itself down in response.
    PeerClosed {
        /// Machine-readable close reason code (§6).
        reason_code: u16,
        /// Human-readable reason text.
        reason: String,
    },
    /// The tunnel has shut down.
    Closed {
        /// Why it closed.
        reason: CloseReason,
    },
}

/// A point-in-time snapshot of session identity and negotiated parameters,
/// independent of the pipeline's own byte/frame counters.
#[derive(Debug, Clone)]
pub struct SessionStats {
    /// The peer's identity.
    pub peer_id: PeerId,
    /// Current session identifier (changes across a rekey).
    pub session_id: [u8; 16],
    /// Whether this endpoint was the handshake initiator.
    pub is_initiator: bool,
    /// Negotiated frame-payload MTU.
    pub mtu: u16,
}

/// One running tunnel: the handshake-to-shutdown lifecycle plus its
/// pipeline workers and timers.
pub struct Tunnel {
    session: Arc<Session>,
    metrics: Arc<PipelineMetrics>,
    cancel: CancellationToken,
    events: broadcast::Sender<TunnelEvent>,
    missed_heartbeats: Arc<AtomicU32>,
    outbound: JoinHandle<Result<(), PipelineError>>,
    inbound: JoinHandle<Result<(), PipelineError>>,
    dispatcher: JoinHandle<()>,
    heartbeat: JoinHandle<()>,
    rekey: JoinHandle<()>,
    nic: Arc<dyn NicPort>,
    transport: Arc<dyn Transport>,
}

impl Tunnel {
    /// Run the handshake to completion over `transport`, install the
    /// resulting session, and spawn the pipeline workers and timers.
    ///
    /// Initiator or responder is determined by `config.role`; in both
    /// cases this call blocks until `ESTABLISHED` is reached or
    /// [`crate::handshake::HANDSHAKE_TIMEOUT`] elapses. This runs before any
    /// pipeline worker is spawned, so driving the handshake by calling
    /// `transport.recv()` directly here is still safe.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Handshake`] if the handshake fails or times out, or
    /// [`Error::Transport`] if the underlying channel fails before that.
    pub async fn establish(
        config: TunnelConfig,
        nic: Arc<dyn NicPort>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, Error> {
        let template = RekeyTemplate::from(&config);
        let mut handshake = Handshake::new(
            config.role,
            config.local_identity,
            config.peer_verify_key,
            false,
            config.capabilities,
            config.heartbeat_interval_s,
            config.mtu,
            config.rekey_interval_s,
        );

        let established = timeout(
            crate::handshake::HANDSHAKE_TIMEOUT,
            drive_handshake_to_established(&mut handshake, &transport),
        )
        .await
        .map_err(|_| Error::Handshake(HandshakeError::HandshakeTimeout))??;

        info!(
            peer_id = %hex::encode(established.peer_id.as_bytes()),
            session_id = %hex::encode(established.session_id),
            "tunnel: handshake established"
        );

        Ok(Self::spawn(established, template, nic, transport))
    }

    fn spawn(
        established: EstablishedSession,
        template: RekeyTemplate,
        nic: Arc<dyn NicPort>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let session = Arc::new(Session::new(
            established.peer_id,
            established.session_id,
            established.is_initiator,
            established.keys,
            Duration::from_secs(u64::from(established.heartbeat_interval_s)),
            Duration::from_secs(u64::from(established.rekey_interval_s)),
        ));
        let metrics = Arc::new(PipelineMetrics::default());
        let cancel = CancellationToken::new();
        let (events, _) = broadcast::channel(64);
        let missed_heartbeats = Arc::new(AtomicU32::new(0));

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (heartbeat_ack_tx, heartbeat_ack_rx) = mpsc::unbounded_channel();
        let (handshake_tx, handshake_rx) = mpsc::unbounded_channel();

        let outbound = tokio::spawn(pipeline::run_outbound_worker(
            Arc::clone(&nic),
            Arc::clone(&transport),
            Arc::clone(&session),
            cancel.clone(),
            Arc::clone(&metrics),
        ));
        let inbound = tokio::spawn(pipeline::run_inbound_worker(
            Arc::clone(&nic),
            Arc::clone(&transport),
            Arc::clone(&session),
            cancel.clone(),
            Arc::clone(&metrics),
            control_tx,
        ));
        let dispatcher = tokio::spawn(run_control_dispatcher(
            control_rx,
            heartbeat_ack_tx,
            handshake_tx,
            cancel.clone(),
            events.clone(),
        ));
        let heartbeat = tokio::spawn(run_heartbeat_timer(
            Arc::clone(&transport),
            cancel.clone(),
            events.clone(),
            Arc::clone(&missed_heartbeats),
            heartbeat_ack_rx,
        ));
        let rekey = tokio::spawn(run_rekey_timer(
            Arc::clone(&session),
            Arc::clone(&transport),
            cancel.clone(),
            events.clone(),
            template,
            handshake_rx,
        ));

        let _ = events.send(TunnelEvent::Established {
            session_id: established.session_id,
            peer_id: established.peer_id,
        });

        Self {
            session,
            metrics,
            cancel,
            events,
            missed_heartbeats,
            outbound,
            inbound,
            dispatcher,
            heartbeat,
            rekey,
            nic,
            transport,
        }
    }

    /// Subscribe to lifecycle and diagnostic events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.events.subscribe()
    }

    /// Point-in-time pipeline counters.
    #[must_use]
    pub fn pipeline_stats(&self) -> PipelineStats {
        self.metrics.snapshot()
    }

    /// Point-in-time session identity and negotiated parameters.
    #[must_use]
    pub fn session_stats(&self) -> SessionStats {
        SessionStats {
            peer_id: self.session.peer_id(),
            session_id: self.session.session_id(),
            is_initiator: self.session.is_initiator(),
            mtu: self.session.mtu,
        }
    }

    /// Shut the tunnel down in the strict order required by §4.9: stop
    /// accepting new frames from the NIC, drain in-flight work for up to
    /// [`SHUTDOWN_DRAIN_TIMEOUT`], send CLOSE, close the transport, release
    /// the NIC, and finally zero all session key material.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] if sending CLOSE or closing the
    /// transport fails; the NIC is still released and keys still zeroed
    /// before the error is returned.
    pub async fn shutdown(self, reason: CloseReason) -> Result<(), Error> {
        self.cancel.cancel();

        let drain = async {
            let _ = self.outbound.await;
            let _ = self.inbound.await;
            let _ = self.dispatcher.await;
            let _ = self.heartbeat.await;
            let _ = self.rekey.await;
        };
        if timeout(SHUTDOWN_DRAIN_TIMEOUT, drain).await.is_err() {
            warn!("tunnel: shutdown drain exceeded budget, proceeding anyway");
        }

        let close = WireMessage::Close {
            reason_code: reason as u16,
            reason: format!("{reason:?}"),
        }
        .encode();
        let send_result = self.transport.send(close).await;
        let close_result = self.transport.close().await;
        let nic_result = self.nic.close();

        self.session.zeroize_keys();
        let _ = self.events.send(TunnelEvent::Closed { reason });

        send_result?;
        close_result?;
        nic_result.map_err(Error::Nic)?;
        Ok(())
    }
}

async fn drive_handshake_to_established(
    handshake: &mut Handshake,
    transport: &Arc<dyn Transport>,
) -> Result<EstablishedSession, Error> {
    let mut rng = OsRng;
    if handshake.state() == crate::handshake::HandshakeState::Idle
        && handshake.role() == HandshakeRole::Initiator
    {
        let hello = handshake.initiate(&mut rng)?;
        transport.send(hello.encode()).await?;
    }

    loop {
        let message = transport.recv().await?;
        let inbound = WireMessage::decode(&message)?;
        let (outbound, established) = handshake.drive(&mut rng, inbound)?;
        if let Some(outbound) = outbound {
            transport.send(outbound.encode()).await?;
        }
        if let Some(established) = established {
            return Ok(established);
        }
    }
}

/// Sole consumer of the inbound worker's [`ControlMessage`] channel. Fans
/// each message out to the one task that actually wants it, so the
/// heartbeat timer and the rekey timer each get their own private receiver
/// instead of racing each other for messages neither owns.
async fn run_control_dispatcher(
    mut control_rx: mpsc::UnboundedReceiver<ControlMessage>,
    heartbeat_ack_tx: mpsc::UnboundedSender<()>,
    handshake_tx: mpsc::UnboundedSender<WireMessage>,
    cancel: CancellationToken,
    events: broadcast::Sender<TunnelEvent>,
) {
    loop {
        let message = tokio::select! {
            () = cancel.cancelled() => {
                debug!("control dispatcher: cancellation observed, exiting");
                return;
            }
            message = control_rx.recv() => match message {
                Some(message) => message,
                None => {
                    debug!("control dispatcher: inbound worker channel closed, exiting");
                    return;
                }
            },
        };

        match message {
            ControlMessage::HeartbeatAck => {
                let _ = heartbeat_ack_tx.send(());
            }
            ControlMessage::Handshake(wire_message) => {
                let _ = handshake_tx.send(wire_message);
            }
            ControlMessage::PeerClosed { reason_code, reason } => {
                info!(reason_code, %reason, "control dispatcher: peer sent CLOSE");
                let _ = events.send(TunnelEvent::PeerClosed { reason_code, reason });
                cancel.cancel();
                return;
            }
            ControlMessage::PeerError { code, message } => {
                warn!(code, %message, "control dispatcher: peer reported ERROR");
            }
        }
    }
}

/// Drive a rekey handshake using messages relayed over `handshake_rx`,
/// rather than reading `transport.recv()` directly (that belongs solely to
/// [`pipeline::run_inbound_worker`] once the pipeline is running).
async fn drive_rekey_to_established(
    handshake: &mut Handshake,
    transport: &Arc<dyn Transport>,
    handshake_rx: &mut mpsc::UnboundedReceiver<WireMessage>,
) -> Result<EstablishedSession, Error> {
    let mut rng = OsRng;
    if handshake.state() == crate::handshake::HandshakeState::Idle
        && handshake.role() == HandshakeRole::Initiator
    {
        let hello = handshake.initiate(&mut rng)?;
        transport.send(hello.encode()).await?;
    }

    loop {
        let inbound = handshake_rx
            .recv()
            .await
            .ok_or_else(|| Error::Internal("handshake relay channel closed".to_string()))?;
        let (outbound, established) = handshake.drive(&mut rng, inbound)?;
        if let Some(outbound) = outbound {
            transport.send(outbound.encode()).await?;
        }
        if let Some(established) = established {
            return Ok(established);
        }
    }
}

async fn run_heartbeat_timer(
    transport: Arc<dyn Transport>,
    cancel: CancellationToken,
    events: broadcast::Sender<TunnelEvent>,
    missed: Arc<AtomicU32>,
    mut heartbeat_ack_rx: mpsc::UnboundedReceiver<()>,
) {
    let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                debug!("heartbeat timer: cancellation observed, exiting");
                return;
            }
            _ = ticker.tick() => {}
        }

        if let Err(err) = transport.send(WireMessage::Heartbeat.encode()).await {
            warn!(error = %err, "heartbeat timer: send failed");
        }

        let acked = timeout(HEARTBEAT_ACK_TIMEOUT, heartbeat_ack_rx.recv())
            .await
            .is_ok_and(|ack| ack.is_some());

        if acked {
            missed.store(0, Ordering::Release);
            continue;
        }

        let consecutive = missed.fetch_add(1, Ordering::AcqRel) + 1;
        let _ = events.send(TunnelEvent::HeartbeatMissed { consecutive });
        if consecutive >= HEARTBEAT_MISS_LIMIT {
            error!("heartbeat timer: missed {HEARTBEAT_MISS_LIMIT} consecutive acks, closing as idle");
            let _ = transport
                .send(
                    WireMessage::Close {
                        reason_code: CloseReason::IdleTimeout as u16,
                        reason: "idle timeout".to_string(),
                    }
                    .encode(),
                )
                .await;
            let _ = events.send(TunnelEvent::Closed {
                reason: CloseReason::IdleTimeout,
            });
            cancel.cancel();
            return;
        }
    }
}

async fn run_rekey_timer(
    session: Arc<Session>,
    transport: Arc<dyn Transport>,
    cancel: CancellationToken,
    events: broadcast::Sender<TunnelEvent>,
    template: RekeyTemplate,
    handshake_rx: mpsc::UnboundedReceiver<WireMessage>,
) {
    match template.role {
        HandshakeRole::Initiator => {
            run_rekey_timer_initiator(session, transport, cancel, events, template, handshake_rx)
                .await;
        }
        HandshakeRole::Responder => {
            run_rekey_timer_responder(session, transport, cancel, events, template, handshake_rx)
                .await;
        }
    }
}

/// Initiator side: poll the session's own due-for-rekey state and start the
/// exchange proactively (§4.9).
async fn run_rekey_timer_initiator(
    session: Arc<Session>,
    transport: Arc<dyn Transport>,
    cancel: CancellationToken,
    events: broadcast::Sender<TunnelEvent>,
    template: RekeyTemplate,
    mut handshake_rx: mpsc::UnboundedReceiver<WireMessage>,
) {
    let mut poll = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                debug!("rekey timer: cancellation observed, exiting");
                return;
            }
            _ = poll.tick() => {}
        }

        if !session.time_rekey_due() && !session.counter_rekey_due() {
            continue;
        }

        let _ = events.send(TunnelEvent::RekeyStarted);
        debug!("rekey timer: initiating rekey");

        let mut handshake = new_rekey_handshake(&template);
        let outcome = timeout(
            REKEY_TIMEOUT,
            drive_rekey_to_established(&mut handshake, &transport, &mut handshake_rx),
        )
        .await;
        report_rekey_outcome(&session, &events, outcome);
    }
}

/// Responder side: never self-initiates. Waits on the handshake relay
/// channel for an incoming rekey `HELLO` and drives the responder side of
/// the exchange when one arrives (§4.9).
async fn run_rekey_timer_responder(
    session: Arc<Session>,
    transport: Arc<dyn Transport>,
    cancel: CancellationToken,
    events: broadcast::Sender<TunnelEvent>,
    template: RekeyTemplate,
    mut handshake_rx: mpsc::UnboundedReceiver<WireMessage>,
) {
    loop {
        let hello = tokio::select! {
            () = cancel.cancelled() => {
                debug!("rekey timer: cancellation observed, exiting");
                return;
            }
            hello = handshake_rx.recv() => match hello {
                Some(hello) => hello,
                None => {
                    debug!("rekey timer: handshake relay channel closed, exiting");
                    return;
                }
            },
        };

        let _ = events.send(TunnelEvent::RekeyStarted);
        debug!("rekey timer: responding to peer-initiated rekey");

        let mut handshake = new_rekey_handshake(&template);
        let outcome = timeout(
            REKEY_TIMEOUT,
            drive_one_rekey_message(&mut handshake, &transport, hello, &mut handshake_rx),
        )
        .await;
        report_rekey_outcome(&session, &events, outcome);
    }
}

fn new_rekey_handshake(template: &RekeyTemplate) -> Handshake {
    Handshake::new(
        template.role,
        Arc::clone(&template.local_identity),
        template.peer_verify_key.clone(),
        true,
        template.capabilities,
        template.heartbeat_interval_s,
        template.mtu,
        template.rekey_interval_s,
    )
}

/// Feed the already-received first inbound message (the rekey `HELLO`) into
/// a fresh responder `Handshake`, then fall through to the normal relay
/// loop for the remaining `RESPONSE` message.
async fn drive_one_rekey_message(
    handshake: &mut Handshake,
    transport: &Arc<dyn Transport>,
    first: WireMessage,
    handshake_rx: &mut mpsc::UnboundedReceiver<WireMessage>,
) -> Result<EstablishedSession, Error> {
    let mut rng = OsRng;
    let (outbound, established) = handshake.drive(&mut rng, first)?;
    if let Some(outbound) = outbound {
        transport.send(outbound.encode()).await?;
    }
    match established {
        Some(established) => Ok(established),
        None => drive_rekey_to_established(handshake, transport, handshake_rx).await,
    }
}

fn report_rekey_outcome(
    session: &Arc<Session>,
    events: &broadcast::Sender<TunnelEvent>,
    outcome: Result<Result<EstablishedSession, Error>, tokio::time::error::Elapsed>,
) {
    match outcome {
        Ok(Ok(established)) => {
            let demoted_at = session.rotate_keys(established.session_id, established.keys);
            info!(session_id = %hex::encode(established.session_id), "rekey timer: rotation complete");
            let _ = events.send(TunnelEvent::RekeyCompleted {
                session_id: established.session_id,
            });

            let session = Arc::clone(session);
            tokio::spawn(async move {
                tokio::time::sleep(REKEY_GRACE_WINDOW).await;
                session.zeroize_previous_generation(demoted_at);
            });
        }
        Ok(Err(err)) => {
            warn!(error = %err, "rekey timer: rekey handshake failed, retrying next interval");
            let _ = events.send(TunnelEvent::RekeyFailed);
        }
        Err(_) => {
            warn!("rekey timer: rekey handshake exceeded budget, retrying next interval");
            let _ = events.send(TunnelEvent::RekeyFailed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_constants_match_design() {
        assert_eq!(HEARTBEAT_INTERVAL, Duration::from_secs(20));
        assert_eq!(HEARTBEAT_ACK_TIMEOUT, Duration::from_secs(5));
        assert_eq!(HEARTBEAT_MISS_LIMIT, 3);
    }

    #[test]
    fn rekey_and_shutdown_constants_match_design() {
        assert_eq!(REKEY_TIMEOUT, Duration::from_secs(60));
        assert_eq!(SHUTDOWN_DRAIN_TIMEOUT, Duration::from_secs(2));
        assert_eq!(HARD_KILL_DEADLINE, Duration::from_secs(5));
    }
}
