//! Tunnel pipeline (C8): the two long-running workers that move frames
//! between the virtual NIC and the transport, encrypting outbound and
//! decrypting inbound (§4.8).
//!
//! Each worker is a single `tokio` task observing a shared
//! [`CancellationToken`]. Neither worker locks `Session`: the outbound
//! worker is the sole writer of `tx_counter`, the inbound worker the sole
//! writer of `rx_last_counter`, matching the single-writer discipline of §5.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use shadowmesh_crypto::aead;
use shadowmesh_nic::NicPort;
use shadowmesh_transport::Transport;

use crate::error::PipelineError;
use crate::frame::{Header, MessageType, WireMessage};
use crate::session::{RxOutcome, Session};

/// Bounded queue depth per direction (§4.8): not a literal channel here —
/// both the NIC and transport own their own internal bounded queues; this
/// constant documents the shared depth they're configured with.
pub const QUEUE_DEPTH: usize = 2000;
/// Consecutive transport write failures after which the outbound worker
/// reports fatal (§4.8).
pub const MAX_CONSECUTIVE_WRITE_FAILURES: u32 = 3;
/// Decryption error rate, per second, above which the inbound worker
/// reports fatal rather than continuing to drop-and-count (§4.8).
pub const DECRYPTION_ERROR_RATE_THRESHOLD: u64 = 10;
/// Backoff between retried transport writes.
pub const WRITE_RETRY_BACKOFF: Duration = Duration::from_millis(200);

/// Counters exposed for diagnostics, mirroring the transport layer's
/// `TransportStats` pattern.
#[derive(Default)]
pub struct PipelineMetrics {
    /// DATA_FRAMEs successfully sent.
    pub tx_frames: AtomicU64,
    /// Transport write failures (including ones later retried).
    pub tx_write_errors: AtomicU64,
    /// Frames dropped because the NIC inbound queue was full, outbound side.
    pub tx_dropped_nic_full: AtomicU64,
    /// DATA_FRAMEs successfully decrypted and delivered to the NIC.
    pub rx_frames: AtomicU64,
    /// Frames rejected by the anti-replay check.
    pub rx_replays: AtomicU64,
    /// AEAD decryption failures (current and previous generation).
    pub rx_decrypt_errors: AtomicU64,
    /// Frames dropped because the NIC outbound queue was full, inbound side.
    pub rx_dropped_nic_full: AtomicU64,
}

impl PipelineMetrics {
    /// Point-in-time snapshot of every counter.
    #[must_use]
    pub fn snapshot(&self) -> PipelineStats {
        PipelineStats {
            tx_frames: self.tx_frames.load(Ordering::Relaxed),
            tx_write_errors: self.tx_write_errors.load(Ordering::Relaxed),
            tx_dropped_nic_full: self.tx_dropped_nic_full.load(Ordering::Relaxed),
            rx_frames: self.rx_frames.load(Ordering::Relaxed),
            rx_replays: self.rx_replays.load(Ordering::Relaxed),
            rx_decrypt_errors: self.rx_decrypt_errors.load(Ordering::Relaxed),
            rx_dropped_nic_full: self.rx_dropped_nic_full.load(Ordering::Relaxed),
        }
    }
}

/// An immutable snapshot of [`PipelineMetrics`].
#[derive(Debug, Clone, Copy, Default)]
pub struct PipelineStats {
    /// DATA_FRAMEs successfully sent.
    pub tx_frames: u64,
    /// Transport write failures (including ones later retried).
    pub tx_write_errors: u64,
    /// Frames dropped because the NIC inbound queue was full, outbound side.
    pub tx_dropped_nic_full: u64,
    /// DATA_FRAMEs successfully decrypted and delivered to the NIC.
    pub rx_frames: u64,
    /// Frames rejected by the anti-replay check.
    pub rx_replays: u64,
    /// AEAD decryption failures (current and previous generation).
    pub rx_decrypt_errors: u64,
    /// Frames dropped because the NIC outbound queue was full, inbound side.
    pub rx_dropped_nic_full: u64,
}

/// Minimum Ethernet frame size (destination MAC + source MAC + EtherType)
/// below which an L2 frame is malformed and dropped (§4.1).
pub const MIN_L2_FRAME_SIZE: usize = 14;

/// Control-plane messages the inbound worker relays out-of-band to the
/// lifecycle controller (C9), since it is the sole reader of
/// `transport.recv()` once a session is installed.
#[derive(Debug, Clone)]
pub enum ControlMessage {
    /// A HEARTBEAT_ACK arrived, answering an outstanding HEARTBEAT.
    HeartbeatAck,
    /// A HELLO/CHALLENGE/RESPONSE/ESTABLISHED arrived after the original
    /// handshake completed — i.e. a rekey in progress.
    Handshake(WireMessage),
    /// The peer sent CLOSE.
    PeerClosed {
        /// Machine-readable close reason code (§6).
        reason_code: u16,
        /// Human-readable reason text.
        reason: String,
    },
    /// The peer sent ERROR.
    PeerError {
        /// Machine-readable error code (§6).
        code: u16,
        /// Human-readable error text.
        message: String,
    },
}

/// Run the outbound worker to completion: NIC → encrypt → transport.
///
/// Returns when `cancel` is triggered (after draining one in-flight frame)
/// or when [`MAX_CONSECUTIVE_WRITE_FAILURES`] consecutive transport writes
/// fail.
///
/// # Errors
///
/// Returns [`PipelineError::WriteRetriesExhausted`] on the latter.
pub async fn run_outbound_worker(
    nic: Arc<dyn NicPort>,
    transport: Arc<dyn Transport>,
    session: Arc<Session>,
    cancel: CancellationToken,
    metrics: Arc<PipelineMetrics>,
) -> Result<(), PipelineError> {
    let mut consecutive_failures: u32 = 0;
    loop {
        let frame = tokio::select! {
            () = cancel.cancelled() => {
                debug!("outbound worker: cancellation observed, exiting");
                return Ok(());
            }
            frame = nic.recv() => match frame {
                Ok(frame) => frame,
                Err(err) => {
                    warn!(error = %err, "outbound worker: NIC recv failed");
                    continue;
                }
            },
        };

        if frame.len() < MIN_L2_FRAME_SIZE {
            warn!(len = frame.len(), "outbound worker: dropping undersized frame");
            continue;
        }

        let counter = session.next_tx_counter();
        let (tx_key, session_id_prefix) = session.tx_key();
        let tx_key = &tx_key;
        // wire_payload = counter_be64(8) || ciphertext+tag; length is known
        // before encryption since ChaCha20-Poly1305 is length-preserving.
        let expected_payload_len = 8 + frame.len() + aead::TAG_SIZE;
        let header = Header {
            version: crate::frame::PROTOCOL_VERSION,
            message_type: MessageType::DataFrame,
            flags: 0,
            length: expected_payload_len as u32,
        };
        let aad = header.as_aad_bytes();

        let wire_payload = match aead::encrypt(&frame, tx_key, counter, session_id_prefix, &aad) {
            Ok(payload) => payload,
            Err(err) => {
                error!(error = %err, "outbound worker: encryption failed, dropping frame");
                continue;
            }
        };

        let message = WireMessage::DataFrame {
            payload: wire_payload,
        }
        .encode();

        match transport.send(message).await {
            Ok(()) => {
                consecutive_failures = 0;
                metrics.tx_frames.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                metrics.tx_write_errors.fetch_add(1, Ordering::Relaxed);
                consecutive_failures += 1;
                warn!(error = %err, attempt = consecutive_failures, "outbound worker: transport write failed");
                if consecutive_failures >= MAX_CONSECUTIVE_WRITE_FAILURES {
                    error!("outbound worker: exhausted write retries, reporting fatal");
                    return Err(PipelineError::WriteRetriesExhausted);
                }
                tokio::time::sleep(WRITE_RETRY_BACKOFF).await;
            }
        }
    }
}

/// Run the inbound worker to completion: transport → decrypt → replay
/// check → NIC.
///
/// # Errors
///
/// Returns [`PipelineError::DecryptionErrorRateExceeded`] once the
/// decrypt-error rate crosses [`DECRYPTION_ERROR_RATE_THRESHOLD`] per
/// second. Unrecognized or malformed wire messages are logged and dropped
/// rather than treated as fatal.
pub async fn run_inbound_worker(
    nic: Arc<dyn NicPort>,
    transport: Arc<dyn Transport>,
    session: Arc<Session>,
    cancel: CancellationToken,
    metrics: Arc<PipelineMetrics>,
    control_tx: mpsc::UnboundedSender<ControlMessage>,
) -> Result<(), PipelineError> {
    let decrypt_error_window = Mutex::new(DecryptErrorWindow::new());
    loop {
        let message = tokio::select! {
            () = cancel.cancelled() => {
                debug!("inbound worker: cancellation observed, exiting");
                return Ok(());
            }
            message = transport.recv() => match message {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!(error = %err, "inbound worker: transport recv failed");
                    continue;
                }
            },
        };

        let decoded = match WireMessage::decode(&message) {
            Ok(decoded) => decoded,
            Err(err) => {
                warn!(error = %err, "inbound worker: malformed wire message, dropping");
                continue;
            }
        };

        match decoded {
            WireMessage::DataFrame { payload } => {
                if payload.len() < 8 {
                    warn!("inbound worker: DATA_FRAME payload too short to carry a counter");
                    continue;
                }
                let header = Header {
                    version: crate::frame::PROTOCOL_VERSION,
                    message_type: MessageType::DataFrame,
                    flags: 0,
                    length: payload.len() as u32,
                };
                let aad = header.as_aad_bytes();

                let mut decrypted = None;
                for (rx_key, session_id_prefix) in session.rx_key_candidates() {
                    if let Ok((counter, plaintext)) =
                        aead::decrypt(&payload, &rx_key, session_id_prefix, &aad)
                    {
                        decrypted = Some((counter, plaintext));
                        break;
                    }
                }

                let Some((counter, plaintext)) = decrypted else {
                    metrics.rx_decrypt_errors.fetch_add(1, Ordering::Relaxed);
                    let mut window = decrypt_error_window.lock().await;
                    window.record();
                    if window.rate_per_second() > DECRYPTION_ERROR_RATE_THRESHOLD {
                        error!("inbound worker: decryption error rate exceeded threshold");
                        return Err(PipelineError::DecryptionErrorRateExceeded);
                    }
                    continue;
                };

                match session.check_and_update_rx(counter) {
                    Ok(RxOutcome::Accept | RxOutcome::AcceptPreviousGeneration) => {}
                    Err(_) => {
                        metrics.rx_replays.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                }

                if nic.send(plaintext).await.is_err() {
                    metrics.rx_dropped_nic_full.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                metrics.rx_frames.fetch_add(1, Ordering::Relaxed);
            }
            WireMessage::Heartbeat => {
                let ack = WireMessage::HeartbeatAck.encode();
                if let Err(err) = transport.send(ack).await {
                    warn!(error = %err, "inbound worker: heartbeat ack send failed");
                }
            }
            WireMessage::HeartbeatAck => {
                let _ = control_tx.send(ControlMessage::HeartbeatAck);
            }
            WireMessage::Close { reason_code, reason } => {
                let _ = control_tx.send(ControlMessage::PeerClosed { reason_code, reason });
            }
            WireMessage::Error { code, message } => {
                let _ = control_tx.send(ControlMessage::PeerError { code, message });
            }
            hello_or_rekey @ (WireMessage::Hello { .. }
            | WireMessage::Challenge { .. }
            | WireMessage::Response { .. }
            | WireMessage::Established { .. }) => {
                if control_tx
                    .send(ControlMessage::Handshake(hello_or_rekey))
                    .is_err()
                {
                    warn!("inbound worker: no rekey handshake listening, dropping message");
                }
            }
        }
    }
}

/// Sliding one-second window of decrypt-failure timestamps, used to decide
/// whether the inbound worker has crossed the fatal error-rate threshold.
struct DecryptErrorWindow {
    timestamps: std::collections::VecDeque<Instant>,
}

impl DecryptErrorWindow {
    fn new() -> Self {
        Self {
            timestamps: std::collections::VecDeque::new(),
        }
    }

    fn record(&mut self) {
        let now = Instant::now();
        self.timestamps.push_back(now);
        self.evict_older_than_one_second(now);
    }

    fn rate_per_second(&mut self) -> u64 {
        let now = Instant::now();
        self.evict_older_than_one_second(now);
        self.timestamps.len() as u64
    }

    fn evict_older_than_one_second(&mut self, now: Instant) {
        while let Some(&front) = self.timestamps.front() {
            if now.duration_since(front) > Duration::from_secs(1) {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
    }
}

/// HELLO rate limiter: at most [`crate::handshake::HELLO_RATE_LIMIT_PER_MINUTE`]
/// accepted per source address per rolling minute (§4.4). Lives here rather
/// than in `handshake` because it operates before any `Handshake` exists
/// for a given source.
#[derive(Default)]
pub struct HelloRateLimiter {
    counts: dashmap::DashMap<String, (u32, Instant)>,
}

impl HelloRateLimiter {
    /// Construct an empty limiter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a HELLO from `source` and report whether it is within the
    /// rolling-minute rate limit.
    #[must_use]
    pub fn check_and_record(&self, source: &str) -> bool {
        let now = Instant::now();
        let mut entry = self
            .counts
            .entry(source.to_string())
            .or_insert((0, now));
        if now.duration_since(entry.1) >= Duration::from_secs(60) {
            entry.0 = 0;
            entry.1 = now;
        }
        entry.0 += 1;
        entry.0 <= crate::handshake::HELLO_RATE_LIMIT_PER_MINUTE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decrypt_error_window_reports_rate_within_second() {
        let mut window = DecryptErrorWindow::new();
        for _ in 0..5 {
            window.record();
        }
        assert_eq!(window.rate_per_second(), 5);
    }

    #[test]
    fn hello_rate_limiter_allows_up_to_threshold() {
        let limiter = HelloRateLimiter::new();
        for _ in 0..crate::handshake::HELLO_RATE_LIMIT_PER_MINUTE {
            assert!(limiter.check_and_record("1.2.3.4"));
        }
        assert!(!limiter.check_and_record("1.2.3.4"));
    }

    #[test]
    fn hello_rate_limiter_tracks_sources_independently() {
        let limiter = HelloRateLimiter::new();
        for _ in 0..crate::handshake::HELLO_RATE_LIMIT_PER_MINUTE {
            limiter.check_and_record("1.2.3.4");
        }
        assert!(limiter.check_and_record("5.6.7.8"));
    }
}
