//! Shared test doubles for cross-crate integration tests.
//!
//! `ChannelTransport` and `MemoryNic` stand in for `WebSocketTransport` and
//! `NicDevice`: one needs a live TLS socket, the other a privileged kernel
//! TAP/TUN device, neither of which a portable test process can assume. Both
//! implement the same `Transport`/`NicPort` traits the tunnel pipeline is
//! written against, so the rest of the stack runs completely unmodified.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use shadowmesh_core::handshake::{HandshakeRole, CAP_OBFUSCATION};
use shadowmesh_core::node::TunnelConfig;
use shadowmesh_crypto::hybrid::generate_hybrid_keypair;
use shadowmesh_nic::{NicError, NicPort};
use shadowmesh_transport::{Transport, TransportError, TransportResult};

/// An in-memory duplex [`Transport`]. [`ChannelTransport::pair`] produces
/// two ends wired directly to each other, standing in for a live
/// WebSocket/TLS connection.
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    closed: AtomicBool,
}

impl ChannelTransport {
    /// Build two transports wired to each other: whatever one side sends,
    /// the other receives.
    #[must_use]
    pub fn pair() -> (Arc<Self>, Arc<Self>) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        let left = Arc::new(Self {
            tx: tx_a,
            rx: Mutex::new(rx_b),
            closed: AtomicBool::new(false),
        });
        let right = Arc::new(Self {
            tx: tx_b,
            rx: Mutex::new(rx_a),
            closed: AtomicBool::new(false),
        });
        (left, right)
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, message: Vec<u8>) -> TransportResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        self.tx.send(message).map_err(|_| TransportError::Closed)
    }

    async fn recv(&self) -> TransportResult<Vec<u8>> {
        self.rx.lock().await.recv().await.ok_or(TransportError::Closed)
    }

    async fn close(&self) -> TransportResult<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// A [`Transport`] decorator that clones every outbound message onto a side
/// channel before forwarding it, so a test can inspect or replay exactly
/// what crossed the wire without otherwise touching the pipeline under
/// test.
pub struct TapTransport {
    inner: Arc<ChannelTransport>,
    tap_tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl TapTransport {
    /// Wrap `inner`, returning the wrapper and a receiver of everything
    /// subsequently sent through it.
    #[must_use]
    pub fn new(inner: Arc<ChannelTransport>) -> (Arc<Self>, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tap_tx, tap_rx) = mpsc::unbounded_channel();
        (Arc::new(Self { inner, tap_tx }), tap_rx)
    }
}

#[async_trait]
impl Transport for TapTransport {
    async fn send(&self, message: Vec<u8>) -> TransportResult<()> {
        let _ = self.tap_tx.send(message.clone());
        self.inner.send(message).await
    }

    async fn recv(&self) -> TransportResult<Vec<u8>> {
        self.inner.recv().await
    }

    async fn close(&self) -> TransportResult<()> {
        self.inner.close().await
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

/// An in-memory [`NicPort`], standing in for a kernel TAP/TUN device.
/// [`MemoryNic::inject`] feeds a frame to the pipeline as though the kernel
/// had just captured it from the local network stack; [`MemoryNic::delivered`]
/// observes a frame the pipeline wrote back to the kernel.
pub struct MemoryNic {
    to_pipeline_tx: mpsc::UnboundedSender<Vec<u8>>,
    to_pipeline_rx: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    from_pipeline_tx: mpsc::UnboundedSender<Vec<u8>>,
    from_pipeline_rx: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    closed: AtomicBool,
}

impl MemoryNic {
    /// Build a fresh, unconnected virtual NIC.
    #[must_use]
    pub fn new() -> Self {
        let (to_pipeline_tx, to_pipeline_rx) = mpsc::unbounded_channel();
        let (from_pipeline_tx, from_pipeline_rx) = mpsc::unbounded_channel();
        Self {
            to_pipeline_tx,
            to_pipeline_rx: Mutex::new(to_pipeline_rx),
            from_pipeline_tx,
            from_pipeline_rx: Mutex::new(from_pipeline_rx),
            closed: AtomicBool::new(false),
        }
    }

    /// Hand a frame to the pipeline as though the kernel had just captured
    /// it on this interface.
    pub fn inject(&self, frame: Vec<u8>) {
        let _ = self.to_pipeline_tx.send(frame);
    }

    /// Await the next frame the pipeline wrote back to the kernel.
    pub async fn delivered(&self) -> Option<Vec<u8>> {
        self.from_pipeline_rx.lock().await.recv().await
    }

    /// Whether [`NicPort::close`] has been called on this device.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Default for MemoryNic {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NicPort for MemoryNic {
    async fn recv(&self) -> Result<Vec<u8>, NicError> {
        self.to_pipeline_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(NicError::Closed)
    }

    async fn send(&self, frame: Vec<u8>) -> Result<(), NicError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(NicError::Closed);
        }
        let _ = self.from_pipeline_tx.send(frame);
        Ok(())
    }

    fn close(&self) -> Result<(), NicError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

/// Build a matched pair of `TunnelConfig`s for an initiator/responder that
/// authenticate to each other in advance (no trust-on-first-use).
#[must_use]
pub fn peer_configs(heartbeat_interval_s: u32, rekey_interval_s: u32) -> (TunnelConfig, TunnelConfig) {
    let mut rng = rand_core::OsRng;
    let initiator_identity = Arc::new(generate_hybrid_keypair(&mut rng, 0));
    let responder_identity = Arc::new(generate_hybrid_keypair(&mut rng, 0));
    let initiator_verify_key = initiator_identity.verify_key();
    let responder_verify_key = responder_identity.verify_key();

    let initiator = TunnelConfig {
        role: HandshakeRole::Initiator,
        local_identity: initiator_identity,
        peer_verify_key: responder_verify_key,
        capabilities: CAP_OBFUSCATION,
        mtu: 1500,
        heartbeat_interval_s,
        rekey_interval_s,
    };
    let responder = TunnelConfig {
        role: HandshakeRole::Responder,
        local_identity: responder_identity,
        peer_verify_key: initiator_verify_key,
        capabilities: CAP_OBFUSCATION,
        mtu: 1500,
        heartbeat_interval_s,
        rekey_interval_s,
    };
    (initiator, responder)
}

/// A 98-byte frame shaped like an Ethernet-framed ICMP echo request: just
/// enough header structure to look realistic without parsing a real ICMP
/// payload.
#[must_use]
pub fn sample_icmp_echo_frame() -> Vec<u8> {
    let mut frame = vec![0u8; 98];
    frame[0..6].copy_from_slice(&[0xBB; 6]); // destination MAC
    frame[6..12].copy_from_slice(&[0xAA; 6]); // source MAC
    frame[12..14].copy_from_slice(&[0x08, 0x00]); // EtherType: IPv4
    frame
}
