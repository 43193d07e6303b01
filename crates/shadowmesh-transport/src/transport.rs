//! Transport trait abstraction over the obfuscated WebSocket/TLS channel.
//!
//! This module defines the core `Transport` trait the tunnel pipeline
//! drives: whole wire messages in, whole wire messages out, no addressing
//! or packetization concerns leak through it.

use async_trait::async_trait;

/// Transport layer errors (§7).
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// I/O error from the underlying TCP/TLS/WebSocket stack.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Transport is closed; no further send/recv will succeed.
    #[error("transport is closed")]
    Closed,

    /// The TLS handshake failed.
    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),

    /// The WebSocket upgrade handshake failed.
    #[error("WebSocket handshake failed: {0}")]
    WebSocketHandshake(String),

    /// A non-binary WebSocket frame (text, ping/pong handled internally, or
    /// unexpected close) arrived where only binary data frames are valid.
    #[error("unexpected WebSocket frame kind")]
    UnexpectedFrameKind,

    /// No pong was observed within the keepalive deadline.
    #[error("peer missed {0} consecutive keepalive pongs")]
    KeepaliveTimeout(u32),

    /// A read or write did not complete within its deadline.
    #[error("{0} timed out")]
    Timeout(&'static str),

    /// Invalid configuration (bad certificate path, unparsable PEM, etc).
    #[error("invalid transport configuration: {0}")]
    InvalidConfig(String),

    /// Catch-all for backend-specific failures.
    #[error("transport error: {0}")]
    Other(String),
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Async transport trait for a single established peer channel.
///
/// Implementations carry whole wire messages (already framed and, for data
/// frames, already AEAD-sealed by the caller) as opaque byte vectors —
/// `Transport` itself knows nothing about ShadowMesh's message types.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one wire message. Returns once the message has been handed to
    /// the underlying socket (not necessarily ack'd by the peer).
    ///
    /// # Errors
    /// Returns `TransportError` if the write fails, times out, or the
    /// transport is closed.
    async fn send(&self, message: Vec<u8>) -> TransportResult<()>;

    /// Receive the next wire message, blocking until one arrives.
    ///
    /// # Errors
    /// Returns `TransportError` if the read fails, times out, the peer
    /// missed its keepalive deadline, or the transport is closed.
    async fn recv(&self) -> TransportResult<Vec<u8>>;

    /// Close the transport and release resources. Idempotent.
    ///
    /// # Errors
    /// Returns `TransportError` if the close handshake fails.
    async fn close(&self) -> TransportResult<()>;

    /// Whether the transport has been closed (locally or by the peer).
    fn is_closed(&self) -> bool;

    /// Snapshot of transport-level statistics.
    fn stats(&self) -> TransportStats {
        TransportStats::default()
    }
}

/// Transport-level statistics, independent of the cryptographic pipeline's
/// own [`shadowmesh_core::pipeline::PipelineStats`](../shadowmesh_core/pipeline/struct.PipelineStats.html).
#[derive(Debug, Clone, Default)]
pub struct TransportStats {
    /// Total bytes sent on the wire.
    pub bytes_sent: u64,
    /// Total bytes received from the wire.
    pub bytes_received: u64,
    /// Total WebSocket binary messages sent.
    pub messages_sent: u64,
    /// Total WebSocket binary messages received.
    pub messages_received: u64,
    /// Send failures.
    pub send_errors: u64,
    /// Receive failures.
    pub recv_errors: u64,
    /// Pings sent.
    pub pings_sent: u64,
    /// Pongs missed since the connection was established.
    pub pongs_missed: u64,
}

impl TransportStats {
    /// Create new empty statistics.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful send.
    pub fn record_send(&mut self, bytes: usize) {
        self.bytes_sent += bytes as u64;
        self.messages_sent += 1;
    }

    /// Record a successful receive.
    pub fn record_recv(&mut self, bytes: usize) {
        self.bytes_received += bytes as u64;
        self.messages_received += 1;
    }

    /// Record a send error.
    pub fn record_send_error(&mut self) {
        self.send_errors += 1;
    }

    /// Record a receive error.
    pub fn record_recv_error(&mut self) {
        self.recv_errors += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_accumulate_sends_and_receives() {
        let mut stats = TransportStats::new();
        stats.record_send(100);
        stats.record_send(50);
        stats.record_recv(200);

        assert_eq!(stats.bytes_sent, 150);
        assert_eq!(stats.messages_sent, 2);
        assert_eq!(stats.bytes_received, 200);
        assert_eq!(stats.messages_received, 1);
    }

    #[test]
    fn stats_track_errors_independently() {
        let mut stats = TransportStats::new();
        stats.record_send_error();
        stats.record_send_error();
        stats.record_recv_error();

        assert_eq!(stats.send_errors, 2);
        assert_eq!(stats.recv_errors, 1);
    }

    #[test]
    fn error_display_messages() {
        assert_eq!(TransportError::Closed.to_string(), "transport is closed");
        assert_eq!(
            TransportError::KeepaliveTimeout(3).to_string(),
            "peer missed 3 consecutive keepalive pongs"
        );
        assert!(TransportError::Timeout("read").to_string().contains("read"));
    }
}
