//! Error taxonomy for the ShadowMesh core (§7).

use thiserror::Error;

/// Top-level core error, wrapping every layer below it.
#[derive(Debug, Error)]
pub enum Error {
    /// Wire codec error (C4)
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Handshake state machine error (C6)
    #[error("handshake error: {0}")]
    Handshake(#[from] HandshakeError),

    /// Session error (C7)
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// Tunnel pipeline error (C8)
    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    /// Transport error (C5)
    #[error("transport error: {0}")]
    Transport(#[from] shadowmesh_transport::TransportError),

    /// Virtual NIC error (C1)
    #[error("nic error: {0}")]
    Nic(#[from] shadowmesh_nic::NicError),

    /// Cryptographic primitive error (C2/C3)
    #[error("crypto error: {0}")]
    Crypto(#[from] shadowmesh_crypto::CryptoError),

    /// Configuration error: aborts session creation before any I/O.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// An internal invariant was violated. Always a bug.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Wire codec (C4) errors. The codec performs only structural parsing; all
/// of these indicate a malformed message, never a semantic problem.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Buffer too short to contain the common header.
    #[error("message too short: expected at least {expected}, got {actual}")]
    TooShort {
        /// Expected minimum size
        expected: usize,
        /// Actual size received
        actual: usize,
    },

    /// `version` byte is not a version this codec understands.
    #[error("invalid protocol version: {0}")]
    InvalidProtocolVersion(u8),

    /// `type` byte does not match any known message type.
    #[error("invalid message type: 0x{0:02X}")]
    InvalidMessageType(u8),

    /// `length` field exceeds the bytes remaining in the buffer.
    #[error("malformed message: length {length} exceeds remaining buffer of {remaining}")]
    MalformedMessage {
        /// Declared payload length
        length: u32,
        /// Bytes actually available
        remaining: usize,
    },

    /// Payload size does not match the type's fixed layout.
    #[error("malformed payload for message type 0x{message_type:02X}: expected {expected} bytes, got {actual}")]
    MalformedPayload {
        /// Message type byte
        message_type: u8,
        /// Expected payload size
        expected: usize,
        /// Actual payload size
        actual: usize,
    },
}

/// Handshake state machine (C6) errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    /// A message arrived that is not valid in the current handshake state.
    #[error("unexpected message in state {state}")]
    UnexpectedMessage {
        /// Human-readable current state name
        state: &'static str,
    },

    /// Hybrid signature verification failed on a HELLO or CHALLENGE.
    #[error("invalid signature")]
    InvalidSignature,

    /// HMAC proof in RESPONSE did not match the expected value.
    #[error("invalid handshake proof")]
    InvalidProof,

    /// Timestamp in HELLO/CHALLENGE skewed by more than 5 minutes.
    #[error("clock skew exceeds 5 minute tolerance")]
    ClockSkew,

    /// Handshake did not complete within the 30 s wall-clock budget.
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// More than 10 HELLOs from one source address within one minute.
    #[error("rate limit exceeded for source address")]
    RateLimitExceeded,

    /// A rekey attempt exceeded its 60 s budget.
    #[error("rekey attempt timed out")]
    RekeyTimeout,
}

/// Session (C7) errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// A frame's counter was not strictly greater than `rx_last_counter`.
    #[error("replay detected: counter {counter} <= last seen {last_seen}")]
    Replay {
        /// Rejected counter
        counter: u64,
        /// Highest counter previously accepted
        last_seen: u64,
    },

    /// No session has been installed yet (handshake not complete).
    #[error("no active session")]
    NoSession,

    /// Requested operation is invalid for the session's current state.
    #[error("invalid session state")]
    InvalidState,
}

/// Tunnel pipeline (C8) errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PipelineError {
    /// Three consecutive transport write failures.
    #[error("outbound worker exhausted retries")]
    WriteRetriesExhausted,

    /// Decryption error rate exceeded the 10/s threshold.
    #[error("decryption error rate exceeded threshold")]
    DecryptionErrorRateExceeded,
}
