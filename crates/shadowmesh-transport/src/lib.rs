//! # ShadowMesh Transport
//!
//! Obfuscated transport layer for ShadowMesh: every wire message travels as
//! one binary frame over a TLS 1.3 WebSocket connection. This crate exposes
//! that as the backend-agnostic [`Transport`] trait plus the concrete
//! [`websocket::WebSocketTransport`] implementation, so the tunnel pipeline
//! in `shadowmesh-core` never touches TCP, TLS, or WebSocket framing
//! directly.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod transport;
pub mod websocket;

pub use transport::{Transport, TransportError, TransportResult, TransportStats};
pub use websocket::{
    accept, client_tls_config, connect, server_tls_config, WebSocketTransport, MAX_MISSED_PONGS,
    PING_INTERVAL, READ_TIMEOUT, WRITE_TIMEOUT, WS_PATH,
};
