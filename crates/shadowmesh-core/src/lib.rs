//! # ShadowMesh Core
//!
//! Protocol orchestration for ShadowMesh: an encrypted peer-to-peer overlay
//! that carries Ethernet/IP frames between two hosts over an obfuscated
//! WebSocket/TLS transport, authenticated by a hybrid post-quantum key
//! exchange.
//!
//! This crate provides:
//! - **Wire codec** ([`frame`]): the 8-byte common header and per-message-type
//!   payload encoding described in §6.
//! - **Handshake state machine** ([`handshake`]): the 4-message hybrid
//!   authenticated key exchange (HELLO/CHALLENGE/RESPONSE/ESTABLISHED).
//! - **Session** ([`session`]): installed per-direction keys, frame
//!   counters, and rekey-generation bookkeeping for one tunnel.
//! - **Tunnel pipeline** ([`pipeline`]): the NIC-to-transport and
//!   transport-to-NIC worker tasks that move encrypted frames in each
//!   direction.
//! - **Lifecycle controller** ([`node`]): owns a tunnel end to end — runs
//!   the handshake, installs the session, spawns pipeline workers, arms
//!   heartbeat and rekey timers, and drives shutdown.
//! - **Error types** ([`error`]): a layered `thiserror` taxonomy mirroring
//!   this module structure.
//!
//! ## Module Structure
//!
//! - [`error`]: error types for every layer below
//! - [`frame`]: wire codec (header + typed payloads)
//! - [`handshake`]: hybrid authenticated key exchange state machine
//! - [`session`]: installed session keys and anti-replay state
//! - [`pipeline`]: outbound/inbound tunnel worker tasks
//! - [`node`]: lifecycle controller (handshake → session → pipeline → shutdown)

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod error;
pub mod frame;
pub mod handshake;
pub mod node;
pub mod pipeline;
pub mod session;

pub use error::Error;
pub use frame::{Header, MessageType, WireMessage, HEADER_SIZE, PROTOCOL_VERSION};
pub use handshake::{Handshake, HandshakeRole};
pub use node::{Tunnel, TunnelConfig, TunnelEvent};
pub use session::Session;

/// Wire protocol version (same value as [`frame::PROTOCOL_VERSION`], exposed
/// here for callers that only need the version, not the codec).
pub const PROTOCOL_VERSION_U32: u32 = PROTOCOL_VERSION as u32;
