//! # ShadowMesh Virtual NIC
//!
//! Kernel TAP/TUN capture and injection for the ShadowMesh tunnel pipeline.
//! A [`device::NicDevice`] owns the kernel file descriptor and exposes it as
//! a pair of bounded, drop-on-overrun [`queue::FrameQueue`]s behind the
//! [`device::NicPort`] trait, so the rest of the stack never touches a raw
//! fd or blocks on kernel I/O.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod device;
pub mod error;
pub mod queue;

pub use device::{NicConfig, NicDevice, NicMode, NicPort, DEFAULT_MTU, L2_HEADER_SIZE};
pub use error::NicError;
pub use queue::{FrameQueue, OverrunPolicy, DEFAULT_QUEUE_DEPTH};
