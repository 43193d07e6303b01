//! Virtual NIC device: create/attach a TAP or TUN interface and expose it
//! as a pair of bounded byte-frame queues (§4.1, §9 polymorphism note).
//!
//! TAP (`L2Tap`) and TUN (`L3Tun`) are modeled as a tagged variant behind
//! one [`NicPort`] trait rather than two parallel code paths, per §9: a
//! session picks one mode at startup and never runs both concurrently.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::error::NicError;
use crate::queue::{FrameQueue, OverrunPolicy, DEFAULT_QUEUE_DEPTH};

/// Ethernet header length (destination MAC + source MAC + EtherType),
/// present in L2 frames and absent in L3 ones.
pub const L2_HEADER_SIZE: usize = 14;
/// Default negotiated MTU, matching [`crate::NicConfig::default`].
pub const DEFAULT_MTU: u16 = 1500;

/// Link layer a NIC device operates at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NicMode {
    /// TAP device: whole Ethernet frames, including L2 headers.
    L2Tap,
    /// TUN device: raw IP packets, no L2 header.
    L3Tun,
}

/// Construction parameters for [`NicDevice::open`].
#[derive(Debug, Clone)]
pub struct NicConfig {
    /// Requested interface name (Linux honors this; macOS assigns its own).
    pub name: Option<String>,
    /// Negotiated frame-payload MTU.
    pub mtu: u16,
    /// Link layer mode.
    pub mode: NicMode,
    /// Depth of each directional bounded queue.
    pub queue_depth: usize,
}

impl Default for NicConfig {
    fn default() -> Self {
        Self {
            name: None,
            mtu: DEFAULT_MTU,
            mode: NicMode::L2Tap,
            queue_depth: DEFAULT_QUEUE_DEPTH,
        }
    }
}

/// Common interface for a virtual NIC, implemented once and shared by the
/// tunnel pipeline regardless of L2/L3 mode.
#[async_trait]
pub trait NicPort: Send + Sync {
    /// Receive the next frame captured from the kernel. Awaits if the
    /// inbound queue is empty.
    async fn recv(&self) -> Result<Vec<u8>, NicError>;

    /// Inject a frame into the kernel, enqueuing it on the outbound queue.
    /// Drops (incrementing a counter) rather than blocking if the queue is
    /// full.
    async fn send(&self, frame: Vec<u8>) -> Result<(), NicError>;

    /// Release the kernel device. Idempotent; safe to call more than once.
    fn close(&self) -> Result<(), NicError>;
}

/// A TAP/TUN device plus its two directional queues and reader/writer
/// background tasks.
///
/// The kernel file descriptor is read and written on blocking OS threads
/// (via `tokio::task::spawn_blocking`), matching the teacher's convention
/// of keeping blocking syscalls off the async executor's worker threads.
pub struct NicDevice {
    config: NicConfig,
    inbound: Arc<FrameQueue>,
    outbound: Arc<FrameQueue>,
    closed: Arc<AtomicBool>,
    dropped_malformed: std::sync::atomic::AtomicU64,
}

impl NicDevice {
    /// Create/attach a kernel virtual NIC and spawn its reader/writer
    /// background tasks.
    ///
    /// # Errors
    ///
    /// Returns [`NicError::PermissionDenied`] without `CAP_NET_ADMIN` (or
    /// equivalent), [`NicError::DeviceBusy`] if `name` is already attached,
    /// or [`NicError::Unsupported`] on a platform without a TAP/TUN driver.
    #[cfg(target_os = "linux")]
    pub fn open(config: NicConfig) -> Result<Self, NicError> {
        let mode = match config.mode {
            NicMode::L2Tap => tun_tap::Mode::Tap,
            NicMode::L3Tun => tun_tap::Mode::Tun,
        };
        let iface = tun_tap::Iface::without_packet_info(
            config.name.as_deref().unwrap_or(""),
            mode,
        )
        .map_err(NicError::from)?;
        info!(name = iface.name(), ?config.mode, "NIC: attached virtual interface");

        let inbound = Arc::new(FrameQueue::new(config.queue_depth, OverrunPolicy::DropOldest));
        let outbound = Arc::new(FrameQueue::new(config.queue_depth, OverrunPolicy::DropNewest));
        let closed = Arc::new(AtomicBool::new(false));

        let iface = Arc::new(iface);
        spawn_reader(Arc::clone(&iface), Arc::clone(&inbound), config.mode, Arc::clone(&closed));
        spawn_writer(iface, Arc::clone(&outbound), Arc::clone(&closed));

        Ok(Self {
            config,
            inbound,
            outbound,
            closed,
            dropped_malformed: std::sync::atomic::AtomicU64::new(0),
        })
    }

    /// On non-Linux platforms no TAP/TUN binding is wired up; opening a
    /// device always reports unsupported rather than silently no-opping.
    #[cfg(not(target_os = "linux"))]
    pub fn open(_config: NicConfig) -> Result<Self, NicError> {
        Err(NicError::Unsupported)
    }

    /// Frames dropped for being below [`L2_HEADER_SIZE`] in L2 mode.
    #[must_use]
    pub fn malformed_dropped_count(&self) -> u64 {
        self.dropped_malformed.load(Ordering::Relaxed)
    }

    /// Number of frames dropped from the inbound (kernel→app) queue for
    /// being full.
    #[must_use]
    pub fn inbound_overrun_count(&self) -> u64 {
        self.inbound.dropped_count()
    }

    /// Number of frames dropped from the outbound (app→kernel) queue for
    /// being full.
    #[must_use]
    pub fn outbound_overrun_count(&self) -> u64 {
        self.outbound.dropped_count()
    }

    /// Configured mode (`L2Tap`/`L3Tun`).
    #[must_use]
    pub fn mode(&self) -> NicMode {
        self.config.mode
    }
}

#[async_trait]
impl NicPort for NicDevice {
    async fn recv(&self) -> Result<Vec<u8>, NicError> {
        self.inbound.pop().await.ok_or(NicError::Closed)
    }

    async fn send(&self, frame: Vec<u8>) -> Result<(), NicError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(NicError::Closed);
        }
        if self.config.mode == NicMode::L2Tap && frame.len() < L2_HEADER_SIZE {
            self.dropped_malformed.fetch_add(1, Ordering::Relaxed);
            warn!(len = frame.len(), "NIC: dropping undersized L2 frame on inject");
            return Ok(());
        }
        self.outbound.push(frame).await;
        Ok(())
    }

    fn close(&self) -> Result<(), NicError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        debug!("NIC: releasing virtual interface");
        Ok(())
    }
}

impl Drop for NicDevice {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(target_os = "linux")]
fn spawn_reader(
    iface: Arc<tun_tap::Iface>,
    inbound: Arc<FrameQueue>,
    mode: NicMode,
    closed: Arc<AtomicBool>,
) {
    tokio::task::spawn_blocking(move || {
        let mut buf = vec![0u8; 65536];
        loop {
            if closed.load(Ordering::Acquire) {
                return;
            }
            match iface.recv(&mut buf) {
                Ok(n) => {
                    if mode == NicMode::L2Tap && n < L2_HEADER_SIZE {
                        warn!(len = n, "NIC: dropping undersized frame from kernel");
                        continue;
                    }
                    let frame = buf[..n].to_vec();
                    let inbound = Arc::clone(&inbound);
                    tokio::runtime::Handle::current().block_on(inbound.push(frame));
                }
                Err(err) => {
                    warn!(error = %err, "NIC: kernel read failed");
                    return;
                }
            }
        }
    });
}

#[cfg(target_os = "linux")]
fn spawn_writer(iface: Arc<tun_tap::Iface>, outbound: Arc<FrameQueue>, closed: Arc<AtomicBool>) {
    tokio::task::spawn_blocking(move || loop {
        if closed.load(Ordering::Acquire) {
            return;
        }
        let Some(frame) = tokio::runtime::Handle::current().block_on(outbound.pop()) else {
            return;
        };
        if let Err(err) = iface.send(&frame) {
            warn!(error = %err, "NIC: kernel write failed");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_l2_tap_at_1500_mtu() {
        let config = NicConfig::default();
        assert_eq!(config.mode, NicMode::L2Tap);
        assert_eq!(config.mtu, 1500);
        assert_eq!(config.queue_depth, DEFAULT_QUEUE_DEPTH);
    }

    #[cfg(not(target_os = "linux"))]
    #[test]
    fn open_is_unsupported_off_linux() {
        let err = NicDevice::open(NicConfig::default()).unwrap_err();
        assert!(matches!(err, NicError::Unsupported));
    }
}
