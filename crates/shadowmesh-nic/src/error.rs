//! Error taxonomy for virtual NIC creation and I/O (§4.1, §7).

use thiserror::Error;

/// Failure kinds surfaced by [`crate::device::NicDevice::open`] and the
/// runtime read/write paths.
#[derive(Debug, Error)]
pub enum NicError {
    /// Process lacks `CAP_NET_ADMIN` or equivalent.
    #[error("permission denied creating virtual NIC")]
    PermissionDenied,

    /// The requested interface name is already attached.
    #[error("device busy: interface already attached")]
    DeviceBusy,

    /// The requested mode or platform combination is not supported.
    #[error("unsupported NIC mode or platform")]
    Unsupported,

    /// The device has already been closed.
    #[error("NIC device is closed")]
    Closed,

    /// Underlying OS I/O error.
    #[error("NIC I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for NicError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied,
            std::io::ErrorKind::AddrInUse | std::io::ErrorKind::AlreadyExists => Self::DeviceBusy,
            _ => Self::Io(err.to_string()),
        }
    }
}
