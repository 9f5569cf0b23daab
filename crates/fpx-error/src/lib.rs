#![forbid(unsafe_code)]
//! Error types for the fastpath engine.
//!
//! # Error Taxonomy
//!
//! The engine distinguishes two kinds of failure:
//!
//! | Kind | Type | Purpose |
//! |------|------|---------|
//! | Control plane | `FpxError` (this crate) | enable / disable / target updates, backing-store I/O |
//! | Data plane | `BioStatus` (this crate) | terminal status delivered to a block request exactly once |
//!
//! Backing-store I/O is performed with `FpxError` results; the fan-out engine
//! folds every unit result into a single `BioStatus` for the original request.
//!
//! ## errno Mapping
//!
//! Every `FpxError` variant maps to exactly one POSIX errno via
//! [`FpxError::to_errno`]. The mapping is exhaustive (no wildcard arms).
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | raw OS error, else `EIO` |
//! | `ShortTransfer` | `EIO` |
//! | `NoMemory` | `ENOMEM` |
//! | `NotConnected` | `ENXIO` |
//! | `ReadOnly` | `EROFS` |
//! | `InvalidConfig` | `EINVAL` |
//! | `NoBackingStore` | `ENODEV` |
//! | `OpenFailed` | raw OS error, else `EIO` |
//! | `Unsupported` | `EOPNOTSUPP` |

use thiserror::Error;

/// Unified error type for fastpath operations.
#[derive(Debug, Error)]
pub enum FpxError {
    /// Operating system I/O error against a backing store.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A backing store accepted fewer bytes than requested.
    #[error("short {op} at offset {offset}: expected {expected} bytes, got {actual}")]
    ShortTransfer {
        op: &'static str,
        offset: u64,
        expected: usize,
        actual: usize,
    },

    /// Tracker budget exhausted while fanning out a request.
    #[error("out of tracker memory")]
    NoMemory,

    /// Device is disconnected or being removed.
    #[error("device {0} is not connected")]
    NotConnected(u64),

    /// Write attempted on a device opened read-only.
    #[error("device {0} is read-only")]
    ReadOnly(u64),

    /// Rejected backing-store configuration (path too long, too many paths,
    /// duplicate path).
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Strict device ended up without any backing store.
    #[error("device {0} has no usable backing store")]
    NoBackingStore(u64),

    /// Opening a backing path failed.
    #[error("failed to open backing path {path}: {source}")]
    OpenFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The backing store does not implement the requested operation.
    #[error("operation not supported: {0}")]
    Unsupported(&'static str),
}

impl FpxError {
    /// Convert this error into a POSIX errno.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) | Self::OpenFailed { source: err, .. } => {
                err.raw_os_error().unwrap_or(libc::EIO)
            }
            Self::ShortTransfer { .. } => libc::EIO,
            Self::NoMemory => libc::ENOMEM,
            Self::NotConnected(_) => libc::ENXIO,
            Self::ReadOnly(_) => libc::EROFS,
            Self::InvalidConfig(_) => libc::EINVAL,
            Self::NoBackingStore(_) => libc::ENODEV,
            Self::Unsupported(_) => libc::EOPNOTSUPP,
        }
    }

    /// True when the error means "this store cannot do that", which the
    /// engine treats as a successful no-op for discards and flushes.
    #[must_use]
    pub fn is_unsupported(&self) -> bool {
        match self {
            Self::Unsupported(_) => true,
            Self::Io(err) => matches!(
                err.raw_os_error(),
                Some(libc::EOPNOTSUPP | libc::EINVAL | libc::EAGAIN | libc::ENOSYS)
            ) || err.kind() == std::io::ErrorKind::Unsupported
                || err.kind() == std::io::ErrorKind::WouldBlock,
            _ => false,
        }
    }
}

/// Result alias using `FpxError`.
pub type Result<T> = std::result::Result<T, FpxError>;

/// Terminal status of a block request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BioStatus {
    Ok,
    /// At least one replica failed.
    IoError,
    /// Tracker allocation failed before fan-out.
    NoMemory,
    /// Device disconnected or being removed.
    NoDevice,
}

impl BioStatus {
    #[must_use]
    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }

    /// Negated-errno style code, `0` for success.
    #[must_use]
    pub fn errno(self) -> libc::c_int {
        match self {
            Self::Ok => 0,
            Self::IoError => libc::EIO,
            Self::NoMemory => libc::ENOMEM,
            Self::NoDevice => libc::ENXIO,
        }
    }
}

impl From<&FpxError> for BioStatus {
    fn from(err: &FpxError) -> Self {
        match err {
            FpxError::NoMemory => Self::NoMemory,
            FpxError::NotConnected(_) => Self::NoDevice,
            _ => Self::IoError,
        }
    }
}

impl std::fmt::Display for BioStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Ok => "ok",
            Self::IoError => "io error",
            Self::NoMemory => "out of memory",
            Self::NoDevice => "no device",
        };
        f.write_str(s)
    }
}
