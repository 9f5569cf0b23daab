#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum number of backing stores (replicas) per device.
pub const MAX_BACKING_STORES: usize = 3;

/// Maximum length in bytes of a backing path.
pub const MAX_BACKING_PATH_LEN: usize = 127;

/// Logical block size of the virtual device.
pub const LOGICAL_BLOCK_SIZE: u32 = 4096;

/// Stable numeric identity of a virtual block device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub u64);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Byte offset on a backing store (pread/pwrite semantics).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ByteOffset(pub u64);

impl ByteOffset {
    pub const ZERO: Self = Self(0);

    /// Add a byte count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, bytes: u64) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }
}

/// Identity of an I/O tracker inside a device's tracker arena.
///
/// Ids are never reused, so a stale id can always be detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TrackerId(pub u64);

impl fmt::Display for TrackerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "iot#{}", self.0)
    }
}

/// Position of a backing store in a device's backing set. Index 0 is the
/// primary replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BackingIndex(pub usize);

impl BackingIndex {
    pub const PRIMARY: Self = Self(0);

    #[must_use]
    pub fn is_primary(self) -> bool {
        self.0 == 0
    }
}

/// How backing stores are opened and whether the device accepts writes.
/// Unknown keys are rejected when deserializing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceMode {
    /// Device accepts non-read requests.
    pub writable: bool,
    /// Every write is durable on completion (`O_SYNC`); explicit flushes
    /// become no-ops.
    pub sync: bool,
}

impl DeviceMode {
    pub const READ_WRITE: Self = Self {
        writable: true,
        sync: false,
    };

    pub const READ_ONLY: Self = Self {
        writable: false,
        sync: false,
    };

    #[must_use]
    pub fn write_allowed(self) -> bool {
        self.writable
    }
}

impl Default for DeviceMode {
    fn default() -> Self {
        Self::READ_WRITE
    }
}

impl fmt::Display for DeviceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(if self.writable { "rw" } else { "ro" })?;
        if self.sync {
            f.write_str("|sync")?;
        }
        Ok(())
    }
}

/// Logical operation carried by a block request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BioOp {
    Read,
    Write,
    Flush,
    Discard,
    WriteZeroes,
}

impl BioOp {
    /// Reads are never replicated; every other operation fans out.
    #[must_use]
    pub fn is_read(self) -> bool {
        matches!(self, Self::Read)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Flush => "flush",
            Self::Discard => "discard",
            Self::WriteZeroes => "write_zeroes",
        }
    }
}

/// Durability flags on a write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BioFlags {
    /// Flush the target cache before the write.
    pub preflush: bool,
    /// Flush the target cache after the write (force unit access).
    pub fua: bool,
}

impl BioFlags {
    pub const NONE: Self = Self {
        preflush: false,
        fua: false,
    };
    pub const FUA: Self = Self {
        preflush: false,
        fua: true,
    };
    pub const PREFLUSH: Self = Self {
        preflush: true,
        fua: false,
    };
}
