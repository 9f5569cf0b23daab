#![forbid(unsafe_code)]
//! Backing stores for the fastpath engine.
//!
//! A backing store is one replica target of a virtual block device: a regular
//! file or a block device. This crate provides the [`BackingTarget`] trait
//! the engine performs I/O through, the [`BackingOpener`] seam used while
//! (re)configuring a device, and the immutable [`BackingSet`] the engine
//! publishes once every handle is open.
//!
//! # Logging
//!
//! - **INFO**  `fpx::backing`: `backing_opened`: path opened, with detected kind
//! - **WARN**  `fpx::backing`: `backing_unknown_kind`: neither file nor block device
//! - **DEBUG** `fpx::backing`: `backing_closed`: last reference to a file target dropped

mod file;
mod mem;

pub use file::{FileTarget, FsOpener};
pub use mem::{MemOp, MemOpener, MemTarget};

use fpx_error::Result;
use fpx_types::{BackingIndex, DeviceMode};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// What kind of object a backing path resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum BackingKind {
    /// Regular file: I/O is executed synchronously on a worker thread.
    RegularFile,
    /// Block device: I/O is submitted directly and completes asynchronously.
    BlockDevice,
}

impl BackingKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RegularFile => "file",
            Self::BlockDevice => "block",
        }
    }
}

/// Per-target operation statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TargetStats {
    pub reads: u64,
    pub writes: u64,
    pub syncs: u64,
    pub punches: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

/// Byte-addressed replica target.
///
/// Implementations must be safe to call from many threads at once; all
/// operations are positional and never share a seek cursor.
pub trait BackingTarget: Send + Sync + fmt::Debug {
    /// Kind of the underlying object.
    fn kind(&self) -> BackingKind;

    /// Write `buf` at `offset`, returning the number of bytes accepted.
    /// A count smaller than `buf.len()` is a short write.
    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<usize>;

    /// Read into `buf` from `offset`, returning the number of bytes read.
    /// A count smaller than `buf.len()` means the target ended early.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// Deallocate `len` bytes at `offset` without changing the target size.
    fn punch_hole(&self, offset: u64, len: u64) -> Result<()>;

    /// Make every completed write durable.
    fn sync(&self) -> Result<()>;

    /// Operation statistics since open.
    fn stats(&self) -> TargetStats;
}

/// Opens backing paths while a device is being (re)configured.
pub trait BackingOpener: Send + Sync + fmt::Debug {
    fn open(&self, path: &str, mode: DeviceMode) -> Result<Arc<dyn BackingTarget>>;
}

/// One installed replica target.
#[derive(Clone)]
pub struct BackingHandle {
    index: BackingIndex,
    path: String,
    target: Arc<dyn BackingTarget>,
}

impl BackingHandle {
    #[must_use]
    pub fn new(index: BackingIndex, path: String, target: Arc<dyn BackingTarget>) -> Self {
        Self {
            index,
            path,
            target,
        }
    }

    #[must_use]
    pub fn index(&self) -> BackingIndex {
        self.index
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[must_use]
    pub fn kind(&self) -> BackingKind {
        self.target.kind()
    }

    #[must_use]
    pub fn target(&self) -> &Arc<dyn BackingTarget> {
        &self.target
    }
}

impl fmt::Debug for BackingHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackingHandle")
            .field("index", &self.index.0)
            .field("path", &self.path)
            .field("kind", &self.kind())
            .finish_non_exhaustive()
    }
}

/// Immutable set of open replica targets.
///
/// Invariant: handle `i` sits at position `i`; when non-empty, handle 0 is
/// the primary. A set is never mutated after publication: reconfiguration
/// builds a new one with a higher generation.
#[derive(Debug, Default)]
pub struct BackingSet {
    generation: u64,
    handles: Vec<BackingHandle>,
}

impl BackingSet {
    #[must_use]
    pub fn empty(generation: u64) -> Self {
        Self {
            generation,
            handles: Vec::new(),
        }
    }

    #[must_use]
    pub fn new(generation: u64, handles: Vec<BackingHandle>) -> Self {
        debug_assert!(
            handles.iter().enumerate().all(|(i, h)| h.index.0 == i),
            "backing handles out of order"
        );
        Self {
            generation,
            handles,
        }
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    #[must_use]
    pub fn get(&self, index: BackingIndex) -> Option<&BackingHandle> {
        self.handles.get(index.0)
    }

    #[must_use]
    pub fn primary(&self) -> Option<&BackingHandle> {
        self.handles.first()
    }

    #[must_use]
    pub fn handles(&self) -> &[BackingHandle] {
        &self.handles
    }

    pub fn iter(&self) -> impl Iterator<Item = &BackingHandle> {
        self.handles.iter()
    }

    /// Paths of the installed handles, in index order.
    #[must_use]
    pub fn paths(&self) -> Vec<String> {
        self.handles.iter().map(|h| h.path.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backing_set_orders_handles_by_index() {
        let a: Arc<dyn BackingTarget> = Arc::new(MemTarget::new(4096));
        let b: Arc<dyn BackingTarget> = Arc::new(MemTarget::new(4096));
        let set = BackingSet::new(
            3,
            vec![
                BackingHandle::new(BackingIndex(0), "/a".into(), a),
                BackingHandle::new(BackingIndex(1), "/b".into(), b),
            ],
        );
        assert_eq!(set.generation(), 3);
        assert_eq!(set.len(), 2);
        assert_eq!(set.primary().map(BackingHandle::path), Some("/a"));
        assert_eq!(set.get(BackingIndex(1)).map(BackingHandle::path), Some("/b"));
        assert!(set.get(BackingIndex(2)).is_none());
    }

    #[test]
    fn empty_set_has_no_primary() {
        let set = BackingSet::empty(0);
        assert!(set.is_empty());
        assert!(set.primary().is_none());
    }
}
