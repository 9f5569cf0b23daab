//! In-memory targets for testing and benchmarking.
//!
//! [`MemTarget`] keeps its bytes in a `Vec<u8>` and supports fault injection
//! so the engine's failure paths can be exercised without real devices.

use crate::{BackingKind, BackingOpener, BackingTarget, TargetStats};
use fpx_error::{FpxError, Result};
use fpx_types::DeviceMode;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

/// Operation recorded by a [`MemTarget`], in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemOp {
    Write { offset: u64, len: usize },
    Read { offset: u64, len: usize },
    Punch { offset: u64, len: u64 },
    Sync,
}

#[derive(Debug, Default, Clone, Copy)]
struct Faults {
    fail_writes: bool,
    fail_reads: bool,
    fail_sync: bool,
    sync_unsupported: bool,
    punch_unsupported: bool,
    short_write: Option<usize>,
    delay: Option<Duration>,
}

/// In-memory replica target with fault injection.
#[derive(Debug)]
pub struct MemTarget {
    kind: BackingKind,
    data: Mutex<Vec<u8>>,
    faults: Mutex<Faults>,
    log: Mutex<Vec<MemOp>>,
    stats: Mutex<TargetStats>,
}

impl MemTarget {
    /// Create a zero-filled regular-file target of `len` bytes.
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self::with_kind(len, BackingKind::RegularFile)
    }

    /// Create a zero-filled target of the given kind.
    #[must_use]
    pub fn with_kind(len: usize, kind: BackingKind) -> Self {
        Self {
            kind,
            data: Mutex::new(vec![0_u8; len]),
            faults: Mutex::new(Faults::default()),
            log: Mutex::new(Vec::new()),
            stats: Mutex::new(TargetStats::default()),
        }
    }

    pub fn fail_writes(&self, on: bool) {
        self.faults.lock().fail_writes = on;
    }

    pub fn fail_reads(&self, on: bool) {
        self.faults.lock().fail_reads = on;
    }

    pub fn fail_sync(&self, on: bool) {
        self.faults.lock().fail_sync = on;
    }

    pub fn sync_unsupported(&self, on: bool) {
        self.faults.lock().sync_unsupported = on;
    }

    pub fn punch_unsupported(&self, on: bool) {
        self.faults.lock().punch_unsupported = on;
    }

    /// Accept at most `limit` bytes per write call.
    pub fn short_write(&self, limit: Option<usize>) {
        self.faults.lock().short_write = limit;
    }

    /// Sleep this long before every data operation.
    pub fn delay(&self, delay: Option<Duration>) {
        self.faults.lock().delay = delay;
    }

    /// Copy of the current contents.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    /// Operations executed so far, in order.
    #[must_use]
    pub fn ops(&self) -> Vec<MemOp> {
        self.log.lock().clone()
    }

    fn faults(&self) -> Faults {
        let faults = *self.faults.lock();
        if let Some(delay) = faults.delay {
            std::thread::sleep(delay);
        }
        faults
    }
}

fn injected(what: &str) -> FpxError {
    FpxError::Io(std::io::Error::other(format!("injected {what} failure")))
}

#[expect(clippy::cast_possible_truncation)] // in-memory offsets fit usize
impl BackingTarget for MemTarget {
    fn kind(&self) -> BackingKind {
        self.kind
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<usize> {
        let faults = self.faults();
        if faults.fail_writes {
            return Err(injected("write"));
        }
        let take = faults.short_write.map_or(buf.len(), |l| l.min(buf.len()));
        let mut data = self.data.lock();
        let start = match self.kind {
            BackingKind::RegularFile => offset as usize,
            BackingKind::BlockDevice => (offset as usize).min(data.len()),
        };
        let end = start + take;
        let take = if end > data.len() {
            match self.kind {
                // Files grow on write; block devices end at their size.
                BackingKind::RegularFile => {
                    data.resize(end, 0);
                    take
                }
                BackingKind::BlockDevice => data.len().saturating_sub(start),
            }
        } else {
            take
        };
        data[start..start + take].copy_from_slice(&buf[..take]);
        drop(data);
        self.log.lock().push(MemOp::Write { offset, len: take });
        let mut s = self.stats.lock();
        s.writes += 1;
        s.bytes_written += take as u64;
        Ok(take)
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if self.faults().fail_reads {
            return Err(injected("read"));
        }
        let data = self.data.lock();
        let start = (offset as usize).min(data.len());
        let end = (start + buf.len()).min(data.len());
        let n = end - start;
        buf[..n].copy_from_slice(&data[start..end]);
        drop(data);
        self.log.lock().push(MemOp::Read { offset, len: n });
        let mut s = self.stats.lock();
        s.reads += 1;
        s.bytes_read += n as u64;
        Ok(n)
    }

    fn punch_hole(&self, offset: u64, len: u64) -> Result<()> {
        if self.faults().punch_unsupported {
            return Err(FpxError::Unsupported("punch_hole"));
        }
        let mut data = self.data.lock();
        let start = (offset as usize).min(data.len());
        let end = (start + len as usize).min(data.len());
        data[start..end].fill(0);
        drop(data);
        self.log.lock().push(MemOp::Punch { offset, len });
        self.stats.lock().punches += 1;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        let faults = self.faults();
        if faults.sync_unsupported {
            return Err(FpxError::Unsupported("sync"));
        }
        if faults.fail_sync {
            return Err(injected("sync"));
        }
        self.log.lock().push(MemOp::Sync);
        self.stats.lock().syncs += 1;
        Ok(())
    }

    fn stats(&self) -> TargetStats {
        self.stats.lock().clone()
    }
}

/// Opener resolving paths to registered [`MemTarget`]s.
///
/// Unregistered paths and paths marked failing return `ENOENT`-style open
/// errors. The opener keeps one reference to every target, so a target is
/// closed once no reference beyond the opener's (and the caller of
/// [`insert`](Self::insert)) remains.
#[derive(Debug, Default)]
pub struct MemOpener {
    targets: Mutex<HashMap<String, Arc<MemTarget>>>,
    failing: Mutex<HashSet<String>>,
    opens: Mutex<Vec<String>>,
}

impl MemOpener {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `target` under `path`, returning it for inspection.
    pub fn insert(&self, path: &str, target: MemTarget) -> Arc<MemTarget> {
        let target = Arc::new(target);
        self.targets.lock().insert(path.to_owned(), Arc::clone(&target));
        target
    }

    pub fn set_failing(&self, path: &str, failing: bool) {
        let mut set = self.failing.lock();
        if failing {
            set.insert(path.to_owned());
        } else {
            set.remove(path);
        }
    }

    /// Paths opened so far, in order.
    #[must_use]
    pub fn opens(&self) -> Vec<String> {
        self.opens.lock().clone()
    }
}

impl BackingOpener for MemOpener {
    fn open(&self, path: &str, _mode: DeviceMode) -> Result<Arc<dyn BackingTarget>> {
        if self.failing.lock().contains(path) {
            return Err(FpxError::OpenFailed {
                path: path.to_owned(),
                source: std::io::Error::from_raw_os_error(libc::ENOENT),
            });
        }
        let target = self.targets.lock().get(path).cloned().ok_or_else(|| {
            FpxError::OpenFailed {
                path: path.to_owned(),
                source: std::io::Error::from_raw_os_error(libc::ENOENT),
            }
        })?;
        self.opens.lock().push(path.to_owned());
        Ok(target)
    }
}
