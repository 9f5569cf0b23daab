//! Write-cache flush coordination.
//!
//! Two kinds of flush reach a backing file:
//!
//! - **Explicit** flushes come from flush requests and from the PREFLUSH and
//!   FUA flags on writes. On a sync-on-write device they are no-ops.
//! - **Background** flushes (off by default) sync a file once enough write
//!   segments accumulated since the last flush. At most one runs at a time;
//!   writers arriving while it runs wait for it to finish.
//!
//! # Logging
//!
//! - **DEBUG** `fpx::flush`: `background_sync_start`, `background_sync_done`
//! - **WARN**  `fpx::flush`: `flush_failed` (explicit or background sync error)

use fpx_backing::BackingTarget;
use fpx_error::Result;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

#[derive(Debug)]
pub(crate) struct FlushCoordinator {
    background: bool,
    threshold: u64,
    sync_mode: bool,
    /// Segments written since the last flush.
    write_segments: AtomicU64,
    active: Mutex<bool>,
    idle: Condvar,
    pub flushes: AtomicU64,
    pub flush_nops: AtomicU64,
    pub syncs: AtomicU64,
}

impl FlushCoordinator {
    pub fn new(background: bool, threshold: u64, sync_mode: bool) -> Self {
        Self {
            background,
            threshold,
            sync_mode,
            write_segments: AtomicU64::new(0),
            active: Mutex::new(false),
            idle: Condvar::new(),
            flushes: AtomicU64::new(0),
            flush_nops: AtomicU64::new(0),
            syncs: AtomicU64::new(0),
        }
    }

    pub fn write_segments(&self) -> u64 {
        self.write_segments.load(Ordering::Relaxed)
    }

    pub fn record_writes(&self, segments: u64) {
        self.write_segments.fetch_add(segments, Ordering::Relaxed);
    }

    /// Called before a file-backed write. Starts a background sync of
    /// `target` when the threshold is crossed and none is running, or waits
    /// for the running one to finish.
    pub fn before_write(&self, target: &dyn BackingTarget) {
        let start = {
            let mut active = self.active.lock();
            let start = self.background
                && !*active
                && self.write_segments.load(Ordering::Relaxed) > self.threshold;
            if start {
                *active = true;
            } else {
                while *active {
                    self.idle.wait(&mut active);
                }
            }
            start
        };
        if start {
            self.background_sync(target);
        }
    }

    fn background_sync(&self, target: &dyn BackingTarget) {
        let pending = self.write_segments.load(Ordering::Relaxed);
        debug!(target: "fpx::flush", pending, "background_sync_start");
        if let Err(err) = target.sync() {
            if !err.is_unsupported() {
                warn!(target: "fpx::flush", error = %err, "flush_failed");
            }
        }
        let mut active = self.active.lock();
        self.write_segments.store(0, Ordering::Relaxed);
        self.syncs.fetch_add(1, Ordering::Relaxed);
        *active = false;
        self.idle.notify_all();
        drop(active);
        debug!(target: "fpx::flush", pending, "background_sync_done");
    }

    /// Explicit flush of `target`. `account` is set for the unit that counts
    /// the request (the head), so a replicated flush is counted once.
    pub fn flush(&self, target: &dyn BackingTarget, account: bool) -> Result<()> {
        if self.sync_mode {
            if account {
                self.flush_nops.fetch_add(1, Ordering::Relaxed);
            }
            return Ok(());
        }
        let result = target.sync();
        if account {
            self.flushes.fetch_add(1, Ordering::Relaxed);
        }
        self.write_segments.store(0, Ordering::Relaxed);
        match result {
            Ok(()) => Ok(()),
            Err(err) if err.is_unsupported() => Ok(()),
            Err(err) => {
                warn!(target: "fpx::flush", error = %err, "flush_failed");
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fpx_backing::{MemOp, MemTarget};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn sync_mode_flush_is_a_counted_no_op() {
        let flush = FlushCoordinator::new(false, 1024, true);
        let target = MemTarget::new(64);
        flush.flush(&target, true).expect("flush");
        flush.flush(&target, false).expect("flush");
        assert_eq!(flush.flush_nops.load(Ordering::Relaxed), 1);
        assert_eq!(flush.flushes.load(Ordering::Relaxed), 0);
        assert!(target.ops().is_empty());
    }

    #[test]
    fn explicit_flush_syncs_and_resets_counter() {
        let flush = FlushCoordinator::new(false, 1024, false);
        let target = MemTarget::new(64);
        flush.record_writes(10);
        flush.flush(&target, true).expect("flush");
        assert_eq!(flush.write_segments(), 0);
        assert_eq!(flush.flushes.load(Ordering::Relaxed), 1);
        assert_eq!(target.ops(), vec![MemOp::Sync]);
    }

    #[test]
    fn unsupported_sync_counts_as_success() {
        let flush = FlushCoordinator::new(false, 1024, false);
        let target = MemTarget::new(64);
        target.sync_unsupported(true);
        flush.flush(&target, true).expect("unsupported is success");
        target.sync_unsupported(false);
        target.fail_sync(true);
        assert!(flush.flush(&target, true).is_err());
    }

    #[test]
    fn background_sync_disabled_by_default_config() {
        let flush = FlushCoordinator::new(false, 2, false);
        let target = MemTarget::new(64);
        flush.record_writes(100);
        flush.before_write(&target);
        assert!(target.ops().is_empty());
        assert_eq!(flush.syncs.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn background_sync_triggers_past_threshold() {
        let flush = FlushCoordinator::new(true, 2, false);
        let target = MemTarget::new(64);
        flush.record_writes(2);
        flush.before_write(&target);
        assert_eq!(flush.syncs.load(Ordering::Relaxed), 0);
        flush.record_writes(1);
        flush.before_write(&target);
        assert_eq!(flush.syncs.load(Ordering::Relaxed), 1);
        assert_eq!(flush.write_segments(), 0);
        assert_eq!(target.ops(), vec![MemOp::Sync]);
    }

    #[test]
    fn writers_wait_for_running_background_sync() {
        let flush = Arc::new(FlushCoordinator::new(true, 0, false));
        let target = Arc::new(MemTarget::new(64));
        target.delay(Some(Duration::from_millis(50)));
        flush.record_writes(1);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let flush = Arc::clone(&flush);
                let target = Arc::clone(&target);
                thread::spawn(move || flush.before_write(target.as_ref()))
            })
            .collect();
        for handle in handles {
            handle.join().expect("writer");
        }
        // One writer started the sync; the others waited and found the
        // counter reset.
        assert_eq!(flush.syncs.load(Ordering::Relaxed), 1);
        assert!(!*flush.active.lock());
    }
}
