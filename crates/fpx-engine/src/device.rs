//! The per-device context and its public handle.

use crate::bio::Bio;
use crate::config::DeviceConfig;
use crate::flush::FlushCoordinator;
use crate::slowpath::SlowPath;
use crate::stats::{DeviceCounters, FastpathStats, load};
use crate::tracker::{Tracker, TrackerArena};
use crate::worker::{self, WorkerThreads};
use arc_swap::ArcSwap;
use async_channel::Sender;
use fpx_backing::{BackingHandle, BackingOpener, BackingSet};
use fpx_error::Result;
use fpx_types::{DeviceId, MAX_BACKING_STORES};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use tracing::info;

/// Compound state guarded by the device lock.
#[derive(Default)]
pub(crate) struct DeviceState {
    pub suspend_depth: usize,
    /// Heads of requests that arrived while suspended, oldest first.
    pub queue: VecDeque<Arc<Tracker>>,
    pub congested: bool,
}

/// State shared between the device handle and its worker threads.
pub(crate) struct DeviceInner {
    pub config: DeviceConfig,
    pub connected: AtomicBool,
    pub removing: AtomicBool,
    pub fastpath: AtomicBool,
    /// Configured backing paths; may be non-empty while the fast path is
    /// disabled.
    pub paths: Mutex<Vec<String>>,
    pub backing: ArcSwap<BackingSet>,
    generation: AtomicU64,
    pub state: Mutex<DeviceState>,
    /// Signalled on request completion while suspended.
    pub drained: Condvar,
    /// Mirror of `state.suspend_depth` for lock-free reads.
    pub suspend_depth: AtomicUsize,
    pub inflight: AtomicUsize,
    pub counters: DeviceCounters,
    pub flush: FlushCoordinator,
    pub arena: TrackerArena,
    /// Serializes enable / disable / target updates.
    pub reconfig: Mutex<()>,
    pub opener: Arc<dyn BackingOpener>,
    pub slow_path: Arc<dyn SlowPath>,
    pub work_tx: Sender<Arc<Tracker>>,
    /// One block submission queue per backing index.
    pub block_tx: Vec<Sender<Arc<Tracker>>>,
}

impl DeviceInner {
    pub fn id(&self) -> DeviceId {
        self.config.id
    }

    /// Install `handles` as the new backing set under a fresh generation.
    pub fn publish(&self, handles: Vec<BackingHandle>) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.backing
            .store(Arc::new(BackingSet::new(generation, handles)));
        generation
    }

    pub fn close_queues(&self) {
        self.work_tx.close();
        for tx in &self.block_tx {
            tx.close();
        }
    }

    pub fn stats(&self) -> FastpathStats {
        let set = self.backing.load();
        let (suspend_depth, queued, congested) = {
            let state = self.state.lock();
            (state.suspend_depth, state.queue.len(), state.congested)
        };
        let c = &self.counters;
        FastpathStats {
            device: self.id().0,
            fastpath: self.fastpath.load(Ordering::Acquire),
            connected: self.connected.load(Ordering::Acquire),
            backing_count: set.len(),
            backing_generation: set.generation(),
            inflight: self.inflight.load(Ordering::Acquire),
            suspend_depth,
            queued,
            congested,
            live_trackers: self.arena.len(),
            writes: load(&c.writes),
            discards: load(&c.discards),
            flushes: load(&self.flush.flushes),
            flush_nops: load(&self.flush.flush_nops),
            preflush: load(&c.preflush),
            fua: load(&c.fua),
            errors: load(&c.errors),
            completions: load(&c.completions),
            switched: load(&c.switched),
            slow_path: load(&c.slow_path),
            syncs: load(&self.flush.syncs),
            write_segments: self.flush.write_segments(),
            congestion_on: load(&c.congestion_on),
            congestion_off: load(&c.congestion_off),
            total_latency_us: load(&c.total_latency_us),
        }
    }
}

/// A virtual block device's fast path.
///
/// Owns the device's worker pool, block submission thread and completion
/// reaper. Dropping the device shuts it down: queued requests fail with
/// `NoDevice`, in-flight requests finish, and every thread is joined.
pub struct Device {
    inner: Arc<DeviceInner>,
    threads: Mutex<Option<WorkerThreads>>,
}

impl Device {
    /// Create a device and, when `config.paths` is non-empty, install them
    /// as its backing stores.
    ///
    /// Fails on an invalid configuration, when the worker threads cannot be
    /// spawned, or when a strict device cannot open any backing store.
    pub fn new(
        config: DeviceConfig,
        opener: Arc<dyn BackingOpener>,
        slow_path: Arc<dyn SlowPath>,
    ) -> Result<Self> {
        config.validate()?;
        let (work_tx, work_rx) = async_channel::unbounded();
        let (block_tx, block_rx): (Vec<_>, Vec<_>) = (0..MAX_BACKING_STORES)
            .map(|_| async_channel::unbounded())
            .unzip();
        let paths = config.paths.clone();
        let inner = Arc::new(DeviceInner {
            flush: FlushCoordinator::new(
                config.background_flush,
                config.flush_write_segments,
                config.mode.sync,
            ),
            arena: TrackerArena::new(config.max_trackers),
            connected: AtomicBool::new(true),
            removing: AtomicBool::new(false),
            fastpath: AtomicBool::new(false),
            paths: Mutex::new(Vec::new()),
            backing: ArcSwap::from_pointee(BackingSet::empty(0)),
            generation: AtomicU64::new(0),
            state: Mutex::new(DeviceState::default()),
            drained: Condvar::new(),
            suspend_depth: AtomicUsize::new(0),
            inflight: AtomicUsize::new(0),
            counters: DeviceCounters::default(),
            reconfig: Mutex::new(()),
            opener,
            slow_path,
            work_tx,
            block_tx,
            config,
        });
        let threads = worker::spawn(&inner, &work_rx, &block_rx)?;
        let device = Self {
            inner,
            threads: Mutex::new(Some(threads)),
        };
        info!(
            target: "fpx::engine",
            device = %device.id(),
            mode = %device.inner.config.mode,
            workers = device.inner.config.workers,
            "device_created"
        );
        if !paths.is_empty() {
            device.update_targets(&paths)?;
        }
        Ok(device)
    }

    #[must_use]
    pub fn id(&self) -> DeviceId {
        self.inner.id()
    }

    #[must_use]
    pub fn config(&self) -> &DeviceConfig {
        &self.inner.config
    }

    /// Submit a request. Its callback runs exactly once: on the fast path
    /// after every replica finished, inline on immediate failure, or
    /// wherever the slow path completes it.
    pub fn submit(&self, bio: Bio) {
        self.inner.submit(bio);
    }

    /// Admission signal for the request queue. Always true while suspended.
    #[must_use]
    pub fn is_congested(&self) -> bool {
        self.inner.is_congested()
    }

    /// Stop executing I/O. Nests; the outermost call waits (bounded) for
    /// in-flight requests to finish.
    pub fn suspend(&self) {
        self.inner.suspend();
    }

    /// Undo one `suspend`; the last one replays queued requests in order.
    pub fn resume(&self) {
        self.inner.resume();
    }

    /// Open the configured backing paths and turn the fast path on.
    ///
    /// With `force`, already-open handles are closed and reopened. Any open
    /// failure rolls the device back to the slow path and is returned.
    pub fn enable(&self, force: bool) -> Result<()> {
        let _guard = self.inner.reconfig.lock();
        self.inner.enable_locked(force)
    }

    /// Sync and close every backing store and fall back to the slow path.
    pub fn disable(&self) {
        let _guard = self.inner.reconfig.lock();
        self.inner.disable_locked();
    }

    /// Replace the backing paths and re-enable the fast path on them.
    pub fn update_targets<S: AsRef<str>>(&self, paths: &[S]) -> Result<()> {
        let paths: Vec<String> = paths.iter().map(|p| p.as_ref().to_owned()).collect();
        self.inner.update_targets(&paths)
    }

    /// Mark the device connected (re-enabling the fast path) or
    /// disconnected (disabling it; further requests fail with `NoDevice`).
    pub fn set_connected(&self, connected: bool) -> Result<()> {
        self.inner.set_connected(connected)
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn fastpath_enabled(&self) -> bool {
        self.inner.fastpath.load(Ordering::Acquire)
    }

    /// Paths configured for the device, whether or not they are open.
    #[must_use]
    pub fn configured_paths(&self) -> Vec<String> {
        self.inner.paths.lock().clone()
    }

    /// Paths of the currently installed backing stores.
    #[must_use]
    pub fn backing_paths(&self) -> Vec<String> {
        self.inner.backing.load().paths()
    }

    #[must_use]
    pub fn stats(&self) -> FastpathStats {
        self.inner.stats()
    }

    /// Tear the device down. Idempotent.
    pub fn shutdown(&self) {
        let Some(threads) = self.threads.lock().take() else {
            return;
        };
        self.inner.removing.store(true, Ordering::Release);
        {
            let _guard = self.inner.reconfig.lock();
            self.inner.disable_locked();
        }
        self.inner.fail_queued();
        self.inner.close_queues();
        threads.join();
        info!(target: "fpx::engine", device = %self.id(), "device_shutdown");
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id())
            .field("fastpath", &self.fastpath_enabled())
            .field("backing", &self.backing_paths())
            .finish_non_exhaustive()
    }
}
