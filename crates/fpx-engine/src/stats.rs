//! Operation counters and the serializable stats snapshot.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic per-device operation counters.
///
/// Each counter is an independent atomic; a snapshot is not a consistent cut
/// across counters.
#[derive(Debug, Default)]
pub(crate) struct DeviceCounters {
    pub writes: AtomicU64,
    pub discards: AtomicU64,
    pub preflush: AtomicU64,
    pub fua: AtomicU64,
    pub errors: AtomicU64,
    pub completions: AtomicU64,
    pub switched: AtomicU64,
    pub slow_path: AtomicU64,
    pub congestion_on: AtomicU64,
    pub congestion_off: AtomicU64,
    pub total_latency_us: AtomicU64,
}

impl DeviceCounters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

pub(crate) fn load(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}

/// Point-in-time view of a device's fast-path state and counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FastpathStats {
    pub device: u64,
    pub fastpath: bool,
    pub connected: bool,
    pub backing_count: usize,
    pub backing_generation: u64,
    pub inflight: usize,
    pub suspend_depth: usize,
    pub queued: usize,
    pub congested: bool,
    pub live_trackers: usize,

    pub writes: u64,
    pub discards: u64,
    pub flushes: u64,
    pub flush_nops: u64,
    pub preflush: u64,
    pub fua: u64,
    pub errors: u64,
    pub completions: u64,
    pub switched: u64,
    pub slow_path: u64,
    pub syncs: u64,
    pub write_segments: u64,
    pub congestion_on: u64,
    pub congestion_off: u64,
    pub total_latency_us: u64,
}

impl FastpathStats {
    /// Mean latency of completed fast-path requests.
    #[must_use]
    pub fn mean_latency_us(&self) -> Option<u64> {
        self.total_latency_us.checked_div(self.completions)
    }
}
