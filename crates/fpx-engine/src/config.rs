//! Per-device configuration.

use fpx_error::{FpxError, Result};
use fpx_types::{DeviceId, DeviceMode, MAX_BACKING_PATH_LEN, MAX_BACKING_STORES};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// Configuration of one virtual device's fast path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub id: DeviceId,
    pub mode: DeviceMode,
    /// Fail target updates that leave the device without a backing store
    /// instead of degrading to the slow path.
    pub strict: bool,
    /// Backing paths installed when the device is brought up.
    pub paths: Vec<String>,
    /// In-flight count above which the device reports congestion.
    pub congestion_threshold: usize,
    /// Sync a file target once `flush_write_segments` segments have been
    /// written since the last flush.
    pub background_flush: bool,
    pub flush_write_segments: u64,
    /// Worker threads executing file-backed units.
    pub workers: usize,
    /// Tracker budget; allocation beyond it fails requests with `NoMemory`.
    pub max_trackers: usize,
    /// How long `suspend` waits for in-flight requests: retries x interval.
    pub suspend_drain_retries: u32,
    pub suspend_drain_interval_ms: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            id: DeviceId(0),
            mode: DeviceMode::READ_WRITE,
            strict: false,
            paths: Vec::new(),
            congestion_threshold: 128,
            background_flush: false,
            flush_write_segments: 1024,
            workers: 4,
            max_trackers: 4096,
            suspend_drain_retries: 30,
            suspend_drain_interval_ms: 100,
        }
    }
}

impl DeviceConfig {
    /// Default configuration for device `id`.
    #[must_use]
    pub fn for_device(id: u64) -> Self {
        Self {
            id: DeviceId(id),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn suspend_drain_interval(&self) -> Duration {
        Duration::from_millis(self.suspend_drain_interval_ms)
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(FpxError::InvalidConfig("workers must be at least 1".into()));
        }
        if self.congestion_threshold == 0 {
            return Err(FpxError::InvalidConfig(
                "congestion_threshold must be at least 1".into(),
            ));
        }
        if self.max_trackers == 0 {
            return Err(FpxError::InvalidConfig(
                "max_trackers must be at least 1".into(),
            ));
        }
        validate_paths(&self.paths)
    }
}

/// Check a backing path list: at most [`MAX_BACKING_STORES`] entries, each
/// non-empty, at most [`MAX_BACKING_PATH_LEN`] bytes, no duplicates.
pub(crate) fn validate_paths<S: AsRef<str>>(paths: &[S]) -> Result<()> {
    if paths.len() > MAX_BACKING_STORES {
        return Err(FpxError::InvalidConfig(format!(
            "{} backing paths given, at most {MAX_BACKING_STORES} supported",
            paths.len()
        )));
    }
    let mut seen = HashSet::with_capacity(paths.len());
    for path in paths {
        let path = path.as_ref();
        if path.is_empty() {
            return Err(FpxError::InvalidConfig("empty backing path".into()));
        }
        if path.len() > MAX_BACKING_PATH_LEN {
            return Err(FpxError::InvalidConfig(format!(
                "backing path {path:?} longer than {MAX_BACKING_PATH_LEN} bytes"
            )));
        }
        if !seen.insert(path) {
            return Err(FpxError::InvalidConfig(format!(
                "duplicate backing path {path:?}"
            )));
        }
    }
    Ok(())
}
