//! Online reconfiguration of a device's backing stores.
//!
//! Every change happens with the device suspended, so no request ever runs
//! against a half-built backing set: either the complete new set is
//! published, or the device is rolled back to the slow path with no
//! handles at all.
//!
//! # Logging
//!
//! - **INFO**  `fpx::reconfig`: `fastpath_enabled`, `fastpath_disabled`, `targets_updated`
//! - **WARN**  `fpx::reconfig`: `fastpath_rollback`, `backing_sync_failed`
//! - **ERROR** `fpx::reconfig`: `strict_without_backing`

use crate::config::validate_paths;
use crate::device::DeviceInner;
use fpx_backing::BackingHandle;
use fpx_error::{FpxError, Result};
use fpx_types::BackingIndex;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing::{debug, error, info, warn};

impl DeviceInner {
    /// Caller holds `reconfig`.
    pub(crate) fn enable_locked(&self, force: bool) -> Result<()> {
        let paths = self.paths.lock().clone();
        if paths.is_empty() {
            debug!(target: "fpx::reconfig", device = %self.id(), "enable_without_paths");
            return Ok(());
        }

        self.suspend();
        let reusable = if force {
            // Close what is installed before reopening.
            self.publish(Vec::new());
            None
        } else {
            Some(self.backing.load_full())
        };

        let mut handles = Vec::with_capacity(paths.len());
        for (i, path) in paths.iter().enumerate() {
            let index = BackingIndex(i);
            let existing = reusable
                .as_ref()
                .and_then(|set| set.get(index))
                .filter(|handle| handle.path() == path.as_str())
                .map(|handle| Arc::clone(handle.target()));
            let opened = match existing {
                Some(target) => Ok(target),
                None => self.opener.open(path, self.config.mode),
            };
            match opened {
                Ok(target) => handles.push(BackingHandle::new(index, path.clone(), target)),
                Err(err) => {
                    drop(handles);
                    drop(reusable);
                    self.paths.lock().clear();
                    self.publish(Vec::new());
                    self.fastpath.store(false, Ordering::Release);
                    self.resume();
                    warn!(
                        target: "fpx::reconfig",
                        device = %self.id(),
                        path = path.as_str(),
                        error = %err,
                        "fastpath_rollback"
                    );
                    return Err(err);
                }
            }
        }

        drop(reusable);
        let count = handles.len();
        let generation = self.publish(handles);
        self.fastpath.store(true, Ordering::Release);
        self.connected.store(true, Ordering::Release);
        self.resume();
        info!(
            target: "fpx::reconfig",
            device = %self.id(),
            count,
            generation,
            force,
            "fastpath_enabled"
        );
        Ok(())
    }

    /// Caller holds `reconfig`.
    pub(crate) fn disable_locked(&self) {
        if !self.fastpath.load(Ordering::Acquire) {
            return;
        }
        self.suspend();
        let set = self.backing.load_full();
        for handle in set.iter() {
            if let Err(err) = handle.target().sync() {
                if !err.is_unsupported() {
                    warn!(
                        target: "fpx::reconfig",
                        device = %self.id(),
                        path = handle.path(),
                        error = %err,
                        "backing_sync_failed"
                    );
                }
            }
        }
        let count = set.len();
        drop(set);
        self.publish(Vec::new());
        self.fastpath.store(false, Ordering::Release);
        self.resume();
        info!(target: "fpx::reconfig", device = %self.id(), count, "fastpath_disabled");
    }

    pub(crate) fn update_targets(&self, paths: &[String]) -> Result<()> {
        validate_paths(paths)?;
        let _guard = self.reconfig.lock();
        self.disable_locked();
        let installed = self.backing.load().len();
        assert!(
            installed == 0,
            "device {}: {installed} backing handles still installed after disable",
            self.id()
        );

        *self.paths.lock() = paths.to_vec();
        let enabled = self.enable_locked(true);

        if self.backing.load().is_empty() {
            if self.config.strict {
                self.paths.lock().clear();
                error!(
                    target: "fpx::reconfig",
                    device = %self.id(),
                    requested = paths.len(),
                    "strict_without_backing"
                );
                return Err(FpxError::NoBackingStore(self.id().0));
            }
            if let Err(err) = enabled {
                debug!(
                    target: "fpx::reconfig",
                    device = %self.id(),
                    error = %err,
                    "degraded_to_slow_path"
                );
            }
        }
        info!(
            target: "fpx::reconfig",
            device = %self.id(),
            count = self.backing.load().len(),
            "targets_updated"
        );
        Ok(())
    }

    pub(crate) fn set_connected(&self, connected: bool) -> Result<()> {
        let _guard = self.reconfig.lock();
        if connected {
            let enabled = self.enable_locked(true);
            self.connected.store(true, Ordering::Release);
            enabled
        } else {
            self.connected.store(false, Ordering::Release);
            self.disable_locked();
            Ok(())
        }
    }
}
