//! Suspend / resume.
//!
//! Suspension nests. The outermost `suspend` waits for in-flight requests
//! to drain, bounded by `suspend_drain_retries` timed-out waits of
//! `suspend_drain_interval` each (a completion wakeup does not use up a
//! retry); the device proceeds suspended even if some
//! are still running. While suspended, newly admitted requests queue. The
//! `resume` that brings the depth back to zero detaches the queue and
//! replays it in arrival order.
//!
//! # Logging
//!
//! - **INFO**  `fpx::suspend`: `device_suspended`, `device_resumed`
//! - **WARN**  `fpx::suspend`: `suspend_drain_timeout`, `resume_unbalanced`
//! - **DEBUG** `fpx::suspend`: `suspend_nested`, `suspend_draining`

use crate::device::DeviceInner;
use crate::tracker::Tracker;
use fpx_error::BioStatus;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing::{debug, info, warn};

impl DeviceInner {
    pub(crate) fn suspend(&self) {
        let depth = {
            let mut state = self.state.lock();
            state.suspend_depth += 1;
            self.suspend_depth.store(state.suspend_depth, Ordering::SeqCst);
            state.suspend_depth
        };
        if depth > 1 {
            debug!(target: "fpx::suspend", device = %self.id(), depth, "suspend_nested");
            return;
        }
        self.drain_inflight();
        info!(target: "fpx::suspend", device = %self.id(), "device_suspended");
    }

    fn drain_inflight(&self) {
        let interval = self.config.suspend_drain_interval();
        let retries = self.config.suspend_drain_retries;
        let mut state = self.state.lock();
        let mut attempt = 0;
        while attempt < retries {
            let inflight = self.inflight.load(Ordering::SeqCst);
            if inflight == 0 {
                return;
            }
            debug!(
                target: "fpx::suspend",
                device = %self.id(),
                inflight,
                attempt,
                "suspend_draining"
            );
            if self.drained.wait_for(&mut state, interval).timed_out() {
                attempt += 1;
            }
        }
        let inflight = self.inflight.load(Ordering::SeqCst);
        if inflight > 0 {
            warn!(
                target: "fpx::suspend",
                device = %self.id(),
                inflight,
                budget_ms = self.config.suspend_drain_interval_ms * u64::from(retries),
                "suspend_drain_timeout"
            );
        }
    }

    pub(crate) fn resume(&self) {
        let detached = {
            let mut state = self.state.lock();
            if state.suspend_depth == 0 {
                drop(state);
                warn!(target: "fpx::suspend", device = %self.id(), "resume_unbalanced");
                return;
            }
            state.suspend_depth -= 1;
            self.suspend_depth.store(state.suspend_depth, Ordering::SeqCst);
            if state.suspend_depth > 0 {
                return;
            }
            std::mem::take(&mut state.queue)
        };
        info!(
            target: "fpx::suspend",
            device = %self.id(),
            queued = detached.len(),
            "device_resumed"
        );
        for head in detached {
            self.replay(head);
        }
    }

    /// Route one request that was queued while suspended.
    fn replay(&self, head: Arc<Tracker>) {
        if !self.connected.load(Ordering::Acquire) || self.removing.load(Ordering::Acquire) {
            self.fail_chain(&head, BioStatus::NoDevice);
        } else if self.fastpath.load(Ordering::Acquire) {
            self.admit(head);
        } else {
            let bio = head.head_state().take_bio();
            self.arena.release_chain(&head);
            self.to_slow_path(bio);
        }
    }

    /// Fail every queued request, whatever the suspend depth.
    pub(crate) fn fail_queued(&self) {
        let queued = std::mem::take(&mut self.state.lock().queue);
        for head in queued {
            self.fail_chain(&head, BioStatus::NoDevice);
        }
    }
}
