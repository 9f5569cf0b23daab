//! Request fan-out and completion aggregation.
//!
//! `submit` either fails a request immediately, hands it to the slow path,
//! or builds its tracker chain and admits it. Admission re-checks the
//! suspend depth under the device lock: a suspended device queues the head,
//! otherwise the request is counted in flight under the same lock and
//! dispatched. Dispatch routes every unit (replicas first, head last) to the
//! block submission queue or the file worker pool depending on the store's
//! kind. Units complete in any order; the one that brings the head's active
//! count to zero reports the request's status and releases the chain.

use crate::bio::{Bio, BioHeader};
use crate::device::DeviceInner;
use crate::stats::DeviceCounters;
use crate::tracker::Tracker;
use fpx_backing::BackingKind;
use fpx_error::{BioStatus, FpxError, Result};
use fpx_types::BioOp;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing::{debug, trace, warn};

impl DeviceInner {
    pub(crate) fn submit(&self, bio: Bio) {
        if !self.connected.load(Ordering::Acquire) || self.removing.load(Ordering::Acquire) {
            debug!(
                target: "fpx::engine",
                device = %self.id(),
                op = bio.op().as_str(),
                reason = "disconnected",
                "request_failed"
            );
            bio.complete(BioStatus::NoDevice);
            return;
        }
        if !bio.op().is_read() && !self.config.mode.write_allowed() {
            let err = FpxError::ReadOnly(self.id().0);
            warn!(
                target: "fpx::engine",
                device = %self.id(),
                op = bio.op().as_str(),
                error = %err,
                "request_failed"
            );
            bio.complete(BioStatus::from(&err));
            return;
        }
        if !self.fastpath.load(Ordering::Acquire) {
            self.to_slow_path(bio);
            return;
        }
        self.fan_out(bio);
    }

    pub(crate) fn to_slow_path(&self, bio: Bio) {
        DeviceCounters::bump(&self.counters.slow_path);
        trace!(target: "fpx::engine", device = %self.id(), op = bio.op().as_str(), "request_slow_path");
        self.slow_path.submit(self.id(), bio);
    }

    /// Build the tracker chain of `bio` against the current backing set.
    fn fan_out(&self, bio: Bio) {
        let set = self.backing.load_full();
        if set.is_empty() {
            // Disabled between the fast-path check and here.
            self.to_slow_path(bio);
            return;
        }
        match self.arena.alloc_chain(bio, set.handles(), set.generation()) {
            Ok(head) => self.admit(head),
            Err(bio) => {
                let err = FpxError::NoMemory;
                warn!(
                    target: "fpx::engine",
                    device = %self.id(),
                    op = bio.op().as_str(),
                    live = self.arena.len(),
                    error = %err,
                    "tracker_alloc_failed"
                );
                bio.complete(BioStatus::from(&err));
            }
        }
    }

    /// Queue `head` if suspended, otherwise count it in flight and dispatch.
    pub(crate) fn admit(&self, head: Arc<Tracker>) {
        let mut state = self.state.lock();
        if state.suspend_depth > 0 {
            trace!(target: "fpx::suspend", device = %self.id(), tracker = %head.id(), "request_queued");
            state.queue.push_back(head);
            return;
        }
        if head.head_state().generation != self.backing.load().generation() {
            drop(state);
            self.redirect(&head);
            return;
        }
        self.inflight.fetch_add(1, Ordering::SeqCst);
        drop(state);
        self.dispatch(&head);
    }

    /// Dissolve a chain built against a backing set that has since been
    /// replaced and route the request again.
    fn redirect(&self, head: &Tracker) {
        let bio = head.head_state().take_bio();
        self.arena.release_chain(head);
        debug!(
            target: "fpx::engine",
            device = %self.id(),
            op = bio.op().as_str(),
            "request_redirected"
        );
        if self.fastpath.load(Ordering::Acquire) {
            self.fan_out(bio);
        } else {
            self.to_slow_path(bio);
        }
    }

    /// Fail a queued chain without executing it.
    pub(crate) fn fail_chain(&self, head: &Tracker, status: BioStatus) {
        let bio = head.head_state().take_bio();
        self.arena.release_chain(head);
        bio.complete(status);
    }

    fn dispatch(&self, head: &Arc<Tracker>) {
        let state = head.head_state();
        state.fails.store(0, Ordering::Relaxed);
        state.active.store(state.unit_count(), Ordering::Release);
        self.account(state.header);
        for &replica in &state.replicas {
            self.submit_unit(self.arena.get(replica));
        }
        self.submit_unit(Arc::clone(head));
    }

    fn account(&self, header: BioHeader) {
        let c = &self.counters;
        match header.op {
            BioOp::Write => {
                DeviceCounters::bump(&c.writes);
                if header.flags.preflush {
                    DeviceCounters::bump(&c.preflush);
                }
                if header.flags.fua {
                    DeviceCounters::bump(&c.fua);
                }
            }
            BioOp::Discard | BioOp::WriteZeroes => DeviceCounters::bump(&c.discards),
            BioOp::Read | BioOp::Flush => {}
        }
    }

    fn submit_unit(&self, unit: Arc<Tracker>) {
        let queue = match unit.handle().kind() {
            BackingKind::BlockDevice => {
                DeviceCounters::bump(&self.counters.switched);
                &self.block_tx[unit.handle().index().0]
            }
            BackingKind::RegularFile => &self.work_tx,
        };
        if let Err(err) = queue.try_send(unit) {
            let unit = err.into_inner();
            self.complete_unit(&unit, Err(FpxError::NotConnected(self.id().0)));
        }
    }

    /// Fold one unit's result into its chain.
    pub(crate) fn complete_unit(&self, unit: &Tracker, result: Result<()>) {
        unit.check_live();
        let head = if unit.is_head() {
            None
        } else {
            Some(self.arena.get(unit.head_id()))
        };
        let head = head.as_deref().unwrap_or(unit);
        let state = head.head_state();

        if let Err(err) = &result {
            state.fails.fetch_add(1, Ordering::AcqRel);
            warn!(
                target: "fpx::engine",
                device = %self.id(),
                tracker = %unit.id(),
                path = unit.handle().path(),
                op = state.header.op.as_str(),
                offset = state.header.offset.0,
                error = %err,
                "replica_failed"
            );
        }
        if state.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.finish(head);
        }
    }

    fn finish(&self, head: &Tracker) {
        let state = head.head_state();
        let failed = state.fails.load(Ordering::Acquire);
        let status = if failed == 0 {
            BioStatus::Ok
        } else {
            BioStatus::IoError
        };
        let units = state.unit_count();
        let bio = state.take_bio();
        self.arena.release_chain(head);

        let latency_us = u64::try_from(head.start().elapsed().as_micros()).unwrap_or(u64::MAX);
        DeviceCounters::bump(&self.counters.completions);
        if failed > 0 {
            DeviceCounters::bump(&self.counters.errors);
        }
        self.counters
            .total_latency_us
            .fetch_add(latency_us, Ordering::Relaxed);

        self.inflight.fetch_sub(1, Ordering::SeqCst);
        if self.suspend_depth.load(Ordering::SeqCst) > 0 {
            let _state = self.state.lock();
            self.drained.notify_all();
        }
        trace!(
            target: "fpx::engine",
            device = %self.id(),
            op = bio.op().as_str(),
            units,
            failed,
            latency_us,
            %status,
            "request_completed"
        );
        bio.complete(status);
    }
}
