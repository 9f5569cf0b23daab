//! Threads executing a device's units.
//!
//! Each device runs:
//!
//! - a pool of `workers` threads (`fpx<id>-w<n>`) executing file-backed
//!   units synchronously and completing them in place;
//! - one block submission thread per backing index (`fpx<id>-blk<i>`)
//!   executing block-device units and posting their results as
//!   [`BlockCompletion`] messages, so replicas on different block devices
//!   proceed concurrently;
//! - one completion reaper (`fpx<id>-done`) folding those messages into
//!   their chains.
//!
//! Threads exit once their queue is closed and drained, so requests already
//! dispatched still complete during shutdown.

use crate::device::DeviceInner;
use crate::tracker::Tracker;
use crate::unit::UnitPath;
use async_channel::{Receiver, Sender};
use fpx_error::Result;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error};

/// Result of a block-device unit, travelling back to the reaper.
pub(crate) struct BlockCompletion {
    unit: Arc<Tracker>,
    result: Result<()>,
}

pub(crate) struct WorkerThreads {
    threads: Vec<JoinHandle<()>>,
}

impl WorkerThreads {
    /// Join every thread except the calling one.
    pub fn join(self) {
        let me = thread::current().id();
        for handle in self.threads {
            if handle.thread().id() == me {
                continue;
            }
            let name = handle.thread().name().unwrap_or("fpx-worker").to_owned();
            if handle.join().is_err() {
                error!(target: "fpx::worker", thread = name.as_str(), "worker_panicked");
            }
        }
    }
}

pub(crate) fn spawn(
    inner: &Arc<DeviceInner>,
    work_rx: &Receiver<Arc<Tracker>>,
    block_rx: &[Receiver<Arc<Tracker>>],
) -> Result<WorkerThreads> {
    let mut threads = WorkerThreads {
        threads: Vec::with_capacity(inner.config.workers + block_rx.len() + 1),
    };
    if let Err(err) = spawn_all(inner, work_rx, block_rx, &mut threads.threads) {
        inner.close_queues();
        threads.join();
        return Err(err.into());
    }
    Ok(threads)
}

fn spawn_all(
    inner: &Arc<DeviceInner>,
    work_rx: &Receiver<Arc<Tracker>>,
    block_rx: &[Receiver<Arc<Tracker>>],
    threads: &mut Vec<JoinHandle<()>>,
) -> std::io::Result<()> {
    let device = inner.id();
    for n in 0..inner.config.workers {
        let inner = Arc::clone(inner);
        let rx = work_rx.clone();
        threads.push(
            thread::Builder::new()
                .name(format!("fpx{device}-w{n}"))
                .spawn(move || file_worker(&inner, &rx))?,
        );
    }

    let (done_tx, done_rx) = async_channel::unbounded();
    {
        let inner = Arc::clone(inner);
        threads.push(
            thread::Builder::new()
                .name(format!("fpx{device}-done"))
                .spawn(move || completion_reaper(&inner, &done_rx))?,
        );
    }
    for (index, rx) in block_rx.iter().enumerate() {
        let inner = Arc::clone(inner);
        let rx = rx.clone();
        let done = done_tx.clone();
        threads.push(
            thread::Builder::new()
                .name(format!("fpx{device}-blk{index}"))
                .spawn(move || block_submitter(&inner, &rx, &done))?,
        );
    }
    Ok(())
}

fn file_worker(inner: &DeviceInner, rx: &Receiver<Arc<Tracker>>) {
    debug!(target: "fpx::worker", device = %inner.id(), "worker_started");
    while let Ok(unit) = rx.recv_blocking() {
        let result = inner.execute_unit(&unit, UnitPath::Worker);
        inner.complete_unit(&unit, result);
    }
    debug!(target: "fpx::worker", device = %inner.id(), "worker_stopped");
}

fn block_submitter(
    inner: &DeviceInner,
    rx: &Receiver<Arc<Tracker>>,
    done: &Sender<BlockCompletion>,
) {
    debug!(target: "fpx::worker", device = %inner.id(), role = "block", "worker_started");
    while let Ok(unit) = rx.recv_blocking() {
        let result = inner.execute_unit(&unit, UnitPath::Block);
        if let Err(err) = done.send_blocking(BlockCompletion { unit, result }) {
            let BlockCompletion { unit, result } = err.into_inner();
            inner.complete_unit(&unit, result);
        }
    }
    debug!(target: "fpx::worker", device = %inner.id(), role = "block", "worker_stopped");
}

/// Runs until every block submitter has dropped its sending side.
fn completion_reaper(inner: &DeviceInner, rx: &Receiver<BlockCompletion>) {
    while let Ok(BlockCompletion { unit, result }) = rx.recv_blocking() {
        inner.complete_unit(&unit, result);
    }
    debug!(target: "fpx::worker", device = %inner.id(), role = "reaper", "worker_stopped");
}
