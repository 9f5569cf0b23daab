#![forbid(unsafe_code)]
//! Fast-path engine of a replicated virtual block device.
//!
//! A [`Device`] takes block requests ([`Bio`]) and, while backing stores are
//! attached, executes them directly against every replica: writes, flushes
//! and discards fan out to all N stores, reads go to the primary only. Each
//! request is tracked by a chain of trackers (one head plus N-1 replicas);
//! the last replica to finish reports a single terminal [`BioStatus`].
//!
//! Around the fan-out core sit the admission gate ([`Device::is_congested`]),
//! the write-cache flush coordinator, suspend/resume with a FIFO queue of
//! requests arriving while suspended, and online reconfiguration of the
//! backing set ([`Device::enable`], [`Device::disable`],
//! [`Device::update_targets`]).
//!
//! When the fast path is disabled requests are handed unmodified to a
//! [`SlowPath`] implementation.
//!
//! # Logging
//!
//! | Target | Events |
//! |--------|--------|
//! | `fpx::engine` | `device_created`, `device_shutdown`, `request_failed`, `replica_failed`, `tracker_alloc_failed`, `request_redirected`, `request_slow_path`, `request_completed`, `discard_unsupported`, `slow_path_unattached` |
//! | `fpx::congestion` | `congestion_on`, `congestion_off` |
//! | `fpx::flush` | `background_sync_start`, `background_sync_done`, `flush_failed` |
//! | `fpx::suspend` | `device_suspended`, `device_resumed`, `request_queued`, `suspend_nested`, `suspend_draining`, `suspend_drain_timeout`, `resume_unbalanced` |
//! | `fpx::reconfig` | `fastpath_enabled`, `fastpath_disabled`, `fastpath_rollback`, `targets_updated`, `strict_without_backing`, `context_connection` |
//! | `fpx::worker` | `worker_started`, `worker_stopped`, `worker_panicked` |

mod bio;
mod config;
mod congestion;
mod context;
mod device;
mod engine;
mod flush;
mod reconfig;
mod slowpath;
mod stats;
mod suspend;
mod tracker;
mod unit;
mod worker;

pub use bio::{Bio, BioCompletion, EndIo};
pub use config::DeviceConfig;
pub use congestion::next_congested;
pub use context::FastpathContext;
pub use device::Device;
pub use slowpath::{SlowPath, UnattachedSlowPath};
pub use stats::FastpathStats;

pub use fpx_error::{BioStatus, FpxError, Result};
