//! Hand-off to the out-of-process request handler.

use crate::bio::Bio;
use fpx_error::BioStatus;
use fpx_types::DeviceId;
use tracing::warn;

/// Receiver of requests the fast path does not execute.
///
/// `submit` takes over the request entirely: the implementation is
/// responsible for completing it exactly once.
pub trait SlowPath: Send + Sync {
    fn submit(&self, device: DeviceId, bio: Bio);
}

impl<F> SlowPath for F
where
    F: Fn(DeviceId, Bio) + Send + Sync,
{
    fn submit(&self, device: DeviceId, bio: Bio) {
        self(device, bio);
    }
}

/// Slow path used when no handler is attached: every request fails with
/// `NoDevice`.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnattachedSlowPath;

impl SlowPath for UnattachedSlowPath {
    fn submit(&self, device: DeviceId, bio: Bio) {
        warn!(
            target: "fpx::engine",
            %device,
            op = bio.op().as_str(),
            offset = bio.offset().0,
            "slow_path_unattached"
        );
        bio.complete(BioStatus::NoDevice);
    }
}
