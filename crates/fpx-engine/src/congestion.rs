//! Admission gate with hysteresis.
//!
//! A device turns congested once more than `threshold` requests are in
//! flight and clears only after in-flight drops below three quarters of the
//! threshold. A suspended device is always congested.

use crate::device::DeviceInner;
use crate::stats::DeviceCounters;
use std::sync::atomic::Ordering;
use tracing::debug;

/// Next congestion state given the current one and the in-flight count.
#[must_use]
pub fn next_congested(congested: bool, inflight: usize, threshold: usize) -> bool {
    if congested {
        // in-flight < 3/4 threshold, without the truncating division.
        inflight.saturating_mul(4) >= threshold.saturating_mul(3)
    } else {
        inflight > threshold
    }
}

impl DeviceInner {
    pub(crate) fn is_congested(&self) -> bool {
        if self.suspend_depth.load(Ordering::SeqCst) > 0 {
            return true;
        }
        let inflight = self.inflight.load(Ordering::Acquire);
        let threshold = self.config.congestion_threshold;

        let mut state = self.state.lock();
        let was = state.congested;
        let now = next_congested(was, inflight, threshold);
        if now != was {
            state.congested = now;
            drop(state);
            if now {
                DeviceCounters::bump(&self.counters.congestion_on);
                debug!(target: "fpx::congestion", device = %self.id(), inflight, threshold, "congestion_on");
            } else {
                DeviceCounters::bump(&self.counters.congestion_off);
                debug!(target: "fpx::congestion", device = %self.id(), inflight, threshold, "congestion_off");
            }
        }
        now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn turns_on_above_threshold_only() {
        assert!(!next_congested(false, 128, 128));
        assert!(next_congested(false, 129, 128));
    }

    #[test]
    fn clears_below_three_quarters() {
        assert!(next_congested(true, 100, 128));
        assert!(next_congested(true, 96, 128));
        assert!(!next_congested(true, 95, 128));
    }

    #[test]
    fn scripted_sequence_from_idle() {
        let threshold = 128;
        let mut congested = false;
        let mut seen = Vec::new();
        for inflight in [129, 100, 95] {
            congested = next_congested(congested, inflight, threshold);
            seen.push(congested);
        }
        assert_eq!(seen, [true, true, false]);
    }

    proptest! {
        #[test]
        fn hysteresis_band_holds_state(
            threshold in 1_usize..10_000,
            congested in any::<bool>(),
            permille in 0_usize..2_000,
        ) {
            let inflight = threshold * permille / 1_000;
            let next = next_congested(congested, inflight, threshold);
            if inflight > threshold {
                prop_assert!(next);
            } else if inflight * 4 < threshold * 3 {
                prop_assert!(!next);
            } else {
                // Inside the band the previous state is kept.
                prop_assert_eq!(next, congested);
            }
        }

        #[test]
        fn on_off_edges_alternate(
            threshold in 4_usize..512,
            trace in proptest::collection::vec(0_usize..1024, 1..64),
        ) {
            let mut congested = false;
            let mut edges = Vec::new();
            for inflight in trace {
                let next = next_congested(congested, inflight, threshold);
                if next != congested {
                    edges.push(next);
                }
                congested = next;
            }
            for pair in edges.windows(2) {
                prop_assert_ne!(pair[0], pair[1]);
            }
            if let Some(first) = edges.first() {
                prop_assert!(*first, "first edge must be congestion_on");
            }
        }
    }
}
