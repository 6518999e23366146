/*
 * Per-Frame Reference Counts
 *
 * A frame shared across address spaces (the low kernel megabyte present
 * in every page directory, a TLS master mapped into several processes) is
 * only returned to the physical allocator once every mapping referencing
 * it has gone away (invariant 4). Counts are sparse, so a keyed map
 * mirrors the bitmap-over-contiguous-frames approach `memory::phys` uses
 * for allocation itself.
 */

use alloc::collections::BTreeMap;
use spin::Mutex;

use crate::tasking::collaborators::FrameRefTrackerContract;

pub struct FrameRefTracker {
    counts: Mutex<BTreeMap<u64, u64>>,
}

impl FrameRefTracker {
    pub const fn new() -> Self {
        FrameRefTracker {
            counts: Mutex::new(BTreeMap::new()),
        }
    }
}

impl Default for FrameRefTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameRefTrackerContract for FrameRefTracker {
    fn increment(&self, phys_addr: u64) {
        let mut counts = self.counts.lock();
        *counts.entry(phys_addr).or_insert(0) += 1;
    }

    fn decrement(&self, phys_addr: u64) -> u64 {
        let mut counts = self.counts.lock();
        let Some(count) = counts.get_mut(&phys_addr) else {
            return 0;
        };
        *count = count.saturating_sub(1);
        let remaining = *count;
        if remaining == 0 {
            counts.remove(&phys_addr);
        }
        remaining
    }
}

/// The single system-wide tracker; every paging adapter decrements
/// through this before handing a frame back to `memory::phys`.
pub static FRAME_REFS: FrameRefTracker = FrameRefTracker::new();

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_freed_only_after_last_decrement() {
        let tracker = FrameRefTracker::new();
        tracker.increment(0x1000);
        tracker.increment(0x1000);
        assert_eq!(tracker.decrement(0x1000), 1);
        assert_eq!(tracker.decrement(0x1000), 0);
    }

    #[test]
    fn decrementing_unknown_frame_is_a_no_op() {
        let tracker = FrameRefTracker::new();
        assert_eq!(tracker.decrement(0xdead), 0);
    }
}
