/*
 * Scheduler Driver - Pluggable Policy
 *
 * `schedule()` (4.8) only ever decides *when* to switch; *which* thread
 * runs next is delegated to a `SchedulingPolicy`, mirroring the
 * mechanism/policy split of the teacher's `traits::Scheduler` /
 * `sched_core::SchedulerCore`. The default policy is round-robin.
 */

use super::percpu::ScheduleEntry;
use super::types::ThreadId;

/// Scheduling algorithms implement this. `pick_next` receives the current
/// run-list contents and a runnability predicate (dead/sleeping threads
/// are filtered out by the caller's `is_runnable` closure, not by the
/// policy reaching into thread state itself).
pub trait SchedulingPolicy: Send {
    /// Opaque per-entry scratch value stored alongside a freshly assigned
    /// thread (round counters, priorities, ...).
    fn init_entry(&mut self, task: ThreadId) -> u64;

    /// Choose the next thread to run from `entries`, or `None` if every
    /// entry is unrunnable (the CPU should idle).
    fn pick_next(&mut self, entries: &[ScheduleEntry], is_runnable: &dyn Fn(ThreadId) -> bool) -> Option<ThreadId>;

    fn name(&self) -> &'static str;
}

/// Round-robin over the run list: scan forward from just after the
/// previously picked entry, wrapping once.
pub struct RoundRobinPolicy {
    last_index: usize,
}

impl RoundRobinPolicy {
    pub fn new() -> Self {
        RoundRobinPolicy { last_index: 0 }
    }
}

impl Default for RoundRobinPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl SchedulingPolicy for RoundRobinPolicy {
    fn init_entry(&mut self, _task: ThreadId) -> u64 {
        0
    }

    fn pick_next(&mut self, entries: &[ScheduleEntry], is_runnable: &dyn Fn(ThreadId) -> bool) -> Option<ThreadId> {
        if entries.is_empty() {
            return None;
        }
        let len = entries.len();
        for offset in 0..len {
            let idx = (self.last_index + offset) % len;
            if is_runnable(entries[idx].task) {
                self.last_index = (idx + 1) % len;
                return Some(entries[idx].task);
            }
        }
        None
    }

    fn name(&self) -> &'static str {
        "round-robin"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: u64) -> ScheduleEntry {
        ScheduleEntry {
            task: ThreadId(id),
            policy_private: 0,
        }
    }

    #[test]
    fn rotates_through_runnable_entries() {
        let mut policy = RoundRobinPolicy::new();
        let entries = alloc::vec![entry(1), entry(2), entry(3)];
        let always = |_: ThreadId| true;

        let first = policy.pick_next(&entries, &always).unwrap();
        let second = policy.pick_next(&entries, &always).unwrap();
        let third = policy.pick_next(&entries, &always).unwrap();
        let fourth = policy.pick_next(&entries, &always).unwrap();

        assert_eq!(first, ThreadId(1));
        assert_eq!(second, ThreadId(2));
        assert_eq!(third, ThreadId(3));
        assert_eq!(fourth, ThreadId(1));
    }

    #[test]
    fn skips_unrunnable_entries() {
        let mut policy = RoundRobinPolicy::new();
        let entries = alloc::vec![entry(1), entry(2), entry(3)];
        let only_three = |id: ThreadId| id == ThreadId(3);

        assert_eq!(policy.pick_next(&entries, &only_three), Some(ThreadId(3)));
    }

    #[test]
    fn empty_list_yields_none() {
        let mut policy = RoundRobinPolicy::new();
        let entries: alloc::vec::Vec<ScheduleEntry> = alloc::vec::Vec::new();
        assert_eq!(policy.pick_next(&entries, &|_| true), None);
    }
}
