/*
 * Per-CPU Scheduler State
 *
 * One element per CPU, indexed by current-CPU ID (§3, 4.2). Modeled on
 * the teacher's `sched_core::PerCpuSchedState`, widened with the
 * distinguished idle/cleanup/preferred handles and the lock-held counter
 * this core's invariants depend on.
 */

use alloc::boxed::Box;
use spin::Mutex;

use super::policy::SchedulingPolicy;
use super::types::{CpuId, ThreadId};

/// One node of the intrusive run list. `policy_private` is scratch space
/// the scheduling policy may use for round counters, priorities, etc.
pub struct ScheduleEntry {
    pub task: ThreadId,
    pub policy_private: u64,
}

pub struct PerCpuSchedStateInner {
    pub time: u64,
    pub round: u64,
    pub current: Option<ThreadId>,
    pub list: alloc::vec::Vec<ScheduleEntry>,
    pub task_count: usize,
    pub idle_task: Option<ThreadId>,
    pub preferred_next_task: Option<ThreadId>,
    pub cleanup_task: Option<ThreadId>,
    /// Count of kernel locks currently held by `current`; scheduling is
    /// forbidden while nonzero (invariant 7, 4.8).
    pub locks_held: u32,
    /// True only inside the interrupt entry/exit envelope (4.8's
    /// precondition for `schedule`).
    pub in_interrupt_handler: bool,
    pub policy: Box<dyn SchedulingPolicy>,
}

/// Per-CPU scheduler state (§3). `lock` is the `spin::Mutex` wrapper;
/// everything mutable lives in `PerCpuSchedStateInner` so `assign`,
/// `schedule`, and the reaper can each take one lock for the duration of
/// their run-list walk.
pub struct PerCpuSchedState {
    pub cpu: CpuId,
    pub inner: Mutex<PerCpuSchedStateInner>,
}

impl PerCpuSchedState {
    /// Zero-initializes per 4.2; the two distinguished threads are
    /// attached afterward by `tasking::core::initialize_local`.
    pub fn new(cpu: CpuId, policy: Box<dyn SchedulingPolicy>) -> Self {
        PerCpuSchedState {
            cpu,
            inner: Mutex::new(PerCpuSchedStateInner {
                time: 0,
                round: 0,
                current: None,
                list: alloc::vec::Vec::new(),
                task_count: 0,
                idle_task: None,
                preferred_next_task: None,
                cleanup_task: None,
                locks_held: 0,
                in_interrupt_handler: false,
                policy,
            }),
        }
    }
}

impl PerCpuSchedStateInner {
    /// `assign` (4.4): idempotent prepend. A thread already on the list is
    /// left exactly where it is, matching `taskingAssign`, which
    /// unconditionally sets `task->assignment = local` with no failure path.
    pub fn assign(&mut self, task: ThreadId) {
        if self.list.iter().any(|e| e.task == task) {
            return;
        }
        let policy_private = self.policy.init_entry(task);
        self.list.insert(0, ScheduleEntry { task, policy_private });
        self.task_count += 1;
    }

    /// Detach every dead entry from the run list, returning them for the
    /// reaper to process outside the lock (4.10 step 1).
    pub fn detach_dead(&mut self, is_dead: impl Fn(ThreadId) -> bool) -> alloc::vec::Vec<ThreadId> {
        let mut dead = alloc::vec::Vec::new();
        self.list.retain(|entry| {
            if is_dead(entry.task) {
                dead.push(entry.task);
                false
            } else {
                true
            }
        });
        self.task_count = self.list.len();
        dead
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasking::policy::RoundRobinPolicy;

    #[test]
    fn task_count_matches_list_length() {
        let state = PerCpuSchedState::new(CpuId(0), Box::new(RoundRobinPolicy::new()));
        let mut inner = state.inner.lock();
        inner.assign(ThreadId(1));
        inner.assign(ThreadId(2));
        assert_eq!(inner.task_count, inner.list.len());
        assert_eq!(inner.task_count, 2);
    }

    #[test]
    fn assign_is_idempotent() {
        let state = PerCpuSchedState::new(CpuId(0), Box::new(RoundRobinPolicy::new()));
        let mut inner = state.inner.lock();
        inner.assign(ThreadId(1));
        inner.assign(ThreadId(2));
        // Re-assigning an already-present thread is a silent no-op: the
        // list and task_count are unchanged, not an error.
        inner.assign(ThreadId(1));
        assert_eq!(inner.task_count, 2);
        assert_eq!(inner.list.len(), 2);
        assert_eq!(inner.list.iter().filter(|e| e.task == ThreadId(1)).count(), 1);
    }
}
