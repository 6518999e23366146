/*
 * ID Allocation and Global Thread Index
 *
 * A dedicated lock hands out strictly increasing thread/process IDs
 * (4.1); a second lock guards a keyed map from ID to thread handle,
 * mutated only at thread creation and during reaping.
 */

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use spin::Mutex;

use super::process::Process;
use super::thread::Thread;
use super::types::{ProcessId, ThreadId};

struct IdAllocator {
    next: u64,
}

static ID_LOCK: Mutex<IdAllocator> = Mutex::new(IdAllocator { next: 1 });

/// Returns successive non-negative integers under `ID_LOCK`. ID 0 is
/// never handed out; it is reserved to mean "no current thread" on a
/// freshly booted CPU (4.7's `store` very-first-interrupt case).
pub fn next_id() -> u64 {
    let mut guard = ID_LOCK.lock();
    let id = guard.next;
    guard.next += 1;
    id
}

/// Keyed map from thread ID to thread handle. Initialized with capacity
/// 128 at bootstrap-core init (4.1); `BTreeMap` has no preallocation
/// concept so the capacity requirement is satisfied trivially, but the
/// lock and the shape of the API match the spec exactly: insert at
/// creation, remove by the reaper, lookup returns `None` on miss.
pub struct GlobalThreadIndex {
    table: Mutex<BTreeMap<ThreadId, Arc<Mutex<Thread>>>>,
}

impl GlobalThreadIndex {
    pub const fn new() -> Self {
        Self {
            table: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn insert(&self, id: ThreadId, thread: Arc<Mutex<Thread>>) {
        self.table.lock().insert(id, thread);
    }

    pub fn remove(&self, id: ThreadId) -> Option<Arc<Mutex<Thread>>> {
        self.table.lock().remove(&id)
    }

    pub fn get(&self, id: ThreadId) -> Option<Arc<Mutex<Thread>>> {
        self.table.lock().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.table.lock().len()
    }
}

pub static GLOBAL_THREAD_INDEX: GlobalThreadIndex = GlobalThreadIndex::new();

/// Process registry. Not named in §3's data model explicitly, but
/// required by `createProcess`/`removeProcess`/`killProcess` (§6); kept
/// alongside the thread index since both are simple keyed maps mutated
/// at creation and torn down by the reaper path.
pub struct GlobalProcessIndex {
    table: Mutex<BTreeMap<ProcessId, Arc<Process>>>,
}

impl GlobalProcessIndex {
    pub const fn new() -> Self {
        Self {
            table: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn insert(&self, id: ProcessId, process: Arc<Process>) {
        self.table.lock().insert(id, process);
    }

    pub fn remove(&self, id: ProcessId) -> Option<Arc<Process>> {
        self.table.lock().remove(&id)
    }

    pub fn get(&self, id: ProcessId) -> Option<Arc<Process>> {
        self.table.lock().get(&id).cloned()
    }
}

pub static GLOBAL_PROCESS_INDEX: GlobalProcessIndex = GlobalProcessIndex::new();

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_strictly_increasing() {
        let a = next_id();
        let b = next_id();
        let c = next_id();
        assert!(a < b);
        assert!(b < c);
    }
}
