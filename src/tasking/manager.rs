/*
 * Tasking Manager - Production Wiring and Public Entry Points
 *
 * `ThreadManager`/`ProcessManager` are zero-sized handles over the global
 * tasking state, mirroring the teacher's own `scheduler::thread::ThreadManager`
 * / `scheduler::process::ProcessManager` — callers never hold a `Tasking`
 * instance themselves, they call through these instead. `ProductionCollaborators`
 * is the one real `Collaborators` impl, wiring `tasking::core` to
 * `memory::paging32`, `memory::refcount`, `memory::vrange`, `arch::x86_64::gdt`,
 * and a minimal wait/filesystem stub (both out of scope per the spec's
 * Non-goals, so they log and otherwise no-op).
 */

use alloc::sync::Arc;
use spin::Mutex;
use x86_64::VirtAddr;

use crate::arch::x86_64::gdt::Gdt;
use crate::memory::paging32::{Frames, Paging32};
use crate::memory::refcount::FRAME_REFS;
use crate::memory::vrange::VirtualRangePool;

use super::collaborators::{
    Collaborators, FilesystemContract, FrameAllocatorContract, FrameRefTrackerContract, GdtContract,
    PagingContract, VirtualRangePoolContract, WaitContract,
};
use super::core;
use super::process::Process;
use super::types::{ProcessId, SecurityLevel, ThreadCreateError, ThreadId};

/// One shared kernel virtual range pool, lazily built on first use since
/// `VirtualRangePool::new_kernel` is not `const`.
static KERNEL_VRANGE: Mutex<Option<VirtualRangePool>> = Mutex::new(None);

struct KernelVrangeHandle;

impl VirtualRangePoolContract for KernelVrangeHandle {
    fn add_range(&self, start: VirtAddr, end: VirtAddr) {
        let mut slot = KERNEL_VRANGE.lock();
        slot.get_or_insert_with(VirtualRangePool::new_kernel).add_range(start, end);
    }

    fn allocate(&self, pages: usize, tag: super::collaborators::VirtualRangeTag) -> Option<VirtAddr> {
        let mut slot = KERNEL_VRANGE.lock();
        slot.get_or_insert_with(VirtualRangePool::new_kernel).allocate(pages, tag)
    }

    fn free(&self, vaddr: VirtAddr) {
        let mut slot = KERNEL_VRANGE.lock();
        if let Some(pool) = slot.as_mut() {
            pool.free(vaddr);
        }
    }
}

/// Waiting/sleeping is implemented by the out-of-scope wait subsystem
/// (Design Notes Open Question 2); the reaper's own sleep is satisfied by
/// a plain timer-driven yield loop instead of a real wait queue.
struct NullWait;

impl WaitContract for NullWait {
    fn sleep(&self, task: ThreadId, ms: u32) {
        log::trace!("tasking: {} requested a {} ms sleep (wait subsystem out of scope)", task, ms);
        crate::utils::timer::sleep_ms(ms as u64);
    }
}

/// The filesystem's per-process record is out of scope; this only logs
/// the lifecycle events the tasking core is contractually required to emit.
struct NullFilesystem;

impl FilesystemContract for NullFilesystem {
    fn process_create(&self, pid: ProcessId) {
        log::debug!("tasking: process {} created", pid);
    }

    fn process_remove(&self, pid: ProcessId) {
        log::debug!("tasking: process {} removed", pid);
    }
}

struct ProductionCollaborators {
    frames: Frames,
    paging: Paging32,
    vrange_kernel: KernelVrangeHandle,
    gdt: Gdt,
    wait: NullWait,
    filesystem: NullFilesystem,
}

impl Collaborators for ProductionCollaborators {
    fn frames(&self) -> &dyn FrameAllocatorContract {
        &self.frames
    }

    fn paging(&self) -> &dyn PagingContract {
        &self.paging
    }

    fn refcount(&self) -> &dyn FrameRefTrackerContract {
        &FRAME_REFS
    }

    fn vrange_kernel(&self) -> &dyn VirtualRangePoolContract {
        &self.vrange_kernel
    }

    fn gdt(&self) -> &dyn GdtContract {
        &self.gdt
    }

    fn wait(&self) -> &dyn WaitContract {
        &self.wait
    }

    fn filesystem(&self) -> &dyn FilesystemContract {
        &self.filesystem
    }
}

static PRODUCTION: ProductionCollaborators = ProductionCollaborators {
    frames: Frames,
    paging: Paging32,
    vrange_kernel: KernelVrangeHandle,
    gdt: Gdt,
    wait: NullWait,
    filesystem: NullFilesystem,
};

/// The collaborator set every production call site uses. Tests supply
/// their own fakes directly to `tasking::core` instead of going through
/// this.
pub fn production() -> &'static dyn Collaborators {
    &PRODUCTION
}

/// Process-level entry points, mirroring the teacher's `ProcessManager`.
pub struct ProcessManager;

impl ProcessManager {
    /// Create a fresh process with no threads yet.
    pub fn create() -> Arc<Process> {
        core::create_process(production())
    }

    pub fn kill(pid: ProcessId) {
        core::kill_process(production(), pid);
    }
}

/// Thread-level entry points, mirroring the teacher's `ThreadManager`.
pub struct ThreadManager;

impl ThreadManager {
    /// Spawn a new kernel thread in a fresh kernel process, the
    /// convenience path most in-kernel callers use.
    pub fn spawn_kernel(entry: extern "C" fn()) -> Result<ThreadId, ThreadCreateError> {
        let process = ProcessManager::create();
        core::create_thread(production(), entry as u64, &process, SecurityLevel::Kernel)
    }

    /// Create a thread within a specific, already-existing process.
    pub fn spawn_in_process(
        entry: u64,
        process: &Arc<Process>,
        level: SecurityLevel,
    ) -> Result<ThreadId, ThreadCreateError> {
        core::create_thread(production(), entry, process, level)
    }

    pub fn current() -> Option<ThreadId> {
        let state = core::get_local();
        state.inner.lock().current
    }

    /// Cooperative yield (4.9), the public name callers use.
    pub fn yield_now() {
        core::kernel_thread_yield();
    }

    /// Cooperative exit (4.9), the public name callers use.
    pub fn exit() -> ! {
        core::kernel_thread_exit();
    }
}

/// One-time boot-time setup for the bootstrap CPU (4.2).
pub fn initialize_bsp(cpu_count: usize) {
    core::initialize_bsp(production(), cpu_count);
}

/// Per-AP setup (4.2), called once on each application processor as it
/// comes online.
pub fn initialize_ap(cpu: super::types::CpuId) {
    core::initialize_ap(production(), cpu);
}

/// One pass of the calling CPU's cleanup thread loop (4.10); called in a
/// loop from the cleanup thread's body.
pub fn run_reaper_once() {
    core::reaper_pass(production());
}
