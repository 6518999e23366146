/*
 * Tasking Core - Lifecycle, Context Switch, Signals
 *
 * The operations of component design §4: ID/index access, per-CPU init,
 * thread creation, assignment, address-space borrow, TLS provisioning,
 * store/restore, the scheduler driver, cooperative yield/exit, the
 * reaper, thread/process removal, and signal injection.
 *
 * Every operation that touches a collaborator (frames, paging, refcount,
 * virtual ranges, the GDT, wait/sleep, the filesystem) takes `&dyn
 * Collaborators` so production callers and `#[cfg(test)]` fakes share
 * the same code path.
 */

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;
use x86_64::VirtAddr;

use super::collaborators::{Collaborators, PageFlags, TableFlags, VirtualRangeTag};
use super::ids::{self, GLOBAL_PROCESS_INDEX, GLOBAL_THREAD_INDEX};
use super::percpu::PerCpuSchedState;
use super::policy::RoundRobinPolicy;
use super::process::Process;
use super::thread::{InterruptionInfo, ProcessorState, Thread, TlsCopy, VirtRange};
use super::types::{
    CpuId, ProcessId, RaiseSignalStatus, SecurityLevel, ThreadCreateError, ThreadId, ThreadKind,
    ThreadStatus, EFLAGS_IF, EFLAGS_IOPL_3, PAGE_SIZE, SIGSEGV,
};

const KERNEL_STACK_PAGES: usize = 4;
const INTERRUPT_STACK_PAGES: usize = 2;

static PER_CPU: Mutex<Vec<Arc<PerCpuSchedState>>> = Mutex::new(Vec::new());

/// CLUU targets a single bootstrap CPU; multi-core affinity beyond one
/// per-CPU run queue is an explicit Non-goal. `current_cpu_id` is the one
/// seam a future APIC-ID lookup would replace.
pub fn current_cpu_id() -> CpuId {
    CpuId(0)
}

/// `getLocal()`: this CPU's scheduler state.
pub fn get_local() -> Arc<PerCpuSchedState> {
    let table = PER_CPU.lock();
    table[current_cpu_id().0 as usize].clone()
}

fn get_cpu(cpu: CpuId) -> Arc<PerCpuSchedState> {
    let table = PER_CPU.lock();
    table[cpu.0 as usize].clone()
}

/// `getNextId()`.
pub fn get_next_id() -> u64 {
    ids::next_id()
}

/// `getById(tid)`.
pub fn get_by_id(tid: ThreadId) -> Option<Arc<Mutex<Thread>>> {
    GLOBAL_THREAD_INDEX.get(tid)
}

// ============================================================================
// 4.2 Per-CPU Initialization
// ============================================================================

/// The bootstrap CPU allocates the per-CPU array sized to `cpu_count`,
/// then runs `initialize_local` for CPU 0.
pub fn initialize_bsp(collab: &dyn Collaborators, cpu_count: usize) {
    let mut table = PER_CPU.lock();
    table.clear();
    for i in 0..cpu_count {
        table.push(Arc::new(PerCpuSchedState::new(
            CpuId(i as u32),
            Box::new(RoundRobinPolicy::new()),
        )));
    }
    drop(table);

    initialize_local(collab, CpuId(0));
}

/// An application CPU joining after the BSP runs only its own local init.
pub fn initialize_ap(collab: &dyn Collaborators, cpu: CpuId) {
    initialize_local(collab, cpu);
}

/// Zero-initializes this CPU's state (already done by `PerCpuSchedState::new`)
/// then creates the idle and cleanup threads, each in a fresh kernel
/// process, per 4.2.
fn initialize_local(collab: &dyn Collaborators, cpu: CpuId) {
    let idle_process = create_process(collab);
    let idle_id = create_thread(collab, idle_thread_body as u64, &idle_process, SecurityLevel::Kernel)
        .expect("idle thread creation must not fail at boot");

    let cleanup_process = create_process(collab);
    let cleanup_id = create_thread(
        collab,
        reaper_thread_body as u64,
        &cleanup_process,
        SecurityLevel::Kernel,
    )
    .expect("cleanup thread creation must not fail at boot");

    let state = get_cpu(cpu);
    let mut inner = state.inner.lock();
    inner.idle_task = Some(idle_id);
    inner.cleanup_task = Some(cleanup_id);
    drop(inner);

    // Idle is never placed on the run list; cleanup is (4.2).
    assign(collab, cpu, cleanup_id);
}

extern "C" fn idle_thread_body() {
    loop {
        x86_64::instructions::hlt();
    }
}

extern "C" fn reaper_thread_body() {
    // The production reaper loop lives in `run_reaper_pass`, driven from
    // the trampoline's idle-time hook rather than from this function body
    // directly, since the tasking core cannot itself own a production
    // `Collaborators` instance. See `tasking::manager::run_reaper_once`.
    loop {
        kernel_thread_yield();
    }
}

// ============================================================================
// 4.1 / process creation
// ============================================================================

/// `createProcess`: allocates a fresh page directory and virtual range
/// pool, but attaches no threads yet. The caller must follow with
/// `create_thread`, whose first invocation makes the new thread main.
pub fn create_process(collab: &dyn Collaborators) -> Arc<Process> {
    let phys_dir = collab
        .paging()
        .new_directory()
        .expect("page directory allocation assumed infallible (Design §7)");

    let pool: Box<dyn super::collaborators::VirtualRangePoolContract + Send> =
        Box::new(super::super::memory::vrange::VirtualRangePool::new());

    // ID is assigned lazily: a process's ID equals its main thread's ID
    // (invariant 5), so the process is registered under a provisional ID
    // of 0 until its first thread attaches.
    Arc::new(Process::new(phys_dir, pool))
}

// ============================================================================
// 4.3 Thread Creation
// ============================================================================

/// Applies the security policy (4.3): segment selectors per level, IOPL
/// for Kernel/Driver.
pub fn apply_security_level(state: &mut ProcessorState, level: SecurityLevel) {
    match level {
        SecurityLevel::Kernel => {
            state.cs = crate::arch::x86_64::gdt::kernel_code_selector().0 as u64;
            state.ss = crate::arch::x86_64::gdt::kernel_data_selector().0 as u64;
            state.ds = state.ss;
            state.es = state.ss;
            state.fs = state.ss;
            state.gs = state.ss;
        }
        SecurityLevel::Driver | SecurityLevel::Application => {
            state.cs = (crate::arch::x86_64::gdt::user_code_selector().0 | 3) as u64;
            state.ss = (crate::arch::x86_64::gdt::user_data_selector().0 | 3) as u64;
            state.ds = state.ss;
            state.es = state.ss;
            state.fs = state.ss;
            state.gs = state.ss;
        }
    }

    if level.has_iopl() {
        state.eflags |= EFLAGS_IOPL_3;
    }
}

/// Resets a thread's processor state on its freshly allocated kernel
/// stack: EFLAGS = IF, ESP at the state frame, EIP = entry (4.3).
fn reset_task_state(kernel_stack_top: VirtAddr, entry: u64, level: SecurityLevel) -> VirtAddr {
    let state_addr = kernel_stack_top - core::mem::size_of::<ProcessorState>() as u64;
    let mut state = ProcessorState {
        eflags: EFLAGS_IF,
        eip: entry,
        ..ProcessorState::default()
    };
    state.esp = state_addr.as_u64();
    apply_security_level(&mut state, level);

    unsafe {
        core::ptr::write(state_addr.as_mut_ptr::<ProcessorState>(), state);
    }
    state_addr
}

/// `createThread(entry, process, level)` (4.3).
pub fn create_thread(
    collab: &dyn Collaborators,
    entry: u64,
    process: &Arc<Process>,
    level: SecurityLevel,
) -> Result<ThreadId, ThreadCreateError> {
    let id = ThreadId(get_next_id());

    // Resolve the process's identity now if this is its first thread
    // (invariant 5: a process's ID equals its main thread's ID).
    let (process_id, becomes_main) = {
        let mut inner = process.inner.lock();
        let becomes_main = inner.tasks.is_empty();
        if becomes_main {
            inner.id = ProcessId(id.0);
            inner.main = Some(id);
        }
        inner.tasks.insert(0, id);
        (inner.id, becomes_main)
    };

    let mut thread = Thread::new(id, process_id, alloc::format!("thread-{}", id.0), level, ThreadKind::Default);

    // 4.3: temporarily switch into the target space so stacks/TLS can be
    // mapped through the usual paging primitives.
    let back = temporary_switch_to(collab, process.page_directory);

    // Kernel threads draw their stack from the shared kernel virtual pool
    // (4.11); user/driver threads draw from their own process's pool.
    let kernel_stack = if level.is_kernel_mode() {
        map_fresh_stack(collab, collab.vrange_kernel(), KERNEL_STACK_PAGES, VirtualRangeTag::KernelStack)?
    } else {
        let inner = process.inner.lock();
        let vrange = map_fresh_stack(collab, &*inner.virtual_range_pool, KERNEL_STACK_PAGES, VirtualRangeTag::KernelStack)?;
        vrange
    };
    thread.stack = kernel_stack;

    if !level.is_kernel_mode() {
        let inner = process.inner.lock();
        let interrupt_stack = map_fresh_stack(
            collab,
            &*inner.virtual_range_pool,
            INTERRUPT_STACK_PAGES,
            VirtualRangeTag::InterruptStack,
        )?;
        thread.interrupt_stack = interrupt_stack;
    }

    let state_ptr = reset_task_state(kernel_stack.end, entry, level);
    thread.state = Some(state_ptr);

    temporary_switch_back(collab, back);

    if becomes_main {
        collab.filesystem().process_create(process_id);
    }

    if !level.is_kernel_mode() {
        prepare_thread_local_storage(collab, process, &mut thread)?;
    }

    let thread = Arc::new(Mutex::new(thread));
    GLOBAL_THREAD_INDEX.insert(id, thread.clone());

    if becomes_main {
        GLOBAL_PROCESS_INDEX.insert(process_id, process.clone());
    }

    Ok(id)
}

fn map_fresh_stack(
    collab: &dyn Collaborators,
    pool: &dyn super::collaborators::VirtualRangePoolContract,
    pages: usize,
    tag: VirtualRangeTag,
) -> Result<VirtRange, ThreadCreateError> {
    let start = pool.allocate(pages, tag).ok_or(ThreadCreateError::OutOfVirtualRange)?;

    for i in 0..pages {
        let vaddr = start + (i * PAGE_SIZE) as u64;
        let frame = collab.frames().allocate().ok_or(ThreadCreateError::OutOfFrames)?;
        collab.paging().map_page(
            vaddr,
            frame,
            TableFlags { user_accessible: false },
            PageFlags {
                writable: true,
                user_accessible: false,
            },
        );
        collab.refcount().increment(frame);
    }

    Ok(VirtRange {
        start,
        end: start + (pages * PAGE_SIZE) as u64,
    })
}

// ============================================================================
// 4.4 Assignment
// ============================================================================

/// `assign(cpu, thread)` (4.4). Idempotent: assigning an already-assigned
/// thread is a no-op, not an error.
pub fn assign(collab: &dyn Collaborators, cpu: CpuId, thread_id: ThreadId) {
    let _ = collab;
    let state = get_cpu(cpu);
    let mut inner = state.inner.lock();
    inner.assign(thread_id);
    drop(inner);

    if let Some(thread) = get_by_id(thread_id) {
        thread.lock().assignment = Some(cpu);
    }
}

// ============================================================================
// 4.5 Address-Space Borrow
// ============================================================================

/// `temporarySwitchTo(physDir)` (4.5). Panics on a nested borrow: the
/// `overridePageDirectory` field would mask the first borrow.
pub fn temporary_switch_to(collab: &dyn Collaborators, phys_dir: u64) -> u64 {
    let back = collab.paging().current_space();

    let state = get_local();
    let inner = state.inner.lock();
    if let Some(current) = inner.current {
        drop(inner);
        if let Some(thread) = get_by_id(current) {
            let mut t = thread.lock();
            if t.override_page_directory.is_some() {
                panic!("temporarySwitchTo: nested address-space borrow on thread {}", t.id);
            }
            t.override_page_directory = Some(phys_dir);
        }
    }

    collab.paging().switch_to_space(phys_dir);
    back
}

/// `temporarySwitchBack(back)` (4.5).
pub fn temporary_switch_back(collab: &dyn Collaborators, back: u64) {
    let state = get_local();
    let inner = state.inner.lock();
    if let Some(current) = inner.current {
        drop(inner);
        if let Some(thread) = get_by_id(current) {
            thread.lock().override_page_directory = None;
        }
    }
    collab.paging().switch_to_space(back);
}

// ============================================================================
// 4.6 TLS Provisioning
// ============================================================================

/// `prepareThreadLocalStorage(task)` (4.6). Silently returns if the
/// process carries no TLS template.
pub fn prepare_thread_local_storage(
    collab: &dyn Collaborators,
    process: &Arc<Process>,
    thread: &mut Thread,
) -> Result<(), ThreadCreateError> {
    let (master, total_size, copy_size, alignment) = {
        let inner = process.inner.lock();
        let m = inner.tls_master;
        (m, m.total_size, m.copy_size, m.alignment.max(1))
    };

    if master.location == 0 {
        return Ok(());
    }

    let aligned = round_up(total_size, alignment);
    let descriptor_size = core::mem::size_of::<u64>(); // the user-thread descriptor's `self` pointer
    let required = aligned + descriptor_size;
    let pages = required.div_ceil(PAGE_SIZE).max(1);

    let back = temporary_switch_to(collab, process.page_directory);

    let start = {
        let mut inner = process.inner.lock();
        inner
            .virtual_range_pool
            .allocate(pages, VirtualRangeTag::Tls)
            .ok_or(ThreadCreateError::OutOfVirtualRange)?
    };

    for i in 0..pages {
        let vaddr = start + (i * PAGE_SIZE) as u64;
        let frame = collab.frames().allocate().ok_or(ThreadCreateError::OutOfFrames)?;
        collab.paging().map_page(
            vaddr,
            frame,
            TableFlags { user_accessible: true },
            PageFlags {
                writable: true,
                user_accessible: true,
            },
        );
        collab.refcount().increment(frame);

        unsafe {
            core::ptr::write_bytes(vaddr.as_mut_ptr::<u8>(), 0, PAGE_SIZE);
        }
    }

    unsafe {
        let copy_len = copy_size.min(total_size);
        core::ptr::copy_nonoverlapping(
            master.location as *const u8,
            start.as_mut_ptr::<u8>(),
            copy_len,
        );

        let user_thread_object = start + aligned as u64;
        core::ptr::write(user_thread_object.as_mut_ptr::<u64>(), user_thread_object.as_u64());

        thread.tls_copy = TlsCopy {
            start,
            end: start + (pages * PAGE_SIZE) as u64,
            user_thread_object,
        };
    }

    temporary_switch_back(collab, back);
    Ok(())
}

fn round_up(value: usize, alignment: usize) -> usize {
    if alignment == 0 {
        return value;
    }
    (value + alignment - 1) & !(alignment - 1)
}

// ============================================================================
// 4.7 Context Store / Restore
// ============================================================================

/// `store(esp)` (4.7). Returns `false` on the very first interrupt on a
/// CPU (no current thread yet), in which case the trampoline must not
/// attempt to resume a prior context.
pub fn store(esp: u64) -> bool {
    let state = get_local();
    let mut inner = state.inner.lock();
    match inner.current {
        None => false,
        Some(current) => {
            drop(inner);
            if let Some(thread) = get_by_id(current) {
                thread.lock().state = Some(VirtAddr::new(esp));
            }
            true
        }
    }
}

/// `restore(esp)` (4.7). Requires a current thread; panics otherwise.
pub fn restore(collab: &dyn Collaborators, esp: u64) -> u64 {
    let _ = esp;
    let state = get_local();
    let inner = state.inner.lock();
    let current = inner.current.expect("restore: no current thread");
    drop(inner);

    let thread = get_by_id(current).expect("restore: current thread missing from global index");
    let t = thread.lock();

    let space = t.override_page_directory.unwrap_or_else(|| {
        GLOBAL_PROCESS_INDEX
            .get(t.process)
            .map(|p| p.page_directory)
            .unwrap_or_else(|| collab.paging().current_space())
    });
    collab.paging().switch_to_space(space);

    if !t.tls_copy.is_none() {
        collab.gdt().set_user_thread_object_address(t.tls_copy.user_thread_object);
    }
    if !t.interrupt_stack.is_none() {
        collab.gdt().set_tss_esp0(t.interrupt_stack.end);
    }

    t.state.expect("restore: current thread has no saved state").as_u64()
}

// ============================================================================
// 4.8 Scheduler Driver
// ============================================================================

/// Marks the calling CPU's per-CPU state as being inside (or outside) the
/// interrupt envelope `schedule`'s precondition requires (4.8). Set by
/// `tasking::trampoline` around every call to `schedule`.
pub fn set_in_interrupt_handler(flag: bool) {
    get_local().inner.lock().in_interrupt_handler = flag;
}

/// `schedule()` (4.8). Must be called only inside the interrupt envelope;
/// refuses to switch while `locksHeld > 0`.
pub fn schedule() {
    let state = get_local();
    let mut inner = state.inner.lock();
    if !inner.in_interrupt_handler {
        panic!("schedule: called outside the interrupt envelope");
    }
    if inner.locks_held > 0 {
        return;
    }

    let preferred = inner.preferred_next_task.take();
    if let Some(preferred) = preferred {
        if inner.list.iter().any(|e| e.task == preferred) {
            inner.current = Some(preferred);
            inner.round += 1;
            return;
        }
    }

    let entries = inner.list.iter().map(|e| (e.task, e.policy_private)).collect::<Vec<_>>();
    let is_runnable = |tid: ThreadId| {
        get_by_id(tid)
            .map(|t| !matches!(t.lock().status, ThreadStatus::Dead))
            .unwrap_or(false)
    };
    let entries_vec: Vec<super::percpu::ScheduleEntry> = entries
        .into_iter()
        .map(|(task, policy_private)| super::percpu::ScheduleEntry { task, policy_private })
        .collect();
    let next = inner.policy.pick_next(&entries_vec, &is_runnable);
    inner.current = next.or(inner.idle_task);
    inner.round += 1;
}

/// `pleaseSchedule(task)` (4.8): request a thread be preferred on its
/// next eligible CPU.
pub fn please_schedule(task: ThreadId) {
    if let Some(thread) = get_by_id(task) {
        if let Some(cpu) = thread.lock().assignment {
            get_cpu(cpu).inner.lock().preferred_next_task = Some(task);
        }
    }
}

// ============================================================================
// 4.9 Cooperative Yield and Exit
// ============================================================================

/// `kernelThreadYield()` (4.9): raises software interrupt `0x81`.
/// Refuses (logs and returns) if the caller holds kernel locks.
pub fn kernel_thread_yield() {
    let state = get_local();
    if state.inner.lock().locks_held > 0 {
        log::warn!("kernel_thread_yield: refused, caller holds a kernel lock");
        return;
    }
    super::trampoline::issue_yield();
}

/// `kernelThreadExit()` (4.9): marks the current thread dead, then yields
/// and never returns.
pub fn kernel_thread_exit() -> ! {
    let state = get_local();
    let inner = state.inner.lock();
    if let Some(current) = inner.current {
        drop(inner);
        if let Some(thread) = get_by_id(current) {
            thread.lock().mark_dead();
        }
    }
    kernel_thread_yield();
    unreachable!("kernel_thread_exit: thread resumed after being marked dead");
}

// ============================================================================
// 4.10 Reaper
// ============================================================================

/// One pass of the per-CPU cleanup thread's loop (4.10). The caller
/// (the cleanup thread's body, via `tasking::manager`) is responsible for
/// sleeping ~3000 ms and yielding between passes.
pub fn reaper_pass(collab: &dyn Collaborators) {
    let state = get_local();
    let mut inner = state.inner.lock();
    let dead = inner.detach_dead(|tid| {
        get_by_id(tid).map(|t| t.lock().is_dead()).unwrap_or(false)
    });
    drop(inner);

    for tid in dead {
        GLOBAL_THREAD_INDEX.remove(tid);
        remove_thread(collab, tid);
    }

    collab.wait().sleep(
        get_local().inner.lock().cleanup_task.unwrap_or(ThreadId(0)),
        3000,
    );
    kernel_thread_yield();
}

// ============================================================================
// 4.11 Thread Removal
// ============================================================================

/// `removeThread` (4.11). Precondition: task status is dead.
pub fn remove_thread(collab: &dyn Collaborators, task: ThreadId) {
    let Some(thread_arc) = GLOBAL_THREAD_INDEX.remove(task).or_else(|| get_by_id(task)) else {
        return;
    };

    let (process_id, stack, interrupt_stack, tls_copy, is_kernel) = {
        let t = thread_arc.lock();
        if !t.is_dead() {
            panic!("remove_thread: task {} is not dead", task);
        }
        (t.process, t.stack, t.interrupt_stack, t.tls_copy, t.security_level.is_kernel_mode())
    };

    let Some(process) = GLOBAL_PROCESS_INDEX.get(process_id) else {
        return;
    };

    let back = temporary_switch_to(collab, process.page_directory);

    unmap_range(collab, interrupt_stack);
    unmap_range(collab, stack);
    if !tls_copy.is_none() {
        unmap_range(collab, VirtRange { start: tls_copy.start, end: tls_copy.end });
    }

    {
        let mut inner = process.inner.lock();
        if !interrupt_stack.is_none() {
            inner.virtual_range_pool.free(interrupt_stack.start);
        }
        if !tls_copy.is_none() {
            inner.virtual_range_pool.free(tls_copy.start);
        }
        // Kernel-thread stacks go to the shared kernel pool, not the
        // process's own pool (4.11); user-thread stacks free through the
        // process pool like everything else mapped in its space.
        if !is_kernel {
            inner.virtual_range_pool.free(stack.start);
        }
    }

    temporary_switch_back(collab, back);

    let (now_empty, was_main) = {
        let mut inner = process.inner.lock();
        inner.tasks.retain(|&t| t != task);
        (inner.tasks.is_empty(), inner.main == Some(task))
    };

    if now_empty {
        remove_process(collab, &process);
    } else if was_main {
        kill_process(collab, process_id);
    }
}

fn unmap_range(collab: &dyn Collaborators, range: VirtRange) {
    if range.is_none() {
        return;
    }
    let pages = range.pages();
    for i in 0..pages {
        let vaddr = range.start + (i * PAGE_SIZE) as u64;
        if let Some(frame) = collab.paging().virtual_to_physical(vaddr) {
            collab.paging().unmap_page(vaddr);
            if collab.refcount().decrement(frame) == 0 {
                collab.frames().mark_free(frame);
            }
        }
    }
}

// ============================================================================
// 4.12 Process Removal
// ============================================================================

/// `removeProcess` (4.12). Walks directory entries 1..1023, skipping the
/// shared low-kernel region at index 0 (Design Notes Open Question 3).
pub fn remove_process(collab: &dyn Collaborators, process: &Arc<Process>) {
    let back = temporary_switch_to(collab, process.page_directory);

    crate::memory::paging32::walk_user_frames(process.page_directory, |frame| {
        if collab.refcount().decrement(frame) == 0 {
            collab.frames().mark_free(frame);
        }
    });

    temporary_switch_back(collab, back);

    let process_id = process.id();
    collab.filesystem().process_remove(process_id);

    // Virtual range pool drops with `process` once its `Arc` refcount
    // reaches zero; the page directory frame is freed explicitly since the
    // paging collaborator, not Rust's allocator, owns it.
    collab.paging().free_directory(process.page_directory);

    GLOBAL_PROCESS_INDEX.remove(process_id);
}

/// `killProcess(pid)` (4.11/4.13): marks all of a process's threads dead
/// so the next reaper pass completes the tear-down. Logs and returns for
/// a non-existent PID (silent fallback, §7).
pub fn kill_process(collab: &dyn Collaborators, pid: ProcessId) {
    let _ = collab;
    let Some(process) = GLOBAL_PROCESS_INDEX.get(pid) else {
        log::warn!("kill_process: no such process {}", pid);
        return;
    };

    let tasks = process.inner.lock().tasks.clone();
    for tid in tasks {
        if let Some(thread) = get_by_id(tid) {
            thread.lock().mark_dead();
        }
    }
}

// ============================================================================
// 4.13 Signal Injection
// ============================================================================

/// `raiseSignal(target, sig)` (4.13).
pub fn raise_signal(collab: &dyn Collaborators, target: ThreadId, sig: u32) -> RaiseSignalStatus {
    let Some(target_thread) = get_by_id(target) else {
        return RaiseSignalStatus::InvalidTarget;
    };
    let process_id = target_thread.lock().process;
    let Some(process) = GLOBAL_PROCESS_INDEX.get(process_id) else {
        return RaiseSignalStatus::InvalidTarget;
    };

    let handler = {
        let inner = process.inner.lock();
        inner.signal_handlers[sig as usize % super::types::SIG_COUNT]
    };

    if handler.address == 0 {
        if sig == SIGSEGV {
            target_thread.lock().mark_dead();
            let is_current = get_local().inner.lock().current == Some(target);
            if is_current {
                schedule();
            }
        }
        return RaiseSignalStatus::Successful;
    }

    let handling_id = if handler.handling_thread == Some(target) || handler.handling_thread.is_none() {
        target
    } else {
        handler.handling_thread.unwrap()
    };

    let Some(handling_thread) = get_by_id(handling_id) else {
        return RaiseSignalStatus::InvalidTarget;
    };

    if handling_thread.lock().interruption_info.is_some() {
        return RaiseSignalStatus::InvalidState;
    }

    interrupt_task(collab, handling_id, handler.address, handler.return_address, &[sig]);
    RaiseSignalStatus::Successful
}

/// `interruptTask(task, entry, returnAddress, argc, args...)` (4.13).
/// Refuses kernel-level tasks.
pub fn interrupt_task(collab: &dyn Collaborators, task: ThreadId, entry: u64, return_address: u64, args: &[u32]) {
    let Some(thread_arc) = get_by_id(task) else {
        return;
    };

    if thread_arc.lock().security_level.is_kernel_mode() {
        log::warn!("interrupt_task: refusing to interrupt kernel-level task {}", task);
        return;
    }

    let process_id = thread_arc.lock().process;
    let Some(process) = GLOBAL_PROCESS_INDEX.get(process_id) else {
        return;
    };
    let _process_lock = process.inner.lock();
    let back = temporary_switch_to(collab, process.page_directory);

    {
        let mut t = thread_arc.lock();
        let state_ptr = t.state.expect("interrupt_task: target has no saved state");
        let saved_state = unsafe { core::ptr::read(state_ptr.as_ptr::<ProcessorState>()) };

        t.interruption_info = Some(InterruptionInfo {
            previous_wait: t.wait,
            previous_status: t.status,
            saved_state,
            original_state_ptr: state_ptr,
        });
        t.wait = super::thread::WaitState::default();
        t.status = ThreadStatus::Running;

        let mut state = saved_state;
        state.eip = entry;

        let mut esp = VirtAddr::new(state.esp);
        for &arg in args.iter().rev() {
            esp -= core::mem::size_of::<u32>() as u64;
            unsafe { core::ptr::write(esp.as_mut_ptr::<u32>(), arg) };
        }
        esp -= core::mem::size_of::<u64>() as u64;
        unsafe { core::ptr::write(esp.as_mut_ptr::<u64>(), return_address) };
        state.esp = esp.as_u64();

        unsafe { core::ptr::write(state_ptr.as_mut_ptr::<ProcessorState>(), state) };
    }

    temporary_switch_back(collab, back);
}

/// Called by the restoration path (external to this core, per 4.13) once
/// a signal handler returns to the trampoline: copies the saved state
/// back, restores wait fields and status, frees `interruptionInfo`.
pub fn complete_signal_delivery(task: ThreadId) {
    let Some(thread_arc) = get_by_id(task) else {
        return;
    };
    let mut t = thread_arc.lock();
    let Some(info) = t.interruption_info.take() else {
        return;
    };
    unsafe {
        core::ptr::write(info.original_state_ptr.as_mut_ptr::<ProcessorState>(), info.saved_state);
    }
    t.wait = info.previous_wait;
    t.status = info.previous_status;
    t.state = Some(info.original_state_ptr);
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasking::collaborators::{FrameAllocatorContract, FrameRefTrackerContract, PagingContract};
    use crate::tasking::process::SignalHandler;
    use crate::tasking::types::SIGUSR1;

    /// `PER_CPU`/`GLOBAL_THREAD_INDEX`/`GLOBAL_PROCESS_INDEX` are process-wide
    /// singletons addressed by `current_cpu_id() == CpuId(0)`; every test
    /// below mutates them, so tests serialize on this lock instead of
    /// relying on `cargo test`'s default thread-per-test parallelism.
    static TEST_LOCK: Mutex<()> = Mutex::new(());

    /// Physical frames are never actually dereferenced by this core (only
    /// passed to the paging collaborator), so a constant stand-in is fine.
    struct FakeFrames;
    impl FrameAllocatorContract for FakeFrames {
        fn allocate(&self) -> Option<u64> {
            Some(0x1000)
        }
        fn mark_free(&self, _phys_addr: u64) {}
    }

    struct FakePaging {
        current: Mutex<u64>,
    }
    impl PagingContract for FakePaging {
        fn map_page(&self, _vaddr: VirtAddr, _paddr: u64, _table_flags: TableFlags, _page_flags: PageFlags) {}
        fn unmap_page(&self, _vaddr: VirtAddr) {}
        fn virtual_to_physical(&self, _vaddr: VirtAddr) -> Option<u64> {
            None
        }
        fn switch_to_space(&self, phys_dir: u64) {
            *self.current.lock() = phys_dir;
        }
        fn current_space(&self) -> u64 {
            *self.current.lock()
        }
        fn new_directory(&self) -> Option<u64> {
            Some(1)
        }
        fn free_directory(&self, _phys_dir: u64) {}
    }

    struct FakeRefcount;
    impl FrameRefTrackerContract for FakeRefcount {
        fn increment(&self, _phys_addr: u64) {}
        fn decrement(&self, _phys_addr: u64) -> u64 {
            0
        }
    }

    /// A bump allocator over a real, heap-backed buffer. Kernel-thread
    /// stacks drawn from here are genuine memory, so `reset_task_state`'s
    /// raw `ProcessorState` write lands somewhere valid instead of an
    /// unbacked kernel virtual address only a real MMU could resolve.
    struct FakeVrangePool {
        next: Mutex<VirtAddr>,
        limit: VirtAddr,
        _storage: Vec<u8>,
    }

    impl FakeVrangePool {
        fn new(pages: usize) -> Self {
            let mut storage = alloc::vec![0u8; pages * PAGE_SIZE];
            let base = VirtAddr::new(storage.as_mut_ptr() as u64);
            let limit = base + storage.len() as u64;
            FakeVrangePool { next: Mutex::new(base), limit, _storage: storage }
        }
    }

    impl super::super::collaborators::VirtualRangePoolContract for FakeVrangePool {
        fn add_range(&self, _start: VirtAddr, _end: VirtAddr) {}

        fn allocate(&self, pages: usize, _tag: VirtualRangeTag) -> Option<VirtAddr> {
            let mut next = self.next.lock();
            let size = (pages * PAGE_SIZE) as u64;
            if *next + size > self.limit {
                return None;
            }
            let addr = *next;
            *next += size;
            Some(addr)
        }

        fn free(&self, _vaddr: VirtAddr) {}
    }

    struct FakeGdt;
    impl super::super::collaborators::GdtContract for FakeGdt {
        fn set_user_thread_object_address(&self, _vaddr: VirtAddr) {}
        fn set_tss_esp0(&self, _vaddr: VirtAddr) {}
    }

    struct FakeWait;
    impl super::super::collaborators::WaitContract for FakeWait {
        fn sleep(&self, _task: ThreadId, _ms: u32) {}
    }

    struct FakeFilesystem;
    impl super::super::collaborators::FilesystemContract for FakeFilesystem {
        fn process_create(&self, _pid: ProcessId) {}
        fn process_remove(&self, _pid: ProcessId) {}
    }

    struct FakeCollaborators {
        frames: FakeFrames,
        paging: FakePaging,
        refcount: FakeRefcount,
        vrange_kernel: FakeVrangePool,
        gdt: FakeGdt,
        wait: FakeWait,
        filesystem: FakeFilesystem,
    }

    impl Collaborators for FakeCollaborators {
        fn frames(&self) -> &dyn super::super::collaborators::FrameAllocatorContract {
            &self.frames
        }
        fn paging(&self) -> &dyn super::super::collaborators::PagingContract {
            &self.paging
        }
        fn refcount(&self) -> &dyn super::super::collaborators::FrameRefTrackerContract {
            &self.refcount
        }
        fn vrange_kernel(&self) -> &dyn super::super::collaborators::VirtualRangePoolContract {
            &self.vrange_kernel
        }
        fn gdt(&self) -> &dyn super::super::collaborators::GdtContract {
            &self.gdt
        }
        fn wait(&self) -> &dyn super::super::collaborators::WaitContract {
            &self.wait
        }
        fn filesystem(&self) -> &dyn super::super::collaborators::FilesystemContract {
            &self.filesystem
        }
    }

    /// `kernel_vrange_pages` only needs to be nonzero for tests that
    /// actually draw a kernel stack (boot-up); the others never touch it.
    fn fake_collaborators(kernel_vrange_pages: usize) -> FakeCollaborators {
        FakeCollaborators {
            frames: FakeFrames,
            paging: FakePaging { current: Mutex::new(0) },
            refcount: FakeRefcount,
            vrange_kernel: FakeVrangePool::new(kernel_vrange_pages),
            gdt: FakeGdt,
            wait: FakeWait,
            filesystem: FakeFilesystem,
        }
    }

    fn reset_percpu() {
        let mut table = PER_CPU.lock();
        table.clear();
        table.push(Arc::new(PerCpuSchedState::new(CpuId(0), Box::new(RoundRobinPolicy::new()))));
    }

    fn register_thread(id: ThreadId, process: ProcessId, level: SecurityLevel) -> Arc<Mutex<Thread>> {
        let thread = Arc::new(Mutex::new(Thread::new(id, process, alloc::format!("test-{}", id.0), level, ThreadKind::Default)));
        GLOBAL_THREAD_INDEX.insert(id, thread.clone());
        thread
    }

    fn make_process(page_directory: u64, main: ThreadId, extra_tasks: &[ThreadId]) -> Arc<Process> {
        let process = Arc::new(Process::new(page_directory, Box::new(FakeVrangePool::new(0))));
        let mut inner = process.inner.lock();
        inner.id = ProcessId(main.0);
        inner.main = Some(main);
        inner.tasks = alloc::vec![main];
        inner.tasks.extend_from_slice(extra_tasks);
        drop(inner);
        process
    }

    #[test]
    fn apply_security_level_sets_selectors_and_iopl() {
        let _guard = TEST_LOCK.lock();

        let mut kernel_state = ProcessorState::default();
        apply_security_level(&mut kernel_state, SecurityLevel::Kernel);
        assert_eq!(kernel_state.cs, crate::arch::x86_64::gdt::kernel_code_selector().0 as u64);
        assert_ne!(kernel_state.eflags & EFLAGS_IOPL_3, 0, "kernel threads run with IOPL 3");

        let mut app_state = ProcessorState::default();
        apply_security_level(&mut app_state, SecurityLevel::Application);
        assert_eq!(app_state.cs & 3, 3, "application threads run at ring 3");
        assert_eq!(app_state.eflags & EFLAGS_IOPL_3, 0, "application threads get no IOPL");
    }

    #[test]
    fn initialize_bsp_creates_idle_and_cleanup_threads() {
        let _guard = TEST_LOCK.lock();
        reset_percpu();
        let collab = fake_collaborators(64);

        let before = get_next_id();
        initialize_bsp(&collab, 1);

        let state = get_local();
        let inner = state.inner.lock();
        let idle = inner.idle_task.expect("idle thread must be created");
        let cleanup = inner.cleanup_task.expect("cleanup thread must be created");
        assert_ne!(idle, cleanup);
        assert!(idle.0 > before && cleanup.0 > before, "both threads got fresh IDs");
        assert!(inner.list.iter().any(|e| e.task == cleanup), "cleanup thread must be on the run list");
        assert!(!inner.list.iter().any(|e| e.task == idle), "idle thread must never be on the run list (4.2)");
        drop(inner);

        GLOBAL_THREAD_INDEX.remove(idle);
        GLOBAL_THREAD_INDEX.remove(cleanup);
        GLOBAL_PROCESS_INDEX.remove(ProcessId(idle.0));
        GLOBAL_PROCESS_INDEX.remove(ProcessId(cleanup.0));
    }

    #[test]
    fn store_schedule_restore_round_trips_between_two_threads() {
        let _guard = TEST_LOCK.lock();
        reset_percpu();
        let collab = fake_collaborators(0);

        let a = ThreadId(get_next_id());
        let b = ThreadId(get_next_id());
        let pid = ProcessId(a.0);
        register_thread(a, pid, SecurityLevel::Kernel);
        register_thread(b, pid, SecurityLevel::Kernel);
        assign(&collab, CpuId(0), a);
        assign(&collab, CpuId(0), b);

        get_local().inner.lock().current = Some(a);

        // A traps: its esp is saved, and the scheduler (round-robin over
        // {a, b}) hands the CPU to B.
        assert!(store(0x1000), "store must report a prior current thread");
        set_in_interrupt_handler(true);
        schedule();
        set_in_interrupt_handler(false);
        assert_eq!(get_local().inner.lock().current, Some(b));

        // B already has a context (as if created earlier); restoring it
        // must hand back exactly B's saved esp.
        get_by_id(b).unwrap().lock().state = Some(VirtAddr::new(0x2000));
        let resumed_esp = restore(&collab, 0x1000);
        assert_eq!(resumed_esp, 0x2000);

        GLOBAL_THREAD_INDEX.remove(a);
        GLOBAL_THREAD_INDEX.remove(b);
    }

    #[test]
    fn reaper_removes_dead_non_main_thread_without_touching_process() {
        let _guard = TEST_LOCK.lock();
        reset_percpu();
        let collab = fake_collaborators(0);

        let main_id = ThreadId(get_next_id());
        let child_id = ThreadId(get_next_id());
        let process = make_process(1, main_id, &[child_id]);
        GLOBAL_PROCESS_INDEX.insert(ProcessId(main_id.0), process.clone());
        register_thread(main_id, ProcessId(main_id.0), SecurityLevel::Kernel);
        let child = register_thread(child_id, ProcessId(main_id.0), SecurityLevel::Kernel);
        child.lock().mark_dead();

        assign(&collab, CpuId(0), main_id);
        assign(&collab, CpuId(0), child_id);

        // Held so reaper_pass's trailing `kernel_thread_yield` returns
        // instead of issuing the real `int 0x81` this host test has no
        // IDT vector for.
        get_local().inner.lock().locks_held = 1;
        reaper_pass(&collab);
        get_local().inner.lock().locks_held = 0;

        assert!(GLOBAL_THREAD_INDEX.get(child_id).is_none(), "dead child must be reaped");
        assert!(GLOBAL_THREAD_INDEX.get(main_id).is_some(), "live main thread is untouched");
        assert_eq!(process.inner.lock().tasks, alloc::vec![main_id]);

        GLOBAL_THREAD_INDEX.remove(main_id);
        GLOBAL_PROCESS_INDEX.remove(ProcessId(main_id.0));
    }

    #[test]
    fn killing_process_marks_all_its_threads_dead() {
        let _guard = TEST_LOCK.lock();

        let main_id = ThreadId(get_next_id());
        let child_a = ThreadId(get_next_id());
        let child_b = ThreadId(get_next_id());
        let process = make_process(2, main_id, &[child_a, child_b]);
        GLOBAL_PROCESS_INDEX.insert(ProcessId(main_id.0), process.clone());
        let main_thread = register_thread(main_id, ProcessId(main_id.0), SecurityLevel::Kernel);
        let a = register_thread(child_a, ProcessId(main_id.0), SecurityLevel::Kernel);
        let b = register_thread(child_b, ProcessId(main_id.0), SecurityLevel::Kernel);

        let collab = fake_collaborators(0);
        kill_process(&collab, ProcessId(main_id.0));

        assert!(main_thread.lock().is_dead());
        assert!(a.lock().is_dead());
        assert!(b.lock().is_dead());

        GLOBAL_THREAD_INDEX.remove(main_id);
        GLOBAL_THREAD_INDEX.remove(child_a);
        GLOBAL_THREAD_INDEX.remove(child_b);
        GLOBAL_PROCESS_INDEX.remove(ProcessId(main_id.0));
    }

    #[test]
    fn raise_signal_redirects_to_installed_handler_and_rejects_reentry() {
        let _guard = TEST_LOCK.lock();
        // `interrupt_task` borrows the current CPU's address space via
        // `temporary_switch_to`, which needs `PER_CPU` populated.
        reset_percpu();
        let collab = fake_collaborators(0);

        let target_id = ThreadId(get_next_id());
        let process = make_process(3, target_id, &[]);
        {
            let mut inner = process.inner.lock();
            inner.signal_handlers[SIGUSR1 as usize] = SignalHandler {
                address: 0xdead_0000,
                return_address: 0xfeed_0000,
                handling_thread: None,
            };
        }
        GLOBAL_PROCESS_INDEX.insert(ProcessId(target_id.0), process.clone());

        // Backing memory standing in for the thread's saved `ProcessorState`
        // slot and the top of its user stack, both real so `interrupt_task`'s
        // raw writes land somewhere valid.
        let mut state_backing = alloc::boxed::Box::new(ProcessorState::default());
        let mut user_stack = alloc::vec![0u8; 64];
        let esp_top = VirtAddr::new(user_stack.as_mut_ptr() as u64) + 32u64;
        state_backing.esp = esp_top.as_u64();
        let state_ptr = VirtAddr::new(&*state_backing as *const ProcessorState as u64);

        let target = register_thread(target_id, ProcessId(target_id.0), SecurityLevel::Application);
        target.lock().state = Some(state_ptr);

        let status = raise_signal(&collab, target_id, SIGUSR1);
        assert_eq!(status, RaiseSignalStatus::Successful);
        assert!(target.lock().interruption_info.is_some());
        let redirected_eip = unsafe { (*state_ptr.as_ptr::<ProcessorState>()).eip };
        assert_eq!(redirected_eip, 0xdead_0000);

        // Re-entrant delivery while `interruptionInfo` is still set must be
        // refused without mutating anything further (invariant 7).
        let second = raise_signal(&collab, target_id, SIGUSR1);
        assert_eq!(second, RaiseSignalStatus::InvalidState);

        GLOBAL_THREAD_INDEX.remove(target_id);
        GLOBAL_PROCESS_INDEX.remove(ProcessId(target_id.0));
    }

    #[test]
    fn sigsegv_without_handler_kills_target_and_reschedules_if_current() {
        let _guard = TEST_LOCK.lock();
        reset_percpu();
        let collab = fake_collaborators(0);

        let target_id = ThreadId(get_next_id());
        let process = make_process(4, target_id, &[]);
        // `signal_handlers[SIGSEGV]` is left at its default (address == 0):
        // no handler installed.
        GLOBAL_PROCESS_INDEX.insert(ProcessId(target_id.0), process.clone());
        let target = register_thread(target_id, ProcessId(target_id.0), SecurityLevel::Application);

        assign(&collab, CpuId(0), target_id);
        get_local().inner.lock().current = Some(target_id);
        set_in_interrupt_handler(true);

        let status = raise_signal(&collab, target_id, SIGSEGV);
        set_in_interrupt_handler(false);

        assert_eq!(status, RaiseSignalStatus::Successful);
        assert!(target.lock().is_dead());
        // The victim was current, so schedule() ran; it was the run list's
        // only entry and is now dead, so no thread was selected.
        assert_eq!(get_local().inner.lock().current, None);

        GLOBAL_THREAD_INDEX.remove(target_id);
        GLOBAL_PROCESS_INDEX.remove(ProcessId(target_id.0));
    }
}
