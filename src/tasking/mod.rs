/*
 * Tasking Core
 *
 * Process/thread lifecycle, per-CPU scheduling, context switching,
 * address-space borrowing, TLS provisioning, and POSIX-style signal
 * injection for a single tasking domain shared by every CPU.
 *
 * `core` holds the actual orchestration logic, expressed purely in terms
 * of the `collaborators::Collaborators` trait bundle so it can be driven
 * by hand-rolled fakes in tests. `manager` wires that logic to the real
 * collaborators (paging, frame allocation, the GDT/TSS) and is the
 * surface the rest of the kernel calls through. `trampoline` is the
 * naked-asm interrupt entry/exit pair that calls into `core` on every
 * yield and timer tick.
 */

pub mod collaborators;
pub mod core;
pub mod ids;
pub mod manager;
pub mod percpu;
pub mod policy;
pub mod process;
pub mod thread;
pub mod trampoline;
pub mod types;

pub use manager::{ProcessManager, ThreadManager};
pub use trampoline::{preemptive_timer_interrupt_handler, yield_interrupt_handler, YIELD_VECTOR};
pub use types::{
    CpuId, ProcessId, RaiseSignalStatus, SecurityLevel, ThreadCreateError, ThreadId, ThreadKind,
    ThreadStatus, SIGSEGV, SIGUSR1,
};
