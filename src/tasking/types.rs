/*
 * Tasking Core - Shared Types
 *
 * Identifiers, enums, and small value types shared across the tasking
 * core. Kept free of allocation so they can be copied freely between
 * locks.
 */

use core::fmt;

/// Globally unique thread identifier.
///
/// Allocated by the ID allocator (`tasking::ids`) and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub u64);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "thread#{}", self.0)
    }
}

/// Process identifier.
///
/// Always equal to the ID of the process's main thread (invariant 5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(pub u64);

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "process#{}", self.0)
    }
}

impl From<ThreadId> for ProcessId {
    fn from(id: ThreadId) -> Self {
        ProcessId(id.0)
    }
}

/// Which CPU core a per-CPU scheduler state belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CpuId(pub u32);

/// A thread's security level, set once at creation and never changed.
///
/// Determines segment selectors and IOPL applied by `apply_security_level`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityLevel {
    Kernel,
    Driver,
    Application,
}

impl SecurityLevel {
    /// Kernel and Driver threads run with IOPL = 3 (EFLAGS bits 0x3000 set).
    pub fn has_iopl(&self) -> bool {
        matches!(self, SecurityLevel::Kernel | SecurityLevel::Driver)
    }

    /// Only Kernel threads run at ring 0; Driver and Application are ring 3.
    pub fn is_kernel_mode(&self) -> bool {
        matches!(self, SecurityLevel::Kernel)
    }
}

/// Coarse status of a thread; the only legal transition out of `Dead` is
/// reaping, which removes the thread entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    Running,
    Waiting,
    Dead,
}

/// Thread specialization. Only `Default` is scheduled onto ordinary run
/// lists; `Idle` and `Cleanup` are held in the per-CPU distinguished
/// handles instead (see `PerCpuSchedState`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadKind {
    Default,
    Idle,
    Cleanup,
}

/// Number of entries in a process's signal-handler table.
pub const SIG_COUNT: usize = 32;

/// POSIX-style signal numbers the tasking core understands directly.
/// Everything else is a plain index into `signal_handlers`.
pub const SIGSEGV: u32 = 11;
pub const SIGUSR1: u32 = 10;

/// Fixed segment selector for the per-thread GS-based user-thread object,
/// matching the spec's 32-bit GDT slot `0x30`.
pub const USER_THREAD_GS_SELECTOR: u16 = 0x30;

/// EFLAGS bit for "interrupts enabled".
pub const EFLAGS_IF: u64 = 0x200;
/// EFLAGS IOPL field, set to level 3 for Kernel/Driver threads.
pub const EFLAGS_IOPL_3: u64 = 0x3000;

/// 4 KiB pages, 1024 entries per table/directory, 4 MiB covered per table:
/// the architectural constants this core assumes of its paging collaborator.
pub const PAGE_SIZE: usize = 4096;
pub const PAGE_TABLE_ENTRIES: usize = 1024;
pub const PAGE_TABLE_COVERAGE: usize = PAGE_TABLE_ENTRIES * PAGE_SIZE;

/// Outcome of `raise_signal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaiseSignalStatus {
    Successful,
    InvalidTarget,
    InvalidState,
}

/// Failure modes of thread creation. Control-block allocation itself is
/// assumed infallible (Design §7); these are the recoverable failures a
/// fallible collaborator (frame allocator, virtual range pool) can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadCreateError {
    OutOfFrames,
    OutOfVirtualRange,
    InterruptStackAllocationFailed,
}

impl fmt::Display for ThreadCreateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThreadCreateError::OutOfFrames => write!(f, "out of physical frames"),
            ThreadCreateError::OutOfVirtualRange => write!(f, "virtual range pool exhausted"),
            ThreadCreateError::InterruptStackAllocationFailed => {
                write!(f, "interrupt stack allocation failed")
            }
        }
    }
}

// `assign` (4.4) has no failure mode: the run list has no capacity limit
// and re-assigning an already-assigned thread is a silent no-op, exactly
// like the original `taskingAssign`.
