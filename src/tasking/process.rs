/*
 * Process Object
 *
 * A process owns an address space and everything indexed by it: the TLS
 * template, the signal-handler table, the heap window, and the
 * environment. Its task list is intrusive-in-spirit (the spec models it
 * as a singly linked list); here it is a `Vec` of `ThreadId` guarded by
 * the same `process.lock`, which gives the same "mutate only under one
 * lock" discipline without hand-rolled pointer-chasing.
 */

use alloc::string::String;
use alloc::vec::Vec;
use spin::Mutex;

use super::thread::ThreadId;
use super::types::{ProcessId, SIG_COUNT};

/// Read-only TLS template a process may carry. `location == 0` means "no
/// template" (4.6).
#[derive(Debug, Clone, Copy, Default)]
pub struct TlsMaster {
    pub location: u64,
    pub copy_size: usize,
    pub total_size: usize,
    pub alignment: usize,
}

/// One entry of `signalHandlers[0..SIG_COUNT)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SignalHandler {
    pub address: u64,
    pub return_address: u64,
    pub handling_thread: Option<ThreadId>,
}

/// The user heap window, `{brk, start, pages}` per the spec; demand
/// paging of the heap itself is an explicit Non-goal, so this core only
/// tracks the window, it never maps pages into it.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeapWindow {
    pub start: u64,
    pub brk: u64,
    pub pages: usize,
}

/// `{arguments, executable path, working directory}`.
#[derive(Debug, Default)]
pub struct Environment {
    pub arguments: Vec<String>,
    pub executable_path: String,
    pub working_directory: String,
}

/// Unit of address-space ownership (§3 Process).
///
/// A process's ID equals its main thread's ID (invariant 5), which is
/// only known once the first thread attaches — so `id` and `main` live
/// behind the same lock as the task list rather than as plain fields,
/// and start out `ProcessId(0)` / `None` until `create_thread` resolves
/// them.
pub struct Process {
    /// `process.lock` serializes mutation of `id`, `main`, `tasks`,
    /// `signal_handlers`, and `environment` (§5).
    pub inner: Mutex<ProcessInner>,
    pub page_directory: u64,
}

pub struct ProcessInner {
    pub id: ProcessId,
    pub main: Option<ThreadId>,
    pub tasks: Vec<ThreadId>,
    pub tls_master: TlsMaster,
    pub signal_handlers: [SignalHandler; SIG_COUNT],
    pub heap: HeapWindow,
    pub environment: Environment,
    /// Per-process virtual range pool, boxed as a trait object so the
    /// process doesn't need a generic parameter over the concrete pool
    /// implementation.
    pub virtual_range_pool: alloc::boxed::Box<dyn super::collaborators::VirtualRangePoolContract + Send>,
}

impl Process {
    pub fn new(
        page_directory: u64,
        virtual_range_pool: alloc::boxed::Box<dyn super::collaborators::VirtualRangePoolContract + Send>,
    ) -> Self {
        Process {
            page_directory,
            inner: Mutex::new(ProcessInner {
                id: ProcessId(0),
                main: None,
                tasks: Vec::new(),
                tls_master: TlsMaster::default(),
                signal_handlers: [SignalHandler::default(); SIG_COUNT],
                heap: HeapWindow::default(),
                environment: Environment::default(),
                virtual_range_pool,
            }),
        }
    }

    pub fn id(&self) -> ProcessId {
        self.inner.lock().id
    }

    pub fn main(&self) -> Option<ThreadId> {
        self.inner.lock().main
    }

    /// True once a main thread has attached (5.2 boundary behavior: the
    /// first thread created in a process becomes main).
    pub fn has_main(&self) -> bool {
        self.main().is_some()
    }
}
