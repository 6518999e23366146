/*
 * Interrupt Trampoline
 *
 * The two naked entry points threads actually trap through: a software
 * `int 0x81` for cooperative yield (4.9) and the hardware timer IRQ for
 * preemption (4.8). Both save the trapping context onto the current
 * thread's own kernel stack in exactly `ProcessorState`'s field layout,
 * hand the stack pointer to `schedule_from_interrupt`, then reload
 * whatever stack pointer comes back before `iretq`. Modeled directly on
 * the teacher's `yield_interrupt_handler` / `preemptive_timer_interrupt_handler`
 * pair and their shared `schedule_from_interrupt` driver.
 */

use core::arch::{asm, naked_asm};

use super::core as tasking_core;
use super::manager;

/// Vector used for the cooperative `int` instruction `kernel_thread_yield`
/// executes (4.9).
pub const YIELD_VECTOR: u8 = 0x81;

/// The shared driver both trampolines call into: saves the interrupted
/// thread's context, asks the scheduler for the next one, and restores it.
/// `esp` is the stack pointer at the moment of the trap, pointing at the
/// `ProcessorState` the trampoline just pushed.
#[unsafe(no_mangle)]
extern "C" fn schedule_from_interrupt(esp: u64) -> u64 {
    tasking_core::store(esp);

    tasking_core::set_in_interrupt_handler(true);
    tasking_core::schedule();
    tasking_core::set_in_interrupt_handler(false);

    tasking_core::restore(manager::production(), esp)
}

/// Same driver as `schedule_from_interrupt`, plus the uptime tick only a
/// real timer IRQ (not a cooperative `int 0x81`) should advance.
#[unsafe(no_mangle)]
extern "C" fn schedule_from_timer_interrupt(esp: u64) -> u64 {
    crate::utils::timer::on_timer_interrupt();
    schedule_from_interrupt(esp)
}

/// Cooperative-yield entry point (4.9). No EOI: this is a software trap,
/// not an IRQ, so there is nothing for the PIC to acknowledge.
#[unsafe(naked)]
pub unsafe extern "C" fn yield_interrupt_handler() {
    naked_asm!(
        "push rax",
        "push rcx",
        "push rdx",
        "push rbx",
        "push rbp",
        "push rsi",
        "push rdi",
        "xor eax, eax",
        "mov ax, ds",
        "push rax",
        "xor eax, eax",
        "mov ax, es",
        "push rax",
        "xor eax, eax",
        "mov ax, fs",
        "push rax",
        "xor eax, eax",
        "mov ax, gs",
        "push rax",
        "mov rdi, rsp",
        "call {schedule_fn}",
        "mov rsp, rax",
        "pop rax",
        "mov gs, ax",
        "pop rax",
        "mov fs, ax",
        "pop rax",
        "mov es, ax",
        "pop rax",
        "mov ds, ax",
        "pop rdi",
        "pop rsi",
        "pop rbp",
        "pop rbx",
        "pop rdx",
        "pop rcx",
        "pop rax",
        "iretq",
        schedule_fn = sym schedule_from_interrupt,
    );
}

/// Preemptive timer entry point (4.8). Identical to `yield_interrupt_handler`
/// except it must acknowledge the PIC (EOI to port 0x20) before `iretq`,
/// since this is a real hardware IRQ the PIC is waiting to be told about.
#[unsafe(naked)]
pub unsafe extern "C" fn preemptive_timer_interrupt_handler() {
    naked_asm!(
        "push rax",
        "push rcx",
        "push rdx",
        "push rbx",
        "push rbp",
        "push rsi",
        "push rdi",
        "xor eax, eax",
        "mov ax, ds",
        "push rax",
        "xor eax, eax",
        "mov ax, es",
        "push rax",
        "xor eax, eax",
        "mov ax, fs",
        "push rax",
        "xor eax, eax",
        "mov ax, gs",
        "push rax",
        "mov rdi, rsp",
        "call {schedule_fn}",
        "mov rsp, rax",
        "mov al, 0x20",
        "out 0x20, al",
        "pop rax",
        "mov gs, ax",
        "pop rax",
        "mov fs, ax",
        "pop rax",
        "mov es, ax",
        "pop rax",
        "mov ds, ax",
        "pop rdi",
        "pop rsi",
        "pop rbp",
        "pop rbx",
        "pop rdx",
        "pop rcx",
        "pop rax",
        "iretq",
        schedule_fn = sym schedule_from_timer_interrupt,
    );
}

/// Issues the cooperative-yield trap (4.9); the only place `int 0x81`
/// appears. Kept here, next to the handler it traps into, rather than in
/// `tasking::core`.
pub fn issue_yield() {
    unsafe {
        asm!("int {vector}", vector = const YIELD_VECTOR, options(nomem, nostack));
    }
}
