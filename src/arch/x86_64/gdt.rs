/*
 * Global Descriptor Table (GDT) Implementation
 *
 * The Global Descriptor Table (GDT) is a fundamental data structure in x86_64 architecture
 * that defines memory segments and their properties. While x86_64 uses a flat memory model
 * where segmentation is largely unused, the GDT is still required for:
 *
 * 1. Code/Data Segment Descriptors: Define kernel and user code/data segments
 * 2. Task State Segment (TSS): Contains CPU state information and stack pointers
 * 3. Privilege Level Management: Enforces ring 0 (kernel) vs ring 3 (user) separation
 * 4. Interrupt Stack Table: Provides separate stacks for different interrupt types
 *
 * For our microkernel, the GDT is essential for:
 * - Setting up proper privilege levels for kernel vs userspace
 * - Providing separate interrupt stacks to prevent stack overflow attacks
 * - Enabling proper context switching between processes
 *
 * The TSS additionally carries the ring-0 stack pointer (ESP0) and, via GS
 * base, the current thread's user-thread-object address — both mutated on
 * every context switch restore (`tasking::core::restore`), so the TSS lives
 * in a `static mut` rather than behind an immutable `lazy_static`, the same
 * "build once at a stable address, mutate in place" idiom `memory::phys`
 * uses for the frame bitmap.
 */

use core::ptr::{addr_of, addr_of_mut};

use lazy_static::lazy_static;
use spin::Mutex;
use x86_64::{
    VirtAddr,
    registers::model_specific::GsBase,
    structures::{
        gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector},
        tss::TaskStateSegment,
    },
};

use crate::tasking::collaborators::GdtContract;

pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;
const DOUBLE_FAULT_STACK_SIZE: usize = 4096;

static mut DOUBLE_FAULT_STACK: [u8; DOUBLE_FAULT_STACK_SIZE] = [0; DOUBLE_FAULT_STACK_SIZE];

/// The live TSS. Built once by `init()`, then mutated in place on every
/// context-switch restore; its address never moves, so the descriptor the
/// GDT holds stays valid across mutation.
static mut TSS_STORAGE: TaskStateSegment = TaskStateSegment::new();

/// Serializes `set_tss_esp0` against itself; GS-base writes are a single
/// MSR write and need no lock.
static TSS_LOCK: Mutex<()> = Mutex::new(());

lazy_static! {
    static ref GDT: (GlobalDescriptorTable, Selectors) = {
        let mut gdt = GlobalDescriptorTable::new();
        let code_selector = gdt.append(Descriptor::kernel_code_segment());
        let data_selector = gdt.append(Descriptor::kernel_data_segment());
        let tss_selector = unsafe { gdt.append(Descriptor::tss_segment(&*addr_of_mut!(TSS_STORAGE))) };
        let user_data_selector = gdt.append(Descriptor::user_data_segment());
        let user_code_selector = gdt.append(Descriptor::user_code_segment());
        (
            gdt,
            Selectors {
                code_selector,
                data_selector,
                tss_selector,
                user_data_selector,
                user_code_selector,
            },
        )
    };
}

struct Selectors {
    code_selector: SegmentSelector,
    data_selector: SegmentSelector,
    tss_selector: SegmentSelector,
    user_data_selector: SegmentSelector,
    user_code_selector: SegmentSelector,
}

/// Initialize the Global Descriptor Table
///
/// This function sets up the GDT with kernel code segment and TSS.
/// Must be called before IDT initialization.
pub fn init() {
    use x86_64::instructions::{
        segmentation::{CS, DS, ES, SS, FS, GS, Segment},
        tables::load_tss,
    };

    unsafe {
        let stack_start = VirtAddr::from_ptr(addr_of!(DOUBLE_FAULT_STACK));
        let stack_end = stack_start + DOUBLE_FAULT_STACK_SIZE as u64;
        (*addr_of_mut!(TSS_STORAGE)).interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] = stack_end;
    }

    log::info!("Loading GDT...");
    GDT.0.load();

    unsafe {
        log::info!("Setting segment registers...");
        // Reload CS to the new code segment
        CS::set_reg(GDT.1.code_selector);

        // CRITICAL: reload all data segments to the new data segment
        // This fixes the triple fault by ensuring all segment registers
        // point to valid descriptors in our new GDT
        DS::set_reg(GDT.1.data_selector);
        ES::set_reg(GDT.1.data_selector);
        SS::set_reg(GDT.1.data_selector);
        FS::set_reg(GDT.1.data_selector);
        GS::set_reg(GDT.1.data_selector);

        log::info!("Loading TSS...");
        load_tss(GDT.1.tss_selector);
    }

    log::info!("GDT initialized successfully");
}

/// Get the kernel code segment selector (Ring 0).
pub fn kernel_code_selector() -> SegmentSelector {
    GDT.1.code_selector
}

/// Get the kernel data segment selector (Ring 0).
pub fn kernel_data_selector() -> SegmentSelector {
    GDT.1.data_selector
}

/// Get the user code segment selector (Ring 3)
///
/// Returns the segment selector for user mode code execution.
/// The selector has RPL=3 (Ring 3) set by the x86_64 crate.
pub fn user_code_selector() -> SegmentSelector {
    GDT.1.user_code_selector
}

/// Get the user data segment selector (Ring 3)
///
/// Returns the segment selector for user mode data access.
/// The selector has RPL=3 (Ring 3) set by the x86_64 crate.
pub fn user_data_selector() -> SegmentSelector {
    GDT.1.user_data_selector
}

/// Set the ring-0 stack pointer the CPU loads on the next ring3->ring0
/// transition (interrupt, syscall trap) for the thread about to run.
pub fn set_tss_esp0(vaddr: VirtAddr) {
    let _guard = TSS_LOCK.lock();
    unsafe {
        (*addr_of_mut!(TSS_STORAGE)).privilege_stack_table[0] = vaddr;
    }
}

/// Set GS base to the current thread's user-thread-object address, so
/// userspace's `%gs:0` access finds its own TLS descriptor (spec's 32-bit
/// GDT GS-slot `0x30` mutation, expressed as this platform's GS-base MSR).
pub fn set_user_thread_object_address(vaddr: VirtAddr) {
    GsBase::write(vaddr);
}

/// Concrete `GdtContract` adapter wiring the tasking core to this module.
pub struct Gdt;

impl GdtContract for Gdt {
    fn set_user_thread_object_address(&self, vaddr: VirtAddr) {
        self::set_user_thread_object_address(vaddr);
    }

    fn set_tss_esp0(&self, vaddr: VirtAddr) {
        self::set_tss_esp0(vaddr);
    }
}
