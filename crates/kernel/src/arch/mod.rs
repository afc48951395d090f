//! Architecture trap entries for the page-fault path.
//!
//! Both formats funnel into [`page_fault`]: the wrappers only decode
//! hardware state (CR2, the error code) and, on the 64-bit path,
//! re-enable interrupts early and bracket the resolver with a
//! stack-local FPU save slot.

use alloc::sync::Arc;

use eos_hal::mmu::DirectMap;
use eos_utils::Mutex;

use crate::memory::fault::{FaultInfo, FaultOutcome, handle_fault};
use crate::task::Task;

/// Page-table backend of the running architecture.
#[cfg(target_arch = "x86")]
pub type ArchTables = eos_hal::mmu::PageTables32<DirectMap>;
/// Page-table backend of the running architecture.
#[cfg(not(target_arch = "x86"))]
pub type ArchTables = eos_hal::mmu::PageTables64<DirectMap>;

/// Task type of the running architecture.
pub type ArchTask = Task<ArchTables>;

/// The task executing on this CPU, published by the scheduler
/// collaborator at context switch.
static CURRENT_TASK: Mutex<Option<Arc<ArchTask>>> = Mutex::new(None);

/// The currently running task.
#[must_use]
pub fn current_task() -> Option<Arc<ArchTask>> {
    CURRENT_TASK.lock().clone()
}

/// Publish the currently running task (scheduler collaborator).
pub fn set_current_task(task: Option<Arc<ArchTask>>) {
    *CURRENT_TASK.lock() = task;
}

/// The architecture-neutral trap entry: resolve a fault against the
/// current task.
///
/// # Panics
///
/// A fault with no current task is an unrecoverable kernel-mode fault.
pub fn page_fault(info: FaultInfo) -> FaultOutcome {
    let Some(task) = current_task() else {
        panic!(
            "FATAL PAGE FAULT at {:#x} (cause {:?}) with no current task",
            info.address, info.cause
        );
    };
    handle_fault(&task, info)
}

#[cfg(target_arch = "x86_64")]
mod entry64 {
    use eos_hal::arch::{self, FaultCause};
    use eos_hal::fpu::FpuState;

    use super::{FaultInfo, FaultOutcome, page_fault};

    /// Hardware trap frame as pushed for a 64-bit exception with an
    /// error code.
    #[repr(C)]
    #[derive(Debug)]
    pub struct TrapFrame {
        pub instruction_pointer: u64,
        pub code_segment: u64,
        pub cpu_flags: u64,
        pub stack_pointer: u64,
        pub stack_segment: u64,
    }

    /// 64-bit page-fault handler body.
    ///
    /// The FPU save slot lives on this invocation's stack, so a nested
    /// fault saves into its own slot and each nesting level restores
    /// exactly once.
    pub extern "C" fn page_fault_handler(frame: &TrapFrame, error_code: u64) {
        let info = FaultInfo {
            address: arch::read_fault_address(),
            cause: FaultCause::from_error_code(error_code),
        };
        // Interrupts back on early: this fault may block on disk I/O
        // and unrelated work should proceed meanwhile.
        arch::enable_interrupts();

        let mut fpu = FpuState::new();
        fpu.save();
        let outcome = page_fault(info);
        fpu.restore();

        if let FaultOutcome::Signalled(code) = outcome {
            log::trace!(
                "page fault at {:#x} -> SIGSEGV {:?} (rip {:#x})",
                info.address,
                code,
                frame.instruction_pointer
            );
        }
    }

    /// Naked trap stub: saves scratch registers, locates the error
    /// code and frame, and calls the handler. Registered in the IDT by
    /// the interrupt setup collaborator.
    #[cfg(target_os = "none")]
    #[unsafe(naked)]
    pub unsafe extern "C" fn page_fault_stub() {
        core::arch::naked_asm!(
            "push rax",
            "push rcx",
            "push rdx",
            "push rsi",
            "push rdi",
            "push r8",
            "push r9",
            "push r10",
            "push r11",
            "mov rdi, rsp",
            "add rdi, 72", // Point to error code
            "mov rsi, [rdi]", // Error code
            "add rdi, 8", // Point to TrapFrame
            "call {handler}",
            "pop r11",
            "pop r10",
            "pop r9",
            "pop r8",
            "pop rdi",
            "pop rsi",
            "pop rdx",
            "pop rcx",
            "pop rax",
            "add rsp, 8", // Clean up error code
            "iretq",
            handler = sym page_fault_handler,
        );
    }
}

#[cfg(target_arch = "x86_64")]
pub use entry64::{TrapFrame, page_fault_handler};
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub use entry64::page_fault_stub;

#[cfg(target_arch = "x86")]
mod entry32 {
    use eos_hal::arch::{self, FaultCause};

    use super::{FaultInfo, page_fault};

    /// 32-bit page-fault handler body. No FPU juggling here; the
    /// legacy kernel does not touch SIMD state inside the handler.
    pub extern "C" fn page_fault_handler(error_code: u32) {
        let info = FaultInfo {
            address: arch::read_fault_address(),
            cause: FaultCause::from_error_code(u64::from(error_code)),
        };
        let _ = page_fault(info);
    }
}

#[cfg(target_arch = "x86")]
pub use entry32::page_fault_handler;
