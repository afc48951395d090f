//! Privileged register access, TLB maintenance and fault-cause
//! decoding.
//!
//! Intrinsics compile to real instructions on bare-metal x86 targets
//! (`target_os = "none"`) and to stubs elsewhere so the VMM
//! test-drives on the host.

use bitflags::bitflags;

bitflags! {
    /// Hardware page-fault cause bits.
    ///
    /// The layout matches the x86 page-fault error code on both the
    /// 32-bit and 64-bit formats: bit 0 present, bit 1 write, bit 2
    /// user-mode, bit 3 reserved-bit violation, bit 4 instruction
    /// fetch.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct FaultCause: u32 {
        /// The faulting page was present (protection fault rather than
        /// a missing mapping).
        const PRESENT  = 1 << 0;
        /// The access was a write.
        const WRITE    = 1 << 1;
        /// The access came from user mode.
        const USER     = 1 << 2;
        /// Reserved bits were set in a paging structure.
        const RESERVED = 1 << 3;
        /// The access was an instruction fetch.
        const IFETCH   = 1 << 4;
    }
}

impl FaultCause {
    /// Decode a hardware error code, ignoring bits this kernel does
    /// not interpret.
    #[must_use]
    pub const fn from_error_code(code: u64) -> Self {
        Self::from_bits_truncate(code as u32)
    }
}

/// Read the faulting virtual address (CR2).
#[cfg(all(any(target_arch = "x86_64", target_arch = "x86"), target_os = "none"))]
#[must_use]
pub fn read_fault_address() -> usize {
    let cr2: usize;
    // SAFETY: reading CR2 has no side effects and is valid at CPL0.
    unsafe {
        core::arch::asm!("mov {}, cr2", out(reg) cr2, options(nostack, preserves_flags));
    }
    cr2
}

#[cfg(not(all(any(target_arch = "x86_64", target_arch = "x86"), target_os = "none")))]
#[must_use]
pub fn read_fault_address() -> usize {
    // Host stub: fault addresses come in through FaultInfo in tests.
    0
}

/// Invalidate the TLB entry covering `va` on the executing CPU.
///
/// This is local-CPU only: there is no cross-CPU shootdown. Faults
/// within one address space serialize on that space's mutex, so
/// another CPU holding a stale translation re-faults and resolves
/// against the already-updated tables. A stale *permissive* entry on a
/// remote CPU is the accepted gap of this scheme.
#[cfg(all(any(target_arch = "x86_64", target_arch = "x86"), target_os = "none"))]
pub fn flush_tlb_local(va: usize) {
    // SAFETY: invlpg only drops a cached translation; the next access
    // re-walks the tables.
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) va, options(nostack, preserves_flags));
    }
}

#[cfg(not(all(any(target_arch = "x86_64", target_arch = "x86"), target_os = "none")))]
pub fn flush_tlb_local(_va: usize) {
    // Host stub: simulated walks never cache translations.
}

/// Re-enable interrupts on the executing CPU.
///
/// The 64-bit fault entry does this early so unrelated work proceeds
/// while a fault blocks on backing-store I/O.
#[cfg(all(any(target_arch = "x86_64", target_arch = "x86"), target_os = "none"))]
pub fn enable_interrupts() {
    // SAFETY: setting IF is the intended effect.
    unsafe {
        core::arch::asm!("sti", options(nostack, preserves_flags));
    }
}

#[cfg(not(all(any(target_arch = "x86_64", target_arch = "x86"), target_os = "none")))]
pub fn enable_interrupts() {
    // Host stub.
}
