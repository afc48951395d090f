//! Extended FPU/SIMD register state.
//!
//! The 64-bit fault handler's own execution can touch SIMD registers
//! (a vectorized page copy, compiler-generated SSE spills), so each
//! handler invocation saves the faulting context's state into a
//! stack-local save area and restores it exactly once on the way out.
//! Nested invocations get their own slot; the save area is never
//! task-global.

/// 512-byte FXSAVE area, 16-byte aligned as the instruction requires.
#[repr(C, align(16))]
pub struct FpuState {
    area: [u8; 512],
}

impl FpuState {
    /// Fresh, zeroed save area.
    #[must_use]
    pub const fn new() -> Self {
        Self { area: [0; 512] }
    }

    /// Capture the executing CPU's FPU/SIMD state.
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    pub fn save(&mut self) {
        // SAFETY: the area is 512 bytes and 16-byte aligned.
        unsafe {
            core::arch::asm!("fxsave64 [{}]", in(reg) self.area.as_mut_ptr(), options(nostack));
        }
    }

    /// Capture the executing CPU's FPU/SIMD state.
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    pub fn save(&mut self) {
        // SAFETY: the area is 512 bytes and 16-byte aligned.
        unsafe {
            core::arch::asm!("fxsave [{}]", in(reg) self.area.as_mut_ptr(), options(nostack));
        }
    }

    #[cfg(not(all(any(target_arch = "x86_64", target_arch = "x86"), target_os = "none")))]
    pub fn save(&mut self) {
        // Host stub.
    }

    /// Restore previously saved state.
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    pub fn restore(&self) {
        // SAFETY: the area holds a state image written by `save`.
        unsafe {
            core::arch::asm!("fxrstor64 [{}]", in(reg) self.area.as_ptr(), options(nostack));
        }
    }

    /// Restore previously saved state.
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    pub fn restore(&self) {
        // SAFETY: the area holds a state image written by `save`.
        unsafe {
            core::arch::asm!("fxrstor [{}]", in(reg) self.area.as_ptr(), options(nostack));
        }
    }

    #[cfg(not(all(any(target_arch = "x86_64", target_arch = "x86"), target_os = "none")))]
    pub fn restore(&self) {
        // Host stub.
    }
}

impl Default for FpuState {
    fn default() -> Self {
        Self::new()
    }
}
