//! Virtual memory management.
//!
//! Build order mirrors the dependency order: frames and the allocator
//! live in the HAL; on top of them sit the region list ([`region`]),
//! the locked address space ([`addrspace`]), the backing-store
//! collaborator ([`backing`]) and the fault resolver ([`fault`]).

use eos_hal::allocator::FrameAllocator;
use eos_utils::Once;

pub mod addrspace;
pub mod backing;
pub mod fault;
pub mod region;

/// Global frame allocator, initialized once during boot after the
/// physical memory map is known.
pub static FRAME_ALLOCATOR: Once<FrameAllocator> = Once::new();

/// Initialize physical memory management for `frames` frames.
///
/// Later calls return the already-initialized allocator.
pub fn init_frames(frames: usize) -> &'static FrameAllocator {
    FRAME_ALLOCATOR.call_once(|| FrameAllocator::new(frames))
}

/// The global frame allocator, if initialized.
#[must_use]
pub fn frame_allocator() -> Option<&'static FrameAllocator> {
    FRAME_ALLOCATOR.get()
}
