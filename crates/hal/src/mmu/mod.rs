//! Address-space page tables.
//!
//! Two backends over the same architecture-neutral contract: the
//! four-level 64-bit format ([`pt64`]) and the legacy two-level 32-bit
//! format ([`pt32`]). The fault resolver is written once against
//! [`AddressSpaceOps`]; everything a backend owns is mechanics, not
//! policy.
//!
//! Physical memory is reached through [`PhysAccess`]. The kernel uses
//! the direct map; tests substitute a page-aligned host arena.

pub mod pt32;
pub mod pt64;
pub mod pte;

pub use pt32::PageTables32;
pub use pt64::PageTables64;
pub use pte::{PageAttrs, PageEntry, Pte32, Pte64};

use eos_error::kernel_error;

use crate::allocator::FrameAllocator;
use crate::frame::Frame;

kernel_error! {
    /// Page table manipulation failures.
    pub enum MapError: 0x02 {
        /// Leaf entry (or an intermediate table) missing
        NotMapped = 0x01 => "address not mapped",
        /// Intermediate table missing during a no-create walk
        WalkFailed = 0x02 => "page table walk failed",
        /// Could not allocate a frame for a page table
        AllocationFailed = 0x03 => "page table allocation failed",
        /// Virtual address outside the format's range
        InvalidAddress = 0x04 => "invalid virtual address",
    }
}

/// Base of the kernel's direct mapping of physical memory.
#[cfg(target_pointer_width = "64")]
pub const KERNEL_VIRT_BASE: usize = 0xFFFF_8000_0000_0000;
#[cfg(target_pointer_width = "32")]
pub const KERNEL_VIRT_BASE: usize = 0xC000_0000;

/// Convert a physical address to its direct-mapped virtual address.
#[inline]
#[must_use]
pub const fn phys_to_virt(pa: usize) -> usize {
    pa + KERNEL_VIRT_BASE
}

/// Convert a direct-mapped virtual address back to physical.
#[inline]
#[must_use]
pub const fn virt_to_phys(va: usize) -> usize {
    va - KERNEL_VIRT_BASE
}

/// Converts physical frames to usable pointers in the current virtual
/// address space.
///
/// The kernel implementation is the direct map; tests provide an arena
/// so page-table manipulation runs on the host.
pub trait PhysAccess: Clone {
    /// Pointer to the first byte of `frame`.
    ///
    /// The returned pointer must be valid for reads and writes of one
    /// full page and aligned to [`crate::PAGE_SIZE`].
    fn frame_ptr(&self, frame: Frame) -> *mut u8;
}

/// [`PhysAccess`] through the kernel's direct map.
#[derive(Clone, Copy, Debug, Default)]
pub struct DirectMap;

impl PhysAccess for DirectMap {
    #[inline]
    fn frame_ptr(&self, frame: Frame) -> *mut u8 {
        phys_to_virt(frame.base()) as *mut u8
    }
}

/// Architecture-neutral contract over one address space's page tables.
///
/// Entries are read and written by value: a lookup yields a snapshot,
/// and mutations go back through the trait. The fault resolver relies
/// on this for its defensive re-checks after operations that can sleep.
pub trait AddressSpaceOps {
    /// Leaf entry type of the backing format.
    type Entry: PageEntry;

    /// Frame of the root table.
    fn root(&self) -> Frame;

    /// The frame allocator backing this space's tables.
    fn allocator(&self) -> &'static FrameAllocator;

    /// Pointer to the bytes of an arbitrary frame (for zeroing and
    /// page copies).
    fn frame_ptr(&self, frame: Frame) -> *mut u8;

    /// Snapshot of the leaf entry covering `va`, if the walk reaches a
    /// leaf table. The entry itself may be non-present.
    fn entry_for(&self, va: usize) -> Option<Self::Entry>;

    /// Write a leaf entry for `va` without creating missing tables.
    fn write_entry(&mut self, va: usize, entry: Self::Entry) -> Result<(), MapError>;

    /// Install a present leaf entry, creating intermediate tables as
    /// needed. Does not flush the TLB; callers flush after the mapping
    /// change they complete.
    fn install_entry(&mut self, va: usize, frame: Frame, attrs: PageAttrs)
    -> Result<(), MapError>;

    /// Frame occupied by the leaf table covering `va`, if present.
    /// Used to detect tables that are themselves shared after fork.
    fn leaf_table_frame(&self, va: usize) -> Option<Frame>;

    /// Privatize a shared leaf table: copy all entries into a freshly
    /// allocated table, drop one sharing reference from the old table
    /// frame, and relink the parent. Referenced frames keep their
    /// share counts (logical mappings are unchanged); per-entry COW
    /// stays the caller's business.
    fn clone_leaf_table(&mut self, va: usize) -> Result<Frame, MapError>;

    /// Clear the leaf entry for `va` and flush its TLB entry. The
    /// referenced frame's lifecycle is the caller's to settle first.
    fn unmap(&mut self, va: usize) -> Result<(), MapError>;

    /// Translate `va` to a physical address and the entry's attributes.
    fn translate(&self, va: usize) -> Option<(usize, PageAttrs)>;

    /// Invalidate the TLB entry for `va` on the executing CPU.
    fn flush_tlb_entry(&self, va: usize);

    /// Release every mapping and table of this space, dropping one
    /// sharing reference from shared frames and freeing sole-owned
    /// ones. Shared subtrees are descended for their share accounting
    /// but their memory is left to the remaining owners.
    fn teardown(&mut self);
}
