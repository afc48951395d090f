//! Per-task address spaces.
//!
//! An [`AddressSpace`] bundles the region list and the page-table
//! backend behind one mutex, the per-address-space lock. Distinct
//! address spaces fault independently; all mutation of regions or
//! tables happens under this lock. The lock is *not* released across
//! backing-store I/O, so same-space faulters queue behind a loading
//! fault (a deliberate, documented scalability trade).

use eos_hal::PAGE_SIZE;
use eos_hal::mmu::{AddressSpaceOps, PageEntry};
use eos_utils::{Mutex, MutexGuard};

use crate::memory::region::{MemRegion, Prot, RegionError, RegionList};

/// The lock-guarded state of one address space.
pub struct SpaceInner<A: AddressSpaceOps> {
    /// Ordered virtual ranges.
    pub regions: RegionList,
    /// Architecture page-table backend.
    pub tables: A,
}

impl<A: AddressSpaceOps> SpaceInner<A> {
    /// Unmap `[start, end)`: drop the covering regions (splitting at
    /// the boundaries) and release every mapped frame, freeing those
    /// this space solely owns and un-sharing the rest.
    pub fn munmap(&mut self, start: usize, end: usize) -> Result<(), RegionError> {
        self.regions.remove(start, end)?;
        let alloc = self.tables.allocator();
        let mut va = start;
        while va < end {
            if let Some(entry) = self.tables.entry_for(va) {
                if entry.is_present() {
                    let frame = entry.frame();
                    let _ = self.tables.unmap(va);
                    if alloc.table().shares(frame) == 0 {
                        alloc.free_frame(frame);
                    } else {
                        alloc.table().dec_shares(frame);
                    }
                }
            }
            va += PAGE_SIZE;
        }
        Ok(())
    }

    /// Change protection over `[start, end)` and bring already-present
    /// entries in line. COW entries never become writable here; the
    /// write fault keeps that decision.
    pub fn mprotect(&mut self, start: usize, end: usize, prot: Prot) -> Result<(), RegionError> {
        self.regions.set_protection(start, end, prot)?;
        let mut va = start;
        while va < end {
            if let Some(entry) = self.tables.entry_for(va) {
                if entry.is_present() {
                    let mut attrs = entry.attrs();
                    attrs.set(
                        eos_hal::mmu::PageAttrs::WRITABLE,
                        prot.contains(Prot::WRITE) && !entry.is_cow(),
                    );
                    attrs.set(eos_hal::mmu::PageAttrs::EXEC, prot.contains(Prot::EXEC));
                    let updated = A::Entry::compose(entry.frame(), attrs);
                    if updated != entry {
                        let _ = self.tables.write_entry(va, updated);
                        self.tables.flush_tlb_entry(va);
                    }
                }
            }
            va += PAGE_SIZE;
        }
        Ok(())
    }
}

/// One task's address space: regions plus page tables, serialized by
/// one mutex.
pub struct AddressSpace<A: AddressSpaceOps> {
    inner: Mutex<SpaceInner<A>>,
}

impl<A: AddressSpaceOps> AddressSpace<A> {
    /// Fresh address space over the given table backend.
    pub fn new(tables: A) -> Self {
        Self {
            inner: Mutex::new(SpaceInner {
                regions: RegionList::new(),
                tables,
            }),
        }
    }

    /// Acquire the per-address-space lock.
    pub fn lock(&self) -> MutexGuard<'_, SpaceInner<A>> {
        self.inner.lock()
    }

    /// Try to acquire the lock without spinning.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, SpaceInner<A>>> {
        self.inner.try_lock()
    }

    /// Register a region (mmap, exec, fork setup).
    pub fn map_region(&self, region: MemRegion) -> Result<(), RegionError> {
        self.inner.lock().regions.insert(region)
    }

    /// Unmap a range (munmap).
    pub fn unmap_range(&self, start: usize, end: usize) -> Result<(), RegionError> {
        self.inner.lock().munmap(start, end)
    }

    /// Change protection over a range (mprotect).
    pub fn protect_range(&self, start: usize, end: usize, prot: Prot) -> Result<(), RegionError> {
        self.inner.lock().mprotect(start, end, prot)
    }

    /// Release everything: regions and the whole table tree. The space
    /// must not be used afterwards.
    pub fn teardown(&self) {
        let mut inner = self.inner.lock();
        inner.tables.teardown();
        inner.regions = RegionList::new();
    }
}

/// Re-entrant handle to a locked [`SpaceInner`], used by the fault
/// resolver.
///
/// The outermost fault invocation owns the mutex guard and stashes the
/// raw pointer in its task; a nested invocation (the handler faulting
/// on its own memory touches) rebuilds a handle from that pointer
/// instead of re-locking.
pub(crate) struct SpaceRef<A: AddressSpaceOps> {
    inner: *mut SpaceInner<A>,
}

impl<A: AddressSpaceOps> SpaceRef<A> {
    pub(crate) fn new(inner: *mut SpaceInner<A>) -> Self {
        debug_assert!(!inner.is_null());
        Self { inner }
    }

    /// Run `f` against the space state.
    ///
    /// Borrows taken here must end before control can reach a nested
    /// fault: page copies, zeroing and backing-store reads all happen
    /// outside `with`, through raw pointers fetched inside it.
    pub(crate) fn with<R>(&self, f: impl FnOnce(&mut SpaceInner<A>) -> R) -> R {
        // SAFETY: `inner` points at the SpaceInner locked by the
        // outermost fault invocation on this CPU. Nested invocations
        // run synchronously inside the outer one, so the pointer stays
        // valid and no two borrows are ever live at once.
        f(unsafe { &mut *self.inner })
    }
}
