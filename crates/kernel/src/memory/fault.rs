//! Page-fault resolution.
//!
//! One state machine, written once against
//! [`AddressSpaceOps`], drives both paging formats:
//!
//! 1. preflight (no task / no space is fatal),
//! 2. recursion guard: only the outermost invocation touches the
//!    per-address-space mutex and the fault-in-progress flag,
//! 3. region lookup, with a downward stack-growth probe,
//! 4. permission checks,
//! 5. not-present: stack population or a backing-store load (major
//!    fault),
//! 6. present write: the copy-on-write path (minor fault); privatize
//!    the leaf table if it is itself shared, then privatize the page
//!    in place when this is the last reference or duplicate it when
//!    sharers remain,
//! 7. unresolved: SIGSEGV for user tasks, a fatal dump for kernel
//!    tasks.
//!
//! Only the local CPU's TLB entry is invalidated after an entry
//! change; see `eos_hal::arch::flush_tlb_local` for why that is
//! sufficient under the per-space mutex.

use core::ptr;

use eos_hal::arch::FaultCause;
use eos_hal::frame::ShareState;
use eos_hal::mmu::{AddressSpaceOps, PageAttrs, PageEntry};
use eos_hal::{PAGE_SIZE, page_base};

use crate::memory::addrspace::SpaceRef;
use crate::memory::region::{Backing, Prot, RegionHit, RegionKind};
use crate::task::{SegvCode, Task, TaskKind};

/// Everything the trap gives us about one fault.
#[derive(Debug, Clone, Copy)]
pub struct FaultInfo {
    /// Faulting virtual address.
    pub address: usize,
    /// Hardware cause bits.
    pub cause: FaultCause,
}

/// How a fault left the trap handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// The mapping was repaired; the instruction retries on return.
    Handled,
    /// SIGSEGV was synthesized for the task; dispatch happens on trap
    /// return. The instruction is not retried.
    Signalled(SegvCode),
}

/// Resolve a fault against `task`'s address space.
///
/// This is the core of the trap entry: the architecture wrappers in
/// [`crate::arch`] only decode hardware state and manage FPU save
/// slots around this call.
///
/// # Panics
///
/// Unrecoverable faults halt the kernel: a task without an address
/// space, a reserved-bit (corrupted page table) fault, and any
/// unresolved fault in a kernel task.
pub fn handle_fault<A: AddressSpaceOps>(task: &Task<A>, info: FaultInfo) -> FaultOutcome {
    let Some(space) = task.space() else {
        fatal_fault(task, &info, "faulting task has no address space");
    };
    if info.cause.contains(FaultCause::RESERVED) {
        fatal_fault(task, &info, "reserved bit set in a paging structure");
    }

    let nested = task.enter_fault();
    let resolution = if nested {
        // Nested fault: the outer invocation already holds the space
        // mutex. Re-locking would deadlock; unlocking on the way out
        // would double-release. Both are reserved for the outermost
        // level.
        let inner = task.active_fault_ptr();
        if inner.is_null() {
            fatal_fault(task, &info, "nested fault with no outer fault state");
        }
        resolve(task, &SpaceRef::new(inner), &info)
    } else {
        let mut guard = space.lock();
        // One pointer feeds both this invocation and any nested ones,
        // published through the task for the latter.
        let inner: *mut _ = &mut *guard;
        task.stash_active_fault(inner);
        let resolution = resolve(task, &SpaceRef::new(inner), &info);
        task.clear_active_fault();
        drop(guard);
        task.leave_fault();
        resolution
    };

    match resolution {
        Ok(()) => FaultOutcome::Handled,
        Err(code) => {
            if task.kind == TaskKind::Kernel {
                fatal_fault(task, &info, "unresolved fault in kernel task");
            }
            task.deliver_segv(code, info.address);
            FaultOutcome::Signalled(code)
        }
    }
}

/// The state machine proper, running against the locked space.
fn resolve<A: AddressSpaceOps>(
    task: &Task<A>,
    space: &SpaceRef<A>,
    info: &FaultInfo,
) -> Result<(), SegvCode> {
    let page = page_base(info.address);

    let hit = space.with(|s| s.regions.lookup(info.address));
    let index = match hit {
        RegionHit::Inside(index) => index,
        RegionHit::StackAbove(index) => return grow_stack(task, space, info, index),
        RegionHit::Miss => return Err(SegvCode::MapErr),
    };
    // Copy the facts out; region borrows must not be live across
    // operations that can sleep or nest.
    let (prot, kind, shared, backing, backing_offset) = space.with(|s| {
        let region = s.regions.get(index);
        (
            region.prot,
            region.kind,
            region.shared,
            region.backing.clone(),
            region.backing_offset(page),
        )
    });

    check_access(&info.cause, prot, kind)?;

    let entry = space.with(|s| s.tables.entry_for(page));
    let present = entry.is_some_and(PageEntry::is_present);

    if !present {
        if kind == RegionKind::Stack {
            install_zeroed(space, page, attrs_for(prot, kind, shared))?;
            task.count_minor_fault();
            return Ok(());
        }
        load_page(space, page, attrs_for(prot, kind, shared), backing, backing_offset)?;
        task.count_major_fault();
        return Ok(());
    }

    if !info.cause.contains(FaultCause::WRITE) {
        // A read of a present page only faults when the mapping
        // forbids it; there is nothing to repair.
        return Err(SegvCode::AccErr);
    }

    resolve_cow(task, space, page, shared)
}

/// Region-level permission checks.
fn check_access(cause: &FaultCause, prot: Prot, kind: RegionKind) -> Result<(), SegvCode> {
    if kind == RegionKind::Kernel && cause.contains(FaultCause::USER) {
        return Err(SegvCode::AccErr);
    }
    if cause.contains(FaultCause::WRITE) && !prot.contains(Prot::WRITE) {
        return Err(SegvCode::AccErr);
    }
    if cause.contains(FaultCause::IFETCH) && !prot.contains(Prot::EXEC) {
        return Err(SegvCode::AccErr);
    }
    // Plain read of a protection-denied range (PROT_NONE).
    if !cause.intersects(FaultCause::WRITE | FaultCause::IFETCH) && !prot.contains(Prot::READ) {
        return Err(SegvCode::AccErr);
    }
    Ok(())
}

/// The copy-on-write path: present page, write access.
fn resolve_cow<A: AddressSpaceOps>(
    task: &Task<A>,
    space: &SpaceRef<A>,
    page: usize,
    region_shared: bool,
) -> Result<(), SegvCode> {
    // Re-lookup: the entry may have changed underneath us across the
    // sleep points of an earlier load (step 5 can block on I/O).
    space
        .with(|s| s.tables.entry_for(page))
        .filter(|e| e.is_present())
        .ok_or(SegvCode::MapErr)?;

    clone_leaf_table_if_shared(space, page)?;

    // Re-read after the possible clone; another fault between our two
    // lock acquisitions may already have resolved this entry.
    let mut entry = space
        .with(|s| s.tables.entry_for(page))
        .filter(|e| e.is_present())
        .ok_or(SegvCode::MapErr)?;
    if !entry.is_cow() {
        // Another racer already resolved it, or the fault is a stale
        // TLB artifact: a pure protection-check pass.
        space.with(|s| s.tables.flush_tlb_entry(page));
        task.count_minor_fault();
        return Ok(());
    }

    let old = entry.frame();
    let alloc = space.with(|s| s.tables.allocator());

    if alloc.table().shares(old) == 0 {
        // Last reference: privatize in place, no data copy.
        entry.clear_cow_make_writable();
        space
            .with(|s| s.tables.write_entry(page, entry))
            .map_err(|_| SegvCode::MapErr)?;
        space.with(|s| s.tables.flush_tlb_entry(page));
        task.count_minor_fault();
        return Ok(());
    }

    // Shared: duplicate the page for this address space.
    let fresh = alloc.alloc_frame().map_err(|_| SegvCode::MapErr)?;
    let (src, dst) = space.with(|s| (s.tables.frame_ptr(old), s.tables.frame_ptr(fresh)));
    // SAFETY: distinct frames, both page-sized and page-aligned; the
    // copy runs outside `with` so a nested fault stays sound.
    unsafe {
        ptr::copy_nonoverlapping(src, dst, PAGE_SIZE);
    }
    // Whether we were the second-to-last sharer or not, the remaining
    // owner privatizes without a copy on its own fault.
    let _: ShareState = alloc.table().dec_shares(old);

    let mut attrs = entry.attrs();
    attrs.remove(PageAttrs::COW);
    attrs.insert(PageAttrs::WRITABLE);
    // Carry the region's private/shared flag forward on the
    // replacement mapping.
    attrs.set(PageAttrs::PRIVATE, !region_shared);
    space
        .with(|s| s.tables.write_entry(page, A::Entry::compose(fresh, attrs)))
        .map_err(|_| SegvCode::MapErr)?;
    space.with(|s| s.tables.flush_tlb_entry(page));
    task.count_minor_fault();
    Ok(())
}

/// Downward stack growth: the faulting address lies
/// below a stack region.
fn grow_stack<A: AddressSpaceOps>(
    task: &Task<A>,
    space: &SpaceRef<A>,
    info: &FaultInfo,
    index: usize,
) -> Result<(), SegvCode> {
    let page = page_base(info.address);
    let (prot, kind, shared) = space.with(|s| {
        let region = s.regions.get(index);
        (region.prot, region.kind, region.shared)
    });
    check_access(&info.cause, prot, kind)?;

    // Probe the limit and adjacency before committing anything.
    space
        .with(|s| s.regions.check_stack_growth(index, page, task.rlimit_stack()))
        .map_err(|_| SegvCode::MapErr)?;

    install_zeroed(space, page, attrs_for(prot, kind, shared))?;

    // Bookkeeping last, so a failed allocation never leaves a
    // truncated region behind.
    space
        .with(|s| s.regions.grow_stack(index, page, task.rlimit_stack()))
        .map_err(|_| SegvCode::MapErr)?;
    task.set_end_stack(page);
    task.count_minor_fault();
    Ok(())
}

/// Attributes for a freshly installed page of a region.
fn attrs_for(prot: Prot, kind: RegionKind, shared: bool) -> PageAttrs {
    let mut attrs = PageAttrs::empty();
    if prot.contains(Prot::WRITE) {
        attrs |= PageAttrs::WRITABLE;
    }
    if prot.contains(Prot::EXEC) {
        attrs |= PageAttrs::EXEC;
    }
    if kind != RegionKind::Kernel {
        attrs |= PageAttrs::USER;
    }
    if !shared {
        attrs |= PageAttrs::PRIVATE;
    }
    attrs
}

/// Privatize the leaf table covering `page` if the table's own frame
/// is shared (fork shares whole tables until first write).
fn clone_leaf_table_if_shared<A: AddressSpaceOps>(
    space: &SpaceRef<A>,
    page: usize,
) -> Result<(), SegvCode> {
    space.with(|s| {
        let Some(table_frame) = s.tables.leaf_table_frame(page) else {
            return Ok(());
        };
        if s.tables.allocator().table().shares(table_frame) == 0 {
            return Ok(());
        }
        s.tables
            .clone_leaf_table(page)
            .map(|_| ())
            .map_err(|_| SegvCode::MapErr)
    })
}

/// Allocate a zeroed frame and install it at `page`.
fn install_zeroed<A: AddressSpaceOps>(
    space: &SpaceRef<A>,
    page: usize,
    attrs: PageAttrs,
) -> Result<(), SegvCode> {
    let alloc = space.with(|s| s.tables.allocator());
    let frame = alloc.alloc_frame().map_err(|_| SegvCode::MapErr)?;
    let dst = space.with(|s| s.tables.frame_ptr(frame));
    // SAFETY: freshly allocated frame, page-sized and page-aligned;
    // zeroing runs outside `with` so a nested fault stays sound.
    unsafe {
        ptr::write_bytes(dst, 0, PAGE_SIZE);
    }

    if let Err(code) = clone_leaf_table_if_shared(space, page) {
        alloc.free_frame(frame);
        return Err(code);
    }
    if space
        .with(|s| s.tables.install_entry(page, frame, attrs))
        .is_err()
    {
        alloc.free_frame(frame);
        return Err(SegvCode::MapErr);
    }
    space.with(|s| s.tables.flush_tlb_entry(page));
    Ok(())
}

/// Load a not-present page of a file/anon region: the
/// backing store fills the bytes, anonymous regions zero-fill, and the
/// fresh mapping carries the region's protection directly; no COW
/// logic applies to a freshly loaded page.
fn load_page<A: AddressSpaceOps>(
    space: &SpaceRef<A>,
    page: usize,
    attrs: PageAttrs,
    backing: Option<Backing>,
    backing_offset: Option<u64>,
) -> Result<(), SegvCode> {
    let alloc = space.with(|s| s.tables.allocator());
    let frame = alloc.alloc_frame().map_err(|_| SegvCode::MapErr)?;
    let dst = space.with(|s| s.tables.frame_ptr(frame));
    // SAFETY: freshly allocated frame, page-sized and page-aligned;
    // all byte work runs outside `with` so a fault nested inside the
    // backing store's read stays sound.
    unsafe {
        ptr::write_bytes(dst, 0, PAGE_SIZE);
    }
    if let (Some(backing), Some(offset)) = (backing, backing_offset) {
        // SAFETY: `dst` points at one full, exclusively owned page.
        let buf = unsafe { &mut *(dst as *mut [u8; PAGE_SIZE]) };
        if backing.store.read_page(offset, buf).is_err() {
            alloc.free_frame(frame);
            return Err(SegvCode::MapErr);
        }
    }

    if let Err(code) = clone_leaf_table_if_shared(space, page) {
        alloc.free_frame(frame);
        return Err(code);
    }
    if space
        .with(|s| s.tables.install_entry(page, frame, attrs))
        .is_err()
    {
        alloc.free_frame(frame);
        return Err(SegvCode::MapErr);
    }
    space.with(|s| s.tables.flush_tlb_entry(page));
    Ok(())
}

/// Unrecoverable fault: dump diagnostics and halt.
fn fatal_fault<A: AddressSpaceOps>(task: &Task<A>, info: &FaultInfo, reason: &str) -> ! {
    log::error!(
        "fatal page fault: task {} ({:?}) at {:#x}, cause {:?}: {}",
        task.id.0,
        task.kind,
        info.address,
        info.cause,
        reason
    );
    panic!(
        "FATAL PAGE FAULT at {:#x} (cause {:?}) in task {} [{:?}]: {}",
        info.address, info.cause, task.id.0, task.kind, reason
    );
}
