//! Task collaborator surface.
//!
//! The scheduler owns task lifecycles; the VMM consumes a narrow
//! slice: the current task's address-space handle, its stack resource
//! limit, fault counters, signal delivery, and the per-task state that
//! makes recursive fault handling safe. [`Task`] models exactly that
//! slice.

use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use alloc::sync::Arc;

use eos_hal::mmu::AddressSpaceOps;
use eos_utils::Mutex;

use crate::memory::addrspace::{AddressSpace, SpaceInner};

/// Signal number delivered on unresolved user faults.
pub const SIGSEGV: u32 = 11;

/// Default stack resource limit (8 MiB, the conventional soft limit).
pub const DEFAULT_RLIMIT_STACK: usize = 8 * 1024 * 1024;

/// Whether a task runs in user or kernel context. Kernel tasks never
/// receive signals; their unresolved faults halt the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    User,
    Kernel,
}

/// Task identifier assigned by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(pub usize);

/// `siginfo` code distinguishing the two SIGSEGV flavors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegvCode {
    /// No mapping exists at the faulting address.
    MapErr = 1,
    /// A mapping exists but forbids the access.
    AccErr = 2,
}

/// Details of a delivered SIGSEGV, consumed by signal dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegvInfo {
    pub code: SegvCode,
    pub address: usize,
}

/// The VMM-visible state of one task.
pub struct Task<A: AddressSpaceOps> {
    pub id: TaskId,
    pub kind: TaskKind,
    space: Option<Arc<AddressSpace<A>>>,
    rlimit_stack: AtomicUsize,
    /// Lowest address of the main stack, updated as it grows down.
    end_stack: AtomicUsize,
    minor_faults: AtomicU64,
    major_faults: AtomicU64,
    pending_signals: AtomicU32,
    segv_info: Mutex<Option<SegvInfo>>,
    /// Set while this task is inside its own page-fault handler.
    in_fault: AtomicBool,
    /// Locked space state of the outermost fault invocation; nested
    /// invocations re-enter through this instead of re-locking.
    active_fault: AtomicPtr<SpaceInner<A>>,
}

impl<A: AddressSpaceOps> Task<A> {
    /// User task owning `space`.
    pub fn user(id: TaskId, space: Arc<AddressSpace<A>>) -> Self {
        Self::new(id, TaskKind::User, Some(space))
    }

    /// Kernel task. `space` covers kernel threads that operate on a
    /// borrowed address space; pure kernel threads pass `None`.
    pub fn kernel(id: TaskId, space: Option<Arc<AddressSpace<A>>>) -> Self {
        Self::new(id, TaskKind::Kernel, space)
    }

    fn new(id: TaskId, kind: TaskKind, space: Option<Arc<AddressSpace<A>>>) -> Self {
        Self {
            id,
            kind,
            space,
            rlimit_stack: AtomicUsize::new(DEFAULT_RLIMIT_STACK),
            end_stack: AtomicUsize::new(0),
            minor_faults: AtomicU64::new(0),
            major_faults: AtomicU64::new(0),
            pending_signals: AtomicU32::new(0),
            segv_info: Mutex::new(None),
            in_fault: AtomicBool::new(false),
            active_fault: AtomicPtr::new(core::ptr::null_mut()),
        }
    }

    /// The task's address space, if it has one.
    pub fn space(&self) -> Option<&Arc<AddressSpace<A>>> {
        self.space.as_ref()
    }

    /// Current stack resource limit in bytes.
    pub fn rlimit_stack(&self) -> usize {
        self.rlimit_stack.load(Ordering::Relaxed)
    }

    /// Adjust the stack resource limit (setrlimit path).
    pub fn set_rlimit_stack(&self, bytes: usize) {
        self.rlimit_stack.store(bytes, Ordering::Relaxed);
    }

    /// Lowest address the main stack has grown to.
    pub fn end_stack(&self) -> usize {
        self.end_stack.load(Ordering::Relaxed)
    }

    /// Record a new stack low-water mark.
    pub fn set_end_stack(&self, addr: usize) {
        self.end_stack.store(addr, Ordering::Relaxed);
    }

    /// Faults resolved without I/O (`minflt`).
    pub fn minor_faults(&self) -> u64 {
        self.minor_faults.load(Ordering::Relaxed)
    }

    /// Faults that required backing-store I/O (`majflt`).
    pub fn major_faults(&self) -> u64 {
        self.major_faults.load(Ordering::Relaxed)
    }

    pub(crate) fn count_minor_fault(&self) {
        self.minor_faults.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn count_major_fault(&self) {
        self.major_faults.fetch_add(1, Ordering::Relaxed);
    }

    /// Pending signal bitmask.
    pub fn pending_signals(&self) -> u32 {
        self.pending_signals.load(Ordering::Acquire)
    }

    /// Whether `sig` is pending.
    pub fn signal_pending(&self, sig: u32) -> bool {
        self.pending_signals() & (1 << sig) != 0
    }

    /// Last synthesized SIGSEGV, if any. Signal dispatch consumes it
    /// on the way back to user mode.
    pub fn take_segv_info(&self) -> Option<SegvInfo> {
        self.segv_info.lock().take()
    }

    /// Synthesize a SIGSEGV at `address`. Dispatch happens on trap
    /// return; the faulting instruction is not retried here.
    pub fn deliver_segv(&self, code: SegvCode, address: usize) {
        *self.segv_info.lock() = Some(SegvInfo { code, address });
        self.pending_signals
            .fetch_or(1 << SIGSEGV, Ordering::Release);
        log::debug!(
            "task {}: SIGSEGV ({:?}) at {:#x}",
            self.id.0,
            code,
            address
        );
    }

    /// Mark this task as inside its fault handler. Returns `true` when
    /// it already was, i.e. this invocation is a nested fault.
    pub(crate) fn enter_fault(&self) -> bool {
        self.in_fault.swap(true, Ordering::AcqRel)
    }

    /// Clear the fault-in-progress flag; only the outermost invocation
    /// does this.
    pub(crate) fn leave_fault(&self) {
        self.in_fault.store(false, Ordering::Release);
    }

    /// Publish the locked space state for nested invocations.
    pub(crate) fn stash_active_fault(&self, inner: *mut SpaceInner<A>) {
        self.active_fault.store(inner, Ordering::Release);
    }

    /// Retract the stashed pointer before unlocking.
    pub(crate) fn clear_active_fault(&self) {
        self.active_fault
            .store(core::ptr::null_mut(), Ordering::Release);
    }

    /// The outer invocation's locked space state, for nested faults.
    pub(crate) fn active_fault_ptr(&self) -> *mut SpaceInner<A> {
        self.active_fault.load(Ordering::Acquire)
    }

    /// Whether the task is currently inside its fault handler.
    pub fn handling_fault(&self) -> bool {
        self.in_fault.load(Ordering::Acquire)
    }
}
