//! EmberOS kernel: virtual memory management.
//!
//! The core of this crate is the page-fault resolution engine in
//! [`memory::fault`]: demand paging, copy-on-write duplication backed
//! by the share-counted frame allocator, downward stack growth, and
//! the per-address-space locking discipline that keeps all of it safe
//! under concurrent and recursive faults.
//!
//! The scheduler, page cache, VFS and drivers are collaborators: the
//! kernel consumes them through the narrow surfaces in [`task`] and
//! [`memory::backing`], and exposes the trap entry points in [`arch`].

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod arch;
pub mod logger;
pub mod memory;
pub mod task;

pub use memory::fault::{FaultInfo, FaultOutcome, handle_fault};
pub use task::{SegvCode, Task, TaskKind};
