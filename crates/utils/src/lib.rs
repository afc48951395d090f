//! Shared utility surface for EmberOS kernel crates.
//!
//! The kernel goes through this crate for its lock API so the choice of
//! lock implementation stays in one place. Interrupt-aware wrappers can
//! be layered here later without touching call sites.

#![cfg_attr(not(test), no_std)]

// The spin crate types are re-exported as our lock API.
pub use spin::{Barrier, Lazy, Once};
pub use spin::{Mutex, MutexGuard};
pub use spin::{RwLock, RwLockReadGuard, RwLockWriteGuard};
