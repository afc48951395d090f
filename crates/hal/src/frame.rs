//! Physical frame descriptors and share counting.
//!
//! Each physical frame has one entry in the [`FrameTable`], an atomic
//! byte counting the mappings that reference the frame *beyond* its
//! owner: `0` means exactly one owner (or the frame is free), `n > 0`
//! means `n` additional sharers. The count tracks logical references at
//! every paging level, so a page table shared wholesale on fork carries
//! a share count just like the leaf pages it maps.
//!
//! The counters are the only cross-address-space mutable state in the
//! VMM and are accessed exclusively through atomic read-modify-write
//! operations; no lock is ever held around them.

use core::sync::atomic::{AtomicU8, Ordering};

use alloc::vec::Vec;

use crate::PAGE_SHIFT;

/// A physical page frame, identified by frame number
/// (physical address / [`crate::PAGE_SIZE`]).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Frame(usize);

impl Frame {
    /// Frame for the page containing physical address `pa`.
    #[must_use]
    pub const fn from_base(pa: usize) -> Self {
        Self(pa >> PAGE_SHIFT)
    }

    /// Frame with the given frame number.
    #[must_use]
    pub const fn from_number(n: usize) -> Self {
        Self(n)
    }

    /// Frame number.
    #[must_use]
    pub const fn number(self) -> usize {
        self.0
    }

    /// Physical base address of this frame.
    #[must_use]
    pub const fn base(self) -> usize {
        self.0 << PAGE_SHIFT
    }

    /// Frame `count` frames above this one.
    #[must_use]
    pub const fn add(self, count: usize) -> Self {
        Self(self.0 + count)
    }
}

impl core::fmt::Display for Frame {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "frame {:#x} (pa {:#x})", self.0, self.base())
    }
}

/// Outcome of dropping one sharing reference from a frame.
///
/// Callers must free a frame only after observing [`ShareState::LastOwner`]
/// (or a zero count they own); the typed result makes freeing a
/// still-shared frame a compile-visible mistake rather than a silent
/// contract on call order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShareState {
    /// Other mappings still reference the frame; `0` remaining sharers
    /// never occurs here.
    StillShared(u8),
    /// The caller held the final sharing reference; the single owner
    /// remains.
    LastOwner,
}

/// Flat table of per-frame share counts, indexed by frame number.
pub struct FrameTable {
    shares: Vec<AtomicU8>,
}

impl FrameTable {
    /// Table for `frames` physical frames, all counts zero.
    #[must_use]
    pub fn new(frames: usize) -> Self {
        let mut shares = Vec::with_capacity(frames);
        shares.resize_with(frames, || AtomicU8::new(0));
        Self { shares }
    }

    /// Number of frames tracked.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shares.len()
    }

    /// True when the table tracks no frames.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shares.is_empty()
    }

    /// Current share count of `frame` (additional mappings beyond the
    /// owner).
    #[must_use]
    pub fn shares(&self, frame: Frame) -> u8 {
        self.shares[frame.number()].load(Ordering::Acquire)
    }

    /// Record one more sharer of `frame`. Returns the new count.
    ///
    /// Saturating at `u8::MAX` is an invariant violation: it would lose
    /// sharers and later free a frame still in use.
    pub fn inc_shares(&self, frame: Frame) -> u8 {
        let cell = &self.shares[frame.number()];
        let mut cur = cell.load(Ordering::Relaxed);
        loop {
            if cur == u8::MAX {
                debug_assert!(false, "share count overflow on {frame}");
                log::error!("frame table: share count overflow on {frame}");
                return cur;
            }
            match cell.compare_exchange_weak(cur, cur + 1, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return cur + 1,
                Err(seen) => cur = seen,
            }
        }
    }

    /// Drop one sharing reference from `frame`.
    ///
    /// Decrementing a zero count is a logic error, not a legitimate
    /// race: counts only reach zero when a single owner remains, and
    /// that owner does not call this. Debug builds assert; release
    /// builds report and clamp.
    pub fn dec_shares(&self, frame: Frame) -> ShareState {
        let cell = &self.shares[frame.number()];
        let mut cur = cell.load(Ordering::Relaxed);
        loop {
            if cur == 0 {
                debug_assert!(false, "share count underflow on {frame}");
                log::error!("frame table: share count underflow on {frame}");
                return ShareState::LastOwner;
            }
            match cell.compare_exchange_weak(cur, cur - 1, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => {
                    return if cur == 1 {
                        ShareState::LastOwner
                    } else {
                        ShareState::StillShared(cur - 1)
                    };
                }
                Err(seen) => cur = seen,
            }
        }
    }

    /// Clear the share state of a frame handed out by the allocator.
    pub(crate) fn reset(&self, frame: Frame) {
        self.shares[frame.number()].store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PAGE_SIZE;

    #[test]
    fn frame_number_and_base_round_trip() {
        let f = Frame::from_base(0x0030_0000);
        assert_eq!(f.number(), 0x300);
        assert_eq!(f.base(), 0x0030_0000);
        assert_eq!(Frame::from_number(0x300), f);
        assert_eq!(f.add(2).base(), 0x0030_0000 + 2 * PAGE_SIZE);
    }

    #[test]
    fn share_count_is_sharers_minus_one() {
        // One owner plus two sharers: the count holds 2, not 3.
        let table = FrameTable::new(8);
        let f = Frame::from_number(3);
        assert_eq!(table.shares(f), 0);
        assert_eq!(table.inc_shares(f), 1);
        assert_eq!(table.inc_shares(f), 2);

        assert_eq!(table.dec_shares(f), ShareState::StillShared(1));
        assert_eq!(table.dec_shares(f), ShareState::LastOwner);
        assert_eq!(table.shares(f), 0);
    }

    #[test]
    fn counts_are_per_frame() {
        let table = FrameTable::new(4);
        table.inc_shares(Frame::from_number(0));
        assert_eq!(table.shares(Frame::from_number(0)), 1);
        assert_eq!(table.shares(Frame::from_number(1)), 0);
    }

    #[test]
    #[cfg_attr(debug_assertions, should_panic(expected = "underflow"))]
    fn underflow_is_an_invariant_violation() {
        let table = FrameTable::new(1);
        let state = table.dec_shares(Frame::from_number(0));
        // Release builds clamp instead of panicking.
        assert_eq!(state, ShareState::LastOwner);
        assert_eq!(table.shares(Frame::from_number(0)), 0);
    }
}
