//! Physical frame allocator.
//!
//! A bitmap allocator over the managed frame range, guarded by a spin
//! mutex. The share counts backing copy-on-write live in the embedded
//! [`FrameTable`] and are reached without taking the allocator lock;
//! the allocator itself only consults them to refuse freeing a frame
//! that still has sharers.

use alloc::vec;
use alloc::vec::Vec;

use eos_error::kernel_error;
use eos_utils::Mutex;

use crate::frame::{Frame, FrameTable};

kernel_error! {
    /// Physical frame allocation failures.
    pub enum AllocError: 0x01 {
        /// No run of free frames large enough
        OutOfMemory = 0x01 => "out of physical frames",
        /// Request outside the managed frame range
        InvalidRange = 0x02 => "frame range not managed by this allocator",
    }
}

struct Bitmap {
    /// One bit per frame; set means allocated.
    words: Vec<u64>,
    frames: usize,
    free: usize,
    /// Scan hint: frame number to start single-frame searches at.
    next: usize,
}

impl Bitmap {
    fn is_set(&self, n: usize) -> bool {
        self.words[n / 64] & (1 << (n % 64)) != 0
    }

    fn set(&mut self, n: usize) {
        self.words[n / 64] |= 1 << (n % 64);
    }

    fn clear(&mut self, n: usize) {
        self.words[n / 64] &= !(1 << (n % 64));
    }

    /// First free frame at or after the hint, wrapping once.
    fn find_one(&self) -> Option<usize> {
        let mut n = self.next;
        for _ in 0..self.frames {
            if n >= self.frames {
                n = 0;
            }
            if !self.is_set(n) {
                return Some(n);
            }
            n += 1;
        }
        None
    }

    /// First free run of `count` frames whose base is a multiple of
    /// `align` frames.
    fn find_run(&self, count: usize, align: usize) -> Option<usize> {
        let mut base = 0;
        while base + count <= self.frames {
            match (base..base + count).find(|&n| self.is_set(n)) {
                None => return Some(base),
                // Skip past the allocated frame, keeping alignment.
                Some(used) => base = (used + 1).next_multiple_of(align),
            }
        }
        None
    }
}

/// Allocator over a contiguous range of physical frames, numbered from
/// zero.
pub struct FrameAllocator {
    inner: Mutex<Bitmap>,
    table: FrameTable,
}

impl FrameAllocator {
    /// Allocator managing `frames` frames, all initially free.
    #[must_use]
    pub fn new(frames: usize) -> Self {
        Self {
            inner: Mutex::new(Bitmap {
                words: vec![0; frames.div_ceil(64)],
                frames,
                free: frames,
                next: 0,
            }),
            table: FrameTable::new(frames),
        }
    }

    /// The share-count table for the managed frames.
    ///
    /// Share operations are lock-free; fault handlers use them while
    /// holding only their own address-space mutex.
    #[must_use]
    pub fn table(&self) -> &FrameTable {
        &self.table
    }

    /// Total managed frames.
    #[must_use]
    pub fn total(&self) -> usize {
        self.inner.lock().frames
    }

    /// Currently free frames.
    #[must_use]
    pub fn available(&self) -> usize {
        self.inner.lock().free
    }

    /// Allocate one frame, cleared of prior share state (a share count
    /// of zero: owned by exactly the caller's single mapping).
    pub fn alloc_frame(&self) -> Result<Frame, AllocError> {
        let mut map = self.inner.lock();
        let n = map.find_one().ok_or(AllocError::OutOfMemory)?;
        map.set(n);
        map.free -= 1;
        map.next = n + 1;
        drop(map);

        let frame = Frame::from_number(n);
        self.table.reset(frame);
        Ok(frame)
    }

    /// Allocate `count` contiguous frames; returns the first.
    pub fn alloc_frames(&self, count: usize) -> Result<Frame, AllocError> {
        self.alloc_run(count, 1)
    }

    /// Allocate `count` contiguous frames whose physical base is
    /// naturally aligned for hardware descriptor rings (aligned to the
    /// next power of two above `count` frames).
    pub fn alloc_dma_frames(&self, count: usize) -> Result<Frame, AllocError> {
        self.alloc_run(count, count.next_power_of_two())
    }

    fn alloc_run(&self, count: usize, align: usize) -> Result<Frame, AllocError> {
        if count == 0 {
            return Err(AllocError::InvalidRange);
        }
        let mut map = self.inner.lock();
        let base = map.find_run(count, align).ok_or(AllocError::OutOfMemory)?;
        for n in base..base + count {
            map.set(n);
        }
        map.free -= count;
        drop(map);

        let first = Frame::from_number(base);
        for i in 0..count {
            self.table.reset(first.add(i));
        }
        Ok(first)
    }

    /// Return one frame to the free pool.
    ///
    /// The caller must already have brought the frame's share count to
    /// zero through [`FrameTable::dec_shares`]; freeing a shared frame
    /// is a contract violation. Debug builds assert; release builds
    /// report and keep the frame allocated rather than hand shared
    /// memory to a new owner.
    pub fn free_frame(&self, frame: Frame) {
        self.free_frames(frame, 1);
    }

    /// Return `count` contiguous frames to the free pool.
    pub fn free_frames(&self, frame: Frame, count: usize) {
        let mut map = self.inner.lock();
        for i in 0..count {
            let f = frame.add(i);
            let n = f.number();
            if n >= map.frames {
                debug_assert!(false, "free of unmanaged {f}");
                log::error!("frame allocator: free of unmanaged {f}");
                continue;
            }
            if self.table.shares(f) != 0 {
                debug_assert!(false, "free of shared {f}");
                log::error!(
                    "frame allocator: free of {f} with {} sharers",
                    self.table.shares(f)
                );
                continue;
            }
            if !map.is_set(n) {
                debug_assert!(false, "double free of {f}");
                log::error!("frame allocator: double free of {f}");
                continue;
            }
            map.clear(n);
            map.free += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_frames_are_distinct_and_reusable() {
        let alloc = FrameAllocator::new(4);
        let a = alloc.alloc_frame().unwrap();
        let b = alloc.alloc_frame().unwrap();
        assert_ne!(a, b);
        assert_eq!(alloc.available(), 2);

        alloc.free_frame(a);
        assert_eq!(alloc.available(), 3);
        // The freed frame comes back eventually.
        let mut seen = alloc.alloc_frame().unwrap();
        for _ in 0..2 {
            if seen == a {
                break;
            }
            seen = alloc.alloc_frame().unwrap();
        }
        assert_eq!(seen, a);
    }

    #[test]
    fn exhaustion_reports_out_of_memory() {
        let alloc = FrameAllocator::new(2);
        alloc.alloc_frame().unwrap();
        alloc.alloc_frame().unwrap();
        assert_eq!(alloc.alloc_frame(), Err(AllocError::OutOfMemory));
    }

    #[test]
    fn contiguous_runs_are_contiguous() {
        let alloc = FrameAllocator::new(16);
        let run = alloc.alloc_frames(4).unwrap();
        // A second allocation must not overlap the run.
        let other = alloc.alloc_frame().unwrap();
        assert!(other.number() < run.number() || other.number() >= run.number() + 4);
        alloc.free_frames(run, 4);
        assert_eq!(alloc.available(), 15);
    }

    #[test]
    fn contiguous_run_skips_holes() {
        let alloc = FrameAllocator::new(8);
        let head = alloc.alloc_frames(3).unwrap();
        assert_eq!(head.number(), 0);
        alloc.free_frame(head.add(1)); // hole at frame 1
        let run = alloc.alloc_frames(2).unwrap();
        assert_eq!(run.number(), 3);
    }

    #[test]
    fn dma_runs_are_naturally_aligned() {
        let alloc = FrameAllocator::new(32);
        alloc.alloc_frame().unwrap(); // disturb alignment
        let run = alloc.alloc_dma_frames(3).unwrap();
        assert_eq!(run.number() % 4, 0, "3-frame DMA run must be 4-aligned");
        let big = alloc.alloc_dma_frames(8).unwrap();
        assert_eq!(big.number() % 8, 0);
    }

    #[test]
    fn oversized_run_is_out_of_memory() {
        let alloc = FrameAllocator::new(8);
        assert_eq!(alloc.alloc_frames(9), Err(AllocError::OutOfMemory));
        assert_eq!(alloc.alloc_frames(0), Err(AllocError::InvalidRange));
    }

    #[test]
    fn allocation_clears_stale_share_state() {
        let alloc = FrameAllocator::new(2);
        let f = alloc.alloc_frame().unwrap();
        alloc.table().inc_shares(f);
        alloc.table().dec_shares(f);
        alloc.free_frame(f);
        let again = alloc.alloc_frame().unwrap();
        assert_eq!(alloc.table().shares(again), 0);
    }

    #[test]
    #[cfg_attr(debug_assertions, should_panic(expected = "free of shared"))]
    fn freeing_a_shared_frame_violates_the_contract() {
        let alloc = FrameAllocator::new(2);
        let f = alloc.alloc_frame().unwrap();
        alloc.table().inc_shares(f);
        alloc.free_frame(f);
        // Release builds refuse the free instead of panicking.
        assert_eq!(alloc.available(), 1);
    }
}
