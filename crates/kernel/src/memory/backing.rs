//! Backing-store collaborator interface.
//!
//! The page cache owns file formats and I/O; the VMM only asks it to
//! produce one page of bytes. Frame allocation and page-table
//! installation stay on the VMM side so the table-shared clone check
//! applies uniformly to every install path.

use alloc::vec::Vec;

use eos_error::kernel_error;
use eos_hal::PAGE_SIZE;

kernel_error! {
    /// Page load failures.
    pub enum LoadError: 0x04 {
        /// Backing store could not produce the page
        ReadFailed = 0x01 => "backing store read failed",
        /// Requested offset lies outside the object
        OutOfRange = 0x02 => "offset outside backing object",
    }
}

/// Supplies page contents for file-backed regions.
///
/// `read_page` may block the calling task while I/O completes; the
/// faulting address space's mutex stays held across the call (other
/// faulters in the same space queue behind it).
pub trait BackingStore: Send + Sync {
    /// Fill `buf` with the page at byte `offset` within the object.
    /// Short objects zero-fill the tail.
    fn read_page(&self, offset: u64, buf: &mut [u8; PAGE_SIZE]) -> Result<(), LoadError>;
}

/// In-memory backing store: serves pages from an owned byte image.
/// Backs ram-resident objects and doubles as the test page source.
pub struct SliceBacking {
    data: Vec<u8>,
}

impl SliceBacking {
    /// Store serving from `data`.
    #[must_use]
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// Length of the backing image in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True when the image is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl BackingStore for SliceBacking {
    fn read_page(&self, offset: u64, buf: &mut [u8; PAGE_SIZE]) -> Result<(), LoadError> {
        let offset = usize::try_from(offset).map_err(|_| LoadError::OutOfRange)?;
        if offset >= self.data.len() {
            return Err(LoadError::OutOfRange);
        }
        let available = (self.data.len() - offset).min(PAGE_SIZE);
        buf[..available].copy_from_slice(&self.data[offset..offset + available]);
        buf[available..].fill(0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serves_full_pages() {
        let mut image = alloc::vec![0u8; 2 * PAGE_SIZE];
        image[PAGE_SIZE] = 0xAB;
        let store = SliceBacking::new(image);

        let mut buf = [0xFFu8; PAGE_SIZE];
        store.read_page(PAGE_SIZE as u64, &mut buf).unwrap();
        assert_eq!(buf[0], 0xAB);
        assert_eq!(buf[1], 0);
    }

    #[test]
    fn zero_fills_the_tail_of_a_short_object() {
        let store = SliceBacking::new(alloc::vec![7u8; 100]);
        let mut buf = [0xFFu8; PAGE_SIZE];
        store.read_page(0, &mut buf).unwrap();
        assert_eq!(buf[99], 7);
        assert_eq!(buf[100], 0);
        assert_eq!(buf[PAGE_SIZE - 1], 0);
    }

    #[test]
    fn out_of_range_offsets_fail() {
        let store = SliceBacking::new(alloc::vec![0u8; 10]);
        let mut buf = [0u8; PAGE_SIZE];
        assert_eq!(
            store.read_page(PAGE_SIZE as u64, &mut buf),
            Err(LoadError::OutOfRange)
        );
    }
}
