//! Page table entries for the two supported paging formats.
//!
//! Both formats expose the same accessor surface through [`PageEntry`]
//! so the fault resolver is written once. The copy-on-write bit lives
//! in the software-available bit range; hardware ignores it.
//!
//! Invariant: an entry marked COW is never writable, and a writable
//! entry is never COW. The mutators preserve this by construction.

use bitflags::bitflags;

use crate::frame::Frame;

bitflags! {
    /// Architecture-neutral page attributes used when composing leaf
    /// entries. Backends map these onto their hardware bit layout.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PageAttrs: u8 {
        /// Writes allowed.
        const WRITABLE = 1 << 0;
        /// Accessible from user mode.
        const USER     = 1 << 1;
        /// Shared read-only, duplicate on first write.
        const COW      = 1 << 2;
        /// Private (non-shared) mapping; 64-bit format only, dropped
        /// by the legacy two-level format.
        const PRIVATE  = 1 << 3;
        /// Caching disabled; 64-bit format only.
        const NOCACHE  = 1 << 4;
        /// Instruction fetches allowed; the 64-bit format sets NX when
        /// absent, the two-level format cannot express it.
        const EXEC     = 1 << 5;
    }
}

/// Accessor surface shared by both entry formats.
pub trait PageEntry: Copy + PartialEq + core::fmt::Debug {
    /// The all-zero, not-present entry.
    const EMPTY: Self;

    /// Build a present leaf entry for `frame` with `attrs`.
    ///
    /// `attrs` must not carry both `WRITABLE` and `COW`.
    fn compose(frame: Frame, attrs: PageAttrs) -> Self;

    fn is_present(self) -> bool;
    fn is_writable(self) -> bool;
    fn is_user(self) -> bool;
    fn is_cow(self) -> bool;

    /// Physical frame this entry references.
    fn frame(self) -> Frame;

    /// Attributes in architecture-neutral form.
    fn attrs(self) -> PageAttrs;

    /// Mark the entry copy-on-write: clears writable, sets COW.
    fn set_cow(&mut self);

    /// Privatize the entry in place: clears COW, sets writable.
    fn clear_cow_make_writable(&mut self);

    /// Raw bits, for diagnostics.
    fn raw(self) -> u64;
}

/// Entry in the four-level 64-bit format.
///
/// Bit layout follows the hardware: present (0), writable (1), user
/// (2), write-through (3), no-cache (4), accessed (5), dirty (6);
/// software bits COW (9) and private (10); NX (63). Frame address in
/// bits 12..52.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Pte64(u64);

impl Pte64 {
    const PRESENT: u64 = 1 << 0;
    const WRITABLE: u64 = 1 << 1;
    const USER: u64 = 1 << 2;
    const NOCACHE: u64 = 1 << 4;
    const COW: u64 = 1 << 9;
    const PRIVATE: u64 = 1 << 10;
    const NX: u64 = 1 << 63;
    const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

    /// Entry linking a next-level table: present, writable, user.
    /// Leaf entries refine access; table links stay permissive.
    #[must_use]
    pub const fn table_link(frame: Frame) -> Self {
        Self((frame.base() as u64 & Self::ADDR_MASK) | Self::PRESENT | Self::WRITABLE | Self::USER)
    }

    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl PageEntry for Pte64 {
    const EMPTY: Self = Self(0);

    fn compose(frame: Frame, attrs: PageAttrs) -> Self {
        debug_assert!(
            !attrs.contains(PageAttrs::WRITABLE | PageAttrs::COW),
            "an entry cannot be both writable and COW"
        );
        let mut bits = (frame.base() as u64 & Self::ADDR_MASK) | Self::PRESENT;
        if attrs.contains(PageAttrs::WRITABLE) {
            bits |= Self::WRITABLE;
        }
        if attrs.contains(PageAttrs::USER) {
            bits |= Self::USER;
        }
        if attrs.contains(PageAttrs::COW) {
            bits |= Self::COW;
        }
        if attrs.contains(PageAttrs::PRIVATE) {
            bits |= Self::PRIVATE;
        }
        if attrs.contains(PageAttrs::NOCACHE) {
            bits |= Self::NOCACHE;
        }
        if !attrs.contains(PageAttrs::EXEC) {
            bits |= Self::NX;
        }
        Self(bits)
    }

    fn is_present(self) -> bool {
        self.0 & Self::PRESENT != 0
    }

    fn is_writable(self) -> bool {
        self.0 & Self::WRITABLE != 0
    }

    fn is_user(self) -> bool {
        self.0 & Self::USER != 0
    }

    fn is_cow(self) -> bool {
        self.0 & Self::COW != 0
    }

    fn frame(self) -> Frame {
        Frame::from_base((self.0 & Self::ADDR_MASK) as usize)
    }

    fn attrs(self) -> PageAttrs {
        let mut attrs = PageAttrs::empty();
        if self.is_writable() {
            attrs |= PageAttrs::WRITABLE;
        }
        if self.is_user() {
            attrs |= PageAttrs::USER;
        }
        if self.is_cow() {
            attrs |= PageAttrs::COW;
        }
        if self.0 & Self::PRIVATE != 0 {
            attrs |= PageAttrs::PRIVATE;
        }
        if self.0 & Self::NOCACHE != 0 {
            attrs |= PageAttrs::NOCACHE;
        }
        if self.0 & Self::NX == 0 {
            attrs |= PageAttrs::EXEC;
        }
        attrs
    }

    fn set_cow(&mut self) {
        self.0 = (self.0 & !Self::WRITABLE) | Self::COW;
    }

    fn clear_cow_make_writable(&mut self) {
        self.0 = (self.0 & !Self::COW) | Self::WRITABLE;
    }

    fn raw(self) -> u64 {
        self.0
    }
}

impl core::fmt::Debug for Pte64 {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Pte64({:#018x})", self.0)
    }
}

/// Entry in the legacy two-level 32-bit format.
///
/// Present (0), writable (1), user (2), accessed (5), dirty (6),
/// software COW bit (9). Frame address in bits 12..32. No NX and no
/// private bit in this format.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Pte32(u32);

impl Pte32 {
    const PRESENT: u32 = 1 << 0;
    const WRITABLE: u32 = 1 << 1;
    const USER: u32 = 1 << 2;
    const COW: u32 = 1 << 9;
    const ADDR_MASK: u32 = 0xFFFF_F000;

    /// Entry linking a second-level table: present, writable, user.
    #[must_use]
    pub const fn table_link(frame: Frame) -> Self {
        Self((frame.base() as u32 & Self::ADDR_MASK) | Self::PRESENT | Self::WRITABLE | Self::USER)
    }

    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }
}

impl PageEntry for Pte32 {
    const EMPTY: Self = Self(0);

    fn compose(frame: Frame, attrs: PageAttrs) -> Self {
        debug_assert!(
            !attrs.contains(PageAttrs::WRITABLE | PageAttrs::COW),
            "an entry cannot be both writable and COW"
        );
        let mut bits = (frame.base() as u32 & Self::ADDR_MASK) | Self::PRESENT;
        if attrs.contains(PageAttrs::WRITABLE) {
            bits |= Self::WRITABLE;
        }
        if attrs.contains(PageAttrs::USER) {
            bits |= Self::USER;
        }
        if attrs.contains(PageAttrs::COW) {
            bits |= Self::COW;
        }
        Self(bits)
    }

    fn is_present(self) -> bool {
        self.0 & Self::PRESENT != 0
    }

    fn is_writable(self) -> bool {
        self.0 & Self::WRITABLE != 0
    }

    fn is_user(self) -> bool {
        self.0 & Self::USER != 0
    }

    fn is_cow(self) -> bool {
        self.0 & Self::COW != 0
    }

    fn frame(self) -> Frame {
        Frame::from_base((self.0 & Self::ADDR_MASK) as usize)
    }

    fn attrs(self) -> PageAttrs {
        let mut attrs = PageAttrs::EXEC; // format cannot forbid fetches
        if self.is_writable() {
            attrs |= PageAttrs::WRITABLE;
        }
        if self.is_user() {
            attrs |= PageAttrs::USER;
        }
        if self.is_cow() {
            attrs |= PageAttrs::COW;
        }
        attrs
    }

    fn set_cow(&mut self) {
        self.0 = (self.0 & !Self::WRITABLE) | Self::COW;
    }

    fn clear_cow_make_writable(&mut self) {
        self.0 = (self.0 & !Self::COW) | Self::WRITABLE;
    }

    fn raw(self) -> u64 {
        u64::from(self.0)
    }
}

impl core::fmt::Debug for Pte32 {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Pte32({:#010x})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cow_and_writable_are_mutually_exclusive() {
        let frame = Frame::from_number(5);
        let mut e = Pte64::compose(frame, PageAttrs::USER | PageAttrs::COW);
        assert!(e.is_cow());
        assert!(!e.is_writable());

        e.clear_cow_make_writable();
        assert!(!e.is_cow());
        assert!(e.is_writable());

        e.set_cow();
        assert!(e.is_cow());
        assert!(!e.is_writable());
        assert_eq!(e.frame(), frame);
    }

    #[test]
    fn pte64_round_trips_attrs() {
        let attrs = PageAttrs::WRITABLE | PageAttrs::USER | PageAttrs::PRIVATE;
        let e = Pte64::compose(Frame::from_number(0x1234), attrs);
        assert!(e.is_present());
        assert_eq!(e.attrs(), attrs);
        assert_eq!(e.frame(), Frame::from_number(0x1234));
    }

    #[test]
    fn pte64_sets_nx_without_exec() {
        let e = Pte64::compose(Frame::from_number(1), PageAttrs::WRITABLE);
        assert_eq!(e.raw() >> 63, 1);
        let x = Pte64::compose(Frame::from_number(1), PageAttrs::EXEC);
        assert_eq!(x.raw() >> 63, 0);
    }

    #[test]
    fn pte32_round_trips_and_drops_64bit_only_attrs() {
        let e = Pte32::compose(
            Frame::from_number(0x99),
            PageAttrs::WRITABLE | PageAttrs::USER | PageAttrs::PRIVATE | PageAttrs::EXEC,
        );
        assert!(e.is_present());
        assert!(e.is_writable());
        assert!(e.is_user());
        // PRIVATE cannot be expressed; EXEC is implicit.
        assert_eq!(e.attrs(), PageAttrs::WRITABLE | PageAttrs::USER | PageAttrs::EXEC);
        assert_eq!(e.frame(), Frame::from_number(0x99));
    }

    #[test]
    fn empty_entries_are_not_present() {
        assert!(!Pte64::EMPTY.is_present());
        assert!(!Pte32::EMPTY.is_present());
    }
}
