//! # Second-Level Table
//!
//! This module models the leaf translation level.
//!
//! - [`PageIndex`]: index type for VA bits `[19:12]`.
//! - [`SmallPageEntry`]: a second-level descriptor. Every present entry
//!   maps one 4 KiB small page; there is no deeper level.
//! - [`SecondLevelTable`]: a 1 KiB-aligned array of 256 descriptors
//!   covering 1 MiB of virtual space.
//!
//! ## Invariants & Notes
//!
//! - The base address stored in a descriptor must be 4 KiB aligned and
//!   below 4 GiB; physical memory beyond 32 bits is only reachable through
//!   the supersection encoding at the first level.
//! - [`SmallPageEntry::make`] forces the small-page type bit.
//! - After modifying live entries the caller owes TLB maintenance.

use bitfield_struct::bitfield;
use iomap_addresses::{PageSize, PhysicalAddress, Size4K, VirtualAddress};

use super::SECOND_LEVEL_ENTRIES;

/// Bits `[11:0]` of a descriptor word hold type and attribute bits.
const ATTR_MASK: u32 = 0x0000_0fff;

/// Index into a second-level table (derived from VA bits `[19:12]`).
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct PageIndex(u16);

impl PageIndex {
    /// Build an index from a virtual address (extracts bits `[19:12]`).
    #[inline]
    #[must_use]
    pub const fn from(va: VirtualAddress) -> Self {
        Self::new(((va.as_u64() >> Size4K::SHIFT) & 0xff) as u16)
    }

    /// Construct from a raw `u16`.
    ///
    /// ### Debug assertions
    /// - Asserts `v < 256` in debug builds.
    #[inline]
    #[must_use]
    pub const fn new(v: u16) -> Self {
        debug_assert!((v as usize) < SECOND_LEVEL_ENTRIES);
        Self(v)
    }

    /// Return the index as `usize` for table access.
    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// Attribute bits of a second-level **small page** descriptor.
///
/// | Bits | Name | Meaning |
/// |------|------|---------|
/// | 0    | XN   | execute never |
/// | 1    | type | set for a small page (forced by [`SmallPageEntry::make`]) |
/// | 2    | B    | bufferable |
/// | 3    | C    | cacheable |
/// | 5:4  | AP\[1:0\] | access permissions |
/// | 8:6  | TEX | type extension (memory-ordering class) |
/// | 9    | AP\[2\] | access permission extension |
/// | 10   | S    | shareable |
/// | 11   | nG   | not global |
/// | 31:12 | base | small-page base address |
#[bitfield(u32)]
pub struct SmallPageBits {
    /// Execute never (XN).
    pub execute_never: bool,
    small_page: bool,
    /// Bufferable (B).
    pub bufferable: bool,
    /// Cacheable (C).
    pub cacheable: bool,
    /// Access permissions AP\[1:0\].
    #[bits(2)]
    pub access_permissions: u8,
    /// Type extension (TEX), selects the memory-ordering class together
    /// with C and B.
    #[bits(3)]
    pub type_extension: u8,
    /// Access permission extension AP\[2\].
    pub access_extended: bool,
    /// Shareable (S).
    pub shareable: bool,
    /// Not global (nG).
    pub not_global: bool,
    #[bits(20)]
    base_31_12: u32,
}

/// A single second-level descriptor word.
#[repr(transparent)]
#[derive(Copy, Clone)]
pub struct SmallPageEntry(u32);

impl SmallPageEntry {
    /// Create an invalid (unmapped) descriptor.
    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    /// `true` when the slot maps a page.
    #[inline]
    #[must_use]
    pub const fn is_present(self) -> bool {
        self.0 & 0b10 != 0
    }

    /// If present, return the mapped page base and the attribute bits.
    #[inline]
    #[must_use]
    pub const fn page(self) -> Option<(PhysicalAddress, SmallPageBits)> {
        if !self.is_present() {
            return None;
        }
        Some((
            PhysicalAddress::new((self.0 & 0xffff_f000) as u64),
            SmallPageBits::from_bits(self.0 & ATTR_MASK),
        ))
    }

    /// Create a small-page leaf for the 4 KiB frame at `base`.
    ///
    /// Forces the small-page type bit and writes the base address, which
    /// must be 4 KiB aligned and below 4 GiB.
    #[inline]
    #[must_use]
    pub const fn make(base: PhysicalAddress, mut bits: SmallPageBits) -> Self {
        debug_assert!(base.is_aligned::<Size4K>(), "page base not 4 KiB aligned");
        debug_assert!(base.as_u64() < 1 << 32, "page base beyond 32 bits");
        bits.set_small_page(true);
        Self((bits.into_bits() & ATTR_MASK) | (base.as_u64() as u32 & 0xffff_f000))
    }

    /// Return the raw 32-bit descriptor word.
    #[inline]
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl core::fmt::Debug for SmallPageEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.page() {
            Some((pa, _)) => write!(f, "SmallPageEntry(page @ {pa})"),
            None => write!(f, "SmallPageEntry(unmapped)"),
        }
    }
}

/// A second-level table: 256 descriptors, 1 KiB aligned, covering 1 MiB.
#[repr(C, align(1024))]
pub struct SecondLevelTable {
    entries: [SmallPageEntry; SECOND_LEVEL_ENTRIES],
}

impl SecondLevelTable {
    /// Create a fully zeroed table (all slots unmapped).
    #[inline]
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [SmallPageEntry::zero(); SECOND_LEVEL_ENTRIES],
        }
    }

    /// Read the descriptor at `i`.
    #[inline]
    #[must_use]
    pub const fn get(&self, i: PageIndex) -> SmallPageEntry {
        self.entries[i.as_usize()]
    }

    /// Write the descriptor at `i`.
    ///
    /// Caller owes TLB maintenance when changing live translations.
    #[inline]
    pub const fn set(&mut self, i: PageIndex, e: SmallPageEntry) {
        self.entries[i.as_usize()] = e;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_page_round_trip() {
        let attrs = SmallPageBits::new()
            .with_execute_never(true)
            .with_access_permissions(0b11)
            .with_type_extension(0b001)
            .with_shareable(true);
        let e = SmallPageEntry::make(PhysicalAddress::new(0x5555_0000), attrs);
        let (pa, bits) = e.page().unwrap();
        assert_eq!(pa.as_u64(), 0x5555_0000);
        assert!(bits.execute_never());
        assert!(bits.shareable());
        assert_eq!(bits.access_permissions(), 0b11);
        assert_eq!(bits.type_extension(), 0b001);
    }

    #[test]
    fn zero_entry_is_absent() {
        let e = SmallPageEntry::zero();
        assert!(!e.is_present());
        assert!(e.page().is_none());
    }

    #[test]
    fn table_get_set() {
        let mut t = SecondLevelTable::zeroed();
        let i = PageIndex::from(VirtualAddress::new(0xe000_3000));
        assert_eq!(i.as_usize(), 3);
        t.set(
            i,
            SmallPageEntry::make(PhysicalAddress::new(0x1000_0000), SmallPageBits::new()),
        );
        assert!(t.get(i).is_present());
        assert!(!t.get(PageIndex::new(4)).is_present());
    }
}
