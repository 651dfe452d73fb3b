//! # Short-Descriptor Page Tables
//!
//! Typed wrappers for the two table levels of the short-descriptor
//! translation scheme.

pub mod first_level;
pub mod second_level;

use crate::page_table::first_level::SectionIndex;
use crate::page_table::second_level::PageIndex;
use iomap_addresses::{PageSize, Size1M, Size4K, Size16M, VirtualAddress};

/// Number of entries in a first-level table (4 GiB / 1 MiB).
pub const FIRST_LEVEL_ENTRIES: usize = 4096;

/// Number of entries in a second-level table (1 MiB / 4 KiB).
pub const SECOND_LEVEL_ENTRIES: usize = 256;

/// Section entries are installed and torn down in **pairs** of consecutive
/// first-level slots; alignment checks for the section granularity use the
/// pair span, not the single-entry span.
pub const SECTION_PAIR_SIZE: u64 = 2 * Size1M::SIZE;

/// Pages covered by one section entry.
pub const PAGES_PER_SECTION: u64 = Size1M::SIZE >> Size4K::SHIFT;

/// Pages covered by one supersection.
pub const PAGES_PER_SUPERSECTION: u64 = Size16M::SIZE >> Size4K::SHIFT;

/// First-level entries written per supersection (eight pairs).
pub const SUPERSECTION_ENTRIES: usize = (Size16M::SIZE / Size1M::SIZE) as usize;

#[inline]
#[must_use]
pub const fn split_indices(va: VirtualAddress) -> (SectionIndex, PageIndex) {
    (SectionIndex::from(va), PageIndex::from(va))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indices_ok() {
        let va = VirtualAddress::new(0xe123_4567);
        let (i1, i2) = split_indices(va);
        assert_eq!(i1.as_usize(), 0xe12);
        assert_eq!(i2.as_usize(), 0x34);
        assert!(i1.as_usize() < FIRST_LEVEL_ENTRIES);
        assert!(i2.as_usize() < SECOND_LEVEL_ENTRIES);
    }

    #[test]
    fn derived_constants_agree() {
        assert_eq!(PAGES_PER_SECTION, 256);
        assert_eq!(PAGES_PER_SUPERSECTION, 4096);
        assert_eq!(SUPERSECTION_ENTRIES, 16);
        assert_eq!(SECTION_PAIR_SIZE, 0x20_0000);
    }
}
