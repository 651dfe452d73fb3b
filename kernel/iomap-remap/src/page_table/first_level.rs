//! # First-Level Table
//!
//! This module models the upper translation level.
//!
//! - [`SectionIndex`]: index type for VA bits `[31:20]`.
//! - [`FirstLevelEntry`]: one 32-bit descriptor. A present entry either
//!   points to a second-level table or is a section/supersection leaf.
//! - [`FirstLevelTable`]: a 16 KiB-aligned array of 4096 descriptors.
//!
//! ## Semantics
//!
//! - A **table** descriptor (type `0b01`) carries the 1 KiB-aligned base
//!   of a second-level table in bits `[31:10]`.
//! - A **section** descriptor (type `0b10`, bit 18 clear) is a 1 MiB leaf;
//!   the base lives in bits `[31:20]`.
//! - A **supersection** descriptor (type `0b10`, bit 18 set) is a 16 MiB
//!   leaf replicated over 16 consecutive slots. The base lives in bits
//!   `[31:24]`; physical address bits `[35:32]` overlay bits `[23:20]`,
//!   which is the *extended* encoding reaching devices above 4 GiB.
//!
//! ## Invariants & Notes
//!
//! - Within one mapped area all present entries are homogeneous: either
//!   all table pointers (page-granularity mappings) or all block leaves.
//!   The remapping code never produces a mix.
//! - Raw constructors do not validate consistency; prefer the typed
//!   `make_*` helpers, which assert alignment in debug builds.
//! - After changing live entries the caller owes TLB maintenance.

use bitfield_struct::bitfield;
use iomap_addresses::{PageSize, PhysicalAddress, Size1M, Size16M, VirtualAddress};

use super::FIRST_LEVEL_ENTRIES;

/// Descriptor type field value for a table pointer.
const TYPE_TABLE: u8 = 0b01;
/// Descriptor type field value for a section or supersection leaf.
const TYPE_SECTION: u8 = 0b10;

/// Bits `[19:0]` of a section descriptor hold type and attribute bits; the
/// remainder is base-address material filled in by the constructors.
const ATTR_MASK: u32 = 0x000f_ffff;

/// Table descriptors carry their base from bit 10 upward.
const TABLE_ATTR_MASK: u32 = 0x0000_03ff;

/// Index into the first-level table (derived from VA bits `[31:20]`).
///
/// Strongly typed to avoid mixing with the second level. Range is
/// `0..4096` (checked in debug builds).
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct SectionIndex(u16);

impl SectionIndex {
    /// Build an index from a virtual address (extracts bits `[31:20]`).
    #[inline]
    #[must_use]
    pub const fn from(va: VirtualAddress) -> Self {
        Self::new(((va.as_u64() >> Size1M::SHIFT) & 0xfff) as u16)
    }

    /// Construct from a raw `u16`.
    ///
    /// ### Debug assertions
    /// - Asserts `v < 4096` in debug builds.
    #[inline]
    #[must_use]
    pub const fn new(v: u16) -> Self {
        debug_assert!((v as usize) < FIRST_LEVEL_ENTRIES);
        Self(v)
    }

    /// The following slot (second half of a section pair).
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self::new(self.0 + 1)
    }

    /// Return the index as `usize` for table access.
    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// Attribute bits of a first-level **table pointer** descriptor.
///
/// | Bits | Name | Meaning |
/// |------|------|---------|
/// | 1:0  | type | `0b01` for a table pointer |
/// | 2    | PXN  | privileged execute-never for the covered span |
/// | 3    | NS   | non-secure |
/// | 8:5  | domain | access domain of the covered span |
/// | 9    | P    | implementation defined |
/// | 31:10 | base | second-level table base (set by [`FirstLevelEntry::make_table`]) |
#[bitfield(u32)]
pub struct TableBits {
    #[bits(2)]
    descriptor_type: u8,
    /// Privileged execute-never (PXN).
    pub execute_never: bool,
    /// Non-secure (NS).
    pub non_secure: bool,
    sbz: bool,
    /// Access domain of the 1 MiB span.
    #[bits(4)]
    pub domain: u8,
    /// Implementation defined ("P" bit).
    pub implementation_defined: bool,
    #[bits(22)]
    base_31_10: u32,
}

/// Attribute bits of a first-level **section/supersection** descriptor.
///
/// | Bits | Name | Meaning |
/// |------|------|---------|
/// | 1:0  | type | `0b10` for a section leaf |
/// | 2    | B    | bufferable |
/// | 3    | C    | cacheable |
/// | 4    | XN   | execute never |
/// | 8:5  | domain | access domain |
/// | 9    | P    | implementation defined |
/// | 11:10 | AP\[1:0\] | access permissions |
/// | 14:12 | TEX | type extension (memory-ordering class) |
/// | 15   | AP\[2\] | access permission extension |
/// | 16   | S    | shareable |
/// | 17   | nG   | not global |
/// | 18   | SS   | supersection marker (set by the entry constructor) |
/// | 19   | NS   | non-secure |
/// | 31:20 | base | section base, or supersection base + PA\[35:32\] |
#[bitfield(u32)]
pub struct SectionBits {
    #[bits(2)]
    descriptor_type: u8,
    /// Bufferable (B).
    pub bufferable: bool,
    /// Cacheable (C).
    pub cacheable: bool,
    /// Execute never (XN).
    pub execute_never: bool,
    /// Access domain.
    #[bits(4)]
    pub domain: u8,
    /// Implementation defined ("P" bit).
    pub implementation_defined: bool,
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
    supersection: bool,
    /// Non-secure (NS).
    pub non_secure: bool,
    #[bits(12)]
    base_31_20: u32,
}

/// What a present first-level descriptor resolves to.
#[derive(Copy, Clone, Debug)]
pub enum FirstLevelKind {
    /// Points to a second-level table.
    Table(PhysicalAddress, TableBits),
    /// 1 MiB direct translation.
    Section(PhysicalAddress, SectionBits),
    /// 16 MiB direct translation (extended base encoding).
    Supersection(PhysicalAddress, SectionBits),
}

/// A single first-level descriptor word.
#[repr(transparent)]
#[derive(Copy, Clone)]
pub struct FirstLevelEntry(u32);

impl FirstLevelEntry {
    /// Create an invalid (unmapped) descriptor.
    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    /// `true` when the slot translates nothing.
    #[inline]
    #[must_use]
    pub const fn is_none(self) -> bool {
        self.0 & 0b11 == 0
    }

    /// Decode the descriptor, or `None` for an unmapped slot.
    #[inline]
    #[must_use]
    pub const fn kind(self) -> Option<FirstLevelKind> {
        match (self.0 & 0b11) as u8 {
            TYPE_TABLE => Some(FirstLevelKind::Table(
                PhysicalAddress::new((self.0 & 0xffff_fc00) as u64),
                TableBits::from_bits(self.0 & TABLE_ATTR_MASK & !0b11),
            )),
            TYPE_SECTION => {
                let bits = SectionBits::from_bits(self.0 & ATTR_MASK);
                if bits.supersection() {
                    // PA[31:24] from the word, PA[35:32] from bits [23:20].
                    let base = ((self.0 & 0xff00_0000) as u64)
                        | ((((self.0 >> 20) & 0xf) as u64) << 32);
                    Some(FirstLevelKind::Supersection(
                        PhysicalAddress::new(base),
                        bits,
                    ))
                } else {
                    Some(FirstLevelKind::Section(
                        PhysicalAddress::new((self.0 & 0xfff0_0000) as u64),
                        bits,
                    ))
                }
            }
            _ => None,
        }
    }

    /// Create a pointer to the second-level table at `table`.
    ///
    /// The base must be 1 KiB aligned.
    #[inline]
    #[must_use]
    pub const fn make_table(table: PhysicalAddress, mut bits: TableBits) -> Self {
        debug_assert!(table.as_u64() & 0x3ff == 0, "table base not 1 KiB aligned");
        debug_assert!(table.as_u64() < 1 << 32);
        bits.set_descriptor_type(TYPE_TABLE);
        Self((bits.into_bits() & TABLE_ATTR_MASK) | (table.as_u64() as u32 & 0xffff_fc00))
    }

    /// Create a 1 MiB section leaf for the physical base `base`.
    ///
    /// The base must be 1 MiB aligned and below 4 GiB; larger physical
    /// addresses only fit the supersection encoding.
    #[inline]
    #[must_use]
    pub const fn make_section(base: PhysicalAddress, mut bits: SectionBits) -> Self {
        debug_assert!(base.is_aligned::<Size1M>(), "section base not 1 MiB aligned");
        debug_assert!(base.as_u64() < 1 << 32, "section base beyond 32 bits");
        bits.set_descriptor_type(TYPE_SECTION);
        bits.set_supersection(false);
        Self((bits.into_bits() & ATTR_MASK) | (base.as_u64() as u32 & 0xfff0_0000))
    }

    /// Create a 16 MiB supersection leaf for the physical base `base`.
    ///
    /// The base must be 16 MiB aligned and below 2³⁶; bits \[35:32\] are
    /// folded into descriptor bits \[23:20\].
    #[inline]
    #[must_use]
    pub const fn make_supersection(base: PhysicalAddress, mut bits: SectionBits) -> Self {
        debug_assert!(
            base.is_aligned::<Size16M>(),
            "supersection base not 16 MiB aligned"
        );
        debug_assert!(base.as_u64() < 1 << 36, "supersection base beyond 36 bits");
        bits.set_descriptor_type(TYPE_SECTION);
        bits.set_supersection(true);
        let low = base.as_u64() as u32 & 0xff00_0000;
        let high = (((base.as_u64() >> 32) & 0xf) as u32) << 20;
        Self((bits.into_bits() & ATTR_MASK) | low | high)
    }

    /// Return the raw 32-bit descriptor word.
    #[inline]
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Construct from a raw 32-bit word. No validation is performed.
    #[inline]
    #[must_use]
    pub const fn from_raw(v: u32) -> Self {
        Self(v)
    }
}

impl core::fmt::Debug for FirstLevelEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.kind() {
            None => write!(f, "FirstLevelEntry(unmapped)"),
            Some(FirstLevelKind::Table(pa, _)) => write!(f, "FirstLevelEntry(table @ {pa})"),
            Some(FirstLevelKind::Section(pa, _)) => write!(f, "FirstLevelEntry(section @ {pa})"),
            Some(FirstLevelKind::Supersection(pa, _)) => {
                write!(f, "FirstLevelEntry(supersection @ {pa})")
            }
        }
    }
}

/// The first-level table: 4096 descriptors, 16 KiB aligned.
#[repr(C, align(16384))]
pub struct FirstLevelTable {
    entries: [FirstLevelEntry; FIRST_LEVEL_ENTRIES],
}

impl FirstLevelTable {
    /// Create a fully zeroed table (all slots unmapped).
    #[inline]
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [FirstLevelEntry::zero(); FIRST_LEVEL_ENTRIES],
        }
    }

    /// Read the descriptor at `i`.
    #[inline]
    #[must_use]
    pub const fn get(&self, i: SectionIndex) -> FirstLevelEntry {
        self.entries[i.as_usize()]
    }

    /// Write the descriptor at `i`.
    ///
    /// Caller owes TLB maintenance when changing live translations.
    #[inline]
    pub const fn set(&mut self, i: SectionIndex, e: FirstLevelEntry) {
        self.entries[i.as_usize()] = e;
    }

    /// Copy the descriptors `start..end` from `src` into this table.
    ///
    /// Used by the lazy synchronizer to republish the shared kernel window
    /// into another address space's table.
    #[inline]
    pub fn copy_slice_from(&mut self, src: &Self, start: usize, end: usize) {
        debug_assert!(start <= end && end <= FIRST_LEVEL_ENTRIES);
        self.entries[start..end].copy_from_slice(&src.entries[start..end]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_descriptor_round_trip() {
        let e = FirstLevelEntry::make_table(
            PhysicalAddress::new(0x0001_2400),
            TableBits::new().with_domain(3),
        );
        let Some(FirstLevelKind::Table(pa, bits)) = e.kind() else {
            panic!("expected table descriptor");
        };
        assert_eq!(pa.as_u64(), 0x0001_2400);
        assert_eq!(bits.domain(), 3);
        assert!(!e.is_none());
    }

    #[test]
    fn section_descriptor_round_trip() {
        let attrs = SectionBits::new()
            .with_bufferable(true)
            .with_access_permissions(0b11)
            .with_type_extension(0b001);
        let e = FirstLevelEntry::make_section(PhysicalAddress::new(0x4010_0000), attrs);
        let Some(FirstLevelKind::Section(pa, bits)) = e.kind() else {
            panic!("expected section descriptor");
        };
        assert_eq!(pa.as_u64(), 0x4010_0000);
        assert!(bits.bufferable());
        assert_eq!(bits.access_permissions(), 0b11);
        assert_eq!(bits.type_extension(), 0b001);
        assert!(!bits.supersection());
    }

    #[test]
    fn supersection_encodes_extended_bits() {
        // PA[35:32] = 0x3 must land in descriptor bits [23:20].
        let e = FirstLevelEntry::make_supersection(
            PhysicalAddress::new(0x3_4500_0000),
            SectionBits::new(),
        );
        assert_eq!((e.raw() >> 20) & 0xf, 0x3);
        assert_eq!(e.raw() & 0xff00_0000, 0x4500_0000);
        let Some(FirstLevelKind::Supersection(pa, bits)) = e.kind() else {
            panic!("expected supersection descriptor");
        };
        assert_eq!(pa.as_u64(), 0x3_4500_0000);
        assert!(bits.supersection());
    }

    #[test]
    fn low_supersection_keeps_extended_bits_clear() {
        let e = FirstLevelEntry::make_supersection(
            PhysicalAddress::new(0x0800_0000),
            SectionBits::new(),
        );
        let Some(FirstLevelKind::Supersection(pa, _)) = e.kind() else {
            panic!("expected supersection descriptor");
        };
        assert_eq!(pa.as_u64(), 0x0800_0000);
    }

    #[test]
    fn zero_entry_is_unmapped() {
        let e = FirstLevelEntry::zero();
        assert!(e.is_none());
        assert!(e.kind().is_none());
    }

    #[test]
    fn table_get_set() {
        let mut t = FirstLevelTable::zeroed();
        let i = SectionIndex::from(VirtualAddress::new(0xe010_0000));
        t.set(
            i,
            FirstLevelEntry::make_section(PhysicalAddress::new(0x4000_0000), SectionBits::new()),
        );
        assert!(!t.get(i).is_none());
        assert!(t.get(i.next()).is_none());
    }
}
