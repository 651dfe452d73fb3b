//! # Memory Types
//!
//! A mapping request names *what kind* of memory it maps — strongly
//! ordered device registers, write-combining framebuffer memory, and so
//! on — through an opaque [`MemoryType`] identifier. A platform-provided
//! [`MemTypeCatalog`] resolves the identifier to the hardware attribute
//! bits, once per request; an identifier the catalog does not know
//! invalidates the whole request.
//!
//! The attribute sets differ per granularity: small-page descriptors and
//! section descriptors place the same semantic bits (bufferable,
//! cacheable, TEX, access permissions, ...) at different positions, so a
//! resolved type carries one word of each.

use crate::page_table::first_level::SectionBits;
use crate::page_table::second_level::SmallPageBits;

/// Opaque identifier for a kind of device memory.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct MemoryType(pub u32);

impl MemoryType {
    /// Strongly-ordered device memory (registers).
    pub const DEVICE: Self = Self(0);
    /// Device memory on a non-shared bus.
    pub const DEVICE_NONSHARED: Self = Self(1);
    /// Device memory that tolerates cached access.
    pub const DEVICE_CACHED: Self = Self(2);
    /// Write-combining device memory (framebuffers, posted-write queues).
    pub const DEVICE_WC: Self = Self(3);
}

impl core::fmt::Display for MemoryType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "memory type {}", self.0)
    }
}

/// The attribute bits a [`MemoryType`] resolves to, one word per
/// descriptor granularity.
///
/// Only attribute bits may be set; descriptor type, base address and the
/// supersection marker are filled in by the entry constructors.
#[derive(Copy, Clone, Debug)]
pub struct MemTypeAttributes {
    /// Attributes for second-level small-page descriptors.
    pub page: SmallPageBits,
    /// Attributes for first-level section/supersection descriptors.
    pub section: SectionBits,
}

/// Resolver from [`MemoryType`] identifiers to attribute bits.
///
/// Implemented by the platform's memory-type table; the engine never
/// interprets the attribute bits it gets back.
pub trait MemTypeCatalog {
    /// Resolve `mt`, or `None` when the identifier is unknown.
    fn resolve(&self, mt: MemoryType) -> Option<MemTypeAttributes>;
}
