//! # Virtual Areas
//!
//! Every mapping request is backed by exactly one reserved, never-aliased
//! span of kernel virtual address space — a [`VmArea`]. Reservation and
//! release are the job of an external allocator behind
//! [`VmAreaAllocator`]; the engine only records which granularity ended up
//! in the area so teardown can take the matching path.

use iomap_addresses::VirtualAddress;

/// Granularity tag recorded for a mapped area.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MappingKind {
    /// Small pages through second-level tables.
    Pages,
    /// Section or supersection leaves at the first level.
    Block,
}

/// A reserved span of kernel virtual address space backing one mapping.
///
/// `size` is page aligned and **includes one trailing guard page** that is
/// never mapped. The area is owned exclusively by the mapping it was
/// created for until released.
#[derive(Copy, Clone, Debug)]
pub struct VmArea {
    /// First byte of the area.
    pub base: VirtualAddress,
    /// Area length in bytes, guard page included.
    pub size: u64,
    /// How the area's range was populated.
    pub kind: MappingKind,
}

/// Reserves and releases non-overlapping virtual areas.
///
/// Implementations hand out page-aligned, pairwise-disjoint ranges from
/// the window `[VMALLOC_START, VMALLOC_END)`
/// ([`layout`](crate::layout)); the engine's freedom from mapping-range
/// locks rests on that disjointness.
pub trait VmAreaAllocator {
    /// Reserve a free area of `size` bytes plus one guard page.
    ///
    /// The returned record has `size + 4 KiB` as its length and
    /// [`MappingKind::Pages`] as its initial tag. Returns `None` when no
    /// free range of that size exists.
    fn reserve(&mut self, size: u64) -> Option<VmArea>;

    /// Record the final shape of a reserved area (notably its granularity
    /// tag, known only after granularity selection).
    fn commit(&mut self, area: VmArea);

    /// Remove and return the area starting exactly at `base`, releasing
    /// its range for later reservations.
    fn take(&mut self, base: VirtualAddress) -> Option<VmArea>;
}
