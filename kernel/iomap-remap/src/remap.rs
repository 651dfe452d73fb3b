//! Range population and teardown at each granularity.
//!
//! These are the workers the orchestrator dispatches to once a virtual
//! area is reserved and a granularity chosen. None of them flush the cache
//! over the *mapped* range on success — the orchestrator does that once
//! for the whole mapping — but the section teardown performs its own
//! cache/TLB maintenance around the clear, as the range is losing its
//! translation right there.

use iomap_addresses::{
    PageFrameNumber, PageSize, PhysicalAddress, Size1M, Size4K, Size16M, VirtualAddress,
};

use crate::kernel_table::{AddressSpace, SharedKernelTable, StructuralGuard};
use crate::mapper::MapError;
use crate::page_table::first_level::{
    FirstLevelEntry, FirstLevelKind, SectionBits, SectionIndex, TableBits,
};
use crate::page_table::second_level::{PageIndex, SmallPageEntry, SmallPageBits};
use crate::page_table::{PAGES_PER_SECTION, PAGES_PER_SUPERSECTION, SUPERSECTION_ENTRIES};
use crate::{CacheMaintenance, PhysMapper, TableAlloc};

/// End of the 1 MiB span containing `addr`, clamped to `end`.
#[inline]
fn span_end(addr: VirtualAddress, end: VirtualAddress) -> VirtualAddress {
    let next = addr.align_down::<Size1M>() + Size1M::SIZE;
    if next < end { next } else { end }
}

/// Locate the second-level table for the span containing `index`,
/// allocating and linking a fresh one when the slot is empty.
///
/// Linking is a structural change to the shared window: it happens under
/// the table lock and bumps the generation. A block leaf in the slot means
/// the caller's area overlaps an existing block mapping, which disjoint
/// reservations rule out.
fn ensure_second_level<M: PhysMapper, A: TableAlloc>(
    kernel: &SharedKernelTable<'_, M>,
    alloc: &mut A,
    index: SectionIndex,
) -> Result<PhysicalAddress, MapError> {
    if let Some(FirstLevelKind::Table(table, _)) = kernel.first_level().get(index).kind() {
        return Ok(table);
    }
    let mut tables = kernel.lock_structural();
    // Re-check: another caller may have linked the slot while we waited.
    match tables.get(index).kind() {
        Some(FirstLevelKind::Table(table, _)) => Ok(table),
        Some(_) => Err(MapError::OverlapConflict),
        None => {
            let table = alloc.alloc_table().ok_or(MapError::TableAllocationFailure)?;
            tables.set(index, FirstLevelEntry::make_table(table, TableBits::new()));
            tables.bump();
            Ok(table)
        }
    }
}

/// Install one leaf entry per page over `[virt, virt + size)`, starting at
/// frame `pfn`.
///
/// An occupied leaf slot means two requests were given overlapping virtual
/// space — address-space bookkeeping is corrupt and the operation aborts
/// immediately with [`MapError::OverlapConflict`], never overwriting the
/// slot. Earlier pages of the same request stay written; the caller
/// abandons the whole area.
pub(crate) fn remap_area_pages<M: PhysMapper, A: TableAlloc>(
    kernel: &SharedKernelTable<'_, M>,
    alloc: &mut A,
    virt: VirtualAddress,
    mut pfn: PageFrameNumber,
    size: u64,
    attrs: SmallPageBits,
) -> Result<(), MapError> {
    debug_assert!(virt.is_aligned::<Size4K>());
    debug_assert!(size > 0 && size % Size4K::SIZE == 0);

    let end = virt + size;
    let mut addr = virt;
    while addr < end {
        let next = span_end(addr, end);
        let table = ensure_second_level(kernel, alloc, SectionIndex::from(addr))?;
        let table = kernel.second_level(table);
        while addr < next {
            let slot = PageIndex::from(addr);
            if table.get(slot).is_present() {
                return Err(MapError::OverlapConflict);
            }
            table.set(slot, SmallPageEntry::make(pfn.base(), attrs));
            pfn += 1;
            addr += Size4K::SIZE;
        }
    }
    Ok(())
}

/// Clear the leaf entries over `[virt, virt + size)`.
///
/// Second-level tables stay linked for reuse by later mappings; only the
/// leaves go away. Spans never populated at page granularity are skipped.
pub(crate) fn unmap_area_pages<M: PhysMapper, C: CacheMaintenance>(
    kernel: &SharedKernelTable<'_, M>,
    cache: &C,
    virt: VirtualAddress,
    size: u64,
) {
    let end = virt + size;
    cache.flush_cache_range(virt, end);
    let mut addr = virt;
    while addr < end {
        let next = span_end(addr, end);
        if let Some(FirstLevelKind::Table(table, _)) =
            kernel.first_level().get(SectionIndex::from(addr)).kind()
        {
            let table = kernel.second_level(table);
            while addr < next {
                table.set(PageIndex::from(addr), SmallPageEntry::zero());
                addr += Size4K::SIZE;
            }
        } else {
            addr = next;
        }
    }
    cache.flush_tlb_range(virt, end);
}

/// Clear every first-level slot over `[virt, end)` while holding the
/// structural lock, bumping the generation per cleared slot and reclaiming
/// second-level tables that lose their last reference.
///
/// Clearing an already-empty slot is a no-op, not an error.
fn clear_first_level_range<A: TableAlloc>(
    tables: &mut StructuralGuard<'_>,
    alloc: &mut A,
    virt: VirtualAddress,
    end: VirtualAddress,
) {
    let mut addr = virt;
    while addr < end {
        let index = SectionIndex::from(addr);
        let entry = tables.get(index);
        if !entry.is_none() {
            tables.set(index, FirstLevelEntry::zero());
            tables.bump();
            if let Some(FirstLevelKind::Table(table, _)) = entry.kind() {
                // A section-aligned area owns every span it covers, so the
                // table cannot serve any other mapping.
                alloc.free_table(table);
            }
        }
        addr += Size1M::SIZE;
    }
}

/// Tear down all first-level entries over `[virt, virt + size)`.
///
/// `size` is masked down to section alignment first: the reservation
/// carries a guard page that must not extend the loop. The cache is
/// flushed before the clear and the TLB after it; the active address
/// space, when known, is reconciled in between so a use-after-unmap
/// through a stale replica is caught promptly.
pub(crate) fn unmap_area_sections<M: PhysMapper, A: TableAlloc, C: CacheMaintenance>(
    kernel: &SharedKernelTable<'_, M>,
    alloc: &mut A,
    cache: &C,
    active: Option<&AddressSpace>,
    virt: VirtualAddress,
    size: u64,
) {
    let end = virt + (size & !(Size1M::SIZE - 1));
    if virt >= end {
        return;
    }
    cache.flush_cache_range(virt, end);
    {
        let mut tables = kernel.lock_structural();
        clear_first_level_range(&mut tables, alloc, virt, end);
    }
    if let Some(space) = active {
        kernel.maybe_reconcile(space);
    }
    cache.flush_tlb_range(virt, end);
}

/// Install section leaves over `[virt, virt + size)` in entry pairs,
/// starting at frame `pfn`.
///
/// Any page-granularity mapping left over the range is removed first and
/// the kernel view synchronized, exactly as for a release.
pub(crate) fn remap_area_sections<M: PhysMapper, A: TableAlloc, C: CacheMaintenance>(
    kernel: &SharedKernelTable<'_, M>,
    alloc: &mut A,
    cache: &C,
    active: Option<&AddressSpace>,
    virt: VirtualAddress,
    mut pfn: PageFrameNumber,
    size: u64,
    attrs: SectionBits,
) -> Result<(), MapError> {
    debug_assert!(virt.is_aligned::<Size1M>());

    unmap_area_sections(kernel, alloc, cache, active, virt, size);

    let end = virt + size;
    let mut addr = virt;
    let mut tables = kernel.lock_structural();
    while addr < end {
        let index = SectionIndex::from(addr);
        tables.set(index, FirstLevelEntry::make_section(pfn.base(), attrs));
        pfn += PAGES_PER_SECTION;
        tables.set(index.next(), FirstLevelEntry::make_section(pfn.base(), attrs));
        pfn += PAGES_PER_SECTION;
        addr += 2 * Size1M::SIZE;
    }
    Ok(())
}

/// Install supersection leaves over `[virt, virt + size)`, starting at
/// frame `pfn`.
///
/// Each 16 MiB unit writes the same descriptor into eight entry pairs;
/// frame bits at and above 2³² go into the extended encoding.
pub(crate) fn remap_area_supersections<M: PhysMapper, A: TableAlloc, C: CacheMaintenance>(
    kernel: &SharedKernelTable<'_, M>,
    alloc: &mut A,
    cache: &C,
    active: Option<&AddressSpace>,
    virt: VirtualAddress,
    mut pfn: PageFrameNumber,
    size: u64,
    attrs: SectionBits,
) -> Result<(), MapError> {
    debug_assert!(virt.is_aligned::<Size16M>());

    unmap_area_sections(kernel, alloc, cache, active, virt, size);

    let end = virt + size;
    let mut addr = virt;
    let mut tables = kernel.lock_structural();
    while addr < end {
        let entry = FirstLevelEntry::make_supersection(pfn.base(), attrs);
        for _ in 0..SUPERSECTION_ENTRIES {
            tables.set(SectionIndex::from(addr), entry);
            addr += Size1M::SIZE;
        }
        pfn += PAGES_PER_SUPERSECTION;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        device_attrs, TestMachine, TestTables, VMALLOC_BASE,
    };
    use iomap_addresses::PhysicalAddress;

    fn pfn(pa: u64) -> PageFrameNumber {
        PageFrameNumber::containing(PhysicalAddress::new(pa))
    }

    #[test]
    fn populate_then_clear_pages() {
        let m = TestMachine::new();
        let kt = m.kernel_table();
        let mut tables = TestTables::new(&m);
        let cache = crate::testing::RecordingCache::default();
        let va = VirtualAddress::new(VMALLOC_BASE);

        remap_area_pages(&kt, &mut tables, va, pfn(0x1000_0000), 0x3000, device_attrs().page)
            .unwrap();
        assert_eq!(m.present_leaves(va, 0x3000), 3);

        unmap_area_pages(&kt, &cache, va, 0x3000);
        assert_eq!(m.present_leaves(va, 0x3000), 0);
        assert_eq!(cache.cache_flushes.get(), 1);
        assert_eq!(cache.tlb_flushes.get(), 1);
    }

    #[test]
    fn populate_spanning_two_sections_links_two_tables() {
        let m = TestMachine::new();
        let kt = m.kernel_table();
        let mut tables = TestTables::new(&m);
        // Start 4 KiB below a section boundary, cross into the next span.
        let va = VirtualAddress::new(VMALLOC_BASE + Size1M::SIZE - 0x1000);

        remap_area_pages(&kt, &mut tables, va, pfn(0x1000_0000), 0x2000, device_attrs().page)
            .unwrap();
        assert_eq!(tables.allocs, 2);
        assert_eq!(m.present_leaves(va, 0x2000), 2);
    }

    #[test]
    fn occupied_slot_is_a_conflict() {
        let m = TestMachine::new();
        let kt = m.kernel_table();
        let mut tables = TestTables::new(&m);
        let va = VirtualAddress::new(VMALLOC_BASE);

        remap_area_pages(&kt, &mut tables, va, pfn(0x1000_0000), 0x1000, device_attrs().page)
            .unwrap();
        let err = remap_area_pages(&kt, &mut tables, va, pfn(0x2000_0000), 0x1000, device_attrs().page)
            .unwrap_err();
        assert_eq!(err, MapError::OverlapConflict);
        // The original mapping must be untouched.
        let (pa, _) = m.leaf_at(va).unwrap();
        assert_eq!(pa.as_u64(), 0x1000_0000);
    }

    #[test]
    fn table_allocation_failure_propagates() {
        let m = TestMachine::new();
        let kt = m.kernel_table();
        let mut tables = TestTables::exhausted(&m);
        let va = VirtualAddress::new(VMALLOC_BASE);

        let err = remap_area_pages(&kt, &mut tables, va, pfn(0x1000_0000), 0x1000, device_attrs().page)
            .unwrap_err();
        assert_eq!(err, MapError::TableAllocationFailure);
    }

    #[test]
    fn sections_replace_page_mapping_and_reclaim_tables() {
        let m = TestMachine::new();
        let kt = m.kernel_table();
        let mut tables = TestTables::new(&m);
        let cache = crate::testing::RecordingCache::default();
        let va = VirtualAddress::new(VMALLOC_BASE);
        let size = 2 * Size1M::SIZE;

        // Page-populate both spans of the pair first.
        remap_area_pages(&kt, &mut tables, va, pfn(0x1000_0000), size, device_attrs().page)
            .unwrap();
        assert_eq!(tables.allocs, 2);

        let g0 = kt.observe();
        remap_area_sections(
            &kt, &mut tables, &cache, None, va, pfn(0x4000_0000), size,
            device_attrs().section,
        )
        .unwrap();

        // Both tables reclaimed, both clears published.
        assert_eq!(tables.frees, 2);
        assert!(kt.observe() > g0);

        // The pair advances the frame by one section between its halves.
        let Some(FirstLevelKind::Section(first, _)) =
            kt.first_level().get(SectionIndex::from(va)).kind()
        else {
            panic!("expected section");
        };
        let Some(FirstLevelKind::Section(second, _)) = kt
            .first_level()
            .get(SectionIndex::from(va).next())
            .kind()
        else {
            panic!("expected section");
        };
        assert_eq!(first.as_u64(), 0x4000_0000);
        assert_eq!(second.as_u64(), 0x4010_0000);
    }

    #[test]
    fn supersection_unit_replicates_sixteen_slots() {
        let m = TestMachine::new();
        let kt = m.kernel_table();
        let mut tables = TestTables::new(&m);
        let cache = crate::testing::RecordingCache::default();
        let va = VirtualAddress::new(VMALLOC_BASE);

        remap_area_supersections(
            &kt, &mut tables, &cache, None, va, pfn(0x1_0000_0000), Size16M::SIZE,
            device_attrs().section,
        )
        .unwrap();

        let first = kt.first_level().get(SectionIndex::from(va)).raw();
        for i in 0..SUPERSECTION_ENTRIES as u64 {
            let e = kt
                .first_level()
                .get(SectionIndex::from(va + i * Size1M::SIZE));
            assert_eq!(e.raw(), first);
            let Some(FirstLevelKind::Supersection(pa, _)) = e.kind() else {
                panic!("expected supersection");
            };
            assert_eq!(pa.as_u64(), 0x1_0000_0000);
        }
    }

    #[test]
    fn clearing_empty_range_is_a_noop() {
        let m = TestMachine::new();
        let kt = m.kernel_table();
        let mut tables = TestTables::new(&m);
        let cache = crate::testing::RecordingCache::default();
        let va = VirtualAddress::new(VMALLOC_BASE);

        let g0 = kt.observe();
        unmap_area_sections(&kt, &mut tables, &cache, None, va, 2 * Size1M::SIZE);
        assert_eq!(kt.observe(), g0);
        assert_eq!(tables.frees, 0);
    }

    #[test]
    fn teardown_reconciles_the_active_space() {
        let m = TestMachine::new();
        let kt = m.kernel_table();
        let mut tables = TestTables::new(&m);
        let cache = crate::testing::RecordingCache::default();
        let space = AddressSpace::new(TestMachine::SPACE_ROOT);
        let va = VirtualAddress::new(VMALLOC_BASE);
        let size = 2 * Size1M::SIZE;

        remap_area_sections(
            &kt, &mut tables, &cache, Some(&space), va, pfn(0x4000_0000), size,
            device_attrs().section,
        )
        .unwrap();
        unmap_area_sections(&kt, &mut tables, &cache, Some(&space), va, size);

        assert_eq!(space.last_observed(), kt.observe());
        let replica: &crate::page_table::first_level::FirstLevelTable =
            unsafe { m.phys_to_mut(space.root()) };
        assert!(replica.get(SectionIndex::from(va)).is_none());
    }
}
