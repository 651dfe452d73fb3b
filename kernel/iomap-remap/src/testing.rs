//! Shared test fixtures: a simulated physical memory arena, a bump
//! allocator for second-level tables, an alignment-preserving area
//! reserver, a recording cache, and a tiny memory-type catalog.
//!
//! Physical addresses are byte offsets into the arena. Only table frames
//! are ever dereferenced; the "device memory" the tests map is never
//! touched, exactly as on real hardware where it is bus space.

use std::cell::Cell;

use iomap_addresses::{PageSize, PhysicalAddress, Size1M, Size4K, Size16M, VirtualAddress};

use crate::kernel_table::{KernelWindow, SharedKernelTable};
use crate::layout::{VMALLOC_END, VMALLOC_START};
use crate::mem_type::{MemTypeAttributes, MemTypeCatalog, MemoryType};
use crate::page_table::first_level::{FirstLevelKind, FirstLevelTable, SectionBits, SectionIndex};
use crate::page_table::second_level::{PageIndex, SecondLevelTable, SmallPageBits};
use crate::vm_area::{MappingKind, VmArea, VmAreaAllocator};
use crate::{CacheMaintenance, CpuCaps, PhysMapper, TableAlloc};

pub const VMALLOC_BASE: u64 = VMALLOC_START;

pub const CAPS_UP_SS: CpuCaps = CpuCaps {
    uniprocessor: true,
    supersections: true,
};
pub const CAPS_UP: CpuCaps = CpuCaps {
    uniprocessor: true,
    supersections: false,
};
pub const CAPS_MP: CpuCaps = CpuCaps {
    uniprocessor: false,
    supersections: true,
};

/// Simulated physical memory. Offset 0 holds the canonical first-level
/// table, [`SPACE_ROOT`](Self::SPACE_ROOT) a second one, and the rest is
/// the pool [`TestTables`] carves second-level tables from.
pub struct TestMachine {
    #[allow(dead_code)]
    arena: Vec<u8>,
    base: *mut u8,
}

impl TestMachine {
    pub const KERNEL_ROOT: PhysicalAddress = PhysicalAddress::new(0);
    pub const SPACE_ROOT: PhysicalAddress = PhysicalAddress::new(0x4000);
    pub const POOL_START: u64 = 0x8000;
    pub const POOL_END: u64 = Self::ARENA_BYTES as u64;

    const ARENA_BYTES: usize = 256 * 1024;
    const ARENA_ALIGN: usize = 16 * 1024;

    pub fn new() -> Self {
        let mut arena = vec![0u8; Self::ARENA_BYTES + Self::ARENA_ALIGN];
        let offset = arena.as_mut_ptr().align_offset(Self::ARENA_ALIGN);
        let base = unsafe { arena.as_mut_ptr().add(offset) };
        Self { arena, base }
    }

    pub fn raw(&self, pa: PhysicalAddress) -> *mut u8 {
        assert!((pa.as_u64() as usize) < Self::ARENA_BYTES);
        unsafe { self.base.add(pa.as_u64() as usize) }
    }

    /// A kernel table rooted in this arena, canonical for the vmalloc
    /// window.
    pub fn kernel_table(&self) -> SharedKernelTable<'_, Self> {
        SharedKernelTable::new(self, Self::KERNEL_ROOT, KernelWindow::vmalloc())
    }

    fn first_level(&self) -> &FirstLevelTable {
        unsafe { &*self.raw(Self::KERNEL_ROOT).cast() }
    }

    /// Walk the canonical tables, like hardware would.
    pub fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        match self.first_level().get(SectionIndex::from(va)).kind()? {
            FirstLevelKind::Table(table, _) => {
                let table: &SecondLevelTable = unsafe { &*self.raw(table).cast() };
                let (base, _) = table.get(PageIndex::from(va)).page()?;
                Some(base + va.offset_in::<Size4K>())
            }
            FirstLevelKind::Section(base, _) => Some(base + va.offset_in::<Size1M>()),
            FirstLevelKind::Supersection(base, _) => Some(base + va.offset_in::<Size16M>()),
        }
    }

    /// Number of 4 KiB steps in `[va, va + size)` that translate to
    /// anything (small page, section or supersection).
    pub fn present_leaves(&self, va: VirtualAddress, size: u64) -> usize {
        (0..size)
            .step_by(Size4K::SIZE as usize)
            .filter(|&off| self.translate(va + off).is_some())
            .count()
    }

    /// The small-page leaf at `va`, if one exists.
    pub fn leaf_at(&self, va: VirtualAddress) -> Option<(PhysicalAddress, SmallPageBits)> {
        match self.first_level().get(SectionIndex::from(va)).kind()? {
            FirstLevelKind::Table(table, _) => {
                let table: &SecondLevelTable = unsafe { &*self.raw(table).cast() };
                table.get(PageIndex::from(va)).page()
            }
            _ => None,
        }
    }
}

impl PhysMapper for TestMachine {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        unsafe { &mut *self.raw(pa).cast::<T>() }
    }
}

/// Bump allocator over the arena's table pool, with a free list and
/// alloc/free counters the tests assert on.
pub struct TestTables<'m> {
    machine: &'m TestMachine,
    next: u64,
    end: u64,
    free: Vec<u64>,
    pub allocs: usize,
    pub frees: usize,
}

impl<'m> TestTables<'m> {
    pub fn new(machine: &'m TestMachine) -> Self {
        Self {
            machine,
            next: TestMachine::POOL_START,
            end: TestMachine::POOL_END,
            free: Vec::new(),
            allocs: 0,
            frees: 0,
        }
    }

    /// An allocator with nothing left to give.
    pub fn exhausted(machine: &'m TestMachine) -> Self {
        Self {
            end: TestMachine::POOL_START,
            ..Self::new(machine)
        }
    }
}

impl TableAlloc for TestTables<'_> {
    fn alloc_table(&mut self) -> Option<PhysicalAddress> {
        const TABLE_BYTES: u64 = 1024;
        let pa = if let Some(pa) = self.free.pop() {
            pa
        } else {
            if self.next + TABLE_BYTES > self.end {
                return None;
            }
            let pa = self.next;
            self.next += TABLE_BYTES;
            pa
        };
        let pa = PhysicalAddress::new(pa);
        unsafe {
            std::ptr::write_bytes(self.machine.raw(pa), 0, TABLE_BYTES as usize);
        }
        self.allocs += 1;
        Some(pa)
    }

    fn free_table(&mut self, table: PhysicalAddress) {
        self.frees += 1;
        self.free.push(table.as_u64());
    }
}

/// First-fit-free bump reserver over the vmalloc window.
///
/// Bases are aligned to the largest granule dividing the requested size,
/// so a request that *could* become a block mapping gets a base that lets
/// the granularity policy actually choose it (a real allocator gives no
/// such guarantee; the tests want determinism).
pub struct TestAreas {
    next: u64,
    limit: u64,
    areas: Vec<VmArea>,
}

impl TestAreas {
    pub fn new() -> Self {
        Self {
            next: VMALLOC_START,
            limit: VMALLOC_END,
            areas: Vec::new(),
        }
    }

    /// A window of only `bytes` bytes, for exhaustion tests.
    pub fn tiny(bytes: u64) -> Self {
        Self {
            limit: VMALLOC_START + bytes,
            ..Self::new()
        }
    }

    pub fn area_count(&self) -> usize {
        self.areas.len()
    }
}

impl VmAreaAllocator for TestAreas {
    fn reserve(&mut self, size: u64) -> Option<VmArea> {
        let align = if size % Size16M::SIZE == 0 {
            Size16M::SIZE
        } else if size % (2 * Size1M::SIZE) == 0 {
            2 * Size1M::SIZE
        } else {
            Size4K::SIZE
        };
        let base = self.next.next_multiple_of(align);
        let padded = size + Size4K::SIZE;
        if base + padded > self.limit {
            return None;
        }
        let area = VmArea {
            base: VirtualAddress::new(base),
            size: padded,
            kind: MappingKind::Pages,
        };
        self.next = base + padded;
        self.areas.push(area);
        Some(area)
    }

    fn commit(&mut self, area: VmArea) {
        if let Some(existing) = self.areas.iter_mut().find(|a| a.base == area.base) {
            *existing = area;
        }
    }

    fn take(&mut self, base: VirtualAddress) -> Option<VmArea> {
        let at = self.areas.iter().position(|a| a.base == base)?;
        Some(self.areas.swap_remove(at))
    }
}

/// Counts maintenance calls instead of touching hardware.
#[derive(Default)]
pub struct RecordingCache {
    pub cache_flushes: Cell<u32>,
    pub tlb_flushes: Cell<u32>,
}

impl CacheMaintenance for RecordingCache {
    fn flush_cache_range(&self, start: VirtualAddress, end: VirtualAddress) {
        assert!(start <= end);
        self.cache_flushes.set(self.cache_flushes.get() + 1);
    }

    fn flush_tlb_range(&self, start: VirtualAddress, end: VirtualAddress) {
        assert!(start <= end);
        self.tlb_flushes.set(self.tlb_flushes.get() + 1);
    }
}

/// Strongly-ordered device attributes, kernel-only access.
pub fn device_attrs() -> MemTypeAttributes {
    MemTypeAttributes {
        page: SmallPageBits::new()
            .with_execute_never(true)
            .with_access_permissions(0b01),
        section: SectionBits::new()
            .with_execute_never(true)
            .with_access_permissions(0b01),
    }
}

/// Write-combining device attributes (TEX remap class 1).
pub fn wc_attrs() -> MemTypeAttributes {
    MemTypeAttributes {
        page: SmallPageBits::new()
            .with_execute_never(true)
            .with_access_permissions(0b01)
            .with_type_extension(0b001),
        section: SectionBits::new()
            .with_execute_never(true)
            .with_access_permissions(0b01)
            .with_type_extension(0b001),
    }
}

/// Catalog resolving the two device types the tests use.
pub struct TestTypes;

impl MemTypeCatalog for TestTypes {
    fn resolve(&self, mt: MemoryType) -> Option<MemTypeAttributes> {
        match mt {
            MemoryType::DEVICE => Some(device_attrs()),
            MemoryType::DEVICE_WC => Some(wc_attrs()),
            _ => None,
        }
    }
}
