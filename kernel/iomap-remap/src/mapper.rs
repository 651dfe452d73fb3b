//! # Mapping Orchestrator
//!
//! [`IoMapper`] ties the collaborators together: it validates a request,
//! resolves the memory type, reserves a virtual area, picks the best
//! granularity the alignment and capabilities allow, dispatches to the
//! matching worker, and unwinds the reservation when anything fails. The
//! reverse path looks the area up by address and takes the teardown path
//! its granularity tag demands.
//!
//! The multi-region entry point [`IoMapper::map_strided`] lays several
//! physical regions, each with its own physical and virtual stride, into
//! one contiguous virtual allocation — the shape of banked or interleaved
//! device memory where only a sub-window of every physical stride is
//! exposed.

use iomap_addresses::{
    MemoryAddress, PageFrameNumber, PageSize, PhysicalAddress, Size1M, Size4K, Size16M,
    VirtualAddress,
};

use crate::kernel_table::{AddressSpace, SharedKernelTable};
use crate::mem_type::{MemTypeCatalog, MemoryType};
use crate::remap::{
    remap_area_pages, remap_area_sections, remap_area_supersections, unmap_area_pages,
    unmap_area_sections,
};
use crate::vm_area::{MappingKind, VmAreaAllocator};
use crate::{CacheMaintenance, CpuCaps, PhysMapper, TableAlloc};

/// Upper bound on the region count accepted by [`IoMapper::map_strided`].
pub const MAX_STRIDED_REGIONS: usize = 4;

/// Why a mapping request failed.
#[derive(Copy, Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum MapError {
    /// Zero length, address wraparound, an unknown memory type, or a
    /// malformed stride/size combination. Rejected before any mutation.
    #[error("invalid mapping request")]
    InvalidRequest,

    /// No free virtual range of the required size. No mutation.
    #[error("kernel virtual address space exhausted")]
    OutOfVirtualSpace,

    /// A second-level table could not be allocated mid-population. Earlier
    /// pages of the request may be written; the area is abandoned.
    #[error("second-level table allocation failed")]
    TableAllocationFailure,

    /// A leaf slot was already occupied: two requests were given
    /// overlapping virtual space. This is a violated precondition —
    /// address-space bookkeeping is corrupt — and callers may reasonably
    /// treat it as unrecoverable.
    #[error("virtual range already mapped")]
    OverlapConflict,
}

/// The granularity chosen for one request (or one strided step).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Granularity {
    /// 16 MiB supersections.
    Supersections,
    /// 1 MiB sections, installed in pairs.
    Sections,
    /// 4 KiB pages.
    Pages,
}

/// One region of a strided request.
///
/// Strides come in pairs: give both or neither. With neither, the region
/// is mapped contiguously (both strides default to `size`).
#[derive(Copy, Clone, Debug)]
pub struct StridedRegion {
    /// Physical base of the region.
    pub phys: PhysicalAddress,
    /// Total physical extent in bytes; must be a multiple of the physical
    /// stride.
    pub size: u64,
    /// Distance between consecutive physical banks.
    pub phys_stride: Option<u64>,
    /// Bytes of each bank actually exposed in the virtual layout; at most
    /// `phys_stride`.
    pub virt_stride: Option<u64>,
}

impl StridedRegion {
    /// Resolve the stride pair, or `None` when exactly one was given.
    const fn strides(&self) -> Option<(u64, u64)> {
        match (self.phys_stride, self.virt_stride) {
            (None, None) => Some((self.size, self.size)),
            (Some(p), Some(v)) => Some((p, v)),
            _ => None,
        }
    }
}

/// Choose the largest granularity that alignment and capabilities permit.
///
/// A pure function of its inputs, independent of call order:
///
/// 1. **Supersections** on a uniprocessor with supersection support when
///    physical base, virtual base and size all align to 16 MiB. The frame
///    *magnitude* plays no role here — it governs encoding, not
///    eligibility.
/// 2. **Sections** on a uniprocessor when all three align to the 2 MiB
///    entry-pair span.
/// 3. **Pages** otherwise — always valid, always available.
#[must_use]
pub fn select_granularity(
    caps: CpuCaps,
    pfn: PageFrameNumber,
    size: u64,
    virt: VirtualAddress,
) -> Granularity {
    if !caps.uniprocessor {
        return Granularity::Pages;
    }
    let combined = pfn.base().as_u64() | size | virt.as_u64();
    if caps.supersections && combined & (Size16M::SIZE - 1) == 0 {
        Granularity::Supersections
    } else if combined & (2 * Size1M::SIZE - 1) == 0 {
        Granularity::Sections
    } else {
        Granularity::Pages
    }
}

/// The mapping engine's front door.
///
/// Owns nothing but borrows of the collaborators; every instance operates
/// on the [`SharedKernelTable`] it was built around.
pub struct IoMapper<'e, M, A, V, T, C>
where
    M: PhysMapper,
    A: TableAlloc,
    V: VmAreaAllocator,
    T: MemTypeCatalog,
    C: CacheMaintenance,
{
    kernel: &'e SharedKernelTable<'e, M>,
    tables: &'e mut A,
    areas: &'e mut V,
    types: &'e T,
    cache: &'e C,
    caps: CpuCaps,
    active: Option<&'e AddressSpace>,
}

impl<'e, M, A, V, T, C> IoMapper<'e, M, A, V, T, C>
where
    M: PhysMapper,
    A: TableAlloc,
    V: VmAreaAllocator,
    T: MemTypeCatalog,
    C: CacheMaintenance,
{
    pub fn new(
        kernel: &'e SharedKernelTable<'e, M>,
        tables: &'e mut A,
        areas: &'e mut V,
        types: &'e T,
        cache: &'e C,
        caps: CpuCaps,
    ) -> Self {
        Self {
            kernel,
            tables,
            areas,
            types,
            cache,
            caps,
            active: None,
        }
    }

    /// Name the address space to reconcile eagerly after block teardowns,
    /// catching use-after-unmap through a stale replica.
    #[must_use]
    pub fn with_active_space(mut self, space: &'e AddressSpace) -> Self {
        self.active = Some(space);
        self
    }

    /// Map `[phys, phys + length)` and return the virtual address of the
    /// first requested byte.
    ///
    /// The physical base does not need page alignment: the sub-page offset
    /// is carried over into the returned address.
    ///
    /// # Errors
    /// See [`MapError`]; on any error no mapping exists afterwards.
    pub fn map(
        &mut self,
        phys: PhysicalAddress,
        length: u64,
        mtype: MemoryType,
    ) -> Result<VirtualAddress, MapError> {
        // Don't allow wraparound or zero size.
        if length == 0 || phys.checked_add(length - 1).is_none() {
            return Err(MapError::InvalidRequest);
        }
        let offset = phys.offset_in::<Size4K>();
        self.map_pfn(PageFrameNumber::containing(phys), offset, length, mtype)
    }

    /// Map `length` bytes starting `offset` bytes into frame `pfn`.
    ///
    /// # Errors
    /// See [`MapError`].
    pub fn map_pfn(
        &mut self,
        pfn: PageFrameNumber,
        offset: u64,
        length: u64,
        mtype: MemoryType,
    ) -> Result<VirtualAddress, MapError> {
        debug_assert!(offset < Size4K::SIZE);

        // High frames must be supersection aligned.
        if pfn.needs_extended_encoding() && !pfn.base().is_aligned::<Size16M>() {
            return Err(MapError::InvalidRequest);
        }
        let attrs = self.types.resolve(mtype).ok_or(MapError::InvalidRequest)?;

        // Page-align the mapping size, taking account of the offset.
        let size = offset.checked_add(length).ok_or(MapError::InvalidRequest)?;
        let size = MemoryAddress::new(size)
            .align_up::<Size4K>()
            .ok_or(MapError::InvalidRequest)?
            .as_u64();

        let mut area = self
            .areas
            .reserve(size)
            .ok_or(MapError::OutOfVirtualSpace)?;

        let granularity = select_granularity(self.caps, pfn, size, area.base);
        if pfn.needs_extended_encoding() && granularity != Granularity::Supersections {
            // Neither a page nor a section descriptor can encode the frame.
            self.areas.take(area.base);
            return Err(MapError::InvalidRequest);
        }

        let populated = match granularity {
            Granularity::Supersections => remap_area_supersections(
                self.kernel,
                self.tables,
                self.cache,
                self.active,
                area.base,
                pfn,
                size,
                attrs.section,
            ),
            Granularity::Sections => remap_area_sections(
                self.kernel,
                self.tables,
                self.cache,
                self.active,
                area.base,
                pfn,
                size,
                attrs.section,
            ),
            Granularity::Pages => {
                remap_area_pages(self.kernel, self.tables, area.base, pfn, size, attrs.page)
            }
        };
        if let Err(err) = populated {
            self.areas.take(area.base);
            return Err(err);
        }

        self.cache.flush_cache_range(area.base, area.base + size);

        area.kind = match granularity {
            Granularity::Pages => MappingKind::Pages,
            _ => MappingKind::Block,
        };
        self.areas.commit(area);
        Ok(area.base + offset)
    }

    /// Install a single page at a caller-chosen virtual address, outside
    /// any area bookkeeping. For fixed early-boot windows.
    ///
    /// # Errors
    /// See [`MapError`].
    pub fn map_page(
        &mut self,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        mtype: MemoryType,
    ) -> Result<(), MapError> {
        let attrs = self.types.resolve(mtype).ok_or(MapError::InvalidRequest)?;
        remap_area_pages(
            self.kernel,
            self.tables,
            virt.align_down::<Size4K>(),
            PageFrameNumber::containing(phys),
            Size4K::SIZE,
            attrs.page,
        )
    }

    /// Map up to [`MAX_STRIDED_REGIONS`] physical regions into one
    /// contiguous virtual allocation.
    ///
    /// Per region, physical banks of `phys_stride` bytes are visited in
    /// order but only the first `virt_stride` bytes of each are laid out;
    /// the granularity policy runs per step. Any step failure abandons the
    /// whole reservation.
    ///
    /// # Errors
    /// See [`MapError`]; all region validation happens before anything is
    /// mapped.
    pub fn map_strided(
        &mut self,
        regions: &[StridedRegion],
        mtype: MemoryType,
    ) -> Result<VirtualAddress, MapError> {
        if regions.is_empty() || regions.len() > MAX_STRIDED_REGIONS {
            return Err(MapError::InvalidRequest);
        }
        let attrs = self.types.resolve(mtype).ok_or(MapError::InvalidRequest)?;

        let mut strides = [(0u64, 0u64); MAX_STRIDED_REGIONS];
        let mut total: u64 = 0;
        for (region, resolved) in regions.iter().zip(strides.iter_mut()) {
            let (pstride, vstride) = region.strides().ok_or(MapError::InvalidRequest)?;

            // Regions must begin and end on page boundaries, strides be
            // page aligned and non-zero, the exposed window no larger than
            // the bank, the size whole banks, and nothing may wrap.
            if region.size == 0
                || pstride == 0
                || vstride == 0
                || (region.phys.as_u64() | region.size | pstride | vstride) & (Size4K::SIZE - 1)
                    != 0
                || vstride > pstride
                || region.size % pstride != 0
                || region.phys.checked_add(region.size - 1).is_none()
            {
                return Err(MapError::InvalidRequest);
            }

            // High regions must be supersection aligned.
            let pfn = PageFrameNumber::containing(region.phys);
            if pfn.needs_extended_encoding() && !region.phys.is_aligned::<Size16M>() {
                return Err(MapError::InvalidRequest);
            }

            let span = (region.size / pstride)
                .checked_mul(vstride)
                .ok_or(MapError::InvalidRequest)?;
            total = total.checked_add(span).ok_or(MapError::InvalidRequest)?;
            *resolved = (pstride, vstride);
        }

        let mut area = self
            .areas
            .reserve(total)
            .ok_or(MapError::OutOfVirtualSpace)?;

        let mut cursor = area.base;
        let mut used_blocks = false;
        let mut populated = Ok(());
        'regions: for (region, &(pstride, vstride)) in regions.iter().zip(strides.iter()) {
            log::debug!(
                "mapping {} to {} ({:#x} bytes, stride {:#x}/{:#x})",
                region.phys,
                cursor,
                region.size,
                pstride,
                vstride
            );
            let mut pfn = PageFrameNumber::containing(region.phys);
            let mut walked = 0;
            while walked < region.size {
                let granularity = select_granularity(self.caps, pfn, vstride, cursor);
                if pfn.needs_extended_encoding() && granularity != Granularity::Supersections {
                    populated = Err(MapError::InvalidRequest);
                    break 'regions;
                }
                populated = match granularity {
                    Granularity::Supersections => remap_area_supersections(
                        self.kernel,
                        self.tables,
                        self.cache,
                        self.active,
                        cursor,
                        pfn,
                        vstride,
                        attrs.section,
                    ),
                    Granularity::Sections => remap_area_sections(
                        self.kernel,
                        self.tables,
                        self.cache,
                        self.active,
                        cursor,
                        pfn,
                        vstride,
                        attrs.section,
                    ),
                    Granularity::Pages => remap_area_pages(
                        self.kernel,
                        self.tables,
                        cursor,
                        pfn,
                        vstride,
                        attrs.page,
                    ),
                };
                if populated.is_err() {
                    break 'regions;
                }
                if granularity != Granularity::Pages {
                    used_blocks = true;
                }
                pfn += pstride >> Size4K::SHIFT;
                cursor += vstride;
                walked += pstride;
            }
        }
        if let Err(err) = populated {
            self.areas.take(area.base);
            return Err(err);
        }

        self.cache.flush_cache_range(area.base, area.base + total);

        area.kind = if used_blocks {
            MappingKind::Block
        } else {
            MappingKind::Pages
        };
        self.areas.commit(area);
        Ok(area.base)
    }

    /// Tear down the mapping whose first byte the caller got from a `map`
    /// call.
    ///
    /// Unmapping an address that is not currently mapped is caller error;
    /// it is logged and otherwise ignored.
    pub fn unmap(&mut self, virt: VirtualAddress) {
        let base = virt.align_down::<Size4K>();
        let Some(area) = self.areas.take(base) else {
            log::warn!("unmap: no mapping at {base}");
            return;
        };
        match area.kind {
            MappingKind::Block => unmap_area_sections(
                self.kernel,
                self.tables,
                self.cache,
                self.active,
                area.base,
                area.size,
            ),
            MappingKind::Pages => {
                // The trailing guard page was never mapped.
                unmap_area_pages(
                    self.kernel,
                    self.cache,
                    area.base,
                    area.size - Size4K::SIZE,
                )
            }
        }
    }
}
