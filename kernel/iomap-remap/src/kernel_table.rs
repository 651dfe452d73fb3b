//! # Shared Kernel Table and Lazy Cross-Space Synchronization
//!
//! The first-level entries covering the device-mapping window are shared
//! state: the kernel's own table is the canonical copy, and every other
//! address space carries a replica of that slice. Rather than broadcasting
//! each structural change to all replicas eagerly, the kernel table keeps
//! a **generation counter**:
//!
//! - every structural change (a slot cleared, or a fresh second-level
//!   table linked in) happens under the table's single coarse lock and
//!   bumps the counter;
//! - an address space reconciles itself against the canonical slice the
//!   next time it becomes active, via [`SharedKernelTable::maybe_reconcile`].
//!
//! The copy loop in [`SharedKernelTable::reconcile`] validates itself
//! against a generation value read *after* the copy finished and repeats
//! until stable, so a reconcile racing a concurrent structural change can
//! never record a partially-copied slice as current. This remains a
//! best-effort scheme under true concurrency; it is sound here because
//! block mappings — the only structural churn after boot — are restricted
//! to uniprocessor configurations.

use core::sync::atomic::{AtomicU32, Ordering};

use iomap_addresses::{PageSize, PhysicalAddress, Size1M, VirtualAddress};
use iomap_sync::{TicketLock, TicketLockGuard};

use crate::PhysMapper;
use crate::layout::{VMALLOC_END, VMALLOC_START};
use crate::page_table::first_level::FirstLevelTable;
use crate::page_table::second_level::SecondLevelTable;

/// A point in the history of structural changes to the shared window.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Generation(u32);

impl Generation {
    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl core::fmt::Display for Generation {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "generation {}", self.0)
    }
}

/// The span of first-level slots shared between all address spaces.
#[derive(Copy, Clone, Debug)]
pub struct KernelWindow {
    start: VirtualAddress,
    end: VirtualAddress,
}

impl KernelWindow {
    /// The window described by [`layout`](crate::layout).
    #[inline]
    #[must_use]
    pub const fn vmalloc() -> Self {
        Self::new(
            VirtualAddress::new(VMALLOC_START),
            VirtualAddress::new(VMALLOC_END),
        )
    }

    /// A window over `[start, end)`. Both bounds must be section aligned.
    #[inline]
    #[must_use]
    pub const fn new(start: VirtualAddress, end: VirtualAddress) -> Self {
        debug_assert!(start.is_aligned::<Size1M>() && end.is_aligned::<Size1M>());
        debug_assert!(start.as_u64() < end.as_u64());
        Self { start, end }
    }

    /// The first-level slot range `start..end` covering the window.
    #[inline]
    #[must_use]
    pub const fn slot_range(self) -> (usize, usize) {
        (
            (self.start.as_u64() >> Size1M::SHIFT) as usize,
            (self.end.as_u64() >> Size1M::SHIFT) as usize,
        )
    }
}

/// A non-canonical address space holding a replica of the shared window.
///
/// Only the root frame and the last-observed generation live here; the
/// table itself is reached through the kernel table's [`PhysMapper`].
pub struct AddressSpace {
    root: PhysicalAddress,
    seen: AtomicU32,
}

impl AddressSpace {
    /// Wrap the first-level table rooted at `root`.
    ///
    /// The replica starts unsynchronized (generation 0 observed).
    #[must_use]
    pub const fn new(root: PhysicalAddress) -> Self {
        Self {
            root,
            seen: AtomicU32::new(0),
        }
    }

    /// Root frame of this space's first-level table.
    #[inline]
    #[must_use]
    pub const fn root(&self) -> PhysicalAddress {
        self.root
    }

    /// The generation this space last observed.
    #[inline]
    #[must_use]
    pub fn last_observed(&self) -> Generation {
        Generation(self.seen.load(Ordering::Acquire))
    }
}

/// The canonical kernel first-level table, its structural-mutation lock,
/// and the generation counter.
///
/// All components take a handle to this service instead of reaching into
/// ambient globals. Leaf-level reads and writes go through
/// [`second_level`](Self::second_level) without locking; anything that
/// clears or links a first-level slot inside the shared window must go
/// through [`lock_structural`](Self::lock_structural).
pub struct SharedKernelTable<'m, M: PhysMapper> {
    root: PhysicalAddress,
    window: KernelWindow,
    mapper: &'m M,
    generation: AtomicU32,
    lock: TicketLock<()>,
}

impl<'m, M: PhysMapper> SharedKernelTable<'m, M> {
    /// Wrap the canonical first-level table rooted at `root`.
    #[must_use]
    pub const fn new(mapper: &'m M, root: PhysicalAddress, window: KernelWindow) -> Self {
        Self {
            root,
            window,
            mapper,
            generation: AtomicU32::new(0),
            lock: TicketLock::new(()),
        }
    }

    /// The shared window this table is canonical for.
    #[inline]
    #[must_use]
    pub const fn window(&self) -> KernelWindow {
        self.window
    }

    /// Current generation of the shared window.
    #[inline]
    #[must_use]
    pub fn observe(&self) -> Generation {
        Generation(self.generation.load(Ordering::Acquire))
    }

    /// Borrow the canonical first-level table.
    ///
    /// Lock-free on purpose: leaf population only *reads* first-level
    /// slots (and takes the structural lock before linking new ones).
    #[inline]
    pub(crate) fn first_level(&self) -> &'m mut FirstLevelTable {
        unsafe { self.mapper.phys_to_mut(self.root) }
    }

    /// Borrow the second-level table at `table`.
    #[inline]
    pub(crate) fn second_level(&self, table: PhysicalAddress) -> &'m mut SecondLevelTable {
        unsafe { self.mapper.phys_to_mut(table) }
    }

    /// Take the structural lock and borrow the canonical table through it.
    pub(crate) fn lock_structural(&self) -> StructuralGuard<'_> {
        let guard = self.lock.lock();
        StructuralGuard {
            table: unsafe { self.mapper.phys_to_mut(self.root) },
            generation: &self.generation,
            _lock: guard,
        }
    }

    /// Copy the shared window from the canonical table into `space`,
    /// looping until the copy is provably consistent.
    ///
    /// The generation recorded for `space` is the value observed *before*
    /// a copy that the *after* observation confirmed; a structural change
    /// racing the copy forces another round.
    pub fn reconcile(&self, space: &AddressSpace) -> Generation {
        let (start, end) = self.window.slot_range();
        loop {
            let seen = self.observe();
            let src: &FirstLevelTable = self.first_level();
            let dst: &mut FirstLevelTable = unsafe { self.mapper.phys_to_mut(space.root) };
            dst.copy_slice_from(src, start, end);
            space.seen.store(seen.0, Ordering::Release);
            if self.observe() == seen {
                return seen;
            }
        }
    }

    /// Reconcile `space` only when it lags the current generation.
    ///
    /// This is the check an address space runs whenever it becomes
    /// active; between activations it may serve a stale window.
    pub fn maybe_reconcile(&self, space: &AddressSpace) {
        if space.last_observed() != self.observe() {
            self.reconcile(space);
        }
    }
}

/// Exclusive, locked access to the canonical first-level table.
///
/// Dereferences to [`FirstLevelTable`]; call [`bump`](Self::bump) once per
/// structural change made while holding the guard.
pub(crate) struct StructuralGuard<'g> {
    table: &'g mut FirstLevelTable,
    generation: &'g AtomicU32,
    _lock: TicketLockGuard<'g, ()>,
}

impl StructuralGuard<'_> {
    /// Publish one structural change to the shared window.
    pub(crate) fn bump(&self) {
        self.generation.fetch_add(1, Ordering::Release);
    }
}

impl core::ops::Deref for StructuralGuard<'_> {
    type Target = FirstLevelTable;
    fn deref(&self) -> &FirstLevelTable {
        self.table
    }
}

impl core::ops::DerefMut for StructuralGuard<'_> {
    fn deref_mut(&mut self) -> &mut FirstLevelTable {
        self.table
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page_table::first_level::{FirstLevelEntry, SectionBits, SectionIndex};
    use crate::testing::TestMachine;

    #[test]
    fn window_slot_range() {
        let w = KernelWindow::vmalloc();
        let (start, end) = w.slot_range();
        assert_eq!(start, 0xe00);
        assert_eq!(end, 0xf00);
    }

    #[test]
    fn observe_starts_at_zero_and_bump_is_visible() {
        let m = TestMachine::new();
        let kt = m.kernel_table();
        let g0 = kt.observe();
        assert_eq!(g0.as_u32(), 0);
        {
            let guard = kt.lock_structural();
            guard.bump();
            guard.bump();
        }
        assert_eq!(kt.observe().as_u32(), 2);
        assert!(kt.observe() > g0);
    }

    #[test]
    fn reconcile_copies_window_and_records_generation() {
        let m = TestMachine::new();
        let kt = m.kernel_table();
        let space = AddressSpace::new(TestMachine::SPACE_ROOT);

        // Mutate a slot inside the window, structurally.
        let idx = SectionIndex::from(VirtualAddress::new(VMALLOC_START));
        {
            let mut guard = kt.lock_structural();
            guard.set(
                idx,
                FirstLevelEntry::make_section(
                    PhysicalAddress::new(0x4000_0000),
                    SectionBits::new(),
                ),
            );
            guard.bump();
        }

        let g = kt.reconcile(&space);
        assert_eq!(g, kt.observe());
        assert_eq!(space.last_observed(), g);

        let replica: &FirstLevelTable = unsafe { m.phys_to_mut(space.root()) };
        assert_eq!(replica.get(idx).raw(), kt.first_level().get(idx).raw());
    }

    #[test]
    fn maybe_reconcile_noops_when_current() {
        let m = TestMachine::new();
        let kt = m.kernel_table();
        let space = AddressSpace::new(TestMachine::SPACE_ROOT);

        kt.reconcile(&space);
        let before = space.last_observed();
        // No structural change since the reconcile: nothing to do.
        kt.maybe_reconcile(&space);
        assert_eq!(space.last_observed(), before);

        // A structural change makes the space lag again.
        kt.lock_structural().bump();
        assert_ne!(space.last_observed(), kt.observe());
        kt.maybe_reconcile(&space);
        assert_eq!(space.last_observed(), kt.observe());
    }

    #[test]
    fn observed_generation_never_decreases() {
        let m = TestMachine::new();
        let kt = m.kernel_table();
        let space = AddressSpace::new(TestMachine::SPACE_ROOT);

        let mut last = kt.reconcile(&space);
        for _ in 0..5 {
            kt.lock_structural().bump();
            let g = kt.reconcile(&space);
            assert!(g > last);
            last = g;
        }
    }
}
