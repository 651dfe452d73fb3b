//! # Kernel Memory Layout
//!
//! Fixed virtual-address landmarks for the remapping window.

/// Start of the window in which device mappings are placed.
///
/// Everything the [`VmAreaAllocator`](crate::vm_area::VmAreaAllocator)
/// hands out lives inside `[VMALLOC_START, VMALLOC_END)`, and the lazy
/// synchronizer copies exactly the first-level entries of this window
/// into other address spaces.
pub const VMALLOC_START: u64 = 0xe000_0000;

/// Exclusive end of the device-mapping window.
pub const VMALLOC_END: u64 = 0xf000_0000;

const _: () = {
    assert!(VMALLOC_START < VMALLOC_END);
    // The window must cover whole supersections so every granularity can
    // be placed in it, and must stay expressible in a 32-bit descriptor.
    assert!(VMALLOC_START % (16 * 1024 * 1024) == 0);
    assert!(VMALLOC_END % (16 * 1024 * 1024) == 0);
    assert!(VMALLOC_END <= 1 << 32);
};
