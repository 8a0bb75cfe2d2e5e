//! Physical page allocation.
//!
//! `buddy_allocator::PageAllocator` already implements the whole of §4.1;
//! this module just gives it the kernel's naming and the `PAddr` newtype
//! plumbing. Per the design notes ("Global module state"), there is no
//! process-wide singleton here — `kernel_init` constructs exactly one
//! `PageAllocator` and threads a handle to it through every driver and
//! cache that needs page frames.

pub use buddy_allocator::{PageAllocator, UsableRange, MAX_ORDER, MIN_ALLOCATION, MIN_ORDER};

use crate::boot::BootInfo;
use crate::config::PAGE_SIZE;
use crate::mem::address::phys_to_direct_virt;
use crate::mem::page_table::TableAlloc;
use buddy_allocator::PAddr;

/// The page allocator doubles as the source of page-table frames: a table
/// is just a page like any other, and both share the kernel's direct map
/// for translation.
impl TableAlloc for PageAllocator {
    fn alloc_table(&mut self) -> Option<PAddr> {
        self.allocate(PAGE_SIZE)
    }
}

/// Builds and initializes a `PageAllocator` from a `BootInfo`'s usable
/// memory-map ranges. `phys_to_direct_virt` is how the allocator reaches
/// its own per-range metadata before any other mapping exists.
///
/// # Safety
/// Must run exactly once, before any other subsystem touches physical
/// memory, per the single-instance invariant in the design notes.
pub unsafe fn init_page_allocator(boot: &BootInfo) -> PageAllocator {
    let ranges: alloc::vec::Vec<UsableRange> = boot
        .usable_ranges()
        .map(|e| UsableRange {
            base: PAddr::new(e.base as usize),
            length: e.length as usize,
        })
        .collect();

    let mut alloc = PageAllocator::new();
    unsafe {
        alloc.init(&ranges, |p| phys_to_direct_virt(PAddr::new(p)).get() as usize);
    }
    alloc
}
