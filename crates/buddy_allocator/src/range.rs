use crate::entry::FreeListEntry;
use crate::{ceil_log2, round_up_page, MIN_ALLOCATION, MIN_ORDER};

/// A contiguous span of physical memory entrusted to the allocator. The first
/// `mdata_size` bytes hold this range's array of [`FreeListEntry`] records
/// (one per page); `base`/`size` describe the remaining, allocatable part.
pub(crate) struct MemRange {
    pub mdata_base: usize,
    pub base: usize,
    pub mdata_size: usize,
    pub size: usize,
}

impl MemRange {
    pub const fn empty() -> Self {
        Self {
            mdata_base: 0,
            base: 0,
            mdata_size: 0,
            size: 0,
        }
    }

    fn entries(&self) -> *mut FreeListEntry {
        self.mdata_base as *mut FreeListEntry
    }

    pub fn entry_at(&self, index: usize) -> &'static mut FreeListEntry {
        unsafe { &mut *self.entries().add(index) }
    }

    pub fn contains_addr(&self, addr: usize) -> bool {
        addr >= self.base && addr <= self.base + self.size
    }

    pub fn contains_mdata_addr(&self, addr: usize) -> bool {
        addr >= self.mdata_base && addr <= self.mdata_base + self.mdata_size
    }

    pub fn addr_to_index(&self, addr: usize) -> usize {
        (addr - self.base) / MIN_ALLOCATION
    }

    pub fn index_to_addr(&self, index: usize) -> usize {
        index * MIN_ALLOCATION + self.base
    }

    /// Carves this range's page-record metadata out of `phys_base..phys_base+length`
    /// (at the virtual address `mdata_virt_base`, reached through the kernel's
    /// direct map) and fills every page-sized slot as a free, minimum-order entry.
    pub fn catalog(phys_base: usize, length: usize, mdata_virt_base: usize) -> Self {
        let num_page_structs = length / MIN_ALLOCATION;
        let mdata_size = round_up_page(num_page_structs * size_of::<FreeListEntry>());

        let range = MemRange {
            mdata_base: mdata_virt_base,
            base: phys_base + mdata_size,
            mdata_size,
            size: length - mdata_size,
        };

        for i in 0..(range.size / MIN_ALLOCATION) {
            *range.entry_at(i) = FreeListEntry::new();
        }

        range
    }

    /// Log2 of the largest power-of-two block, in bytes, that still fits in
    /// `remaining` and does not exceed `MIN_ALLOCATION`.
    pub fn largest_fitting_order(remaining: usize) -> Option<u32> {
        if remaining < MIN_ALLOCATION {
            return None;
        }
        let top = ceil_log2(remaining as u64) as u32;
        let top = if (1u64 << top) > remaining as u64 {
            top - 1
        } else {
            top
        };
        Some(top.max(MIN_ORDER as u32))
    }
}
