//! Segregated free-list kernel heap (§4.3).
//!
//! A contiguous virtual window, mapped once at [`KernelHeap::init`] and
//! grown on demand by pulling more physically contiguous pages from the
//! `PageAllocator` and remapping the window. Below `PMM_THRESHOLD`,
//! allocations are carved out of 256 segregated free lists; at or above
//! it, a request is satisfied directly by the `PageAllocator` and tagged
//! so `free`/`reallocate` can recognise the origin.
//!
//! Every chunk, free or not, is prefixed by a [`ChunkHeader`] living in
//! the heap's own backing memory — there is no separate metadata array,
//! unlike `buddy_allocator`'s per-range `FreeListEntry` table. Locating
//! the smallest non-empty bin at or above a size class is a find-first-set
//! over a bitmap, one word per 64 bins.

use core::ptr::NonNull;

use align_ext::AlignExt;
use intrusive_list::{container_of, Link, List};

use crate::config::{HEAP_ALIGN, HEAP_EXACT_BINS, HEAP_NUM_BINS, HEAP_WINDOW_BASE, PMM_THRESHOLD};
use crate::error::{KError, KResult};
use crate::mem::address::{direct_virt_to_phys, phys_to_direct_virt, PAddr, VAddr};
use crate::mem::page_alloc::PageAllocator;
use crate::mem::page_table::{PageMap, PteFlags};

const IN_USE: usize = 1;
const SIZE_MASK: usize = !(HEAP_ALIGN - 1);
const BITMAP_WORDS: usize = HEAP_NUM_BINS / 64;

/// `{prev_ptr, next_ptr, size_and_flags, prev_size}`, exactly `HEAP_ALIGN`
/// bytes so the smallest possible chunk still has room for its own header.
#[repr(C)]
struct ChunkHeader {
    link: Link,
    size_and_flags: usize,
    prev_size: usize,
}

const _: () = assert!(core::mem::size_of::<ChunkHeader>() == HEAP_ALIGN);

impl ChunkHeader {
    fn size(&self) -> usize {
        self.size_and_flags & SIZE_MASK
    }

    fn is_in_use(&self) -> bool {
        self.size_and_flags & IN_USE != 0
    }

    fn set_in_use(&mut self, in_use: bool) {
        if in_use {
            self.size_and_flags |= IN_USE;
        } else {
            self.size_and_flags &= !IN_USE;
        }
    }

    fn set_size(&mut self, size: usize) {
        debug_assert_eq!(size & !SIZE_MASK, 0, "chunk size must be heap-aligned");
        self.size_and_flags = size | (self.size_and_flags & IN_USE);
    }

    unsafe fn next(&self) -> NonNull<ChunkHeader> {
        unsafe {
            let raw = (self as *const Self as *mut u8).add(self.size());
            NonNull::new_unchecked(raw as *mut ChunkHeader)
        }
    }

    unsafe fn prev(&self) -> NonNull<ChunkHeader> {
        unsafe {
            let raw = (self as *const Self as *mut u8).sub(self.prev_size & SIZE_MASK);
            NonNull::new_unchecked(raw as *mut ChunkHeader)
        }
    }
}

fn payload_of(header: NonNull<ChunkHeader>) -> VAddr {
    VAddr::new(header.as_ptr() as u64 + HEAP_ALIGN as u64)
}

/// Maps a chunk size to its bin: exact 32-byte buckets below 1024 bytes,
/// two log-spaced sub-bins per power of two above it.
fn bin_index(size: usize) -> usize {
    if size < 1024 {
        return size / HEAP_ALIGN;
    }

    const LOG2_MIN_SIZE: usize = 11;
    let floor_log2_size = 64 - (size as u64).leading_zeros() as usize;
    let mut index = (floor_log2_size - LOG2_MIN_SIZE) * 2;
    index += (size >> (floor_log2_size - 2)) & 1;
    (HEAP_EXACT_BINS + index).min(HEAP_NUM_BINS - 1)
}

pub struct KernelHeap {
    bins: [List; HEAP_NUM_BINS],
    bitmap: [u64; BITMAP_WORDS],
    base: VAddr,
    paddr: PAddr,
    size: usize,
    max_size: usize,
    top: NonNull<ChunkHeader>,
}

impl KernelHeap {
    /// Allocates `initial_size` (rounded up to `HEAP_ALIGN`) physical pages,
    /// maps them at the fixed heap window base, and seeds a single "top"
    /// chunk spanning the whole window.
    pub fn init(
        page_alloc: &mut PageAllocator,
        page_map: &mut PageMap,
        initial_size: usize,
        max_size: usize,
    ) -> KResult<Self> {
        let initial_size = initial_size.align_up(HEAP_ALIGN);
        let base = VAddr::new(HEAP_WINDOW_BASE);
        let paddr = page_alloc.allocate(initial_size).ok_or(KError::NoMemory)?;

        page_map.map_range(page_alloc, paddr, base, initial_size, PteFlags::RW)?;
        unsafe {
            page_map.load();
        }

        let top = unsafe {
            let ptr = base.get() as *mut ChunkHeader;
            (*ptr).link = Link::new();
            (*ptr).size_and_flags = initial_size;
            (*ptr).prev_size = 0;
            NonNull::new_unchecked(ptr)
        };

        Ok(Self {
            bins: [const { List::new() }; HEAP_NUM_BINS],
            bitmap: [0; BITMAP_WORDS],
            base,
            paddr,
            size: initial_size,
            max_size,
            top,
        })
    }

    fn bin_set(&mut self, bin: usize) {
        self.bitmap[bin / 64] |= 1 << (bin % 64);
    }

    fn bin_clear(&mut self, bin: usize) {
        self.bitmap[bin / 64] &= !(1 << (bin % 64));
    }

    fn push_free(&mut self, mut header: NonNull<ChunkHeader>) {
        let bin = bin_index(unsafe { header.as_ref() }.size());
        unsafe {
            self.bins[bin].insert(&mut header.as_mut().link);
        }
        self.bin_set(bin);
    }

    fn remove_from_bin(&mut self, bin: usize, mut header: NonNull<ChunkHeader>) {
        unsafe {
            self.bins[bin].remove(&mut header.as_mut().link);
        }
        if self.bins[bin].is_empty() {
            self.bin_clear(bin);
        }
    }

    /// Scans `bin`'s list for the first chunk of at least `size`, skipping
    /// (and restoring) any that are too small — a log-spaced bin can hold
    /// chunks spanning its whole size range.
    fn take_fitting(&mut self, bin: usize, size: usize) -> Option<NonNull<ChunkHeader>> {
        let mut skipped = List::new();
        let mut found = None;

        while let Some(link) = self.bins[bin].pop() {
            let header = unsafe { container_of!(link, ChunkHeader, link) };
            if unsafe { header.as_ref() }.size() >= size {
                found = Some(header);
                break;
            }
            skipped.insert(link);
        }

        while let Some(link) = skipped.pop() {
            self.bins[bin].insert(link);
        }

        if self.bins[bin].is_empty() {
            self.bin_clear(bin);
        }
        found
    }

    /// Finds the smallest non-empty bin at or above `size`'s bin and takes
    /// a chunk that actually fits, in O(number of bins scanned).
    fn find_entry(&mut self, size: usize) -> Option<NonNull<ChunkHeader>> {
        let start_bin = bin_index(size);
        let mut word_index = start_bin / 64;
        let mut mask = self.bitmap[word_index] & (!0u64 << (start_bin % 64));

        loop {
            while mask == 0 {
                word_index += 1;
                if word_index == BITMAP_WORDS {
                    return None;
                }
                mask = self.bitmap[word_index];
            }

            let bin = word_index * 64 + mask.trailing_zeros() as usize;
            if let Some(entry) = self.take_fitting(bin, size) {
                return Some(entry);
            }
            mask &= mask - 1;
        }
    }

    /// Splits `entry` into a `size`-byte, in-use head and a free tail,
    /// returning the tail. If `entry` was `top`, the tail becomes the new
    /// top instead of being linked onto a bin.
    unsafe fn split(&mut self, mut entry: NonNull<ChunkHeader>, size: usize) -> NonNull<ChunkHeader> {
        unsafe {
            let old_size = entry.as_ref().size();
            let mut next = {
                let raw = (entry.as_ptr() as *mut u8).add(size) as *mut ChunkHeader;
                NonNull::new_unchecked(raw)
            };

            next.as_mut().link = Link::new();
            entry.as_mut().set_size(size);
            entry.as_mut().set_in_use(true);
            next.as_mut().size_and_flags = old_size - size;
            next.as_mut().prev_size = entry.as_ref().size_and_flags;

            if entry == self.top {
                self.top = next;
            } else {
                let mut after = next.as_ref().next();
                after.as_mut().prev_size = next.as_ref().size_and_flags;
            }

            next
        }
    }

    fn split_and_push(&mut self, entry: NonNull<ChunkHeader>, size: usize) {
        let next = unsafe { self.split(entry, size) };
        if next != self.top {
            self.push_free(next);
        }
    }

    /// Absorbs a free predecessor and/or successor into `entry`. `entry`
    /// itself must already have `IN_USE` cleared and must not be linked
    /// into any bin.
    unsafe fn merge_with_neighbors(&mut self, mut entry: NonNull<ChunkHeader>) -> NonNull<ChunkHeader> {
        unsafe {
            if entry.as_ref().prev_size & IN_USE == 0 && entry.as_ref().prev_size != 0 {
                let current_size = entry.as_ref().size_and_flags;
                let prev = entry.as_ref().prev();
                let prev_bin = bin_index(prev.as_ref().size());
                self.remove_from_bin(prev_bin, prev);
                entry = prev;
                entry.as_mut().size_and_flags += current_size;
            }

            let next = entry.as_ref().next();
            if !next.as_ref().is_in_use() {
                let next_bin = bin_index(next.as_ref().size());
                self.remove_from_bin(next_bin, next);
                entry.as_mut().size_and_flags += next.as_ref().size();
                if next == self.top {
                    self.top = entry;
                }
            }

            if entry != self.top {
                let mut after = entry.as_ref().next();
                after.as_mut().prev_size = entry.as_ref().size_and_flags;
            }

            entry
        }
    }

    fn grow_heap(&mut self, page_alloc: &mut PageAllocator, page_map: &mut PageMap) -> KResult<()> {
        if self.size >= self.max_size {
            return Err(KError::NoSpace);
        }

        let old_size = self.size;
        let new_size = old_size.saturating_mul(2).min(self.max_size);
        let new_paddr = page_alloc
            .reallocate(self.paddr, new_size)
            .ok_or(KError::NoMemory)?;

        // `reallocate` only guarantees the new physical range holds the old
        // contents when the base address is unchanged; copy explicitly
        // before the window is remapped onto it otherwise.
        if new_paddr.get() != self.paddr.get() {
            let old_virt = phys_to_direct_virt(self.paddr);
            let new_virt = phys_to_direct_virt(new_paddr);
            unsafe {
                core::ptr::copy(old_virt.get() as *const u8, new_virt.get() as *mut u8, old_size);
            }
        }

        page_map.unmap_range(page_alloc, self.base, old_size)?;
        page_map.map_range(page_alloc, new_paddr, self.base, new_size, PteFlags::RW)?;
        unsafe {
            page_map.load();
        }

        self.paddr = new_paddr;
        let grown_by = new_size - old_size;
        self.size = new_size;

        unsafe {
            self.top.as_mut().size_and_flags += grown_by;
        }
        Ok(())
    }

    fn header_of(ptr: VAddr) -> NonNull<ChunkHeader> {
        unsafe { NonNull::new_unchecked((ptr.get() - HEAP_ALIGN as u64) as *mut ChunkHeader) }
    }

    pub fn allocate(
        &mut self,
        page_alloc: &mut PageAllocator,
        page_map: &mut PageMap,
        size: usize,
    ) -> KResult<VAddr> {
        if size == 0 {
            return Err(KError::InvalidArgument);
        }
        debug_assert!(self.verify());

        let total = (size + HEAP_ALIGN).align_up(HEAP_ALIGN);

        if total >= PMM_THRESHOLD {
            let paddr = page_alloc.allocate(total).ok_or(KError::NoMemory)?;
            let vaddr = phys_to_direct_virt(paddr);
            unsafe {
                let header = &mut *(vaddr.get() as *mut ChunkHeader);
                header.link = Link::new();
                header.size_and_flags = total | IN_USE;
                header.prev_size = 0;
            }
            return Ok(VAddr::new(vaddr.get() + HEAP_ALIGN as u64));
        }

        let mut entry = if let Some(entry) = self.find_entry(total) {
            let entry_size = unsafe { entry.as_ref() }.size();
            if total >= 1024 && entry_size > total {
                self.split_and_push(entry, total);
            }
            entry
        } else {
            while total >= unsafe { self.top.as_ref() }.size() {
                self.grow_heap(page_alloc, page_map)?;
            }
            let top = self.top;
            self.top = unsafe { self.split(top, total) };
            top
        };

        unsafe {
            entry.as_mut().set_in_use(true);
            let mut next = entry.as_ref().next();
            next.as_mut().prev_size = entry.as_ref().size_and_flags;
        }

        debug_assert!(self.verify());
        Ok(payload_of(entry))
    }

    pub fn free(&mut self, page_alloc: &mut PageAllocator, ptr: VAddr) {
        debug_assert!(self.verify());

        let mut header = Self::header_of(ptr);
        let size = unsafe { header.as_ref() }.size();

        if size >= PMM_THRESHOLD {
            let paddr = direct_virt_to_phys(VAddr::new(header.as_ptr() as u64));
            page_alloc.free(paddr);
            return;
        }

        unsafe {
            header.as_mut().set_in_use(false);
            let merged = self.merge_with_neighbors(header);
            if merged != self.top {
                self.push_free(merged);
            }
        }

        debug_assert!(self.verify());
    }

    /// Grows, shrinks, or moves an allocation. Below `PMM_THRESHOLD` this
    /// tries in-place coalescing with its neighbors first; crossing the
    /// threshold in either direction, or failing to coalesce enough room,
    /// falls back to allocate-copy-free. Any branch that changes the
    /// backing address copies the live payload before the old storage is
    /// released.
    pub fn reallocate(
        &mut self,
        page_alloc: &mut PageAllocator,
        page_map: &mut PageMap,
        ptr: VAddr,
        size: usize,
    ) -> KResult<VAddr> {
        if size == 0 {
            return Err(KError::InvalidArgument);
        }
        debug_assert!(self.verify());

        let total = (size + HEAP_ALIGN).align_up(HEAP_ALIGN);
        let mut header = Self::header_of(ptr);
        if !unsafe { header.as_ref() }.is_in_use() {
            return Err(KError::InvalidArgument);
        }
        let original_size = unsafe { header.as_ref() }.size();

        if original_size >= PMM_THRESHOLD {
            let old_paddr = direct_virt_to_phys(VAddr::new(header.as_ptr() as u64));
            let new_paddr = page_alloc
                .reallocate(old_paddr, total)
                .ok_or(KError::NoMemory)?;
            let new_vaddr = phys_to_direct_virt(new_paddr);
            if new_paddr.get() != old_paddr.get() {
                unsafe {
                    core::ptr::copy(
                        phys_to_direct_virt(old_paddr).get() as *const u8,
                        new_vaddr.get() as *mut u8,
                        original_size.min(total),
                    );
                }
            }
            unsafe {
                (*(new_vaddr.get() as *mut ChunkHeader)).size_and_flags = total | IN_USE;
            }
            return Ok(VAddr::new(new_vaddr.get() + HEAP_ALIGN as u64));
        }

        if total >= PMM_THRESHOLD {
            let new_ptr = self.allocate(page_alloc, page_map, size)?;
            unsafe {
                core::ptr::copy(
                    ptr.get() as *const u8,
                    new_ptr.get() as *mut u8,
                    original_size - HEAP_ALIGN,
                );
            }
            self.free(page_alloc, ptr);
            return Ok(new_ptr);
        }

        unsafe {
            header.as_mut().set_in_use(false);
        }
        let merged = unsafe { self.merge_with_neighbors(header) };
        let merged_size = unsafe { merged.as_ref() }.size();

        if merged_size >= total {
            if merged_size > total {
                self.split_and_push(merged, total);
            }
            let mut merged = merged;
            unsafe {
                merged.as_mut().set_in_use(true);
                let mut next = merged.as_ref().next();
                next.as_mut().prev_size = merged.as_ref().size_and_flags;
            }
            let new_ptr = payload_of(merged);
            if new_ptr.get() != ptr.get() {
                unsafe {
                    core::ptr::copy(
                        ptr.get() as *const u8,
                        new_ptr.get() as *mut u8,
                        original_size.min(total) - HEAP_ALIGN,
                    );
                }
            }
            debug_assert!(self.verify());
            return Ok(new_ptr);
        }

        unsafe {
            let mut next = merged.as_ref().next();
            next.as_mut().prev_size = merged.as_ref().size_and_flags;
        }

        let new_ptr = self.allocate(page_alloc, page_map, size)?;
        unsafe {
            core::ptr::copy(
                ptr.get() as *const u8,
                new_ptr.get() as *mut u8,
                (original_size - HEAP_ALIGN).min(size),
            );
        }
        self.free(page_alloc, payload_of(merged));

        debug_assert!(self.verify());
        Ok(new_ptr)
    }

    /// Translates an address inside the heap window to its current
    /// physical backing, or `None` if it falls outside the window.
    pub fn to_phys(&self, vaddr: VAddr) -> Option<PAddr> {
        let offset = vaddr.get().checked_sub(self.base.get())?;
        if offset as usize >= self.size {
            return None;
        }
        Some(PAddr::new(self.paddr.get() + offset as usize))
    }

    pub fn to_virt(&self, paddr: PAddr) -> Option<VAddr> {
        let offset = paddr.get().checked_sub(self.paddr.get())?;
        if offset >= self.size {
            return None;
        }
        Some(VAddr::new(self.base.get() + offset as u64))
    }

    /// Walks every chunk from the window base to `top`, checking that
    /// sizes sum to the heap's total size and that every `prev_size`
    /// matches its predecessor's raw `size_and_flags`. Returns `false`
    /// instead of panicking so tests can assert on it directly.
    pub fn verify(&self) -> bool {
        unsafe {
            let mut chunk = NonNull::new_unchecked(self.base.get() as *mut ChunkHeader);
            let mut sum = 0usize;
            let mut prev: Option<NonNull<ChunkHeader>> = None;

            loop {
                if chunk.as_ptr() as u64 > self.top.as_ptr() as u64 {
                    return false;
                }
                if let Some(prev) = prev {
                    if chunk.as_ref().prev_size != prev.as_ref().size_and_flags {
                        return false;
                    }
                }
                if chunk == self.top {
                    break;
                }
                sum += chunk.as_ref().size();
                prev = Some(chunk);
                chunk = chunk.as_ref().next();
            }

            sum += self.top.as_ref().size();
            sum == self.size
        }
    }
}

#[cfg(test)]
extern crate std;

#[cfg(test)]
mod tests {
    use super::*;

    /// Host-allocated memory standing in for the heap's mapped window:
    /// chunk arithmetic is exercised exactly as in the kernel, bypassing
    /// `PageAllocator`/`PageMap`/MMIO entirely.
    struct FakeBacking {
        ptr: *mut u8,
    }

    impl FakeBacking {
        fn new(len: usize) -> Self {
            let layout = core::alloc::Layout::from_size_align(len, 4096).unwrap();
            let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
            Self { ptr }
        }

        fn base(&self) -> u64 {
            self.ptr as u64
        }
    }

    /// Builds a `KernelHeap` directly over host memory, bypassing
    /// `PageAllocator`/`PageMap`/MMIO entirely: the window base and chunk
    /// arithmetic are exercised exactly as in the kernel, only the
    /// translation from "physical" to virtual is identity instead of the
    /// real direct map.
    fn fresh_heap(len: usize) -> (KernelHeap, FakeBacking) {
        let backing = FakeBacking::new(len);
        let base = VAddr::new(backing.base());
        let top = unsafe {
            let ptr = base.get() as *mut ChunkHeader;
            (*ptr).link = Link::new();
            (*ptr).size_and_flags = len;
            (*ptr).prev_size = 0;
            NonNull::new_unchecked(ptr)
        };
        let heap = KernelHeap {
            bins: [const { List::new() }; HEAP_NUM_BINS],
            bitmap: [0; BITMAP_WORDS],
            base,
            paddr: PAddr::new(backing.base() as usize),
            size: len,
            max_size: len,
            top,
        };
        (heap, backing)
    }

    #[test]
    fn bin_index_exact_buckets_match_stride() {
        assert_eq!(bin_index(32), 1);
        assert_eq!(bin_index(64), 2);
        assert_eq!(bin_index(992), 31);
    }

    #[test]
    fn bin_index_is_monotonic() {
        let mut prev = 0;
        let mut size = 32;
        while size < 16384 {
            let bin = bin_index(size);
            assert!(bin >= prev, "bin_index regressed at size {size}");
            prev = bin;
            size += 32;
        }
    }

    #[test]
    fn allocate_and_free_roundtrip_stays_within_window() {
        let (mut heap, _backing) = fresh_heap(1 << 20);

        let a = unsafe { heap.allocate_raw(64) };
        assert!(heap.verify());
        unsafe { heap.free_raw(a) };
        assert!(heap.verify());
    }

    #[test]
    fn split_then_coalesce_restores_single_top_chunk() {
        let (mut heap, _backing) = fresh_heap(1 << 16);
        let original_top_size = unsafe { heap.top.as_ref() }.size();

        let a = unsafe { heap.allocate_raw(128) };
        let b = unsafe { heap.allocate_raw(256) };
        assert!(heap.verify());

        unsafe { heap.free_raw(a) };
        unsafe { heap.free_raw(b) };
        assert!(heap.verify());

        assert_eq!(unsafe { heap.top.as_ref() }.size(), original_top_size);
    }

    #[test]
    fn reallocate_in_place_grows_without_moving_when_neighbor_is_free() {
        let (mut heap, _backing) = fresh_heap(1 << 16);

        let a = unsafe { heap.allocate_raw(32) };
        let b = unsafe { heap.allocate_raw(32) };
        unsafe { heap.free_raw(b) };

        let grown = unsafe { heap.reallocate_raw(a, 160) };
        assert!(heap.verify());
        assert_eq!(grown.get(), a.get());
    }

    impl KernelHeap {
        /// Drives `allocate`'s below-threshold bin/top path directly,
        /// without a `PageAllocator`/`PageMap` (growth is never exercised
        /// here; the arena is sized well above any test's needs).
        unsafe fn allocate_raw(&mut self, size: usize) -> VAddr {
            let total = (size + HEAP_ALIGN).align_up(HEAP_ALIGN);
            debug_assert!(total < self.size, "test arena too small for allocate_raw");

            let mut entry = if let Some(entry) = self.find_entry(total) {
                let entry_size = unsafe { entry.as_ref() }.size();
                if total >= 1024 && entry_size > total {
                    self.split_and_push(entry, total);
                }
                entry
            } else {
                let top = self.top;
                self.top = unsafe { self.split(top, total) };
                top
            };

            unsafe {
                entry.as_mut().set_in_use(true);
                let mut next = entry.as_ref().next();
                next.as_mut().prev_size = entry.as_ref().size_and_flags;
            }
            payload_of(entry)
        }

        unsafe fn free_raw(&mut self, ptr: VAddr) {
            let mut header = Self::header_of(ptr);
            unsafe {
                header.as_mut().set_in_use(false);
                let merged = self.merge_with_neighbors(header);
                if merged != self.top {
                    self.push_free(merged);
                }
            }
        }

        unsafe fn reallocate_raw(&mut self, ptr: VAddr, size: usize) -> VAddr {
            let total = (size + HEAP_ALIGN).align_up(HEAP_ALIGN);
            let mut header = Self::header_of(ptr);

            unsafe {
                header.as_mut().set_in_use(false);
            }
            let merged = unsafe { self.merge_with_neighbors(header) };
            let merged_size = unsafe { merged.as_ref() }.size();

            assert!(merged_size >= total, "test allocation too large to grow in place");
            if merged_size > total {
                self.split_and_push(merged, total);
            }
            let mut merged = merged;
            unsafe {
                merged.as_mut().set_in_use(true);
                let mut next = merged.as_ref().next();
                next.as_mut().prev_size = merged.as_ref().size_and_flags;
            }
            payload_of(merged)
        }
    }
}
