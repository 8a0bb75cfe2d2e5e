//! x86-64 four-level page tables (§4.2).
//!
//! Each level is 512 entries of 8 bytes (one page). Table pages are
//! allocated one frame at a time from a `PageAllocator` and reached
//! through the kernel's direct map, so walking never needs the MMU to
//! already have the path mapped. `load()` (writing CR3) and TLB
//! invalidation are the only genuinely hardware-facing operations and
//! are gated behind `target_arch = "x86_64"`; the walk/create logic
//! above them is plain arithmetic over a byte buffer and is exercised by
//! host-side tests through the [`TableAlloc`] seam.

use bitflags::bitflags;

use crate::config::PAGE_SIZE;
use crate::error::{KError, KResult};
use crate::mem::address::{phys_to_direct_virt, PAddr, VAddr};

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct PteFlags: u64 {
        const PRESENT = 1 << 0;
        const RW      = 1 << 1;
        const USER    = 1 << 2;
        const WT      = 1 << 3;
        const CD      = 1 << 4;
        const ACCESSED = 1 << 5;
        const DIRTY   = 1 << 6;
        const PAT     = 1 << 7;
        const GLOBAL  = 1 << 8;
        const NX      = 1 << 63;
    }
}

const ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;

/// Seam over table-page allocation and phys->virt translation, so the
/// walk logic below is testable on the host without a real
/// `PageAllocator`, the kernel's real direct map, or an MMU.
pub trait TableAlloc {
    fn alloc_table(&mut self) -> Option<PAddr>;

    /// Translates a table's physical address into a virtual address the
    /// walker can dereference. Defaults to the kernel's real direct map;
    /// tests override this to point at host memory instead.
    fn phys_to_virt(&self, paddr: PAddr) -> VAddr {
        phys_to_direct_virt(paddr)
    }
}

#[derive(Clone, Copy)]
struct Entry(u64);

impl Entry {
    fn is_present(self) -> bool {
        self.0 & PteFlags::PRESENT.bits() != 0
    }

    fn addr(self) -> PAddr {
        PAddr::new((self.0 & ADDR_MASK) as usize)
    }

    fn pack(addr: PAddr, flags: PteFlags) -> Self {
        Entry((addr.get() as u64 & ADDR_MASK) | (flags | PteFlags::PRESENT).bits())
    }
}

fn table_at(alloc: &impl TableAlloc, paddr: PAddr) -> &'static mut [u64; 512] {
    let vaddr = alloc.phys_to_virt(paddr);
    unsafe { &mut *(vaddr.get() as *mut [u64; 512]) }
}

pub struct PageMap {
    root: PAddr,
}

impl PageMap {
    /// Allocates and zeroes a fresh top-level (PML4) table.
    pub fn new(alloc: &mut impl TableAlloc) -> KResult<Self> {
        let root = alloc.alloc_table().ok_or(KError::NoMemory)?;
        table_at(alloc, root).fill(0);
        Ok(Self { root })
    }

    pub fn root(&self) -> PAddr {
        self.root
    }

    fn walk_or_create(
        &mut self,
        alloc: &mut impl TableAlloc,
        vaddr: VAddr,
    ) -> KResult<&'static mut u64> {
        let mut table_paddr = self.root;
        for level in 0..3 {
            let table = table_at(alloc, table_paddr);
            let index = vaddr.index(level);
            let entry = Entry(table[index]);

            let next = if entry.is_present() {
                entry.addr()
            } else {
                let new_table = alloc.alloc_table().ok_or(KError::NoMemory)?;
                table_at(alloc, new_table).fill(0);
                let table = table_at(alloc, table_paddr);
                table[index] =
                    Entry::pack(new_table, PteFlags::RW | PteFlags::USER).0;
                new_table
            };
            table_paddr = next;
        }

        let table = table_at(alloc, table_paddr);
        let index = vaddr.index(3);
        Ok(&mut table[index])
    }

    fn walk(&self, alloc: &impl TableAlloc, vaddr: VAddr) -> Option<&'static mut u64> {
        let mut table_paddr = self.root;
        for level in 0..3 {
            let table = table_at(alloc, table_paddr);
            let entry = Entry(table[vaddr.index(level)]);
            if !entry.is_present() {
                return None;
            }
            table_paddr = entry.addr();
        }
        let table = table_at(alloc, table_paddr);
        Some(&mut table[vaddr.index(3)])
    }

    pub fn map(
        &mut self,
        alloc: &mut impl TableAlloc,
        paddr: PAddr,
        vaddr: VAddr,
        flags: PteFlags,
    ) -> KResult<()> {
        let pte = self.walk_or_create(alloc, vaddr)?;
        *pte = Entry::pack(paddr, flags).0;
        Ok(())
    }

    pub fn map_range(
        &mut self,
        alloc: &mut impl TableAlloc,
        paddr: PAddr,
        vaddr: VAddr,
        len: usize,
        flags: PteFlags,
    ) -> KResult<()> {
        let pages = len.div_ceil(PAGE_SIZE);
        for i in 0..pages {
            self.map(
                alloc,
                PAddr::new(paddr.get() + i * PAGE_SIZE),
                VAddr::new(vaddr.get() + (i * PAGE_SIZE) as u64),
                flags,
            )?;
        }
        Ok(())
    }

    pub fn unmap(&mut self, alloc: &impl TableAlloc, vaddr: VAddr) -> KResult<()> {
        let pte = self.walk(alloc, vaddr).ok_or(KError::NotFound)?;
        *pte = 0;
        invalidate_page(vaddr);
        Ok(())
    }

    pub fn unmap_range(&mut self, alloc: &impl TableAlloc, vaddr: VAddr, len: usize) -> KResult<()> {
        let pages = len.div_ceil(PAGE_SIZE);
        for i in 0..pages {
            self.unmap(alloc, VAddr::new(vaddr.get() + (i * PAGE_SIZE) as u64))?;
        }
        Ok(())
    }

    pub fn vaddr_to_paddr(&self, alloc: &impl TableAlloc, vaddr: VAddr) -> Option<PAddr> {
        let pte = self.walk(alloc, vaddr)?;
        let entry = Entry(*pte);
        if !entry.is_present() {
            return None;
        }
        Some(PAddr::new(entry.addr().get() + vaddr.page_offset()))
    }

    /// Atomic with respect to failure only in that a failed unmap is
    /// rolled back before returning (§4.2).
    pub fn remap(
        &mut self,
        alloc: &mut impl TableAlloc,
        old_vaddr: VAddr,
        new_paddr: PAddr,
        new_vaddr: VAddr,
        flags: PteFlags,
    ) -> KResult<()> {
        let old_paddr = self.vaddr_to_paddr(alloc, old_vaddr);

        if self.unmap(alloc, old_vaddr).is_err() {
            return Err(KError::NotFound);
        }

        if let Err(e) = self.map(alloc, new_paddr, new_vaddr, flags) {
            if let Some(old_paddr) = old_paddr {
                let _ = self.map(alloc, old_paddr, old_vaddr, flags);
            }
            return Err(e);
        }

        invalidate_page(old_vaddr);
        invalidate_page(new_vaddr);
        Ok(())
    }

    /// Writes this table's root into CR3 and activates it.
    ///
    /// # Safety
    /// The new table must map every address the CPU will dereference
    /// immediately after the switch (current code, current stack).
    #[cfg(target_arch = "x86_64")]
    pub unsafe fn load(&self) {
        unsafe {
            core::arch::asm!("mov cr3, {}", in(reg) self.root.get() as u64, options(nostack, preserves_flags));
        }
    }

    #[cfg(not(target_arch = "x86_64"))]
    pub unsafe fn load(&self) {}
}

#[cfg(target_arch = "x86_64")]
fn invalidate_page(vaddr: VAddr) {
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) vaddr.get(), options(nostack, preserves_flags));
    }
}

#[cfg(not(target_arch = "x86_64"))]
fn invalidate_page(_vaddr: VAddr) {}

#[cfg(test)]
extern crate std;

#[cfg(test)]
mod tests {
    use super::*;
    use std::vec::Vec;

    struct FakeFrames {
        arena_base: usize,
        next: usize,
        len: usize,
    }

    impl FakeFrames {
        fn new(len_pages: usize) -> (Self, Vec<u8>) {
            let backing = vec![0u8; len_pages * PAGE_SIZE + PAGE_SIZE];
            let base = backing.as_ptr() as usize;
            let aligned = (base + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
            (
                Self {
                    arena_base: aligned,
                    next: 0,
                    len: len_pages,
                },
                backing,
            )
        }
    }

    impl TableAlloc for FakeFrames {
        fn alloc_table(&mut self) -> Option<PAddr> {
            if self.next >= self.len {
                return None;
            }
            let addr = self.arena_base + self.next * PAGE_SIZE;
            self.next += 1;
            // "Physical" addresses here are just host pointers into the
            // backing Vec; phys_to_virt below is identity instead of the
            // real direct map.
            Some(PAddr::new(addr))
        }

        fn phys_to_virt(&self, paddr: PAddr) -> VAddr {
            VAddr::new(paddr.get() as u64)
        }
    }

    #[test]
    fn map_then_translate_roundtrips() {
        let (mut frames, _backing) = FakeFrames::new(16);
        let mut pt = PageMap::new(&mut frames).unwrap();

        let vaddr = VAddr::new(0x1000);
        let paddr = PAddr::new(0x2000);
        pt.map(&mut frames, paddr, vaddr, PteFlags::RW).unwrap();

        assert_eq!(
            pt.vaddr_to_paddr(&frames, vaddr).unwrap().get(),
            paddr.get()
        );
        assert_eq!(pt.vaddr_to_paddr(&frames, VAddr::new(0x3000)), None);
    }

    #[test]
    fn unmap_clears_translation() {
        let (mut frames, _backing) = FakeFrames::new(16);
        let mut pt = PageMap::new(&mut frames).unwrap();

        let vaddr = VAddr::new(0x500_000);
        pt.map(&mut frames, PAddr::new(0x9000), vaddr, PteFlags::RW)
            .unwrap();
        pt.unmap(&frames, vaddr).unwrap();
        assert_eq!(pt.vaddr_to_paddr(&frames, vaddr), None);
    }

    #[test]
    fn map_range_covers_every_page() {
        let (mut frames, _backing) = FakeFrames::new(16);
        let mut pt = PageMap::new(&mut frames).unwrap();

        pt.map_range(
            &mut frames,
            PAddr::new(0x10000),
            VAddr::new(0x700_000),
            3 * PAGE_SIZE,
            PteFlags::RW,
        )
        .unwrap();

        for i in 0..3 {
            let vaddr = VAddr::new(0x700_000 + (i * PAGE_SIZE) as u64);
            assert_eq!(pt.vaddr_to_paddr(&frames, vaddr).unwrap().get(), 0x10000 + i * PAGE_SIZE);
        }
    }
}
