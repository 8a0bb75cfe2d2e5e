//! Boot-time subsystem bring-up (§4.11).
//!
//! Sequences `PageAllocator -> PageMap -> KernelHeap -> global_alloc::install
//! -> SataPort -> Ext2Mount -> Vfs`, the dependency order implied by the
//! rest of this crate's module boundaries: nothing downstream can run
//! before the thing it borrows from exists. Mirrors the teacher's
//! `kernel_init::setup_memory` followed by driver bring-up, but stops once
//! the root `Vfs` is built instead of handing off to a scheduler — there is
//! none here.

use containers::KBox;

use crate::boot::{BootInfo, KernelPmr, MemoryRangeKind};
use crate::config::{DIRECT_MAP_BASE, HEAP_INITIAL_SIZE, HEAP_MAX_SIZE, HIGH_DIRECT_MAP_BASE};
use crate::driver::ahci::{AdapterControl, SataPort};
use crate::driver::serial;
use crate::error::{KError, KResult};
use crate::fs::ext2::{Ext2Mount, EXT2_PARTITION_TYPE_GUID};
use crate::mem::address::{PAddr, VAddr};
use crate::mem::global_alloc;
use crate::mem::heap::KernelHeap;
use crate::mem::page_alloc::{self, PageAllocator};
use crate::mem::page_table::{PageMap, PteFlags};
use crate::vfs::Vfs;

const FOUR_GIB: u64 = 4 << 30;

fn range_flags(kind: MemoryRangeKind) -> PteFlags {
    match kind {
        // Identity-mapped executable per §4.2: the bootloader may still be
        // executing out of a reclaimable range, and a framebuffer is code
        // in the loose sense of "the firmware jumps through it".
        MemoryRangeKind::BootloaderReclaimable | MemoryRangeKind::Framebuffer => PteFlags::RW,
        MemoryRangeKind::Usable | MemoryRangeKind::Reserved => PteFlags::RW | PteFlags::NX,
    }
}

fn pmr_flags(pmr: &KernelPmr) -> PteFlags {
    let mut flags = PteFlags::empty();
    if pmr.writable {
        flags |= PteFlags::RW;
    }
    if !pmr.executable {
        flags |= PteFlags::NX;
    }
    flags
}

/// Builds the kernel's own page table, double-mapping the low 4 GiB at
/// both identity and [`DIRECT_MAP_BASE`], double-mapping everything above
/// at identity and [`HIGH_DIRECT_MAP_BASE`], and remapping every kernel
/// PMR at its ELF virtual address. The old bootloader-provided mapping
/// stays live in CR3 until this table is installed with [`PageMap::load`]
/// — every `phys_to_direct_virt` lookup up to that point, including the
/// ones `init_page_allocator` itself performs, still resolves through it.
fn build_page_map(boot: &BootInfo, page_alloc: &mut PageAllocator) -> KResult<PageMap> {
    let mut page_map = PageMap::new(page_alloc)?;

    for entry in boot.memory_map.iter() {
        let flags = range_flags(entry.kind);
        let base = entry.base;
        let end = base + entry.length;

        page_map.map_range(
            page_alloc,
            PAddr::new(base as usize),
            VAddr::new(base),
            entry.length as usize,
            flags,
        )?;

        if base < FOUR_GIB {
            let low_len = (end.min(FOUR_GIB) - base) as usize;
            page_map.map_range(
                page_alloc,
                PAddr::new(base as usize),
                VAddr::new(DIRECT_MAP_BASE + base),
                low_len,
                flags,
            )?;
        }
        if end > FOUR_GIB {
            let high_base = base.max(FOUR_GIB);
            let high_len = (end - high_base) as usize;
            page_map.map_range(
                page_alloc,
                PAddr::new(high_base as usize),
                VAddr::new(HIGH_DIRECT_MAP_BASE + high_base),
                high_len,
                flags,
            )?;
        }
    }

    for pmr in boot.kernel_pmrs.iter() {
        page_map.map_range(
            page_alloc,
            PAddr::new(pmr.paddr as usize),
            VAddr::new(pmr.vaddr),
            pmr.length as usize,
            pmr_flags(pmr),
        )?;
    }

    Ok(page_map)
}

/// Probes every port the HBA reports as implemented and returns the first
/// one that answers with a live SATA signature. A multi-disk kernel would
/// keep all of them; this one only ever needs a boot disk.
fn bring_up_first_disk(control: &AdapterControl) -> KResult<SataPort> {
    let hba_ncq_capable = control.capabilities() & crate::config::HBA_CAP_SNCQ != 0;
    for nport in control.implemented_ports() {
        let regs = control.port_base(nport);
        let port = global_alloc::with_page_alloc(|page_alloc| unsafe {
            SataPort::new(regs, nport, hba_ncq_capable, page_alloc)
        })?;
        if port.status_ok() {
            return Ok(port);
        }
    }
    Err(KError::NotFound)
}

/// Finds the first GPT partition on `port` whose type GUID matches ext2
/// and returns its starting LBA.
fn find_ext2_partition(port: &SataPort) -> KResult<u64> {
    let mut n = 0;
    while let Some(guid) = port.nth_partition_type_guid(n) {
        if guid == EXT2_PARTITION_TYPE_GUID {
            let (start_lba, _len) = port.get_nth_partition(n).ok_or(KError::NotFound)?;
            return Ok(start_lba);
        }
        n += 1;
    }
    Err(KError::NotFound)
}

/// Runs the whole boot sequence and hands back a `Vfs` mounted on the
/// first ext2 partition found on the first live disk.
///
/// # Safety
/// Must run exactly once, at kernel entry, before any code relies on the
/// direct map, the heap, or a console; `boot` must be the handoff the
/// bootloader actually produced for this machine.
pub unsafe fn kernel_init(boot: BootInfo) -> KResult<Vfs> {
    unsafe {
        serial::init();
    }
    eonix_log::println_info!("kernel_init: starting");

    let mut page_alloc = unsafe { page_alloc::init_page_allocator(&boot) };
    let mut page_map = build_page_map(&boot, &mut page_alloc)?;
    unsafe {
        page_map.load();
    }
    eonix_log::println_info!("kernel_init: page table installed");

    let heap = KernelHeap::init(&mut page_alloc, &mut page_map, HEAP_INITIAL_SIZE, HEAP_MAX_SIZE)?;
    unsafe {
        global_alloc::install(page_alloc, page_map, heap);
    }
    eonix_log::println_info!("kernel_init: heap online");

    let ahci_base = boot.ahci_mmio_base.ok_or(KError::NotFound)?;
    let control = unsafe { AdapterControl::new(PAddr::new(ahci_base as usize)) };

    let port = bring_up_first_disk(&control)?;
    eonix_log::println_info!("kernel_init: disk online, queue depth {}", port.queue_depth());

    let partition_base = find_ext2_partition(&port)?;
    let mount = Ext2Mount::new(KBox::new(port), partition_base)?;
    eonix_log::println_info!("kernel_init: ext2 root mounted");

    Ok(Vfs::new(mount))
}
