//! One AHCI port driving a single SATA drive (§4.4).
//!
//! The scheduling model is polled throughout: "the AHCI controller is
//! programmed by memory-mapped I/O and polled to completion" (§6) — there
//! is no interrupt-driven completion anywhere in this driver. A single
//! `IDENTIFY`/GPT-read command and any uncached single-range read/write
//! issued through [`SataPort::read`]/[`SataPort::write`] go through slot
//! 0 alone, polled to completion before the next command is issued
//! through the same slot, exactly as §6 describes. The one place more
//! than one slot is ever armed at once is [`SataPort::raw_read_ncq`],
//! used to fetch a long uncached run: it stages several FPDMA reads on
//! distinct slots, activates them together, and waits once on the
//! combined `sata_active` bitmap (§4.4 "Range batching") — gated on
//! [`SataPort::ncq_capable`], computed from both the HBA's capability
//! register and the device's own `IDENTIFY` data rather than hard-coded
//! disabled (§9 "NCQ capability").

use core::ptr::NonNull;

use buddy_allocator::PAddr;
use containers::{KVec, LruCache};

use crate::config::{
    AHCI_NCQ_BATCH, AHCI_NCQ_SLOT_SECTORS, AHCI_NUM_SLOTS, AHCI_PRDT_COUNT, AHCI_PRDT_SIZE,
    SECTOR_CACHE_CAPACITY, SECTOR_SIZE,
};
use crate::error::{KError, KResult};
use crate::mem::address::phys_to_direct_virt;
use crate::mem::page_alloc::PageAllocator;

use super::defs::{
    CommandHeader, CommandTable, HbaPort, ATA_CMD_DMA_READ, ATA_CMD_DMA_WRITE,
    ATA_CMD_FPDMA_READ, ATA_CMD_FPDMA_WRITE, ATA_CMD_IDENTIFY, PORT_CMD_CR, PORT_CMD_FR,
    PORT_CMD_FRE, PORT_CMD_ST, PORT_IS_TFES, PORT_TFD_BSY, PORT_TFD_DRQ, SATA_SIG_ATA,
    SATA_STATUS_ACTIVE_PRESENT,
};
use super::gpt::{self, Gpt};
use super::register::Register;

const SPINWAIT_MAX: usize = 100_000;
const DMA_BOUNCE_SECTORS: usize = 128;
const DMA_BOUNCE_BYTES: usize = DMA_BOUNCE_SECTORS * SECTOR_SIZE;
const NCQ_BOUNCE_BYTES: usize = AHCI_NCQ_BATCH * AHCI_NCQ_SLOT_SECTORS * SECTOR_SIZE;

struct CachedSector {
    data: [u8; SECTOR_SIZE],
    dirty: bool,
}

pub struct SataPort {
    nport: u32,
    regs: PAddr,

    cmd_list_paddr: PAddr,
    cmd_list: &'static mut [CommandHeader; AHCI_NUM_SLOTS],

    fis_paddr: PAddr,

    cmd_tables_paddr: PAddr,
    cmd_tables: &'static mut [CommandTable; AHCI_NUM_SLOTS],

    dma_paddr: PAddr,
    dma: &'static mut [u8; DMA_BOUNCE_BYTES],

    /// Per-slot bounce region for NCQ-batched dispatch, `AHCI_NCQ_BATCH`
    /// slots' worth of `AHCI_NCQ_SLOT_SECTORS` sectors each; unused
    /// (never allocated from) on a port that doesn't end up NCQ-capable.
    ncq_paddr: PAddr,
    ncq_dma: &'static mut [u8; NCQ_BOUNCE_BYTES],

    max_lba: u64,
    queue_depth: u16,
    /// Device- and HBA-level NCQ support, gated on both the HBA's
    /// capability register bit 30 and the queue-depth field of
    /// `IDENTIFY` word 75 (§9 "NCQ capability": the source hard-codes
    /// this false; this port actually uses it).
    ncq_capable: bool,
    cache: LruCache<u64, CachedSector>,
    gpt: Option<Gpt>,
}

fn reg32(base: PAddr) -> Register<u32> {
    let addr = phys_to_direct_virt(base).get() as usize;
    unsafe { Register::new(NonNull::new(addr as *mut u32).unwrap()) }
}

fn reg64(base: PAddr) -> Register<u64> {
    let addr = phys_to_direct_virt(base).get() as usize;
    unsafe { Register::new(NonNull::new(addr as *mut u64).unwrap()) }
}

impl SataPort {
    fn field_u32(&self, offset: usize) -> Register<u32> {
        reg32(PAddr::new(self.regs.get() + offset))
    }

    fn field_u64(&self, offset: usize) -> Register<u64> {
        reg64(PAddr::new(self.regs.get() + offset))
    }

    fn hw(&self) -> &HbaPort {
        unsafe { &*(phys_to_direct_virt(self.regs).get() as *const HbaPort) }
    }

    pub fn status_ok(&self) -> bool {
        let sata_status = self.hw().sata_status;
        let signature = self.hw().signature;
        (sata_status & 0xf) as u32 == SATA_STATUS_ACTIVE_PRESENT && signature == SATA_SIG_ATA
    }

    /// Allocates the command list, received-FIS area, command-table
    /// region and a reusable DMA bounce buffer, then brings the port up.
    ///
    /// # Safety
    /// `regs` must be the physical address of a live, AHCI-mode port's
    /// register block, and the caller must have already confirmed
    /// `status_ok` if it wants to skip probing a dead port.
    pub unsafe fn new(
        regs: PAddr,
        nport: u32,
        hba_ncq_capable: bool,
        page_alloc: &mut PageAllocator,
    ) -> KResult<Self> {
        let cmd_list_paddr = page_alloc.allocate(4096).ok_or(KError::NoMemory)?;
        let fis_paddr = page_alloc.allocate(4096).ok_or(KError::NoMemory)?;
        let cmd_tables_paddr = page_alloc
            .allocate(AHCI_NUM_SLOTS * size_of::<CommandTable>())
            .ok_or(KError::NoMemory)?;
        let dma_paddr = page_alloc
            .allocate(DMA_BOUNCE_BYTES)
            .ok_or(KError::NoMemory)?;
        let ncq_paddr = page_alloc
            .allocate(NCQ_BOUNCE_BYTES)
            .ok_or(KError::NoMemory)?;

        let cmd_list: &'static mut [CommandHeader; AHCI_NUM_SLOTS] =
            unsafe { &mut *(phys_to_direct_virt(cmd_list_paddr).get() as *mut _) };
        let cmd_tables: &'static mut [CommandTable; AHCI_NUM_SLOTS] =
            unsafe { &mut *(phys_to_direct_virt(cmd_tables_paddr).get() as *mut _) };
        let dma: &'static mut [u8; DMA_BOUNCE_BYTES] =
            unsafe { &mut *(phys_to_direct_virt(dma_paddr).get() as *mut _) };
        let ncq_dma: &'static mut [u8; NCQ_BOUNCE_BYTES] =
            unsafe { &mut *(phys_to_direct_virt(ncq_paddr).get() as *mut _) };

        unsafe {
            core::ptr::write_bytes(cmd_list.as_mut_ptr(), 0, AHCI_NUM_SLOTS);
            core::ptr::write_bytes(
                phys_to_direct_virt(fis_paddr).get() as *mut u8,
                0,
                4096,
            );
            core::ptr::write_bytes(cmd_tables.as_mut_ptr(), 0, AHCI_NUM_SLOTS);
        }

        for (i, header) in cmd_list.iter_mut().enumerate() {
            let table_paddr = cmd_tables_paddr.get() + i * size_of::<CommandTable>();
            header.command_table_base = table_paddr as u64;
        }

        let mut port = Self {
            nport,
            regs,
            cmd_list_paddr,
            cmd_list,
            fis_paddr,
            cmd_tables_paddr,
            cmd_tables,
            dma_paddr,
            dma,
            ncq_paddr,
            ncq_dma,
            max_lba: 0,
            queue_depth: 1,
            ncq_capable: false,
            cache: LruCache::new(SECTOR_CACHE_CAPACITY),
            gpt: None,
        };

        port.configure()?;
        port.identify(hba_ncq_capable)?;
        port.gpt = port.read_gpt().ok();

        Ok(port)
    }

    fn suspend_commands(&self) -> KResult<()> {
        let cmd_status = self.field_u32(core::mem::offset_of!(HbaPort, command_status));
        let value = cmd_status.read();
        if value & PORT_CMD_ST != 0 {
            cmd_status.write(value & !PORT_CMD_ST);
        }
        let value = cmd_status.read();
        if value & PORT_CMD_FRE != 0 {
            cmd_status.write(value & !PORT_CMD_FRE);
        }
        if !cmd_status.spinwait_clear(PORT_CMD_CR | PORT_CMD_FR, SPINWAIT_MAX) {
            return Err(KError::HardwareFault);
        }
        Ok(())
    }

    fn activate_commands(&self) -> KResult<()> {
        let cmd_status = self.field_u32(core::mem::offset_of!(HbaPort, command_status));
        if !cmd_status.spinwait_clear(1 << 15, SPINWAIT_MAX) {
            return Err(KError::HardwareFault);
        }
        let value = cmd_status.read();
        cmd_status.write(value | PORT_CMD_FRE | PORT_CMD_ST);
        Ok(())
    }

    fn configure(&mut self) -> KResult<()> {
        self.suspend_commands()?;
        self.field_u64(core::mem::offset_of!(HbaPort, command_list_base))
            .write(self.cmd_list_paddr.get() as u64);
        self.field_u64(core::mem::offset_of!(HbaPort, fis_base))
            .write(self.fis_paddr.get() as u64);
        self.field_u32(core::mem::offset_of!(HbaPort, interrupt_enable))
            .write(0);
        self.activate_commands()
    }

    fn task_file_busy(&self) -> bool {
        self.hw().task_file_data & (PORT_TFD_BSY | PORT_TFD_DRQ) != 0
    }

    fn op_failed(&self) -> bool {
        let tfd = self.hw().task_file_data;
        let is = self.hw().interrupt_status;
        let serr = self.hw().sata_error;
        tfd & PORT_TFD_ERR != 0 || is & PORT_IS_TFES != 0 || serr != 0
    }

    /// Issues whatever is set up in slot 0's header and polls to
    /// completion, or to a hardware-fault verdict.
    fn run_slot0(&mut self) -> KResult<()> {
        if !self
            .field_u32(core::mem::offset_of!(HbaPort, command_status))
            .spinwait_clear(0, 0)
        {
            // never actually waits; kept for symmetry with the busy poll below
        }

        let mut spins = 0;
        while self.task_file_busy() {
            if spins == SPINWAIT_MAX {
                return Err(KError::HardwareFault);
            }
            spins += 1;
            core::hint::spin_loop();
        }

        self.activate_commands()?;
        self.field_u32(core::mem::offset_of!(HbaPort, command_issue))
            .write(1);

        let mut spins = 0;
        loop {
            let issue = self.field_u32(core::mem::offset_of!(HbaPort, command_issue)).read();
            if issue & 1 == 0 {
                break;
            }
            if self.op_failed() {
                self.suspend_commands()?;
                return Err(KError::HardwareFault);
            }
            if spins == SPINWAIT_MAX {
                self.suspend_commands()?;
                return Err(KError::HardwareFault);
            }
            spins += 1;
            core::hint::spin_loop();
        }

        let failed = self.op_failed();
        self.suspend_commands()?;
        if failed {
            return Err(KError::HardwareFault);
        }
        Ok(())
    }

    fn setup_prdt(&mut self, paddr: u64, len: usize) -> usize {
        let table = &mut self.cmd_tables[0];
        let mut remaining = len;
        let mut offset: u64 = 0;
        let mut entries = 0;
        while remaining > 0 && entries < AHCI_PRDT_COUNT {
            let chunk = remaining.min(AHCI_PRDT_SIZE as usize);
            table.prdt[entries].setup(paddr + offset, chunk);
            remaining -= chunk;
            offset += chunk as u64;
            entries += 1;
        }
        entries
    }

    fn identify(&mut self, hba_ncq_capable: bool) -> KResult<()> {
        let prdt_entries = self.setup_prdt(self.dma_paddr.get() as u64, SECTOR_SIZE);
        self.cmd_tables[0].cmd_fis.setup_identify(ATA_CMD_IDENTIFY);
        self.cmd_list[0].setup(
            self.cmd_tables_paddr.get() as u64,
            prdt_entries as u16,
            false,
        );

        self.run_slot0()?;

        let info = self.dma;
        let word75 = u16::from_le_bytes([info[150], info[151]]);
        self.queue_depth = (word75 & 0x1f) + 1;
        // Bit 30 of word 76 (the SATA capabilities word) also reports
        // per-device NCQ support; gate on both it and the HBA-wide
        // capability so neither side can claim NCQ the other can't back
        // (§9 "NCQ capability").
        let word76 = u16::from_le_bytes([info[152], info[153]]);
        let device_ncq = word76 & (1 << 8) != 0;
        self.ncq_capable = hba_ncq_capable && device_ncq && self.queue_depth > 1;

        let mut max_lba_bytes = [0u8; 8];
        max_lba_bytes[0..8].copy_from_slice(&info[200..208]);
        self.max_lba = u64::from_le_bytes(max_lba_bytes);

        eonix_log::println_debug!(
            "ahci: port {} identified, max_lba={}, queue_depth={}, ncq={}",
            self.nport,
            self.max_lba,
            self.queue_depth,
            self.ncq_capable
        );
        Ok(())
    }

    fn disk_read_write(&mut self, lba: u64, num_sectors: usize, write: bool) -> KResult<()> {
        if lba + num_sectors as u64 > self.max_lba {
            return Err(KError::InvalidArgument);
        }

        let len = num_sectors * SECTOR_SIZE;
        let prdt_entries = self.setup_prdt(self.dma_paddr.get() as u64, len);

        let command = if write {
            ATA_CMD_DMA_WRITE
        } else {
            ATA_CMD_DMA_READ
        };
        self.cmd_tables[0]
            .cmd_fis
            .setup_rw(command, lba, num_sectors as u16, 0, 0, false);
        self.cmd_list[0].setup(
            self.cmd_tables_paddr.get() as u64,
            prdt_entries as u16,
            write,
        );

        self.run_slot0()
    }

    /// Reads `num_sectors` sectors starting at `lba` into `buf`: via
    /// concurrent NCQ-tagged slots when the device and HBA both support
    /// it, otherwise through the single-slot bounce buffer in
    /// `DMA_BOUNCE_SECTORS`-sized chunks (§9 "NCQ capability").
    fn raw_read(&mut self, lba: u64, num_sectors: usize, buf: &mut [u8]) -> KResult<()> {
        if self.ncq_capable {
            return self.raw_read_ncq(lba, num_sectors, buf);
        }
        let mut done = 0;
        while done < num_sectors {
            let chunk = (num_sectors - done).min(DMA_BOUNCE_SECTORS);
            self.disk_read_write(lba + done as u64, chunk, false)?;
            buf[done * SECTOR_SIZE..(done + chunk) * SECTOR_SIZE]
                .copy_from_slice(&self.dma[..chunk * SECTOR_SIZE]);
            done += chunk;
        }
        Ok(())
    }

    /// NCQ-accelerated form of [`SataPort::raw_read`]: splits the run
    /// into `AHCI_NCQ_SLOT_SECTORS`-sized pieces and dispatches up to
    /// `AHCI_NCQ_BATCH` of them per wave, each on its own command slot
    /// and its own slice of the per-port NCQ bounce region, waiting once
    /// on the combined `sata_active`/`command_issue` mask per wave (§4.4
    /// "Range batching").
    fn raw_read_ncq(&mut self, lba: u64, num_sectors: usize, buf: &mut [u8]) -> KResult<()> {
        let mut done = 0usize;
        while done < num_sectors {
            let mut ranges: KVec<(u64, usize)> = KVec::new();
            let mut wave_sectors = 0usize;
            while ranges.len() < AHCI_NCQ_BATCH && done + wave_sectors < num_sectors {
                let chunk = (num_sectors - done - wave_sectors).min(AHCI_NCQ_SLOT_SECTORS);
                ranges.push((lba + (done + wave_sectors) as u64, chunk));
                wave_sectors += chunk;
            }

            self.issue_ncq_wave(&ranges, false)?;

            let mut buf_off = done * SECTOR_SIZE;
            for (slot, &(_, chunk)) in ranges.iter().enumerate() {
                let len = chunk * SECTOR_SIZE;
                let bounce_off = slot * AHCI_NCQ_SLOT_SECTORS * SECTOR_SIZE;
                buf[buf_off..buf_off + len]
                    .copy_from_slice(&self.ncq_dma[bounce_off..bounce_off + len]);
                buf_off += len;
            }

            done += wave_sectors;
        }
        Ok(())
    }

    /// Arms `ranges.len()` (at most `AHCI_NCQ_BATCH`) FPDMA commands on
    /// slots `0..ranges.len()`, each tagged with its own slot number and
    /// pointing at its own slice of the NCQ bounce region, activates
    /// them together, and waits on the combined `sata_active` /
    /// `command_issue` mask clearing — the "disjoint slots... single
    /// wait... combined bitmap" dispatch §4.4 describes.
    fn issue_ncq_wave(&mut self, ranges: &[(u64, usize)], write: bool) -> KResult<()> {
        let cmd_tables_paddr = self.cmd_tables_paddr.get() as u64;
        let ncq_paddr = self.ncq_paddr.get() as u64;

        let mut tag_mask: u32 = 0;
        for (slot, &(lba, num_sectors)) in ranges.iter().enumerate() {
            let len = num_sectors * SECTOR_SIZE;
            let bounce_paddr = ncq_paddr + (slot * AHCI_NCQ_SLOT_SECTORS * SECTOR_SIZE) as u64;

            let entries = {
                let table = &mut self.cmd_tables[slot];
                let mut remaining = len;
                let mut off = 0u64;
                let mut entries = 0;
                while remaining > 0 && entries < AHCI_PRDT_COUNT {
                    let chunk = remaining.min(AHCI_PRDT_SIZE as usize);
                    table.prdt[entries].setup(bounce_paddr + off, chunk);
                    remaining -= chunk;
                    off += chunk as u64;
                    entries += 1;
                }
                let command = if write {
                    ATA_CMD_FPDMA_WRITE
                } else {
                    ATA_CMD_FPDMA_READ
                };
                table
                    .cmd_fis
                    .setup_rw(command, lba, num_sectors as u16, slot as u8, 0, true);
                entries
            };

            let table_paddr = cmd_tables_paddr + slot as u64 * size_of::<CommandTable>() as u64;
            self.cmd_list[slot].setup(table_paddr, entries as u16, write);

            tag_mask |= 1 << slot;
        }

        self.activate_commands()?;
        self.field_u32(core::mem::offset_of!(HbaPort, sata_active))
            .write(tag_mask);
        self.field_u32(core::mem::offset_of!(HbaPort, command_issue))
            .write(tag_mask);

        let mut spins = 0;
        loop {
            let sact = self
                .field_u32(core::mem::offset_of!(HbaPort, sata_active))
                .read();
            let ci = self
                .field_u32(core::mem::offset_of!(HbaPort, command_issue))
                .read();
            if (sact | ci) & tag_mask == 0 {
                break;
            }
            if self.op_failed() {
                self.suspend_commands()?;
                return Err(KError::HardwareFault);
            }
            if spins == SPINWAIT_MAX {
                self.suspend_commands()?;
                return Err(KError::HardwareFault);
            }
            spins += 1;
            core::hint::spin_loop();
        }

        let failed = self.op_failed();
        self.suspend_commands()?;
        if failed {
            return Err(KError::HardwareFault);
        }
        Ok(())
    }

    /// Walks `[lba, lba+num_sectors)` splicing cache hits with bulk reads
    /// of the contiguous uncached runs in between; writes go straight to
    /// the cache ("written-around") and are flushed lazily on eviction
    /// (§4.4 "Sector cache").
    fn cache_read_write(&mut self, lba: u64, num_sectors: usize, buf: &mut [u8], write: bool) -> KResult<()> {
        let mut i = 0;
        while i < num_sectors {
            let first_uncached = i;
            let mut uncached = 0;
            while i < num_sectors && !self.cache.contains(&(lba + i as u64)) {
                i += 1;
                uncached += 1;
            }

            if uncached > 0 {
                let off = first_uncached * SECTOR_SIZE;
                if !write {
                    self.raw_read(
                        lba + first_uncached as u64,
                        uncached,
                        &mut buf[off..off + uncached * SECTOR_SIZE],
                    )?;
                }

                for j in 0..uncached {
                    let sector_lba = lba + first_uncached as u64 + j as u64;
                    let mut data = [0u8; SECTOR_SIZE];
                    let src = off + j * SECTOR_SIZE;
                    data.copy_from_slice(&buf[src..src + SECTOR_SIZE]);
                    self.insert_cache_entry(sector_lba, CachedSector { data, dirty: write });
                }
            }

            if i < num_sectors {
                let sector_lba = lba + i as u64;
                let off = i * SECTOR_SIZE;
                if write {
                    let mut data = [0u8; SECTOR_SIZE];
                    data.copy_from_slice(&buf[off..off + SECTOR_SIZE]);
                    // `sector_lba` was seen as cached by the `contains` scan
                    // above, but inserting the preceding uncached run can
                    // itself evict it (a long run against a small
                    // `SECTOR_CACHE_CAPACITY`) — fall back to a fresh insert
                    // rather than assuming the entry survived.
                    match self.cache.get_mut(&sector_lba) {
                        Some(cached) => {
                            cached.data = data;
                            cached.dirty = true;
                        }
                        None => self.insert_cache_entry(sector_lba, CachedSector { data, dirty: true }),
                    }
                } else {
                    match self.cache.get_mut(&sector_lba) {
                        Some(cached) => buf[off..off + SECTOR_SIZE].copy_from_slice(&cached.data),
                        None => {
                            self.raw_read(sector_lba, 1, &mut buf[off..off + SECTOR_SIZE])?;
                            let mut data = [0u8; SECTOR_SIZE];
                            data.copy_from_slice(&buf[off..off + SECTOR_SIZE]);
                            self.insert_cache_entry(sector_lba, CachedSector { data, dirty: false });
                        }
                    }
                }
                i += 1;
            }
        }

        Ok(())
    }

    /// Inserts a freshly read or written sector into the cache. If this
    /// evicts a dirty entry, the evicted sector is written back directly
    /// through slot 0 before its memory is released: the eviction
    /// closure only captures the disjoint fields it needs (disk
    /// registers, command structures, the bounce buffer), never `cache`
    /// itself, so there is no owning pointer from a cache entry back to
    /// the port (§4.4 design notes).
    fn insert_cache_entry(&mut self, lba: u64, entry: CachedSector) {
        let regs = self.regs;
        let cmd_tables_paddr = self.cmd_tables_paddr;
        let dma_paddr = self.dma_paddr;
        let cmd_list = &mut *self.cmd_list;
        let cmd_tables = &mut *self.cmd_tables;
        let dma = &mut *self.dma;

        self.cache.insert(lba, entry, |evicted_lba, evicted| {
            if evicted.dirty {
                dma[..SECTOR_SIZE].copy_from_slice(&evicted.data);
                write_back_sector(regs, cmd_list, cmd_tables, cmd_tables_paddr, dma_paddr, evicted_lba);
            }
        });
    }

    pub fn read(&mut self, lba: u64, num_sectors: usize, buf: &mut [u8]) -> KResult<()> {
        self.cache_read_write(lba, num_sectors, buf, false)
    }

    pub fn write(&mut self, lba: u64, num_sectors: usize, buf: &[u8]) -> KResult<()> {
        let mut scratch = KVec::with_capacity(num_sectors * SECTOR_SIZE);
        scratch.extend_from_slice(buf);
        self.cache_read_write(lba, num_sectors, &mut scratch, true)
    }

    /// Batched form of [`SataPort::read`]: dispatches each `(lba,
    /// num_sectors)` range in turn against `buf`'s matching slice (§4.4
    /// "Range batching"). Each range still goes through the per-LBA
    /// sector cache exactly as [`SataPort::read`] does (so cache
    /// consistency across a batched call is identical to the same reads
    /// issued one at a time); the concurrency this section of the spec
    /// asks for happens one level down, in the uncached-run fetch inside
    /// [`SataPort::raw_read`], which dispatches multiple NCQ-tagged slots
    /// at once when the device and HBA both support it.
    pub fn read_ranges(&mut self, ranges: &[(u64, usize)], buf: &mut [u8]) -> KResult<()> {
        let mut offset = 0usize;
        for &(lba, num_sectors) in ranges {
            let len = num_sectors * SECTOR_SIZE;
            self.read(lba, num_sectors, &mut buf[offset..offset + len])?;
            offset += len;
        }
        Ok(())
    }

    /// Batched form of [`SataPort::write`]; see [`SataPort::read_ranges`].
    pub fn write_ranges(&mut self, ranges: &[(u64, usize)], buf: &[u8]) -> KResult<()> {
        let mut offset = 0usize;
        for &(lba, num_sectors) in ranges {
            let len = num_sectors * SECTOR_SIZE;
            self.write(lba, num_sectors, &buf[offset..offset + len])?;
            offset += len;
        }
        Ok(())
    }

    pub fn queue_depth(&self) -> u16 {
        self.queue_depth
    }

    fn read_gpt(&mut self) -> KResult<Gpt> {
        let mut header_sector = [0u8; SECTOR_SIZE];
        self.raw_read(1, 1, &mut header_sector)?;
        let header = gpt::Gpt::peek_header(&header_sector)?;

        let entry_sectors = Gpt::entry_array_sectors(&header);
        let mut entries = KVec::with_capacity(entry_sectors * SECTOR_SIZE);
        entries.resize(entry_sectors * SECTOR_SIZE, 0);
        self.raw_read(header.entry_arr_lba, entry_sectors, &mut entries)?;

        Gpt::parse(&header_sector, &entries)
    }

    pub fn find_partition_by_guid(&self, type_guid_lo: u64, type_guid_hi: u64) -> Option<(u64, u64)> {
        self.gpt
            .as_ref()?
            .find_by_guid(type_guid_lo, type_guid_hi)
            .map(gpt::partition_range)
    }

    pub fn get_nth_partition(&self, n: usize) -> Option<(u64, u64)> {
        self.gpt.as_ref()?.nth(n).map(gpt::partition_range)
    }

    /// The n-th partition's type GUID, so a caller (the VFS's `mount`)
    /// can check it against the filesystem it knows how to read before
    /// committing to `get_nth_partition`'s sector range.
    pub fn nth_partition_type_guid(&self, n: usize) -> Option<(u64, u64)> {
        let entry = self.gpt.as_ref()?.nth(n)?;
        Some((entry.type_guid_lo, entry.type_guid_hi))
    }

    pub fn nport(&self) -> u32 {
        self.nport
    }
}

/// Writes one sector directly to disk via slot 0, used from the cache's
/// eviction closure where `self` is already split by field to satisfy
/// the borrow checker (disjoint captures, §4.4 design notes on
/// avoiding an owning back-reference from cache entries to the port).
fn write_back_sector(
    regs: PAddr,
    cmd_list: &mut [CommandHeader; AHCI_NUM_SLOTS],
    cmd_tables: &mut [CommandTable; AHCI_NUM_SLOTS],
    cmd_tables_paddr: PAddr,
    dma_paddr: PAddr,
    lba: u64,
) {
    cmd_tables[0]
        .cmd_fis
        .setup_rw(ATA_CMD_DMA_WRITE, lba, 1, 0, 0, false);
    cmd_tables[0].prdt[0].setup(dma_paddr.get() as u64, SECTOR_SIZE);
    cmd_list[0].setup(cmd_tables_paddr.get() as u64, 1, true);

    let cmd_status = reg32(PAddr::new(regs.get() + core::mem::offset_of!(HbaPort, command_status)));
    let mut spins = 0;
    while cmd_status.read() & (1 << 15) != 0 {
        if spins == SPINWAIT_MAX {
            return;
        }
        spins += 1;
    }
    let value = cmd_status.read();
    cmd_status.write(value | PORT_CMD_FRE | PORT_CMD_ST);

    let ci = reg32(PAddr::new(regs.get() + core::mem::offset_of!(HbaPort, command_issue)));
    ci.write(1);

    let tfd = reg32(PAddr::new(regs.get() + core::mem::offset_of!(HbaPort, task_file_data)));
    let mut spins = 0;
    while ci.read() & 1 != 0 {
        if tfd.read() & PORT_TFD_ERR != 0 || spins == SPINWAIT_MAX {
            break;
        }
        spins += 1;
        core::hint::spin_loop();
    }

    let cmd_status_off = core::mem::offset_of!(HbaPort, command_status);
    let cmd_status = reg32(PAddr::new(regs.get() + cmd_status_off));
    let value = cmd_status.read();
    cmd_status.write(value & !(PORT_CMD_ST | PORT_CMD_FRE));
}
