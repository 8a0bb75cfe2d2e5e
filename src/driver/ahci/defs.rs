//! AHCI MMIO layouts, FIS frames, and command-structure constants (§4.4/§6).
//!
//! Every struct here is `repr(C)` and mirrors a byte-for-byte hardware or
//! wire layout; none of it is Rust-idiomatic by choice; it cannot be,
//! since the controller reads these bytes directly.

pub const GHC_AE: u32 = 0x8000_0000;

pub const PORT_CMD_ST: u32 = 0x0000_0001;
pub const PORT_CMD_FRE: u32 = 0x0000_0010;
pub const PORT_CMD_FR: u32 = 0x0000_4000;
pub const PORT_CMD_CR: u32 = 0x0000_8000;

pub const PORT_TFD_BSY: u32 = 0x80;
pub const PORT_TFD_DRQ: u32 = 0x08;
pub const PORT_TFD_ERR: u32 = 0x01;

pub const PORT_IS_TFES: u32 = 1 << 30;

pub const SATA_SIG_ATA: u32 = 0x0000_0101;
pub const SATA_STATUS_ACTIVE_PRESENT: u32 = 0x13;

pub const FIS_TYPE_REG_H2D: u8 = 0x27;
pub const FIS_TYPE_REG_D2H: u8 = 0x34;

pub const ATA_CMD_DMA_READ: u8 = 0x25;
pub const ATA_CMD_DMA_WRITE: u8 = 0x35;
pub const ATA_CMD_FPDMA_READ: u8 = 0x60;
pub const ATA_CMD_FPDMA_WRITE: u8 = 0x61;
pub const ATA_CMD_IDENTIFY: u8 = 0xec;
pub const ATA_CMD_READ_NATIVE_MAX_ADDR_EXT: u8 = 0x78;

pub const LBA_MODE: u8 = 0x40;

/// Per-port register block, at `abar + 0x100 + 0x80 * port`.
#[repr(C)]
pub struct HbaPort {
    pub command_list_base: u64,
    pub fis_base: u64,
    pub interrupt_status: u32,
    pub interrupt_enable: u32,
    pub command_status: u32,
    _reserved0: u32,
    pub task_file_data: u32,
    pub signature: u32,
    pub sata_status: u32,
    pub sata_control: u32,
    pub sata_error: u32,
    pub sata_active: u32,
    pub command_issue: u32,
    pub sata_notification: u32,
    pub fis_based_switch_control: u32,
    _reserved1: [u32; 11],
    _vendor: [u32; 4],
}

/// Controller-wide register block at the AHCI MMIO base (`abar`).
#[repr(C)]
pub struct HbaMem {
    pub capabilities: u32,
    pub global_host_control: u32,
    pub interrupt_status: u32,
    pub ports_implemented: u32,
    pub version: u32,
    pub cmd_completion_coalescing_control: u32,
    pub cmd_completion_coalescing_ports: u32,
    pub enclosure_mgmt_location: u32,
    pub enclosure_mgmt_control: u32,
    pub capabilities_ext: u32,
    pub bios_handoff_control_status: u32,
}

/// One command-list slot (32 bytes). The HBA reads this to find the
/// command table for a queued command.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct CommandHeader {
    /// bits [0:4] FIS length in dwords, [5] ATAPI, [6] write, [7] prefetchable
    pub flags_lo: u8,
    /// bits [0] reset, [1] bist, [2] clear-busy-on-ok, [4:7] port multiplier
    pub flags_hi: u8,
    pub prdt_length: u16,
    pub bytes_transferred: u32,
    pub command_table_base: u64,
    _reserved: [u32; 4],
}

impl CommandHeader {
    pub fn setup(&mut self, cmdtable_base: u64, prdt_entries: u16, write: bool) {
        self.flags_lo = (size_of::<FisH2D>() / 4) as u8;
        if write {
            self.flags_lo |= 1 << 6;
        }
        self.flags_hi = 0;
        self.prdt_length = prdt_entries;
        self.bytes_transferred = 0;
        self.command_table_base = cmdtable_base;
        self._reserved = [0; 4];
    }
}

/// Host-to-device register FIS, the command frame sent to the drive.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct FisH2D {
    pub fis_type: u8,
    /// bit 7: 1 = command, 0 = control
    pub flags: u8,
    pub command: u8,
    pub feature_lo: u8,
    pub lba0: u8,
    pub lba1: u8,
    pub lba2: u8,
    pub device: u8,
    pub lba3: u8,
    pub lba4: u8,
    pub lba5: u8,
    pub feature_hi: u8,
    pub count_lo: u8,
    pub count_hi: u8,
    pub icc: u8,
    pub control: u8,
    _reserved: [u8; 4],
}

impl FisH2D {
    pub fn setup_rw(&mut self, command: u8, lba: u64, count: u16, tag: u8, priority: u8, ncq: bool) {
        *self = FisH2D {
            fis_type: FIS_TYPE_REG_H2D,
            flags: 0x80,
            command,
            feature_lo: 0,
            lba0: lba as u8,
            lba1: (lba >> 8) as u8,
            lba2: (lba >> 16) as u8,
            device: LBA_MODE,
            lba3: (lba >> 24) as u8,
            lba4: (lba >> 32) as u8,
            lba5: (lba >> 40) as u8,
            feature_hi: 0,
            count_lo: 0,
            count_hi: 0,
            icc: 0,
            control: 0,
            _reserved: [0; 4],
        };

        if ncq {
            self.feature_lo = count as u8;
            self.feature_hi = (count >> 8) as u8;
            self.count_lo = tag << 3;
            self.count_hi = priority << 6;
        } else {
            self.count_lo = count as u8;
            self.count_hi = (count >> 8) as u8;
        }
    }

    pub fn setup_identify(&mut self, command: u8) {
        *self = FisH2D {
            fis_type: FIS_TYPE_REG_H2D,
            flags: 0x80,
            command,
            feature_lo: 0,
            lba0: 0,
            lba1: 0,
            lba2: 0,
            device: 0,
            lba3: 0,
            lba4: 0,
            lba5: 0,
            feature_hi: 0,
            count_lo: 0,
            count_hi: 0,
            icc: 0,
            control: 0,
            _reserved: [0; 4],
        };
    }
}

/// Device-to-host register FIS, the status frame the drive posts back.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct FisD2H {
    pub fis_type: u8,
    pub flags: u8,
    pub status: u8,
    pub error: u8,
    pub lba0: u8,
    pub lba1: u8,
    pub lba2: u8,
    pub device: u8,
    pub lba3: u8,
    pub lba4: u8,
    pub lba5: u8,
    _reserved1: u8,
    pub count_lo: u8,
    pub count_hi: u8,
    _reserved2: [u8; 6],
}

impl FisD2H {
    pub fn max_lba(&self) -> u64 {
        (self.lba0 as u64)
            | (self.lba1 as u64) << 8
            | (self.lba2 as u64) << 16
            | (self.lba3 as u64) << 24
            | (self.lba4 as u64) << 32
            | (self.lba5 as u64) << 40
    }
}

/// The area the controller writes received FISes into. Only the
/// device-to-host register FIS at a fixed offset is consulted here; the
/// rest is reserved for PIO/DMA setup FISes this driver never issues.
#[repr(C)]
pub struct ReceivedFis {
    _dma_setup: [u8; 32],
    _pio_setup: [u8; 20],
    _pad0: [u8; 12],
    pub reg: FisD2H,
    _pad1: [u8; 4],
    _set_device_bits: [u8; 8],
    _unknown: [u8; 64],
    _reserved: [u8; 96],
}

/// One scatter-gather entry. `byte_count` is the AHCI encoding
/// (actual byte count minus one).
#[repr(C)]
#[derive(Clone, Copy)]
pub struct PrdtEntry {
    pub base: u64,
    _reserved0: u32,
    /// bits [0:21] byte count - 1, bit [31] interrupt-on-completion
    pub shared: u32,
}

impl PrdtEntry {
    pub fn setup(&mut self, paddr: u64, len: usize) {
        self.base = paddr;
        self._reserved0 = 0;
        self.shared = 0x8000_0000 | ((len as u32 - 1) & 0x3f_ffff);
    }
}

/// One command table: a command FIS, an (unused) ATAPI command area, and
/// a fixed-size PRDT.
#[repr(C)]
pub struct CommandTable {
    pub cmd_fis: FisH2D,
    _cmd_fis_pad: [u8; 64 - size_of::<FisH2D>()],
    _atapi_cmd: [u8; 16],
    _reserved: [u8; 48],
    pub prdt: [PrdtEntry; crate::config::AHCI_PRDT_COUNT],
}
