//! The bootloader handoff surface.
//!
//! The bootloader (out of scope per §1) hands the kernel a memory map, a
//! list of pre-parsed PMRs (Protected Memory Ranges — the kernel's own
//! ELF segments, already resolved to `{vaddr, paddr}` pairs so no ELF
//! parser is needed here), and an ACPI RSDP physical address that is
//! carried through but never parsed (ACPI/PCIe enumeration is a sibling
//! concern that yields the AHCI MMIO base address this kernel is handed
//! directly).

use containers::KVec;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryRangeKind {
    Usable,
    Reserved,
    BootloaderReclaimable,
    Framebuffer,
}

#[derive(Debug, Clone, Copy)]
pub struct MemoryMapEntry {
    pub base: u64,
    pub length: u64,
    pub kind: MemoryRangeKind,
}

/// One ELF segment of the running kernel image, already parsed by the
/// bootloader into the fields `PageMap::map_range` needs.
#[derive(Debug, Clone, Copy)]
pub struct KernelPmr {
    pub vaddr: u64,
    pub paddr: u64,
    pub length: u64,
    pub readable: bool,
    pub writable: bool,
    pub executable: bool,
}

pub struct BootInfo {
    pub memory_map: KVec<MemoryMapEntry>,
    pub kernel_pmrs: KVec<KernelPmr>,
    /// Physical address of the ACPI RSDP. Carried through unparsed —
    /// ACPI/PCIe table walking is out of scope (§1).
    pub acpi_rsdp: u64,
    /// AHCI controller MMIO base address, already resolved by PCIe
    /// enumeration (out of scope; see §1's "yields an AHCI MMIO base
    /// address").
    pub ahci_mmio_base: Option<u64>,
}

impl BootInfo {
    pub fn usable_ranges(&self) -> impl Iterator<Item = &MemoryMapEntry> {
        self.memory_map
            .iter()
            .filter(|e| e.kind == MemoryRangeKind::Usable)
    }
}
