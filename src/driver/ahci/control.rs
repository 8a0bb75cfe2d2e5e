//! Global HBA control: the `HbaMem` block that precedes the per-port
//! register arrays (§4.4, §6 "AHCI MMIO").

use core::ptr::NonNull;

use crate::mem::address::phys_to_direct_virt;
use buddy_allocator::PAddr;

use super::defs::{HbaMem, HbaPort, GHC_AE};
use super::register::Register;

/// Iterates the set bits of a 32-bit bitmap, least-significant first.
/// Used for both `ports_implemented` and `interrupt_status`.
pub struct BitsIter {
    remaining: u32,
}

impl BitsIter {
    pub fn new(bits: u32) -> Self {
        Self { remaining: bits }
    }
}

impl Iterator for BitsIter {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        if self.remaining == 0 {
            return None;
        }
        let bit = self.remaining.trailing_zeros();
        self.remaining &= !(1 << bit);
        Some(bit)
    }
}

pub struct AdapterControl {
    base: PAddr,
}

impl AdapterControl {
    /// # Safety
    /// `base` must be the physical base address of a live AHCI HBA's
    /// MMIO register block.
    pub unsafe fn new(base: PAddr) -> Self {
        let control = Self { base };
        // Firmware almost always leaves this set, but nothing downstream
        // (port registers, command lists) is architecturally guaranteed
        // live until the OS asserts it itself.
        let ghc = control.field(core::mem::offset_of!(HbaMem, global_host_control));
        ghc.write(ghc.read() | GHC_AE);
        control
    }

    fn hba(&self) -> &HbaMem {
        unsafe { &*(phys_to_direct_virt(self.base).get() as *const HbaMem) }
    }

    fn field(&self, offset: usize) -> Register<u32> {
        let addr = phys_to_direct_virt(self.base).get() as usize + offset;
        unsafe { Register::new(NonNull::new(addr as *mut u32).unwrap()) }
    }

    /// The HBA-wide capability register (`CAP`), bit 30 of which is
    /// "Supports Native Command Queuing" — gates whether any port's
    /// reported `IDENTIFY` queue depth is trustworthy (§4.4, §9 "NCQ
    /// capability").
    pub fn capabilities(&self) -> u32 {
        self.hba().capabilities
    }

    pub fn implemented_ports(&self) -> BitsIter {
        BitsIter::new(self.hba().ports_implemented)
    }

    pub fn pending_interrupts(&self) -> BitsIter {
        BitsIter::new(self.hba().interrupt_status)
    }

    pub fn clear_interrupt(&self, nport: u32) {
        let is = self.field(core::mem::offset_of!(HbaMem, interrupt_status));
        is.write(1 << nport);
    }

    /// Physical address of the per-port register block for `nport`.
    pub fn port_base(&self, nport: u32) -> PAddr {
        PAddr::new(self.base.get() + 0x100 + 0x80 * nport as usize)
    }

    pub fn port_regs(&self, nport: u32) -> &'static HbaPort {
        unsafe { &*(phys_to_direct_virt(self.port_base(nport)).get() as *const HbaPort) }
    }
}
