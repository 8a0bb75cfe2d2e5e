use core::fmt;
use core::ops::{Add, Sub};

/// A physical memory address. Kept as a bare `usize` newtype rather than a
/// pointer: the buddy allocator only ever does arithmetic on addresses, and
/// never dereferences one without first translating it through a direct map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PAddr(pub usize);

impl PAddr {
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    pub const fn get(self) -> usize {
        self.0
    }
}

impl fmt::LowerHex for PAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl Add<usize> for PAddr {
    type Output = PAddr;
    fn add(self, rhs: usize) -> PAddr {
        PAddr(self.0 + rhs)
    }
}

impl Sub<usize> for PAddr {
    type Output = PAddr;
    fn sub(self, rhs: usize) -> PAddr {
        PAddr(self.0 - rhs)
    }
}

impl Sub<PAddr> for PAddr {
    type Output = usize;
    fn sub(self, rhs: PAddr) -> usize {
        self.0 - rhs.0
    }
}
