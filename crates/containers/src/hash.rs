use core::hash::Hasher;

/// Multiplicative string hasher used by [`crate::KHashMap`]. Not
/// cryptographically strong, but none of the keys this kernel hashes
/// (inode numbers, LBAs, block-group numbers, path components) are
/// attacker-controlled in a way that would make collision attacks a
/// real concern.
#[derive(Default, Clone)]
pub struct KernelHasher {
    cur: u64,
}

impl Hasher for KernelHasher {
    fn finish(&self) -> u64 {
        self.cur
    }

    fn write(&mut self, bytes: &[u8]) {
        const SEED: u64 = 131;
        for &byte in bytes {
            self.cur = self.cur.wrapping_mul(SEED).wrapping_add(byte as u64);
        }
    }
}
