//! One mounted ext2 partition (§4.5 "Ext2Mount").
//!
//! Owns the `SataPort` driving the partition, the superblock and block
//! group descriptor table, the three per-block-group LRU caches (inode
//! table, inode bitmap, block bitmap), and the vnode pin map that
//! guarantees at most one live [`Ext2VNode`] per inode number.

use core::cell::RefCell;
use core::ptr::NonNull;

use containers::{KBox, KHashMap, KRc, KVec, LruCache};

use crate::config::EXT2_GROUP_CACHE_CAPACITY;
use crate::driver::ahci::SataPort;
use crate::error::{KError, KResult};

use super::disk::{
    read_u16, write_u16, BlockGroupDescriptor, Inode, Superblock, EXT2_MAGIC, EXT2_ROOT_INO,
};
use super::vnode::{Extent, Ext2VNode};

/// A cached copy of one on-disk block-group metadata region (inode
/// table, inode bitmap, or block bitmap), dirty-tracked so eviction only
/// writes back regions that actually changed.
struct CachedRegion {
    data: KVec<u8>,
    dirty: bool,
    start_block: u32,
}

struct PinEntry {
    vnode: KRc<RefCell<Ext2VNode>>,
    pin_count: u32,
}

pub struct Ext2Mount {
    port: KBox<SataPort>,
    partition_base: u64,
    block_size: usize,
    sectors_per_block: usize,

    super_block: Superblock,
    super_dirty: bool,

    bgdt: KVec<BlockGroupDescriptor>,
    bgdt_dirty: bool,
    bgdt_start_block: u32,
    num_groups: u32,

    inode_table_cache: LruCache<u32, CachedRegion>,
    inode_bitmap_cache: LruCache<u32, CachedRegion>,
    block_bitmap_cache: LruCache<u32, CachedRegion>,

    pins: KHashMap<u32, PinEntry>,
    root: Option<KRc<RefCell<Ext2VNode>>>,
}

fn find_zero_bit(bitmap: &[u8], total_bits: usize, skip_first_two: bool) -> Option<usize> {
    let mut bit_base = 0usize;
    for word_bytes in bitmap.chunks(8) {
        if bit_base >= total_bits {
            break;
        }
        let mut word_buf = [0u8; 8];
        word_buf[..word_bytes.len()].copy_from_slice(word_bytes);
        let mut word = u64::from_le_bytes(word_buf);
        if skip_first_two && bit_base == 0 {
            word |= 0b11;
        }
        if word != u64::MAX {
            for b in 0..64 {
                let bit = bit_base + b;
                if bit >= total_bits {
                    return None;
                }
                if word & (1 << b) == 0 {
                    return Some(bit);
                }
            }
        }
        bit_base += 64;
    }
    None
}

fn set_bit(bitmap: &mut [u8], bit: usize) {
    bitmap[bit / 8] |= 1 << (bit % 8);
}

fn clear_bit(bitmap: &mut [u8], bit: usize) {
    bitmap[bit / 8] &= !(1 << (bit % 8));
}

fn writeback_region(
    port: &mut SataPort,
    partition_base: u64,
    sectors_per_block: usize,
    start_block: u32,
    data: &[u8],
) {
    let lba = partition_base + 2 + (start_block as u64 - 1) * sectors_per_block as u64;
    let num_sectors = data.len() / 512;
    let _ = port.write(lba, num_sectors, data);
}

impl Ext2Mount {
    /// Reads the superblock and block group descriptor table off
    /// `partition_base` (the partition's starting LBA, per the GPT entry
    /// that selected this partition) and materialises the mount's root
    /// vnode.
    pub fn new(mut port: KBox<SataPort>, partition_base: u64) -> KResult<KBox<Self>> {
        let mut sb_buf = [0u8; 1024];
        port.read(partition_base + 2, 2, &mut sb_buf)?;
        let super_block = unsafe { (sb_buf.as_ptr() as *const Superblock).read_unaligned() };
        if { super_block.s_magic } != EXT2_MAGIC {
            eonix_log::println_warn!(
                "ext2: bad superblock magic {:#x} at partition base {}",
                { super_block.s_magic },
                partition_base
            );
            return Err(KError::InvalidFormat);
        }

        let block_size = 1024usize << super_block.s_log_block_size;
        let sectors_per_block = block_size / 512;
        let num_groups = {
            let blocks = super_block.s_blocks_count;
            let bpg = super_block.s_blocks_per_group;
            blocks.div_ceil(bpg)
        };
        // The superblock occupies all of block 1 when block_size == 1024
        // (1024 bytes == one whole block), so the BGDT starts at block 2;
        // for block_size >= 2048 the superblock sits inside block 0 and
        // the BGDT starts at block 1 (original_source/sys/fs/ext2_mount.cpp's
        // `bgdt_` base-sector computation).
        let bgdt_start_block: u32 = if block_size == 1024 { 2 } else { 1 };

        let mut mount = KBox::new(Ext2Mount {
            port,
            partition_base,
            block_size,
            sectors_per_block,
            super_block,
            super_dirty: false,
            bgdt: KVec::new(),
            bgdt_dirty: false,
            bgdt_start_block,
            num_groups,
            inode_table_cache: LruCache::new(EXT2_GROUP_CACHE_CAPACITY),
            inode_bitmap_cache: LruCache::new(EXT2_GROUP_CACHE_CAPACITY),
            block_bitmap_cache: LruCache::new(EXT2_GROUP_CACHE_CAPACITY),
            pins: KHashMap::new(),
            root: None,
        });

        let bgdt_bytes = num_groups as usize * core::mem::size_of::<BlockGroupDescriptor>();
        let bgdt_blocks = bgdt_bytes.div_ceil(block_size);
        let mut bgdt_buf = KVec::with_capacity(bgdt_blocks * block_size);
        bgdt_buf.resize(bgdt_blocks * block_size, 0);
        mount.read_block_range(bgdt_start_block, bgdt_blocks as u32, &mut bgdt_buf)?;

        let mut bgdt = KVec::with_capacity(num_groups as usize);
        for i in 0..num_groups as usize {
            let off = i * core::mem::size_of::<BlockGroupDescriptor>();
            let bgd = unsafe {
                (bgdt_buf.as_ptr().add(off) as *const BlockGroupDescriptor).read_unaligned()
            };
            bgdt.push(bgd);
        }
        mount.bgdt = bgdt;

        let root = mount.get_vnode(EXT2_ROOT_INO)?;
        mount.root = Some(root);

        Ok(mount)
    }

    pub fn root(&self) -> KRc<RefCell<Ext2VNode>> {
        self.root
            .clone()
            .expect("root vnode is materialised during Ext2Mount::new")
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_to_lba(&self, block: u32) -> u64 {
        self.partition_base + 2 + (block as u64 - 1) * self.sectors_per_block as u64
    }

    pub fn read_block_range(&mut self, block: u32, n: u32, buf: &mut [u8]) -> KResult<()> {
        let lba = self.block_to_lba(block);
        self.port.read(lba, n as usize * self.sectors_per_block, buf)
    }

    pub fn write_block_range(&mut self, block: u32, n: u32, buf: &[u8]) -> KResult<()> {
        let lba = self.block_to_lba(block);
        self.port.write(lba, n as usize * self.sectors_per_block, buf)
    }

    pub fn read_block(&mut self, block: u32, buf: &mut [u8]) -> KResult<()> {
        self.read_block_range(block, 1, buf)
    }

    pub fn write_block(&mut self, block: u32, buf: &[u8]) -> KResult<()> {
        self.write_block_range(block, 1, buf)
    }

    /// Reads a set of (possibly non-contiguous) extents into `buf` in
    /// order, using the port's batched range read (§4.4 "Range
    /// batching").
    pub fn read_blocks(&mut self, extents: &[Extent], buf: &mut [u8]) -> KResult<()> {
        let ranges: KVec<(u64, usize)> = extents
            .iter()
            .map(|e| {
                (
                    self.block_to_lba(e.start_block),
                    e.length as usize * self.sectors_per_block,
                )
            })
            .collect();
        self.port.read_ranges(&ranges, buf)
    }

    pub fn write_blocks(&mut self, extents: &[Extent], buf: &[u8]) -> KResult<()> {
        let ranges: KVec<(u64, usize)> = extents
            .iter()
            .map(|e| {
                (
                    self.block_to_lba(e.start_block),
                    e.length as usize * self.sectors_per_block,
                )
            })
            .collect();
        self.port.write_ranges(&ranges, buf)
    }

    fn inode_table_blocks(&self) -> u32 {
        let inode_size = (self.super_block.s_inode_size as u32).max(128);
        let bytes = self.super_block.s_inodes_per_group * inode_size;
        bytes.div_ceil(self.block_size as u32)
    }

    fn ensure_inode_bitmap(&mut self, group: u32) -> KResult<&mut [u8]> {
        if !self.inode_bitmap_cache.contains(&group) {
            let start_block = self.bgdt[group as usize].bg_inode_bitmap;
            let mut data = KVec::with_capacity(self.block_size);
            data.resize(self.block_size, 0);
            self.read_block(start_block, &mut data)?;

            let port = &mut *self.port;
            let partition_base = self.partition_base;
            let sectors_per_block = self.sectors_per_block;
            self.inode_bitmap_cache.insert(
                group,
                CachedRegion {
                    data,
                    dirty: false,
                    start_block,
                },
                |_g, evicted| {
                    if evicted.dirty {
                        writeback_region(port, partition_base, sectors_per_block, evicted.start_block, &evicted.data);
                    }
                },
            );
        }
        Ok(&mut self.inode_bitmap_cache.get_mut(&group).unwrap().data)
    }

    fn ensure_block_bitmap(&mut self, group: u32) -> KResult<&mut [u8]> {
        if !self.block_bitmap_cache.contains(&group) {
            let start_block = self.bgdt[group as usize].bg_block_bitmap;
            let mut data = KVec::with_capacity(self.block_size);
            data.resize(self.block_size, 0);
            self.read_block(start_block, &mut data)?;

            let port = &mut *self.port;
            let partition_base = self.partition_base;
            let sectors_per_block = self.sectors_per_block;
            self.block_bitmap_cache.insert(
                group,
                CachedRegion {
                    data,
                    dirty: false,
                    start_block,
                },
                |_g, evicted| {
                    if evicted.dirty {
                        writeback_region(port, partition_base, sectors_per_block, evicted.start_block, &evicted.data);
                    }
                },
            );
        }
        Ok(&mut self.block_bitmap_cache.get_mut(&group).unwrap().data)
    }

    fn ensure_inode_table(&mut self, group: u32) -> KResult<&mut [u8]> {
        if !self.inode_table_cache.contains(&group) {
            let start_block = self.bgdt[group as usize].bg_inode_table;
            let blocks = self.inode_table_blocks();
            let mut data = KVec::with_capacity(blocks as usize * self.block_size);
            data.resize(blocks as usize * self.block_size, 0);
            self.read_block_range(start_block, blocks, &mut data)?;

            let port = &mut *self.port;
            let partition_base = self.partition_base;
            let sectors_per_block = self.sectors_per_block;
            self.inode_table_cache.insert(
                group,
                CachedRegion {
                    data,
                    dirty: false,
                    start_block,
                },
                |_g, evicted| {
                    if evicted.dirty {
                        writeback_region(port, partition_base, sectors_per_block, evicted.start_block, &evicted.data);
                    }
                },
            );
        }
        Ok(&mut self.inode_table_cache.get_mut(&group).unwrap().data)
    }

    /// Scans group by group for a free inode, 64 bits at a time,
    /// skipping the two reserved inodes in group 0's bitmap.
    pub fn alloc_inode(&mut self, mode: u16) -> KResult<u32> {
        let inodes_per_group = self.super_block.s_inodes_per_group;
        for group in 0..self.num_groups {
            if self.bgdt[group as usize].bg_free_inodes_count == 0 {
                continue;
            }
            let bitmap = self.ensure_inode_bitmap(group)?;
            let Some(bit) = find_zero_bit(bitmap, inodes_per_group as usize, group == 0) else {
                continue;
            };
            set_bit(bitmap, bit);
            self.inode_bitmap_cache.get_mut(&group).unwrap().dirty = true;

            let ino = group * inodes_per_group + bit as u32 + 1;

            self.bgdt[group as usize].bg_free_inodes_count -= 1;
            self.bgdt_dirty = true;
            self.super_block.s_free_inodes_count -= 1;
            self.super_dirty = true;

            let mut inode = Inode::zeroed();
            inode.i_mode = mode;
            inode.i_links_count = 1;
            self.write_inode(ino, &inode)?;

            return Ok(ino);
        }
        Err(KError::NoSpace)
    }

    pub fn free_inode(&mut self, ino: u32) -> KResult<()> {
        let inodes_per_group = self.super_block.s_inodes_per_group;
        let group = (ino - 1) / inodes_per_group;
        let bit = ((ino - 1) % inodes_per_group) as usize;

        let bitmap = self.ensure_inode_bitmap(group)?;
        clear_bit(bitmap, bit);
        self.inode_bitmap_cache.get_mut(&group).unwrap().dirty = true;

        self.bgdt[group as usize].bg_free_inodes_count += 1;
        self.bgdt_dirty = true;
        self.super_block.s_free_inodes_count += 1;
        self.super_dirty = true;
        Ok(())
    }

    /// Scans group by group for a free block, 64 bits at a time.
    pub fn alloc_block(&mut self) -> KResult<u32> {
        let blocks_per_group = self.super_block.s_blocks_per_group;
        for group in 0..self.num_groups {
            if self.bgdt[group as usize].bg_free_blocks_count == 0 {
                continue;
            }
            let bitmap = self.ensure_block_bitmap(group)?;
            let Some(bit) = find_zero_bit(bitmap, blocks_per_group as usize, false) else {
                continue;
            };
            set_bit(bitmap, bit);
            self.block_bitmap_cache.get_mut(&group).unwrap().dirty = true;

            let block = self.super_block.s_first_data_block + group * blocks_per_group + bit as u32;

            self.bgdt[group as usize].bg_free_blocks_count -= 1;
            self.bgdt_dirty = true;
            self.super_block.s_free_blocks_count -= 1;
            self.super_dirty = true;

            return Ok(block);
        }
        Err(KError::NoSpace)
    }

    pub fn free_block(&mut self, block: u32) -> KResult<()> {
        let blocks_per_group = self.super_block.s_blocks_per_group;
        let rel = block - self.super_block.s_first_data_block;
        let group = rel / blocks_per_group;
        let bit = (rel % blocks_per_group) as usize;

        let bitmap = self.ensure_block_bitmap(group)?;
        clear_bit(bitmap, bit);
        self.block_bitmap_cache.get_mut(&group).unwrap().dirty = true;

        self.bgdt[group as usize].bg_free_blocks_count += 1;
        self.bgdt_dirty = true;
        self.super_block.s_free_blocks_count += 1;
        self.super_dirty = true;
        Ok(())
    }

    fn inode_location(&self, ino: u32) -> (u32, usize) {
        let inodes_per_group = self.super_block.s_inodes_per_group;
        let inode_size = (self.super_block.s_inode_size as usize).max(128);
        let group = (ino - 1) / inodes_per_group;
        let index = (ino - 1) % inodes_per_group;
        (group, index as usize * inode_size)
    }

    pub fn read_inode(&mut self, ino: u32) -> KResult<Inode> {
        let (group, byte_off) = self.inode_location(ino);
        let table = self.ensure_inode_table(group)?;
        let size = core::mem::size_of::<Inode>();
        let bytes = &table[byte_off..byte_off + size];
        Ok(unsafe { (bytes.as_ptr() as *const Inode).read_unaligned() })
    }

    pub fn write_inode(&mut self, ino: u32, inode: &Inode) -> KResult<()> {
        let (group, byte_off) = self.inode_location(ino);
        let table = self.ensure_inode_table(group)?;
        let size = core::mem::size_of::<Inode>();
        let dst = &mut table[byte_off..byte_off + size];
        let src = unsafe { core::slice::from_raw_parts(inode as *const Inode as *const u8, size) };
        dst.copy_from_slice(src);
        self.inode_table_cache.get_mut(&group).unwrap().dirty = true;
        Ok(())
    }

    /// Returns the pinned vnode for `ino`, bumping its pin count, or
    /// materialises a fresh one from disk and pins it for the first
    /// time (§4.5 "Vnode registry": "for any inode number, at most one
    /// live vnode instance exists").
    pub fn get_vnode(&mut self, ino: u32) -> KResult<KRc<RefCell<Ext2VNode>>> {
        if let Some(entry) = self.pins.get_mut(&ino) {
            entry.pin_count += 1;
            return Ok(entry.vnode.clone());
        }

        let inode = self.read_inode(ino)?;
        let mount_ptr = NonNull::new(self as *mut Ext2Mount).unwrap();
        let vnode = KRc::new(RefCell::new(Ext2VNode::new(ino, inode, mount_ptr)));
        self.pins.insert(
            ino,
            PinEntry {
                vnode: vnode.clone(),
                pin_count: 1,
            },
        );
        Ok(vnode)
    }

    pub fn pin(&mut self, ino: u32) {
        if let Some(entry) = self.pins.get_mut(&ino) {
            entry.pin_count += 1;
        }
    }

    pub fn unpin(&mut self, ino: u32) {
        if let Some(entry) = self.pins.get_mut(&ino) {
            entry.pin_count -= 1;
            if entry.pin_count == 0 {
                self.pins.remove(&ino);
            }
        }
    }

    /// Writes back the superblock and block group descriptor table if
    /// dirty, and drains every cached region, writing back whichever
    /// ones were modified.
    pub fn flush(&mut self) -> KResult<()> {
        if self.super_dirty {
            let mut buf = [0u8; 1024];
            unsafe { core::ptr::write(buf.as_mut_ptr() as *mut Superblock, self.super_block) };
            self.port.write(self.partition_base + 2, 2, &buf)?;
            self.super_dirty = false;
        }

        if self.bgdt_dirty {
            let bgdt_bytes = self.bgdt.len() * core::mem::size_of::<BlockGroupDescriptor>();
            let bgdt_blocks = bgdt_bytes.div_ceil(self.block_size);
            let mut buf = KVec::with_capacity(bgdt_blocks * self.block_size);
            buf.resize(bgdt_blocks * self.block_size, 0);
            for (i, bgd) in self.bgdt.iter().enumerate() {
                let off = i * core::mem::size_of::<BlockGroupDescriptor>();
                unsafe {
                    core::ptr::write(buf.as_mut_ptr().add(off) as *mut BlockGroupDescriptor, *bgd)
                };
            }
            let bgdt_start_block = self.bgdt_start_block;
            self.write_block_range(bgdt_start_block, bgdt_blocks as u32, &buf)?;
            self.bgdt_dirty = false;
        }

        let port = &mut *self.port;
        let partition_base = self.partition_base;
        let sectors_per_block = self.sectors_per_block;
        self.inode_table_cache.drain(|_g, region| {
            if region.dirty {
                writeback_region(port, partition_base, sectors_per_block, region.start_block, &region.data);
            }
        });
        self.inode_bitmap_cache.drain(|_g, region| {
            if region.dirty {
                writeback_region(port, partition_base, sectors_per_block, region.start_block, &region.data);
            }
        });
        self.block_bitmap_cache.drain(|_g, region| {
            if region.dirty {
                writeback_region(port, partition_base, sectors_per_block, region.start_block, &region.data);
            }
        });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_zero_bit_skips_reserved_inodes_in_group_zero() {
        let bitmap = [0u8; 16];
        assert_eq!(find_zero_bit(&bitmap, 128, true), Some(2));
        assert_eq!(find_zero_bit(&bitmap, 128, false), Some(0));
    }

    #[test]
    fn find_zero_bit_finds_first_gap() {
        let mut bitmap = [0xffu8; 16];
        clear_bit(&mut bitmap, 40);
        assert_eq!(find_zero_bit(&bitmap, 128, false), Some(40));
    }

    #[test]
    fn find_zero_bit_returns_none_when_full() {
        let bitmap = [0xffu8; 16];
        assert_eq!(find_zero_bit(&bitmap, 128, false), None);
    }

    #[test]
    fn set_and_clear_bit_roundtrip() {
        let mut bitmap = [0u8; 4];
        set_bit(&mut bitmap, 5);
        assert_eq!(bitmap[0], 0b0010_0000);
        clear_bit(&mut bitmap, 5);
        assert_eq!(bitmap[0], 0);
    }
}
