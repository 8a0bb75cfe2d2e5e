//! ext2 on-disk structures (§4.5 "Disk layout").
//!
//! Every struct here is `repr(C, packed)` and read/written with
//! `read_unaligned`/a manual byte copy, the same convention
//! `driver::ahci::gpt` uses for `GptHeader`/`GptEntry`: these are bytes
//! off a disk, not values the compiler ever lays out itself.

pub const EXT2_MAGIC: u16 = 0xEF53;

/// Reserved inode numbers (ext2 numbers inodes from 1).
pub const EXT2_BAD_BLOCKS_INO: u32 = 1;
pub const EXT2_ROOT_INO: u32 = 2;

pub const EXT2_FT_UNKNOWN: u8 = 0;
pub const EXT2_FT_REG_FILE: u8 = 1;
pub const EXT2_FT_DIR: u8 = 2;
pub const EXT2_FT_CHRDEV: u8 = 3;
pub const EXT2_FT_BLKDEV: u8 = 4;
pub const EXT2_FT_FIFO: u8 = 5;
pub const EXT2_FT_SOCK: u8 = 6;
pub const EXT2_FT_SYMLINK: u8 = 7;

pub const S_IFMT: u16 = 0xF000;
pub const S_IFSOCK: u16 = 0xC000;
pub const S_IFLNK: u16 = 0xA000;
pub const S_IFREG: u16 = 0x8000;
pub const S_IFBLK: u16 = 0x6000;
pub const S_IFDIR: u16 = 0x4000;
pub const S_IFCHR: u16 = 0x2000;
pub const S_IFIFO: u16 = 0x1000;

/// The number of `i_block` direct pointers before the singly-indirect slot.
pub const EXT2_DIRECT_BLOCKS: u32 = 12;
pub const EXT2_SINGLY_INDIRECT: usize = 12;
pub const EXT2_DOUBLY_INDIRECT: usize = 13;
pub const EXT2_TRIPLY_INDIRECT: usize = 14;

/// "Linux filesystem data" GPT partition type GUID — the type this
/// kernel treats as "mount as ext2" when walking a disk's partition
/// table (§4.5 "mount").
pub const EXT2_PARTITION_TYPE_GUID: (u64, u64) = (0x4772_8483_0FC6_63AF, 0x6626_47D8_693D_798E);

/// The first 1024 bytes of a mounted partition, at byte offset 1024
/// (LBA 2 for 512-byte sectors). Only the fields this kernel's subset of
/// ext2 actually consults are named; the rest of the 1024-byte block is
/// reserved padding, kept so the struct's size matches the on-disk
/// layout exactly.
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct Superblock {
    pub s_inodes_count: u32,
    pub s_blocks_count: u32,
    pub s_r_blocks_count: u32,
    pub s_free_blocks_count: u32,
    pub s_free_inodes_count: u32,
    pub s_first_data_block: u32,
    pub s_log_block_size: u32,
    pub s_log_frag_size: u32,
    pub s_blocks_per_group: u32,
    pub s_frags_per_group: u32,
    pub s_inodes_per_group: u32,
    pub s_mtime: u32,
    pub s_wtime: u32,
    pub s_mnt_count: u16,
    pub s_max_mnt_count: u16,
    pub s_magic: u16,
    pub s_state: u16,
    pub s_errors: u16,
    pub s_minor_rev_level: u16,
    pub s_lastcheck: u32,
    pub s_checkinterval: u32,
    pub s_creator_os: u32,
    pub s_rev_level: u32,
    pub s_def_resuid: u16,
    pub s_def_resgid: u16,
    pub s_first_ino: u32,
    pub s_inode_size: u16,
    pub s_block_group_nr: u16,
    pub s_feature_compat: u32,
    pub s_feature_incompat: u32,
    pub s_feature_ro_compat: u32,
    pub s_uuid: [u8; 16],
    pub s_volume_name: [u8; 16],
    pub s_last_mounted: [u8; 64],
    pub s_algo_bitmap: u32,
    _reserved: [u8; 1024 - 204],
}

const _: () = assert!(core::mem::size_of::<Superblock>() == 1024);

/// One 32-byte entry of the block group descriptor table.
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct BlockGroupDescriptor {
    pub bg_block_bitmap: u32,
    pub bg_inode_bitmap: u32,
    pub bg_inode_table: u32,
    pub bg_free_blocks_count: u16,
    pub bg_free_inodes_count: u16,
    pub bg_used_dirs_count: u16,
    pub bg_pad: u16,
    pub bg_reserved: [u8; 12],
}

const _: () = assert!(core::mem::size_of::<BlockGroupDescriptor>() == 32);

/// The classic 128-byte on-disk inode: 12 direct block pointers plus a
/// singly, doubly and triply indirect pointer (§4.6 "Block mapping").
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct Inode {
    pub i_mode: u16,
    pub i_uid: u16,
    pub i_size: u32,
    pub i_atime: u32,
    pub i_ctime: u32,
    pub i_mtime: u32,
    pub i_dtime: u32,
    pub i_gid: u16,
    pub i_links_count: u16,
    pub i_blocks: u32,
    pub i_flags: u32,
    pub i_osd1: u32,
    pub i_block: [u32; 15],
    pub i_generation: u32,
    pub i_file_acl: u32,
    pub i_dir_acl: u32,
    pub i_faddr: u32,
    pub i_osd2: [u8; 12],
}

const _: () = assert!(core::mem::size_of::<Inode>() == 128);

impl Inode {
    pub fn zeroed() -> Self {
        // SAFETY: every field is a plain integer/byte array; the
        // all-zeroes bit pattern is a valid `Inode`.
        unsafe { core::mem::zeroed() }
    }

    pub fn file_type(&self) -> u16 {
        self.i_mode & S_IFMT
    }

    pub fn is_dir(&self) -> bool {
        self.file_type() == S_IFDIR
    }

    pub fn is_symlink(&self) -> bool {
        self.file_type() == S_IFLNK
    }
}

/// A directory entry's fixed 8-byte header; the name follows immediately
/// and `rec_len` (not `8 + name_len`) is the stride to the next entry.
pub const DIRENT_HEADER_LEN: usize = 8;

pub fn dirent_align(len: usize) -> usize {
    (len + 3) & !3
}

pub fn file_type_for_mode(mode: u16) -> u8 {
    match mode & S_IFMT {
        S_IFREG => EXT2_FT_REG_FILE,
        S_IFDIR => EXT2_FT_DIR,
        S_IFCHR => EXT2_FT_CHRDEV,
        S_IFBLK => EXT2_FT_BLKDEV,
        S_IFIFO => EXT2_FT_FIFO,
        S_IFSOCK => EXT2_FT_SOCK,
        S_IFLNK => EXT2_FT_SYMLINK,
        _ => EXT2_FT_UNKNOWN,
    }
}

pub(crate) fn read_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(buf[off..off + 4].try_into().unwrap())
}

pub(crate) fn write_u32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

pub(crate) fn read_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes(buf[off..off + 2].try_into().unwrap())
}

pub(crate) fn write_u16(buf: &mut [u8], off: usize, v: u16) {
    buf[off..off + 2].copy_from_slice(&v.to_le_bytes());
}

pub(crate) fn read_u8(buf: &[u8], off: usize) -> u8 {
    buf[off]
}

pub(crate) fn write_u8(buf: &mut [u8], off: usize, v: u8) {
    buf[off] = v;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dirent_align_rounds_up_to_four() {
        assert_eq!(dirent_align(8), 8);
        assert_eq!(dirent_align(9), 12);
        assert_eq!(dirent_align(11), 12);
        assert_eq!(dirent_align(12), 12);
    }

    #[test]
    fn file_type_mapping_covers_common_modes() {
        assert_eq!(file_type_for_mode(S_IFREG | 0o644), EXT2_FT_REG_FILE);
        assert_eq!(file_type_for_mode(S_IFDIR | 0o755), EXT2_FT_DIR);
        assert_eq!(file_type_for_mode(S_IFLNK | 0o777), EXT2_FT_SYMLINK);
    }

    #[test]
    fn zeroed_inode_has_no_type() {
        let inode = Inode::zeroed();
        assert_eq!(inode.file_type(), 0);
        assert!(!inode.is_dir());
    }
}
