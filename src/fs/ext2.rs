//! ext2 filesystem (§4.5 "Ext2Mount", §4.6 "Ext2VNode").
//!
//! Split the way `driver::ahci` is split: on-disk layout in `disk`, the
//! per-mount block/inode allocator and region caches in `mount`, and the
//! per-inode read/write/directory logic in `vnode`.

mod disk;
mod mount;
mod vnode;

pub use disk::{
    EXT2_FT_DIR, EXT2_FT_REG_FILE, EXT2_FT_SYMLINK, EXT2_MAGIC, EXT2_PARTITION_TYPE_GUID,
    EXT2_ROOT_INO, S_IFDIR, S_IFLNK, S_IFREG,
};
pub use mount::Ext2Mount;
pub use vnode::{Extent, Ext2VNode, LookupResult};
