//! Compile-time tunables.
//!
//! There is no persisted configuration in this kernel (§6): every knob
//! that would otherwise live in a config file is a `pub const` here,
//! grounded in the same pattern `buddy_allocator` uses for its own
//! `MIN_ORDER`/`MAX_ORDER`/`NUM_ORDERS`.

/// Page size in bytes. 4 KiB pages throughout.
pub const PAGE_SIZE: usize = 4096;
pub const PAGE_SIZE_BITS: usize = 12;

/// High-half base for the direct map of the first 4 GiB of physical memory.
pub const DIRECT_MAP_BASE: u64 = 0xFFFF_8000_0000_0000;

/// Base of the linear direct-mapping window for physical memory above 4 GiB.
pub const HIGH_DIRECT_MAP_BASE: u64 = 0xFFFF_8001_0000_0000;

/// Base of the kernel heap's virtual window, immediately above the direct maps.
pub const HEAP_WINDOW_BASE: u64 = 0xFFFF_C000_0000_0000;

/// Initial size of the kernel heap's backing, in bytes.
pub const HEAP_INITIAL_SIZE: usize = 1 << 20; // 1 MiB

/// Maximum size the kernel heap window may grow to.
pub const HEAP_MAX_SIZE: usize = 1 << 30; // 1 GiB

/// Allocations at or above this size bypass the segregated free lists and
/// are satisfied directly by the page allocator.
pub const PMM_THRESHOLD: usize = 16 * 1024;

/// Byte alignment every heap chunk size is rounded up to.
pub const HEAP_ALIGN: usize = 32;

/// Number of segregated free-list bins in the kernel heap.
pub const HEAP_NUM_BINS: usize = 256;

/// Exact-size bins: bins `0..32` cover `32..=1024` bytes at 32-byte stride.
pub const HEAP_EXACT_BINS: usize = 32;

/// AHCI: number of PRDT entries per command table.
pub const AHCI_PRDT_COUNT: usize = 8;

/// AHCI: maximum bytes a single PRDT entry may describe.
pub const AHCI_PRDT_SIZE: u32 = 4 * 1024 * 1024;

/// AHCI: number of command slots per port (architectural maximum).
pub const AHCI_NUM_SLOTS: usize = 32;

/// AHCI: maximum number of slots a single NCQ batch dispatch arms at
/// once. Bounded well below `AHCI_NUM_SLOTS` so the per-port NCQ bounce
/// region (`AHCI_NCQ_BATCH * AHCI_NCQ_SLOT_SECTORS` sectors) stays small;
/// a batch larger than this many ranges is split into several waves.
pub const AHCI_NCQ_BATCH: usize = 8;

/// AHCI: sectors of bounce buffer reserved per slot in an NCQ batch.
pub const AHCI_NCQ_SLOT_SECTORS: usize = 128;

/// HBA capability register bit 30: "Supports Native Command Queuing".
pub const HBA_CAP_SNCQ: u32 = 1 << 30;

/// AHCI: maximum number of ports a single HBA may implement.
pub const AHCI_MAX_PORTS: usize = 32;

/// Sector size in bytes. This kernel targets 512-byte logical sectors.
pub const SECTOR_SIZE: usize = 512;

/// Capacity of each SATA port's LRU sector cache, in cached sectors.
pub const SECTOR_CACHE_CAPACITY: usize = 512;

/// Capacity of each of an ext2 mount's per-block-group LRU caches
/// (inode table, inode bitmap, block bitmap), in cached block-groups.
pub const EXT2_GROUP_CACHE_CAPACITY: usize = 16;

/// Inline symlink storage threshold: targets shorter than this are stored
/// directly in the inode's direct-pointer area instead of as file content.
pub const EXT2_INLINE_SYMLINK_MAX: usize = 60;
