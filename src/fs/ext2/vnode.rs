//! Per-inode read/write/directory logic (§4.6 "Ext2VNode").
//!
//! A vnode is a thin, stateful wrapper around one on-disk [`Inode`]: it
//! knows how to turn a byte range into a list of block [`Extent`]s
//! (walking the indirect blocks when needed), how to splice a
//! head/middle/tail write into those extents, and how to parse or mutate
//! its own directory-entry stream when it is a directory. It does not
//! own the mount it belongs to — that would make `Ext2Mount` and
//! `Ext2VNode` a cyclic ownership graph — it holds a non-owning
//! [`NonNull`] back-reference instead, valid because every `Ext2Mount`
//! lives inside a heap-pinned `KBox` for its whole lifetime.

use core::cell::RefCell;
use core::ptr::NonNull;

use containers::{KHashMap, KRc, KString, KVec};

use crate::config::EXT2_INLINE_SYMLINK_MAX;
use crate::error::{KError, KResult};

use super::disk::{
    dirent_align, file_type_for_mode, read_u16, read_u32, read_u8, write_u16, write_u32, write_u8,
    Inode, DIRENT_HEADER_LEN, EXT2_DIRECT_BLOCKS, EXT2_DOUBLY_INDIRECT, EXT2_SINGLY_INDIRECT,
    EXT2_TRIPLY_INDIRECT, S_IFDIR, S_IFLNK, S_IFMT,
};
use super::mount::Ext2Mount;

/// One contiguous run of `length` blocks starting at `start_block`; the
/// unit `Ext2Mount::read_blocks`/`write_blocks` batches I/O over (§4.4
/// "Range batching").
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Extent {
    pub start_block: u32,
    pub length: u32,
}

pub struct LookupResult {
    pub ino: u32,
    pub file_type: u8,
}

pub struct Ext2VNode {
    ino: u32,
    inode: Inode,
    mount: NonNull<Ext2Mount>,
    /// Child-name -> root-vnode-of-mounted-filesystem. A name present
    /// here shadows any on-disk child of the same name during lookup
    /// (§3 "VNode" invariant (a)).
    overlay: KHashMap<KString, KRc<RefCell<Ext2VNode>>>,
}

impl Ext2VNode {
    pub(super) fn new(ino: u32, inode: Inode, mount: NonNull<Ext2Mount>) -> Self {
        Self {
            ino,
            inode,
            mount,
            overlay: KHashMap::new(),
        }
    }

    /// Attaches `root` as the mounted filesystem visible at child name
    /// `name`, shadowing any on-disk entry of the same name.
    pub fn mount_child(&mut self, name: &str, root: KRc<RefCell<Ext2VNode>>) {
        self.overlay.insert(KString::from(name), root);
    }

    /// Detaches and returns the overlay previously attached at `name`.
    pub fn unmount_child(&mut self, name: &str) -> Option<KRc<RefCell<Ext2VNode>>> {
        self.overlay.remove(&KString::from(name))
    }

    pub fn overlay_is_empty(&self) -> bool {
        self.overlay.is_empty()
    }

    /// Peeks the overlay without materialising a pin, for the VFS's own
    /// path walk.
    pub fn overlay_get(&self, name: &str) -> Option<KRc<RefCell<Ext2VNode>>> {
        self.overlay.get(&KString::from(name)).cloned()
    }

    pub(crate) fn mount(&self) -> &mut Ext2Mount {
        // SAFETY: `mount` points at an `Ext2Mount` heap-pinned for at
        // least as long as any vnode it has handed out is alive (the
        // mount's pin map holds a strong reference to every vnode it
        // created, so the mount always outlives its vnodes).
        unsafe { &mut *self.mount.as_ptr() }
    }

    /// Pins and returns the child `ino` from this vnode's own mount (the
    /// VFS path walker's on-disk-child step).
    pub(crate) fn pin_child(&mut self, ino: u32) -> KResult<KRc<RefCell<Ext2VNode>>> {
        self.mount().get_vnode(ino)
    }

    pub(crate) fn unpin_child(&mut self, ino: u32) {
        self.mount().unpin(ino);
    }

    /// Registers a lasting pin on this vnode itself, for a freshly
    /// opened `FileHandle`.
    pub(crate) fn pin_self(&mut self) {
        let ino = self.ino;
        self.mount().pin(ino);
    }

    pub(crate) fn unpin_self(&mut self) {
        let ino = self.ino;
        self.mount().unpin(ino);
    }

    pub fn ino(&self) -> u32 {
        self.ino
    }

    pub fn size(&self) -> u64 {
        self.inode.i_size as u64
    }

    pub fn mode(&self) -> u16 {
        self.inode.i_mode
    }

    pub fn links_count(&self) -> u16 {
        self.inode.i_links_count
    }

    pub fn is_dir(&self) -> bool {
        self.inode.is_dir()
    }

    pub fn is_symlink(&self) -> bool {
        self.inode.is_symlink()
    }

    pub fn set_links_count(&mut self, n: u16) {
        self.inode.i_links_count = n;
        self.flush_inode();
    }

    fn flush_inode(&mut self) {
        let ino = self.ino;
        let inode = self.inode;
        let _ = self.mount().write_inode(ino, &inode);
    }

    fn block_size(&self) -> usize {
        self.mount().block_size()
    }

    fn pointers_per_block(&self) -> u32 {
        (self.block_size() / 4) as u32
    }

    /// Resolves the block pointer at logical index `index`, reading
    /// indirect blocks along the way; `alloc` controls whether missing
    /// pointers (including indirect blocks themselves) are allocated and
    /// written back, or treated as a hole (returns `Ok(None)`).
    fn resolve_indirect(&mut self, index: u32, alloc: bool) -> KResult<Option<u32>> {
        let ppb = self.pointers_per_block();

        if index < EXT2_DIRECT_BLOCKS {
            let ptr = self.inode.i_block[index as usize];
            if ptr != 0 {
                return Ok(Some(ptr));
            }
            if !alloc {
                return Ok(None);
            }
            let block = self.mount().alloc_block()?;
            self.inode.i_block[index as usize] = block;
            self.flush_inode();
            return Ok(Some(block));
        }

        let index = index - EXT2_DIRECT_BLOCKS;
        if index < ppb {
            return self.resolve_via_indirect_chain(&[(EXT2_SINGLY_INDIRECT, index)], alloc);
        }

        let index = index - ppb;
        if index < ppb * ppb {
            let outer = index / ppb;
            let inner = index % ppb;
            return self.resolve_via_indirect_chain(
                &[(EXT2_DOUBLY_INDIRECT, outer), (usize::MAX, inner)],
                alloc,
            );
        }

        let index = index - ppb * ppb;
        let l1 = index / (ppb * ppb);
        let l2 = (index / ppb) % ppb;
        let l3 = index % ppb;
        self.resolve_via_indirect_chain(
            &[
                (EXT2_TRIPLY_INDIRECT, l1),
                (usize::MAX, l2),
                (usize::MAX, l3),
            ],
            alloc,
        )
    }

    /// Walks a chain of indirect blocks. The first hop reads its pointer
    /// out of `i_block[root_slot]`; every subsequent hop reads its
    /// pointer out of the block fetched by the previous hop, at the
    /// offset given by that hop's index. `root_slot == usize::MAX` marks
    /// a continuation hop (its "root" is the previous hop's block).
    fn resolve_via_indirect_chain(
        &mut self,
        hops: &[(usize, u32)],
        alloc: bool,
    ) -> KResult<Option<u32>> {
        let block_size = self.block_size();
        let mut current_block: Option<u32> = None;

        for (hop_i, &(root_slot, index)) in hops.iter().enumerate() {
            let ptr_block = if hop_i == 0 {
                let existing = self.inode.i_block[root_slot];
                if existing != 0 {
                    existing
                } else if alloc {
                    let new_block = self.mount().alloc_block()?;
                    self.zero_block(new_block)?;
                    self.inode.i_block[root_slot] = new_block;
                    self.flush_inode();
                    new_block
                } else {
                    return Ok(None);
                }
            } else {
                current_block.unwrap()
            };

            let mut buf = KVec::with_capacity(block_size);
            buf.resize(block_size, 0);
            self.mount().read_block(ptr_block, &mut buf)?;
            let off = index as usize * 4;
            let next = read_u32(&buf, off);

            let is_last = hop_i == hops.len() - 1;
            if is_last {
                if next != 0 {
                    return Ok(Some(next));
                }
                if !alloc {
                    return Ok(None);
                }
                let new_block = self.mount().alloc_block()?;
                write_u32(&mut buf, off, new_block);
                self.mount().write_block(ptr_block, &buf)?;
                return Ok(Some(new_block));
            }

            if next != 0 {
                current_block = Some(next);
            } else if alloc {
                let new_block = self.mount().alloc_block()?;
                self.zero_block(new_block)?;
                write_u32(&mut buf, off, new_block);
                self.mount().write_block(ptr_block, &buf)?;
                current_block = Some(new_block);
            } else {
                return Ok(None);
            }
        }

        Ok(current_block)
    }

    fn zero_block(&mut self, block: u32) -> KResult<()> {
        let block_size = self.block_size();
        let mut buf = KVec::with_capacity(block_size);
        buf.resize(block_size, 0);
        self.mount().write_block(block, &buf)
    }

    /// Coalesces the logical blocks spanning `[byte_off, byte_off+len)`
    /// into a minimal list of contiguous [`Extent`]s, allocating any
    /// holes when `alloc` is set.
    fn get_or_create_extents(&mut self, byte_off: u64, len: u64, alloc: bool) -> KResult<KVec<Extent>> {
        if len == 0 {
            return Ok(KVec::new());
        }
        let block_size = self.block_size() as u64;
        let first_block_idx = (byte_off / block_size) as u32;
        let last_block_idx = ((byte_off + len - 1) / block_size) as u32;

        let mut extents: KVec<Extent> = KVec::new();
        for idx in first_block_idx..=last_block_idx {
            let Some(block) = self.resolve_indirect(idx, alloc)? else {
                continue;
            };
            if let Some(last) = extents.last_mut() {
                if last.start_block + last.length == block {
                    last.length += 1;
                    continue;
                }
            }
            extents.push(Extent {
                start_block: block,
                length: 1,
            });
        }
        Ok(extents)
    }

    /// Reads `buf.len()` bytes starting at `offset`, splicing whole
    /// blocks read directly into `buf` with the head/tail partial blocks
    /// read through a scratch buffer (§4.6 "read/write splicing").
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> KResult<usize> {
        let size = self.size();
        if offset >= size {
            return Ok(0);
        }
        let len = (buf.len() as u64).min(size - offset) as usize;
        if len == 0 {
            return Ok(0);
        }

        let block_size = self.block_size() as u64;
        let extents = self.get_or_create_extents(offset, len as u64, false)?;
        if extents.is_empty() {
            buf[..len].fill(0);
            return Ok(len);
        }

        let first_block_off = offset - (offset / block_size) * block_size;
        let total_blocks: u32 = extents.iter().map(|e| e.length).sum();
        let mut region = KVec::with_capacity(total_blocks as usize * block_size as usize);
        region.resize(total_blocks as usize * block_size as usize, 0);
        self.mount().read_blocks(&extents, &mut region)?;

        let start = first_block_off as usize;
        buf[..len].copy_from_slice(&region[start..start + len]);
        Ok(len)
    }

    /// Writes `buf` at `offset`, allocating blocks for any holes and
    /// growing `i_size` if the write extends past the current size. Head
    /// and tail partial blocks are read-modify-written through the same
    /// scratch region as a full write so a short write never corrupts
    /// the untouched bytes around it.
    pub fn write_at(&mut self, offset: u64, buf: &[u8]) -> KResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let block_size = self.block_size() as u64;
        let len = buf.len() as u64;
        let extents = self.get_or_create_extents(offset, len, true)?;

        let first_block_off = offset - (offset / block_size) * block_size;
        let total_blocks: u32 = extents.iter().map(|e| e.length).sum();
        let region_len = total_blocks as usize * block_size as usize;
        let mut region = KVec::with_capacity(region_len);
        region.resize(region_len, 0);

        let needs_rmw = first_block_off != 0 || (first_block_off + len) % block_size != 0;
        if needs_rmw {
            self.mount().read_blocks(&extents, &mut region)?;
        }

        let start = first_block_off as usize;
        region[start..start + buf.len()].copy_from_slice(buf);
        self.mount().write_blocks(&extents, &region)?;

        let new_size = offset + len;
        if new_size > self.size() {
            self.inode.i_size = new_size as u32;
            self.flush_inode();
        }
        Ok(buf.len())
    }

    // -- directory entries -------------------------------------------------

    /// Initializes a fresh directory block's worth of content with `.`
    /// and `..` entries, sized to fill the whole block.
    pub fn init_directory(&mut self, parent_ino: u32) -> KResult<()> {
        let block_size = self.block_size();
        let mut buf = KVec::with_capacity(block_size);
        buf.resize(block_size, 0);

        let dot_len = dirent_align(DIRENT_HEADER_LEN + 1);
        write_u32(&mut buf, 0, self.ino);
        write_u16(&mut buf, 4, dot_len as u16);
        write_u8(&mut buf, 6, 1);
        write_u8(&mut buf, 7, file_type_for_mode(S_IFDIR));
        buf[8] = b'.';

        let dotdot_off = dot_len;
        let dotdot_len = block_size - dotdot_off;
        write_u32(&mut buf, dotdot_off, parent_ino);
        write_u16(&mut buf, dotdot_off + 4, dotdot_len as u16);
        write_u8(&mut buf, dotdot_off + 6, 2);
        write_u8(&mut buf, dotdot_off + 7, file_type_for_mode(S_IFDIR));
        buf[dotdot_off + 8] = b'.';
        buf[dotdot_off + 9] = b'.';

        self.inode.i_size = block_size as u32;
        self.write_at(0, &buf)?;
        Ok(())
    }

    fn directory_block(&mut self) -> KResult<(u32, KVec<u8>)> {
        let block_size = self.block_size();
        let mut buf = KVec::with_capacity(self.size() as usize);
        buf.resize(self.size() as usize, 0);
        self.read_at(0, &mut buf)?;
        Ok((block_size as u32, buf))
    }

    /// Counts live directory entries (including `.`/`..`), for `remove`'s
    /// "directory must be empty" check.
    pub fn count_entries(&mut self) -> KResult<usize> {
        let (_, buf) = self.directory_block()?;
        let mut off = 0usize;
        let mut count = 0;
        while off + DIRENT_HEADER_LEN <= buf.len() {
            let ino = read_u32(&buf, off);
            let rec_len = read_u16(&buf, off + 4) as usize;
            if rec_len < DIRENT_HEADER_LEN {
                break;
            }
            if ino != 0 {
                count += 1;
            }
            off += rec_len;
        }
        Ok(count)
    }

    /// Linear scan over the directory-entry stream looking for `name`.
    pub fn find_child(&mut self, name: &str) -> KResult<Option<LookupResult>> {
        let (_, buf) = self.directory_block()?;
        let mut off = 0usize;
        while off + DIRENT_HEADER_LEN <= buf.len() {
            let ino = read_u32(&buf, off);
            let rec_len = read_u16(&buf, off + 4) as usize;
            if rec_len < DIRENT_HEADER_LEN {
                break;
            }
            let name_len = read_u8(&buf, off + 6) as usize;
            let file_type = read_u8(&buf, off + 7);
            if ino != 0 && name_len == name.len() {
                let entry_name = &buf[off + 8..off + 8 + name_len];
                if entry_name == name.as_bytes() {
                    return Ok(Some(LookupResult { ino, file_type }));
                }
            }
            off += rec_len;
        }
        Ok(None)
    }

    /// Resolves a (possibly multi-segment) path relative to this vnode.
    /// Splits at the first `/`; the overlay map is consulted for the
    /// first segment before the on-disk directory entries are, so a
    /// mounted filesystem shadows an on-disk child of the same name
    /// (§4.6 "Lookup", §3 "VNode" invariant (a)). If a remainder is
    /// left, recurses into the resolved child.
    pub fn lookup(&mut self, path: &str) -> KResult<LookupResult> {
        if !self.is_dir() {
            return Err(KError::InvalidArgument);
        }
        let path = path.strip_prefix('/').unwrap_or(path);
        let (first, rest) = match path.find('/') {
            Some(idx) => (&path[..idx], &path[idx + 1..]),
            None => (path, ""),
        };
        if first.is_empty() {
            return Err(KError::InvalidArgument);
        }

        if let Some(overlay_root) = self.overlay.get(first) {
            let overlay_root = overlay_root.clone();
            if rest.is_empty() {
                let vn = overlay_root.borrow();
                return Ok(LookupResult {
                    ino: vn.ino(),
                    file_type: file_type_for_mode(vn.mode()),
                });
            }
            return overlay_root.borrow_mut().lookup(rest);
        }

        let found = self.find_child(first)?.ok_or(KError::NotFound)?;
        if rest.is_empty() {
            return Ok(found);
        }

        let child = self.mount().get_vnode(found.ino)?;
        let result = child.borrow_mut().lookup(rest);
        self.mount().unpin(found.ino);
        result
    }

    /// Appends a directory entry for `(ino, name, file_type)`, splitting
    /// the slack off the end of the first entry whose `rec_len` is large
    /// enough to hold both the existing entry (shrunk to its own minimum
    /// size) and the new one (§4.6 "slack-splitting insert").
    pub fn add_entry(&mut self, ino: u32, name: &str, file_type: u8) -> KResult<()> {
        if name.len() > 255 {
            return Err(KError::InvalidArgument);
        }
        let needed = dirent_align(DIRENT_HEADER_LEN + name.len());
        let (block_size, mut buf) = self.directory_block()?;
        let block_size = block_size as usize;

        let mut off = 0usize;
        while off + DIRENT_HEADER_LEN <= buf.len() {
            let existing_ino = read_u32(&buf, off);
            let rec_len = read_u16(&buf, off + 4) as usize;
            if rec_len < DIRENT_HEADER_LEN {
                break;
            }
            let existing_name_len = read_u8(&buf, off + 6) as usize;
            let used = if existing_ino == 0 {
                0
            } else {
                dirent_align(DIRENT_HEADER_LEN + existing_name_len)
            };
            let slack = rec_len - used;

            if slack >= needed {
                let new_off = if existing_ino != 0 {
                    write_u16(&mut buf, off + 4, used as u16);
                    off + used
                } else {
                    off
                };
                let new_rec_len = rec_len - (new_off - off);

                write_u32(&mut buf, new_off, ino);
                write_u16(&mut buf, new_off + 4, new_rec_len as u16);
                write_u8(&mut buf, new_off + 6, name.len() as u8);
                write_u8(&mut buf, new_off + 7, file_type);
                buf[new_off + 8..new_off + 8 + name.len()].copy_from_slice(name.as_bytes());

                self.write_at(0, &buf)?;
                return Ok(());
            }

            off += rec_len;
        }

        // No slack anywhere: grow the directory by one block.
        let new_block_off = buf.len();
        let mut new_block = KVec::with_capacity(block_size);
        new_block.resize(block_size, 0);
        write_u32(&mut new_block, 0, ino);
        write_u16(&mut new_block, 4, block_size as u16);
        write_u8(&mut new_block, 6, name.len() as u8);
        write_u8(&mut new_block, 7, file_type);
        new_block[8..8 + name.len()].copy_from_slice(name.as_bytes());

        self.write_at(new_block_off as u64, &new_block)?;
        Ok(())
    }

    /// Removes the entry named `name` by merging its `rec_len` into the
    /// preceding entry in the same block (or zeroing the inode field if
    /// it is the first entry in the block — the stride must stay so
    /// later entries remain reachable).
    pub fn remove_entry(&mut self, name: &str) -> KResult<()> {
        let (block_size, mut buf) = self.directory_block()?;
        let block_size = block_size as usize;

        let mut block_start = 0usize;
        while block_start < buf.len() {
            let mut off = block_start;
            let mut prev: Option<usize> = None;
            while off < block_start + block_size {
                let ino = read_u32(&buf, off);
                let rec_len = read_u16(&buf, off + 4) as usize;
                if rec_len < DIRENT_HEADER_LEN {
                    break;
                }
                let name_len = read_u8(&buf, off + 6) as usize;
                if ino != 0 && name_len == name.len() && &buf[off + 8..off + 8 + name_len] == name.as_bytes() {
                    if let Some(prev_off) = prev {
                        let prev_rec_len = read_u16(&buf, prev_off + 4) as usize;
                        write_u16(&mut buf, prev_off + 4, (prev_rec_len + rec_len) as u16);
                    } else {
                        write_u32(&mut buf, off, 0);
                    }
                    self.write_at(0, &buf)?;
                    return Ok(());
                }
                prev = Some(off);
                off += rec_len;
            }
            block_start += block_size;
        }

        Err(KError::NotFound)
    }

    // -- symlinks ------------------------------------------------------

    /// Writes `target` inline into `i_block`'s raw bytes when it fits
    /// within [`EXT2_INLINE_SYMLINK_MAX`], otherwise as ordinary file
    /// content (§4.6 "inline symlinks").
    pub fn write_symlink_target(&mut self, target: &str) -> KResult<()> {
        if target.len() <= EXT2_INLINE_SYMLINK_MAX {
            let bytes = target.as_bytes();
            let raw = unsafe {
                core::slice::from_raw_parts_mut(
                    self.inode.i_block.as_mut_ptr() as *mut u8,
                    self.inode.i_block.len() * 4,
                )
            };
            raw[..bytes.len()].copy_from_slice(bytes);
            self.inode.i_size = bytes.len() as u32;
            self.flush_inode();
            Ok(())
        } else {
            self.write_at(0, target.as_bytes())?;
            Ok(())
        }
    }

    pub fn read_symlink_target(&mut self) -> KResult<KString> {
        let size = self.size() as usize;
        if size <= EXT2_INLINE_SYMLINK_MAX && !self.has_allocated_blocks() {
            let raw = unsafe {
                core::slice::from_raw_parts(
                    self.inode.i_block.as_ptr() as *const u8,
                    self.inode.i_block.len() * 4,
                )
            };
            let s = core::str::from_utf8(&raw[..size]).map_err(|_| KError::InvalidFormat)?;
            Ok(KString::from(s))
        } else {
            let mut buf = KVec::with_capacity(size);
            buf.resize(size, 0);
            self.read_at(0, &mut buf)?;
            let s = core::str::from_utf8(&buf).map_err(|_| KError::InvalidFormat)?;
            Ok(KString::from(s))
        }
    }

    fn has_allocated_blocks(&self) -> bool {
        self.inode.i_block[0] != 0
    }

    pub fn truncate(&mut self, new_size: u64) -> KResult<()> {
        if new_size > self.size() {
            return Err(KError::InvalidArgument);
        }
        self.inode.i_size = new_size as u32;
        self.flush_inode();
        Ok(())
    }

    pub fn set_mode(&mut self, mode: u16) {
        let file_type = self.inode.i_mode & S_IFMT;
        self.inode.i_mode = file_type | (mode & !S_IFMT);
        self.flush_inode();
    }

    /// Frees every data block and indirect-index block owned by this
    /// file (the "meta_pass" extent pass, §4.6), then zeroes the on-disk
    /// inode record. Called once `i_links_count` has reached zero
    /// (§4.6 "Unlink"). An inline symlink target has nothing allocated.
    pub fn free_contents(&mut self) -> KResult<()> {
        if !(self.is_symlink() && !self.has_allocated_blocks()) {
            for i in 0..EXT2_DIRECT_BLOCKS as usize {
                let block = self.inode.i_block[i];
                if block != 0 {
                    self.mount().free_block(block)?;
                }
            }
            self.free_indirect(EXT2_SINGLY_INDIRECT, 1)?;
            self.free_indirect(EXT2_DOUBLY_INDIRECT, 2)?;
            self.free_indirect(EXT2_TRIPLY_INDIRECT, 3)?;
        }

        self.inode = Inode::zeroed();
        let ino = self.ino;
        let inode = self.inode;
        self.mount().write_inode(ino, &inode)?;
        Ok(())
    }

    /// Frees the indirect block tree rooted at `i_block[slot]` (`depth`
    /// levels of index blocks below it), including the root index block
    /// itself.
    fn free_indirect(&mut self, slot: usize, depth: u32) -> KResult<()> {
        let block = self.inode.i_block[slot];
        if block == 0 {
            return Ok(());
        }
        self.free_indirect_block(block, depth)?;
        self.mount().free_block(block)
    }

    /// Recursively frees every pointer in the index block `block`
    /// (`depth` levels deep; leaves at `depth == 1` are data blocks),
    /// freeing deeper index blocks as it unwinds, but not `block` itself
    /// (the caller owns that one).
    fn free_indirect_block(&mut self, block: u32, depth: u32) -> KResult<()> {
        let block_size = self.block_size();
        let mut buf = KVec::with_capacity(block_size);
        buf.resize(block_size, 0);
        self.mount().read_block(block, &mut buf)?;

        let ppb = self.pointers_per_block() as usize;
        for i in 0..ppb {
            let ptr = read_u32(&buf, i * 4);
            if ptr == 0 {
                continue;
            }
            if depth > 1 {
                self.free_indirect_block(ptr, depth - 1)?;
            }
            self.mount().free_block(ptr)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dot_dirent_layout_matches_expected_offsets() {
        let mut buf = [0u8; 16];
        write_u32(&mut buf, 0, 2);
        write_u16(&mut buf, 4, 12);
        write_u8(&mut buf, 6, 1);
        write_u8(&mut buf, 7, 2);
        buf[8] = b'.';
        assert_eq!(read_u32(&buf, 0), 2);
        assert_eq!(read_u16(&buf, 4), 12);
        assert_eq!(buf[8], b'.');
    }
}
