//! Virtual file system layer (§4.7 "VFS / FileHandle").
//!
//! Owns the root filesystem's mount and every filesystem mounted on top
//! of it, decomposes pathnames, walks vnodes (crossing a mount's overlay
//! map when a path segment is shadowed), and exposes the user-facing
//! `open`/`close`/`touch`/`mkdir`/`remove`/`link`/`sym_link`/`unlink`/
//! `mount`/`unmount` surface. A single concrete filesystem (ext2) is
//! supported, so there is no capability-table dispatch here — just
//! `Ext2Mount`/`Ext2VNode` directly, per §9's "model a single concrete
//! filesystem behind a capability set" note, simplified to the one
//! filesystem this kernel actually reads.

use core::cell::RefCell;

use containers::{KBox, KHashMap, KRc, KString, KVec};

use crate::driver::ahci::SataPort;
use crate::error::{KError, KResult};
use crate::fs::ext2::{
    Ext2Mount, Ext2VNode, EXT2_FT_DIR, EXT2_FT_REG_FILE, EXT2_FT_SYMLINK, EXT2_PARTITION_TYPE_GUID,
    S_IFDIR, S_IFLNK, S_IFREG,
};

type VNodeRef = KRc<RefCell<Ext2VNode>>;

/// Splits `path` into `(directory_prefix, basename)`; `directory_prefix`
/// ends with `/` (or is empty for a bare top-level name), `basename` is
/// the final segment (§4.7 "path decomposition").
fn split_path(path: &str) -> (&str, &str) {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(idx) => (&trimmed[..=idx], &trimmed[idx + 1..]),
        None => ("", trimmed),
    }
}

pub struct FileHandle {
    vnode: VNodeRef,
    path: KString,
    offset: u64,
    readable: bool,
    writeable: bool,
    valid: bool,
}

impl FileHandle {
    pub fn seek(&mut self, offset: u64) {
        self.offset = offset;
    }

    pub fn read(&mut self, len: usize) -> KResult<KVec<u8>> {
        if !self.valid {
            return Err(KError::Closed);
        }
        if !self.readable {
            return Err(KError::InvalidArgument);
        }
        let mut buf = KVec::with_capacity(len);
        buf.resize(len, 0);
        let n = self.vnode.borrow_mut().read_at(self.offset, &mut buf)?;
        buf.truncate(n);
        self.offset += n as u64;
        Ok(buf)
    }

    pub fn write(&mut self, buf: &[u8]) -> KResult<usize> {
        if !self.valid {
            return Err(KError::Closed);
        }
        if !self.writeable {
            return Err(KError::InvalidArgument);
        }
        let n = self.vnode.borrow_mut().write_at(self.offset, buf)?;
        self.offset += n as u64;
        Ok(n)
    }

    pub fn ino(&self) -> u32 {
        self.vnode.borrow().ino()
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Invalidates the handle and unpins its vnode, without consulting
    /// or updating the owning `Vfs`'s open-handle table. `Vfs::close`
    /// is the path that also does that bookkeeping; this exists so a
    /// handle dropped without an explicit `close` still releases its pin.
    fn suspend_io(&mut self) {
        if self.valid {
            self.valid = false;
            self.vnode.borrow_mut().unpin_self();
        }
    }
}

impl Drop for FileHandle {
    fn drop(&mut self) {
        self.suspend_io();
    }
}

pub struct Vfs {
    /// `mounts[0]` is the boot filesystem; every later entry is attached
    /// somewhere in `mounts[0]`'s (or a descendant's) overlay map.
    mounts: KVec<KBox<Ext2Mount>>,
    open_handles: KHashMap<KString, u32>,
}

impl Vfs {
    pub fn new(root: KBox<Ext2Mount>) -> Self {
        let mut mounts = KVec::new();
        mounts.push(root);
        Self {
            mounts,
            open_handles: KHashMap::new(),
        }
    }

    fn root(&self) -> VNodeRef {
        self.mounts[0].root()
    }

    /// Walks `path` segment by segment from the root, consulting each
    /// vnode's overlay map before its on-disk directory entries. Every
    /// intermediate pin taken along the way (on-disk children only —
    /// overlay roots are already permanently pinned by their own mount)
    /// is released before the walk moves past it; the caller decides
    /// whether the final vnode should gain a lasting pin via
    /// `pin_self`/`unpin_self`.
    fn resolve(&mut self, path: &str) -> KResult<VNodeRef> {
        let path = path.trim_matches('/');
        let mut current = self.root();
        if path.is_empty() {
            return Ok(current);
        }

        for seg in path.split('/') {
            if seg.is_empty() {
                return Err(KError::InvalidArgument);
            }

            let overlay_hit = current.borrow().overlay_get(seg);
            let next = if let Some(overlay_root) = overlay_hit {
                overlay_root
            } else {
                let found = current.borrow_mut().find_child(seg)?.ok_or(KError::NotFound)?;
                let child = current.borrow_mut().pin_child(found.ino)?;
                current.borrow_mut().unpin_child(found.ino);
                child
            };

            current = next;
        }

        Ok(current)
    }

    /// Resolves `path` to its parent directory vnode and basename,
    /// rejecting an empty basename (root itself has none).
    fn resolve_parent<'a>(&mut self, path: &'a str) -> KResult<(VNodeRef, &'a str)> {
        let (dir, base) = split_path(path);
        if base.is_empty() {
            return Err(KError::InvalidArgument);
        }
        let parent = self.resolve(dir)?;
        if !parent.borrow().is_dir() {
            return Err(KError::InvalidArgument);
        }
        Ok((parent, base))
    }

    /// Creates a new regular file named by `path`'s basename inside its
    /// parent directory.
    pub fn touch(&mut self, path: &str) -> KResult<VNodeRef> {
        let (parent, base) = self.resolve_parent(path)?;
        let mut parent_ref = parent.borrow_mut();
        if parent_ref.find_child(base)?.is_some() {
            return Err(KError::AlreadyExists);
        }
        let ino = parent_ref.mount().alloc_inode(S_IFREG | 0o644)?;
        parent_ref.add_entry(ino, base, EXT2_FT_REG_FILE)?;
        parent_ref.mount().get_vnode(ino)
    }

    /// Creates a new, empty directory named by `path`'s basename,
    /// initialised with `.`/`..` entries, and bumps both its own and its
    /// parent's link count for the new `..`/`.` references.
    pub fn mkdir(&mut self, path: &str) -> KResult<VNodeRef> {
        let (parent, base) = self.resolve_parent(path)?;
        let mut parent_ref = parent.borrow_mut();
        if parent_ref.find_child(base)?.is_some() {
            return Err(KError::AlreadyExists);
        }
        let parent_ino = parent_ref.ino();
        let mount = parent_ref.mount();
        let ino = mount.alloc_inode(S_IFDIR | 0o755)?;
        parent_ref.add_entry(ino, base, EXT2_FT_DIR)?;

        let child = parent_ref.mount().get_vnode(ino)?;
        child.borrow_mut().init_directory(parent_ino)?;
        child.borrow_mut().set_links_count(2);
        let parent_links = parent_ref.links_count();
        parent_ref.set_links_count(parent_links + 1);

        Ok(child)
    }

    /// Removes the directory entry at `path` and decrements the target's
    /// link count, freeing it once it reaches zero. Directories are
    /// refused unless empty (only `.`/`..` remain) to avoid orphaning
    /// their contents.
    pub fn remove(&mut self, path: &str) -> KResult<()> {
        let (parent, base) = self.resolve_parent(path)?;
        let mut parent_ref = parent.borrow_mut();
        let found = parent_ref.find_child(base)?.ok_or(KError::NotFound)?;

        let target = parent_ref.mount().get_vnode(found.ino)?;
        {
            let mut target_ref = target.borrow_mut();
            if target_ref.is_dir() && target_ref.count_entries()? > 2 {
                parent_ref.mount().unpin(found.ino);
                return Err(KError::InvalidArgument);
            }
            let new_links = target_ref.links_count().saturating_sub(1);
            target_ref.set_links_count(new_links);
        }

        parent_ref.remove_entry(base)?;
        parent_ref.mount().unpin(found.ino);

        if target.borrow().links_count() == 0 {
            let ino = target.borrow().ino();
            target.borrow_mut().free_contents()?;
            parent_ref.mount().free_inode(ino)?;
        }
        Ok(())
    }

    /// Adds a new directory entry for `new_path` pointing at the inode
    /// already named by `old_path`, incrementing its link count.
    pub fn link(&mut self, old_path: &str, new_path: &str) -> KResult<()> {
        let target = self.resolve(old_path)?;
        let (parent, base) = self.resolve_parent(new_path)?;
        let mut parent_ref = parent.borrow_mut();
        if parent_ref.find_child(base)?.is_some() {
            return Err(KError::AlreadyExists);
        }

        let mut target_ref = target.borrow_mut();
        if target_ref.is_dir() {
            return Err(KError::InvalidArgument);
        }
        let ino = target_ref.ino();
        let file_type = if target_ref.is_symlink() {
            EXT2_FT_SYMLINK
        } else {
            EXT2_FT_REG_FILE
        };
        parent_ref.add_entry(ino, base, file_type)?;
        let links = target_ref.links_count();
        target_ref.set_links_count(links + 1);
        Ok(())
    }

    /// `unlink` is `remove` restricted to non-directories (§4.6 "Hard
    /// link"/"Unlink").
    pub fn unlink(&mut self, path: &str) -> KResult<()> {
        let vnode = self.resolve(path)?;
        if vnode.borrow().is_dir() {
            return Err(KError::InvalidArgument);
        }
        self.remove(path)
    }

    /// Creates a symbolic link at `path` whose target is `target`.
    pub fn sym_link(&mut self, path: &str, target: &str) -> KResult<VNodeRef> {
        let (parent, base) = self.resolve_parent(path)?;
        let mut parent_ref = parent.borrow_mut();
        if parent_ref.find_child(base)?.is_some() {
            return Err(KError::AlreadyExists);
        }
        let mount = parent_ref.mount();
        let ino = mount.alloc_inode(S_IFLNK | 0o777)?;
        parent_ref.add_entry(ino, base, EXT2_FT_SYMLINK)?;

        let vnode = parent_ref.mount().get_vnode(ino)?;
        vnode.borrow_mut().write_symlink_target(target)?;
        Ok(vnode)
    }

    /// Opens `path`, creating it via `touch` first when `create` is set
    /// and the path does not yet resolve.
    pub fn open(&mut self, path: &str, readable: bool, writeable: bool, create: bool) -> KResult<FileHandle> {
        let vnode = match self.resolve(path) {
            Ok(v) => v,
            Err(KError::NotFound) if create => self.touch(path)?,
            Err(e) => return Err(e),
        };
        vnode.borrow_mut().pin_self();

        let key = KString::from(path);
        match self.open_handles.get_mut(&key) {
            Some(n) => *n += 1,
            None => {
                self.open_handles.insert(KString::from(path), 1);
            }
        }

        Ok(FileHandle {
            vnode,
            path: key,
            offset: 0,
            readable,
            writeable,
            valid: true,
        })
    }

    /// Invalidates `handle` and unpins its vnode, decrementing the
    /// open-handle count for its path.
    pub fn close(&mut self, mut handle: FileHandle) {
        handle.suspend_io();
        if let Some(n) = self.open_handles.get_mut(&handle.path) {
            *n -= 1;
            if *n == 0 {
                self.open_handles.remove(&handle.path);
            }
        }
    }

    /// Mounts the `part_num`-th partition of `port` at `path`, if its
    /// GPT entry's type GUID is the ext2 type this kernel knows how to
    /// read (§4.7 "mount").
    pub fn mount(&mut self, path: &str, port: KBox<SataPort>, part_num: usize) -> KResult<()> {
        let (guid_lo, guid_hi) = port
            .nth_partition_type_guid(part_num)
            .ok_or(KError::NotFound)?;
        if (guid_lo, guid_hi) != EXT2_PARTITION_TYPE_GUID {
            return Err(KError::InvalidFormat);
        }
        let (start_lba, _len) = port.get_nth_partition(part_num).ok_or(KError::NotFound)?;

        let (parent, base) = self.resolve_parent(path)?;
        {
            let mut parent_ref = parent.borrow_mut();
            if !parent_ref.is_dir() {
                return Err(KError::InvalidArgument);
            }
            if parent_ref.overlay_get(base).is_some() {
                return Err(KError::AlreadyExists);
            }
        }

        let new_mount = Ext2Mount::new(port, start_lba)?;
        let new_root = new_mount.root();
        self.mounts.push(new_mount);

        parent.borrow_mut().pin_self();
        parent.borrow_mut().mount_child(base, new_root);
        Ok(())
    }

    /// Detaches the filesystem mounted at `path`, unpinning the mount
    /// point's parent once its overlay map becomes empty (§3 "VNode"
    /// invariant (b)).
    pub fn unmount(&mut self, path: &str) -> KResult<()> {
        let (parent, base) = self.resolve_parent(path)?;
        let mut parent_ref = parent.borrow_mut();
        if parent_ref.unmount_child(base).is_none() {
            return Err(KError::NotFound);
        }
        if parent_ref.overlay_is_empty() {
            parent_ref.unpin_self();
        }
        Ok(())
    }

    /// Resolves `path` without opening a handle, for callers (`stat`-like
    /// uses) that just need the target vnode transiently.
    pub fn lookup(&mut self, path: &str) -> KResult<VNodeRef> {
        self.resolve(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_path_separates_prefix_and_basename() {
        assert_eq!(split_path("/a/b/c.txt"), ("/a/b/", "c.txt"));
        assert_eq!(split_path("/a"), ("/", "a"));
        assert_eq!(split_path("a"), ("", "a"));
        assert_eq!(split_path("/a/b/"), ("/a/", "b"));
    }
}
