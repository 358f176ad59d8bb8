//! Pathname-to-inode translation and the namespace operations.
//!
//! Each operation composes the directory and inode engines. The parent
//! directory is always handled before the child; rollbacks run in the
//! inverse order of the steps that succeeded.

use crate::{now, Ext2Fs, InodeRef, RENAME_NOREPLACE};
use e2l_dir::{add_link, delete_entry, dotdot, empty_dir, find_entry, inode_by_name, set_link};
use e2l_error::{Ext2Error, Result};
use e2l_inode::Inode;
use e2l_types::{
    DeviceNumber, InodeNumber, NAME_LEN, S_IFDIR, S_IFLNK, S_IFMT, S_IFREG, S_ISGID,
};
use tracing::debug;

impl Ext2Fs {
    /// Allocate and register a new inode parented at `dir`.
    fn new_inode_for(&self, dir: &mut Inode, mode: u16) -> Result<InodeRef> {
        let is_dir = e2l_types::is_dir(mode);
        let alloc = self.ctx().new_inode(dir.block_group, dir.ino, is_dir)?;

        let (uid, default_gid) = *self.owner.lock();
        let mut mode = mode;
        let gid = if dir.mode & S_ISGID != 0 {
            if is_dir {
                mode |= S_ISGID;
            }
            dir.gid
        } else {
            default_gid
        };

        let mut inode = Inode::new_allocated(alloc.ino, alloc.group, mode, uid, gid, dir.flags, now());
        if let Err(err) = e2l_inode::write_inode(&self.ctx(), &mut inode) {
            self.ctx().free_inode(alloc.ino, is_dir)?;
            return Err(err);
        }
        debug!(target: "e2l::fs", ino = alloc.ino.0, mode, "allocated new inode");
        Ok(self.insert_new(inode))
    }

    /// Shared tail of create/symlink/mknod: link the child under `dir`,
    /// undoing the allocation if the link cannot be added.
    fn add_nondir(&self, dir: &mut Inode, name: &[u8], child: InodeRef) -> Result<InodeRef> {
        match add_link(&self.ctx(), dir, name, child.ino, now()) {
            Ok(()) => {
                let mut c = child.lock();
                e2l_inode::write_inode(&self.ctx(), &mut c)?;
                drop(c);
                Ok(child)
            }
            Err(err) => {
                child.lock().links_count -= 1;
                self.iput(child)?;
                Err(err)
            }
        }
    }

    // ── Lookup and path resolution ──────────────────────────────────────

    /// Find `name` in `dir`. A hit on a freed on-disk inode is corruption.
    pub fn lookup(&self, dir: &InodeRef, name: &[u8]) -> Result<Option<InodeRef>> {
        if name.len() > NAME_LEN {
            return Err(Ext2Error::NameTooLong);
        }
        let found = {
            let mut d = dir.lock();
            inode_by_name(&self.ctx(), &mut d, name)?
        };
        let Some(ino) = found else {
            return Ok(None);
        };
        match self.iget(ino) {
            Err(Ext2Error::Stale(_)) => {
                use e2l_error::CorruptionSink;
                self.fs_error("lookup", &format!("deleted inode referenced: {ino}"));
                Err(Ext2Error::Corruption {
                    block: 0,
                    detail: format!("deleted inode {ino} referenced from directory {}", dir.ino),
                })
            }
            other => other.map(Some),
        }
    }

    /// Resolve an absolute slash-separated path from the root.
    pub fn resolve(&self, path: &str) -> Result<InodeRef> {
        let mut cur = self.root()?;
        for comp in path.split('/').filter(|c| !c.is_empty() && *c != ".") {
            match self.lookup(&cur, comp.as_bytes()) {
                Ok(Some(next)) => {
                    self.iput(cur)?;
                    cur = next;
                }
                Ok(None) => {
                    self.iput(cur)?;
                    return Err(Ext2Error::NotFound(comp.to_owned()));
                }
                Err(err) => {
                    self.iput(cur)?;
                    return Err(err);
                }
            }
        }
        Ok(cur)
    }

    // ── Creation ────────────────────────────────────────────────────────

    /// Create a regular file. `mode` carries the permission bits.
    pub fn create(&self, dir: &InodeRef, name: &[u8], mode: u16) -> Result<InodeRef> {
        self.check_writable()?;
        let _ns = self.ns_lock.lock();

        let mut d = dir.lock();
        let child = self.new_inode_for(&mut d, S_IFREG | (mode & !S_IFMT))?;
        self.add_nondir(&mut d, name, child)
    }

    /// Hard-link `target` as `dir`/`name`.
    pub fn link(&self, target: &InodeRef, dir: &InodeRef, name: &[u8]) -> Result<()> {
        self.check_writable()?;
        let _ns = self.ns_lock.lock();

        {
            let mut t = target.lock();
            if t.is_dir() {
                return Err(Ext2Error::IsDirectory);
            }
            if u32::from(t.links_count) >= e2l_types::LINK_MAX {
                return Err(Ext2Error::TooManyLinks);
            }
            t.touch_ctime(now());
            t.links_count += 1;
        }

        let mut d = dir.lock();
        match add_link(&self.ctx(), &mut d, name, target.ino, now()) {
            Ok(()) => {
                let mut t = target.lock();
                e2l_inode::write_inode(&self.ctx(), &mut t)?;
                Ok(())
            }
            Err(err) => {
                let mut t = target.lock();
                t.links_count -= 1;
                t.dirty = true;
                Err(err)
            }
        }
    }

    /// Remove `dir`/`name` (non-directories).
    pub fn unlink(&self, dir: &InodeRef, name: &[u8]) -> Result<()> {
        self.check_writable()?;
        let _ns = self.ns_lock.lock();
        self.unlink_locked(dir, name)
    }

    fn unlink_locked(&self, dir: &InodeRef, name: &[u8]) -> Result<()> {
        let mut d = dir.lock();
        let Some((loc, ino)) = find_entry(&self.ctx(), &mut d, name)? else {
            return Err(Ext2Error::NotFound(String::from_utf8_lossy(name).into_owned()));
        };
        let victim = self.iget(ino)?;
        if victim.lock().is_dir() {
            drop(d);
            self.iput(victim)?;
            return Err(Ext2Error::IsDirectory);
        }

        delete_entry(&self.ctx(), &mut d, loc, now())?;
        let dir_ctime = d.ctime;
        drop(d);

        {
            let mut v = victim.lock();
            v.ctime = dir_ctime;
            v.links_count -= 1;
            v.dirty = true;
        }
        self.iput(victim)
    }

    /// Create a symbolic link to `target`.
    ///
    /// Targets that fit the inode's slot bytes are stored inline; longer
    /// ones (up to a block) go through the data path as a single block.
    pub fn symlink(&self, dir: &InodeRef, name: &[u8], target: &[u8]) -> Result<InodeRef> {
        self.check_writable()?;
        let _ns = self.ns_lock.lock();

        if target.len() + 1 > self.geometry().block_size.as_usize() {
            return Err(Ext2Error::NameTooLong);
        }

        let mut d = dir.lock();
        let child = self.new_inode_for(&mut d, S_IFLNK | 0o777)?;
        {
            let mut c = child.lock();
            if target.len() <= e2l_types::FAST_SYMLINK_MAX {
                c.set_fast_symlink(target);
            } else {
                self.write_locked(&mut c, 0, target)?;
                c.kind = e2l_inode::InodeKind::Symlink;
            }
            if let Err(err) = e2l_inode::write_inode(&self.ctx(), &mut c) {
                c.links_count -= 1;
                drop(c);
                self.iput(child)?;
                return Err(err);
            }
        }
        self.add_nondir(&mut d, name, child)
    }

    /// Create a directory: bump the parent for the child's `..`, lay out
    /// `.`/`..`, then publish the name.
    pub fn mkdir(&self, dir: &InodeRef, name: &[u8], mode: u16) -> Result<InodeRef> {
        self.check_writable()?;
        let _ns = self.ns_lock.lock();

        let mut d = dir.lock();
        if u32::from(d.links_count) >= e2l_types::LINK_MAX {
            return Err(Ext2Error::TooManyLinks);
        }
        d.links_count += 1;
        d.dirty = true;

        let child = match self.new_inode_for(&mut d, S_IFDIR | (mode & !S_IFMT)) {
            Ok(child) => child,
            Err(err) => {
                d.links_count -= 1;
                return Err(err);
            }
        };

        let setup = {
            let mut c = child.lock();
            c.links_count += 1; // "." below
            e2l_dir::make_empty(&self.ctx(), &mut c, d.ino)
                .and_then(|()| e2l_inode::write_inode(&self.ctx(), &mut c).map(|_| ()))
        };
        let linked = setup.and_then(|()| add_link(&self.ctx(), &mut d, name, child.ino, now()));

        match linked {
            Ok(()) => {
                let mut c = child.lock();
                e2l_inode::write_inode(&self.ctx(), &mut c)?;
                drop(c);
                Ok(child)
            }
            Err(err) => {
                {
                    let mut c = child.lock();
                    c.links_count -= 2;
                }
                d.links_count -= 1;
                drop(d);
                self.iput(child)?;
                Err(err)
            }
        }
    }

    /// Remove an empty directory.
    pub fn rmdir(&self, dir: &InodeRef, name: &[u8]) -> Result<()> {
        self.check_writable()?;
        let _ns = self.ns_lock.lock();

        let mut d = dir.lock();
        let Some((loc, ino)) = find_entry(&self.ctx(), &mut d, name)? else {
            return Err(Ext2Error::NotFound(String::from_utf8_lossy(name).into_owned()));
        };
        let victim = self.iget(ino)?;

        let empty = {
            let mut v = victim.lock();
            if !v.is_dir() {
                drop(v);
                drop(d);
                self.iput(victim)?;
                return Err(Ext2Error::NotDirectory);
            }
            empty_dir(&self.ctx(), &mut v)?
        };
        if !empty {
            drop(d);
            self.iput(victim)?;
            return Err(Ext2Error::NotEmpty);
        }

        delete_entry(&self.ctx(), &mut d, loc, now())?;
        let dir_ctime = d.ctime;
        d.links_count -= 1;
        d.dirty = true;
        drop(d);

        {
            let mut v = victim.lock();
            v.ctime = dir_ctime;
            v.size = 0;
            v.links_count = v.links_count.saturating_sub(2);
            v.dirty = true;
        }
        self.iput(victim)
    }

    /// Create a device, fifo, or socket node.
    pub fn mknod(&self, dir: &InodeRef, name: &[u8], mode: u16, rdev: DeviceNumber) -> Result<InodeRef> {
        self.check_writable()?;
        let _ns = self.ns_lock.lock();

        let mut d = dir.lock();
        let child = self.new_inode_for(&mut d, mode)?;
        {
            let mut c = child.lock();
            c.init_special(rdev);
            if let Err(err) = e2l_inode::write_inode(&self.ctx(), &mut c) {
                c.links_count -= 1;
                drop(c);
                self.iput(child)?;
                return Err(err);
            }
        }
        self.add_nondir(&mut d, name, child)
    }

    /// Rename `old_dir`/`old_name` to `new_dir`/`new_name`.
    ///
    /// Ordering keeps a name for the source bound at all times: the new
    /// binding is published before the old entry is deleted, so concurrent
    /// lookups see the pre- or post-rename state, never neither.
    pub fn rename(
        &self,
        old_dir: &InodeRef,
        old_name: &[u8],
        new_dir: &InodeRef,
        new_name: &[u8],
        flags: u32,
    ) -> Result<()> {
        if flags & !RENAME_NOREPLACE != 0 {
            return Err(Ext2Error::Unsupported("rename flags beyond NOREPLACE"));
        }
        self.check_writable()?;
        let _ns = self.ns_lock.lock();
        let same_dir = old_dir.ino == new_dir.ino;
        let when = now();

        let (old_loc, old_ino) = {
            let mut od = old_dir.lock();
            find_entry(&self.ctx(), &mut od, old_name)?.ok_or_else(|| {
                Ext2Error::NotFound(String::from_utf8_lossy(old_name).into_owned())
            })?
        };
        let old_inode = self.iget(old_ino)?;
        let dir_move = { old_inode.lock().is_dir() } && !same_dir;

        // A moved directory needs its `..` re-pointed afterwards.
        let dotdot_loc = if dir_move {
            let mut oi = old_inode.lock();
            Some(dotdot(&self.ctx(), &mut oi)?.0)
        } else {
            None
        };

        let target = {
            let mut nd = new_dir.lock();
            find_entry(&self.ctx(), &mut nd, new_name)?
        };

        let publish = match target {
            Some((new_loc, new_ino)) => {
                if flags & RENAME_NOREPLACE != 0 {
                    self.iput(old_inode)?;
                    return Err(Ext2Error::Exists);
                }
                let target_ref = self.iget(new_ino)?;
                let res = (|| -> Result<()> {
                    if dir_move {
                        let mut t = target_ref.lock();
                        if !t.is_dir() {
                            return Err(Ext2Error::NotDirectory);
                        }
                        if !empty_dir(&self.ctx(), &mut t)? {
                            return Err(Ext2Error::NotEmpty);
                        }
                    }
                    {
                        let mut nd = new_dir.lock();
                        set_link(&self.ctx(), &mut nd, new_loc, old_ino, true, when)?;
                    }
                    let mut t = target_ref.lock();
                    t.touch_ctime(when);
                    if dir_move {
                        t.links_count = t.links_count.saturating_sub(1);
                    }
                    t.links_count = t.links_count.saturating_sub(1);
                    Ok(())
                })();
                let put = self.iput(target_ref);
                res.and(put)
            }
            None => {
                let mut nd = new_dir.lock();
                add_link(&self.ctx(), &mut nd, new_name, old_ino, when).map(|()| {
                    if dir_move {
                        nd.links_count += 1;
                        nd.dirty = true;
                    }
                })
            }
        };
        if let Err(err) = publish {
            self.iput(old_inode)?;
            return Err(err);
        }

        old_inode.lock().touch_ctime(when);

        {
            let mut od = old_dir.lock();
            delete_entry(&self.ctx(), &mut od, old_loc, when)?;
        }

        if let Some(loc) = dotdot_loc {
            {
                let mut oi = old_inode.lock();
                set_link(&self.ctx(), &mut oi, loc, new_dir.ino, false, when)?;
            }
            let mut od = old_dir.lock();
            od.links_count -= 1;
            od.dirty = true;
        }

        self.iput(old_inode)
    }

    // ── Directory reading ───────────────────────────────────────────────

    /// Iterate `dir` from `cursor`, emitting `(name, inode)` per live entry.
    pub fn readdir(
        &self,
        dir: &InodeRef,
        cursor: &mut e2l_dir::DirCursor,
        emit: &mut dyn FnMut(&[u8], InodeNumber) -> bool,
    ) -> Result<()> {
        let mut d = dir.lock();
        e2l_dir::readdir(&self.ctx(), &mut d, cursor, emit)
    }

    /// The symlink's target bytes.
    pub fn read_symlink(&self, link: &InodeRef) -> Result<Vec<u8>> {
        let mut l = link.lock();
        if !l.is_symlink() {
            return Err(Ext2Error::InvalidInput("not a symlink"));
        }
        if l.is_fast_symlink() {
            return Ok(l.fast_symlink_target());
        }
        let size = l.size as usize;
        let mut buf = vec![0_u8; size];
        let read = self.read_locked(&mut l, 0, &mut buf)?;
        buf.truncate(read);
        Ok(buf)
    }
}
