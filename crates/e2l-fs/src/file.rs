//! Whole-file data access and attributes.
//!
//! Stands in for the host's generic read/write plumbing: every path maps
//! logical blocks through the inode's direct slots and moves bytes through
//! the buffer cache. Holes read as zeros; writes allocate on demand and
//! never reach past the direct-block limit.

use crate::{now, Ext2Fs, InodeRef};
use e2l_error::{Ext2Error, Result};
use e2l_inode::{get_blocks, truncate_blocks, Inode, InodeKind};
use e2l_types::{DeviceNumber, InodeNumber};
use serde::Serialize;
use tracing::trace;

/// Attribute snapshot (getattr).
#[derive(Debug, Clone, Serialize)]
pub struct Attr {
    pub ino: InodeNumber,
    pub mode: u16,
    pub links: u16,
    pub uid: u16,
    pub gid: u16,
    pub size: u32,
    /// 512-byte sectors, as stored on disk.
    pub blocks: u32,
    pub atime: u32,
    pub mtime: u32,
    pub ctime: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rdev: Option<DeviceNumber>,
}

/// Attribute changes (setattr). A size change truncates or zero-extends.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetAttr {
    pub mode: Option<u16>,
    pub uid: Option<u16>,
    pub gid: Option<u16>,
    pub size: Option<u64>,
    pub atime: Option<u32>,
    pub mtime: Option<u32>,
}

impl Ext2Fs {
    // ── Read ────────────────────────────────────────────────────────────

    /// Read up to `buf.len()` bytes at `offset`. Returns the bytes read,
    /// clamped at end of file; unwritten blocks inside the file read zero.
    pub fn read_at(&self, file: &InodeRef, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let mut inode = file.lock();
        if inode.is_dir() {
            return Err(Ext2Error::IsDirectory);
        }
        self.read_locked(&mut inode, offset, buf)
    }

    pub(crate) fn read_locked(
        &self,
        inode: &mut Inode,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize> {
        let size = u64::from(inode.size);
        if offset >= size {
            return Ok(0);
        }
        let len = buf.len().min((size - offset) as usize);
        let block_size = self.geometry().block_size.as_usize();

        let mut done = 0_usize;
        while done < len {
            let pos = offset + done as u64;
            let iblock = (pos / block_size as u64) as u32;
            let in_block = (pos % block_size as u64) as usize;
            let step = (block_size - in_block).min(len - done);

            match get_blocks(&self.ctx(), inode, iblock, false)? {
                Some(mapped) => {
                    let data = self.dev_read(mapped.block)?;
                    buf[done..done + step].copy_from_slice(&data[in_block..in_block + step]);
                }
                None => buf[done..done + step].fill(0),
            }
            done += step;
        }
        trace!(target: "e2l::fs", ino = inode.ino.0, offset, len, "read");
        Ok(len)
    }

    fn dev_read(&self, block: e2l_types::BlockNumber) -> Result<Vec<u8>> {
        use e2l_block::BlockDevice;
        Ok(self.dev.read_block(block)?.into_inner())
    }

    // ── Write ───────────────────────────────────────────────────────────

    /// Write `data` at `offset`, allocating blocks as needed and extending
    /// the file. The file cannot grow past the direct-block limit.
    pub fn write_at(&self, file: &InodeRef, offset: u64, data: &[u8]) -> Result<usize> {
        self.check_writable()?;
        let mut inode = file.lock();
        if inode.is_dir() {
            return Err(Ext2Error::IsDirectory);
        }
        self.write_locked(&mut inode, offset, data)
    }

    pub(crate) fn write_locked(
        &self,
        inode: &mut Inode,
        offset: u64,
        data: &[u8],
    ) -> Result<usize> {
        use e2l_block::BlockDevice;

        let end = offset + data.len() as u64;
        if end > self.geometry().max_file_size() {
            return Err(Ext2Error::Unsupported("file size beyond direct blocks"));
        }
        let block_size = self.geometry().block_size.as_usize();

        let mut done = 0_usize;
        while done < data.len() {
            let pos = offset + done as u64;
            let iblock = (pos / block_size as u64) as u32;
            let in_block = (pos % block_size as u64) as usize;
            let step = (block_size - in_block).min(data.len() - done);

            let Some(mapped) = get_blocks(&self.ctx(), inode, iblock, true)? else {
                return Err(Ext2Error::Corruption {
                    block: 0,
                    detail: format!("mapping block {iblock} of inode {} failed", inode.ino),
                });
            };

            let mut block_data = if mapped.new {
                vec![0_u8; block_size]
            } else {
                self.dev_read(mapped.block)?
            };
            block_data[in_block..in_block + step].copy_from_slice(&data[done..done + step]);
            self.dev.write_block(mapped.block, &block_data)?;
            done += step;
        }

        if end > u64::from(inode.size) {
            inode.size = end as u32;
        }
        inode.touch_mtime_ctime(now());
        trace!(target: "e2l::fs", ino = inode.ino.0, offset, len = data.len(), "write");
        Ok(data.len())
    }

    // ── Attributes ──────────────────────────────────────────────────────

    pub fn getattr(&self, file: &InodeRef) -> Attr {
        let inode = file.lock();
        let rdev = match inode.kind {
            InodeKind::CharDev(dev) | InodeKind::BlockDev(dev) => Some(dev),
            _ => None,
        };
        Attr {
            ino: inode.ino,
            mode: inode.mode,
            links: inode.links_count,
            uid: inode.uid,
            gid: inode.gid,
            size: inode.size,
            blocks: inode.blocks,
            atime: inode.atime,
            mtime: inode.mtime,
            ctime: inode.ctime,
            rdev,
        }
    }

    pub fn setattr(&self, file: &InodeRef, attr: &SetAttr) -> Result<()> {
        self.check_writable()?;
        let mut inode = file.lock();

        if let Some(size) = attr.size {
            if size != u64::from(inode.size) {
                self.setsize_locked(&mut inode, size)?;
            }
        }
        if let Some(mode) = attr.mode {
            inode.mode = (inode.mode & e2l_types::S_IFMT) | (mode & !e2l_types::S_IFMT);
        }
        if let Some(uid) = attr.uid {
            inode.uid = uid;
        }
        if let Some(gid) = attr.gid {
            inode.gid = gid;
        }
        if let Some(atime) = attr.atime {
            inode.atime = atime;
        }
        if let Some(mtime) = attr.mtime {
            inode.mtime = mtime;
        }
        inode.ctime = now();
        inode.dirty = true;
        Ok(())
    }

    /// Change the file size: zero the tail of the last kept block, adjust
    /// `i_size`, and release the dropped blocks.
    fn setsize_locked(&self, inode: &mut Inode, new_size: u64) -> Result<()> {
        use e2l_block::BlockDevice;

        if !(inode.is_reg() || inode.is_dir() || inode.is_symlink()) || inode.is_fast_symlink() {
            return Err(Ext2Error::InvalidInput("inode type cannot be resized"));
        }
        if new_size > self.geometry().max_file_size() {
            return Err(Ext2Error::Unsupported("file size beyond direct blocks"));
        }

        let block_size = self.geometry().block_size.as_usize();
        let tail = (new_size % block_size as u64) as usize;
        if tail != 0 {
            // Zero from the new end to the block boundary so later extension
            // reads back zeros.
            let iblock = (new_size / block_size as u64) as u32;
            if let Some(mapped) = get_blocks(&self.ctx(), inode, iblock, false)? {
                let mut data = self.dev_read(mapped.block)?;
                data[tail..].fill(0);
                self.dev.write_block(mapped.block, &data)?;
            }
        }

        inode.size = new_size as u32;
        truncate_blocks(&self.ctx(), inode, new_size as u32)?;
        inode.touch_mtime_ctime(now());
        Ok(())
    }
}
