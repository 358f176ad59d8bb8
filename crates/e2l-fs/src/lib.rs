#![forbid(unsafe_code)]
//! The mounted ext2-lite filesystem.
//!
//! Owns the superblock lifecycle (probe, validate, mount state, sync,
//! unmount), the pinned group descriptors, the inode cache, and the
//! namespace operations composed from the allocator, inode, and directory
//! engines. On-disk corruption funnels through `fs_error`, which marks the
//! filesystem and applies the configured `errors=` policy.

mod file;
mod namei;
mod options;

pub use e2l_dir::DirCursor;
pub use file::{Attr, SetAttr};
pub use options::{ErrorPolicy, MountOptions};

use e2l_alloc::{FsCounters, FsCtx, FsGeometry, GroupTable};
use e2l_block::{BlockDevice, BufferCache, ByteBlockDevice, ByteDevice};
use e2l_error::{CorruptionSink, Ext2Error, Result};
use e2l_inode::Inode;
use e2l_ondisk::{GroupDesc, Superblock, GROUP_DESC_SIZE};
use e2l_types::{
    BlockNumber, ByteOffset, InodeNumber, ERROR_FS, MAX_SUPP_REV, SUPERBLOCK_OFFSET,
    SUPERBLOCK_SIZE, VALID_FS,
};
use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, warn};

/// Only rename flag this variant understands.
pub const RENAME_NOREPLACE: u32 = 1;

type Device = BufferCache<ByteBlockDevice<Box<dyn ByteDevice>>>;

/// Current time as 32-bit seconds, the on-disk timestamp width.
#[must_use]
pub(crate) fn now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

/// Counted reference to a cached in-memory inode.
///
/// Obtained from `iget` (or the namespace operations) and returned through
/// `iput`; the last put evicts the inode, deleting it on disk when its link
/// count reached zero.
#[derive(Debug)]
pub struct InodeRef {
    pub ino: InodeNumber,
    inode: Arc<Mutex<Inode>>,
}

impl InodeRef {
    pub fn lock(&self) -> MutexGuard<'_, Inode> {
        self.inode.lock()
    }
}

struct IcacheEntry {
    inode: Arc<Mutex<Inode>>,
    refs: usize,
}

struct SbState {
    sb: Superblock,
    /// Pinned contents of the block holding the superblock; dynamic fields
    /// are patched in place before every superblock write.
    sb_bytes: Vec<u8>,
    mount_state: u16,
}

pub struct Ext2Fs {
    dev: Device,
    geo: FsGeometry,
    table: GroupTable,
    counters: FsCounters,
    state: Mutex<SbState>,
    icache: Mutex<HashMap<u32, IcacheEntry>>,
    options: Mutex<MountOptions>,
    read_only: AtomicBool,
    /// Cached statfs overhead: (blocks_count it was computed for, overhead).
    overhead: Mutex<Option<(u32, u32)>>,
    /// Serialises namespace mutations, standing in for the host VFS's
    /// per-inode directory locks.
    ns_lock: Mutex<()>,
    owner: Mutex<(u16, u16)>,
}

impl fmt::Debug for Ext2Fs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ext2Fs").finish_non_exhaustive()
    }
}

/// statfs report. Total blocks exclude the filesystem's own structures.
#[derive(Debug, Clone, Serialize)]
pub struct StatFs {
    pub block_size: u32,
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub namelen: u32,
    pub fsid: u64,
}

impl Ext2Fs {
    // ── Mount ───────────────────────────────────────────────────────────

    /// Mount a filesystem from a byte device.
    ///
    /// The superblock is probed at byte 1024 regardless of block size; once
    /// the declared block size is known the device is re-read through a
    /// block-sized cache and the geometry, feature bits, and descriptors
    /// are all validated before the mount is declared live.
    pub fn mount(dev: Box<dyn ByteDevice>, option_str: &str, read_only: bool) -> Result<Self> {
        let mut region = vec![0_u8; SUPERBLOCK_SIZE];
        dev.read_exact_at(ByteOffset(SUPERBLOCK_OFFSET as u64), &mut region)
            .map_err(|_| Ext2Error::Format("unable to read superblock".to_owned()))?;
        let probe = Superblock::parse_region(&region)
            .map_err(|err| Ext2Error::Format(format!("can't find an ext2 filesystem: {err}")))?;

        if probe.default_mount_opts != 0 {
            warn!(target: "e2l::fs", "ignoring default mount options");
        }
        let opts = MountOptions::from_sb_errors(probe.errors).parse(option_str)?;

        // This lite variant supports no feature set at all.
        if probe.has_any_features() {
            error!(target: "e2l::fs", "couldn't mount because of unsupported features");
            return Err(Ext2Error::Unsupported("filesystem advertises feature flags"));
        }

        // Re-read the superblock through the declared block size.
        let block_dev = ByteBlockDevice::new(dev, probe.block_size)?;
        let cache = BufferCache::new(block_dev);
        let sb_block = BlockNumber(SUPERBLOCK_OFFSET as u32 / probe.block_size);
        let sb_offset = SUPERBLOCK_OFFSET % probe.block_size as usize;
        let sb_bytes = cache
            .read_block(sb_block)?
            .into_inner();
        let sb = Superblock::parse_region(&sb_bytes[sb_offset..sb_offset + SUPERBLOCK_SIZE])
            .map_err(|_| Ext2Error::Format("magic mismatch on second superblock read".to_owned()))?;

        sb.validate_geometry()?;
        let geo = FsGeometry::from_superblock(&sb)?;
        if u64::from(geo.blocks_count) > cache.block_count() {
            return Err(Ext2Error::Format(format!(
                "filesystem claims {} blocks but the device holds {}",
                geo.blocks_count,
                cache.block_count()
            )));
        }

        let mut read_only = read_only;
        if sb.rev_level > MAX_SUPP_REV {
            error!(target: "e2l::fs", rev = sb.rev_level, "revision level too high, forcing read-only mode");
            read_only = true;
        }

        // Load every descriptor block; they stay pinned until unmount.
        let mut descs = Vec::with_capacity(geo.groups_count as usize);
        for i in 0..geo.gdb_count {
            let block = cache
                .read_block(geo.desc_block(i))
                .map_err(|_| Ext2Error::Format("unable to read group descriptors".to_owned()))?;
            let bytes = block.as_slice();
            let in_block = geo
                .desc_per_block
                .min(geo.groups_count - i * geo.desc_per_block);
            for j in 0..in_block as usize {
                descs.push(GroupDesc::parse_from_bytes(&bytes[j * GROUP_DESC_SIZE..])?);
            }
        }

        check_descriptors(&geo, &descs)?;
        let table = GroupTable::new(descs);
        let counters = FsCounters::new(
            table.count_free_blocks(),
            table.count_free_inodes(),
            table.count_dirs(),
        );

        let mount_state = sb.state;
        let fs = Self {
            dev: cache,
            geo,
            table,
            counters,
            state: Mutex::new(SbState {
                sb,
                sb_bytes,
                mount_state,
            }),
            icache: Mutex::new(HashMap::new()),
            options: Mutex::new(opts),
            read_only: AtomicBool::new(read_only),
            overhead: Mutex::new(None),
            ns_lock: Mutex::new(()),
            owner: Mutex::new((0, 0)),
        };

        // Enough is set up to read an inode: sanity-check the root.
        let root = e2l_inode::read_inode(&fs.ctx(), InodeNumber::ROOT)
            .map_err(|_| Ext2Error::Format("corrupt root inode, run e2fsck".to_owned()))?;
        if !root.is_dir() || root.blocks == 0 || root.size == 0 {
            return Err(Ext2Error::Format("corrupt root inode, run e2fsck".to_owned()));
        }

        fs.check_super();
        if !fs.is_read_only() {
            fs.sync_fs(true)?;
        }
        info!(target: "e2l::fs", block_size = fs.geo.block_size.get(), groups = fs.geo.groups_count, "mounted");
        Ok(fs)
    }

    /// Mount-time state warnings and bookkeeping (writable mounts only).
    fn check_super(&self) {
        if self.is_read_only() {
            return;
        }
        let mut st = self.state.lock();
        if st.mount_state & VALID_FS == 0 {
            warn!(target: "e2l::fs", "mounting unchecked fs, running e2fsck is recommended");
        } else if st.mount_state & ERROR_FS != 0 {
            warn!(target: "e2l::fs", "mounting fs with errors, running e2fsck is recommended");
        } else if st.sb.checkinterval != 0
            && st.sb.lastcheck.saturating_add(st.sb.checkinterval) <= now()
        {
            warn!(target: "e2l::fs", "checktime reached, running e2fsck is recommended");
        }
        st.sb.mnt_count = st.sb.mnt_count.wrapping_add(1);
        drop(st);

        if self.options.lock().debug {
            debug!(
                target: "e2l::fs",
                bs = self.geo.block_size.get(),
                gc = self.geo.groups_count,
                bpg = self.geo.blocks_per_group,
                ipg = self.geo.inodes_per_group,
                "mount geometry"
            );
        }
    }

    // ── Accessors ───────────────────────────────────────────────────────

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn geometry(&self) -> &FsGeometry {
        &self.geo
    }

    #[must_use]
    pub fn superblock(&self) -> Superblock {
        self.state.lock().sb.clone()
    }

    /// Owner credentials applied to newly created inodes.
    pub fn set_owner(&self, uid: u16, gid: u16) {
        *self.owner.lock() = (uid, gid);
    }

    pub(crate) fn check_writable(&self) -> Result<()> {
        if self.is_read_only() {
            return Err(Ext2Error::ReadOnly);
        }
        Ok(())
    }

    pub(crate) fn ctx(&self) -> FsCtx<'_> {
        FsCtx {
            dev: &self.dev,
            geo: &self.geo,
            table: &self.table,
            counters: &self.counters,
            sink: self,
        }
    }

    fn sb_block(&self) -> BlockNumber {
        BlockNumber(self.geo.sb_block)
    }

    fn sb_offset(&self) -> usize {
        SUPERBLOCK_OFFSET % self.geo.block_size.as_usize()
    }

    // ── Superblock write-out ────────────────────────────────────────────

    /// Refresh the dynamic superblock fields and write the superblock
    /// block. A recorded I/O failure from the previous attempt is cleared
    /// and the write retried this once.
    fn sync_super(&self, wait: bool) -> Result<()> {
        if self.dev.take_write_error(self.sb_block()) {
            error!(target: "e2l::fs", "previous I/O error to superblock detected");
        }

        // Group locks are taken before the superblock lock, never inside it.
        let free_blocks = self.table.count_free_blocks() as u32;
        let free_inodes = self.table.count_free_inodes() as u32;

        let bytes = {
            let mut st = self.state.lock();
            let st = &mut *st;
            st.sb.free_blocks_count = free_blocks;
            st.sb.free_inodes_count = free_inodes;
            st.sb.wtime = now();
            let off = self.sb_offset();
            st.sb.patch_dynamic(&mut st.sb_bytes[off..off + SUPERBLOCK_SIZE]);
            st.sb_bytes.clone()
        };

        self.dev.write_block(self.sb_block(), &bytes)?;
        if wait {
            self.dev.flush_block(self.sb_block())?;
        }
        Ok(())
    }

    /// Push all state to disk.
    ///
    /// While mounted writable the on-disk state keeps `VALID_FS` clear; the
    /// flag only returns at unmount.
    pub fn sync_fs(&self, wait: bool) -> Result<()> {
        {
            let mut st = self.state.lock();
            if st.sb.state & VALID_FS != 0 {
                debug!(target: "e2l::fs", "setting valid to 0");
                st.sb.state &= !VALID_FS;
            }
        }

        self.write_dirty_inodes()?;
        self.table.write_back(&self.dev, &self.geo)?;
        self.sync_super(wait)?;
        if wait {
            self.dev.sync()?;
        }
        Ok(())
    }

    fn write_dirty_inodes(&self) -> Result<()> {
        let handles: Vec<Arc<Mutex<Inode>>> = self
            .icache
            .lock()
            .values()
            .map(|entry| Arc::clone(&entry.inode))
            .collect();
        for handle in handles {
            let mut inode = handle.lock();
            if inode.dirty {
                e2l_inode::write_inode(&self.ctx(), &mut inode)?;
            }
        }
        Ok(())
    }

    /// Unmount: restore the saved mount state (including `VALID_FS` unless
    /// errors were seen) and push everything out.
    pub fn unmount(self) -> Result<()> {
        if !self.is_read_only() {
            self.write_dirty_inodes()?;
            self.table.write_back(&self.dev, &self.geo)?;
            {
                let mut st = self.state.lock();
                st.sb.state = st.mount_state;
            }
            self.sync_super(true)?;
        }
        self.dev.sync()?;
        info!(target: "e2l::fs", "unmounted");
        Ok(())
    }

    // ── statfs / remount / options ──────────────────────────────────────

    pub fn statfs(&self) -> Result<StatFs> {
        let bfree = self.table.count_free_blocks();
        let ffree = self.table.count_free_inodes();

        let overhead = {
            let mut cached = self.overhead.lock();
            match *cached {
                Some((blocks_last, ov)) if blocks_last == self.geo.blocks_count => ov,
                _ => {
                    // Constant for a given group count: leading boot block,
                    // then per group a superblock copy, the descriptor
                    // blocks, two bitmaps, and the inode table.
                    let per_group = 1 + self.geo.gdb_count + 2 + self.geo.itb_per_group;
                    let ov = self.geo.first_data_block + self.geo.groups_count * per_group;
                    *cached = Some((self.geo.blocks_count, ov));
                    ov
                }
            }
        };

        let fsid = {
            let mut st = self.state.lock();
            st.sb.free_blocks_count = bfree as u32;
            st.sb.free_inodes_count = ffree as u32;
            st.sb.fsid()
        };

        Ok(StatFs {
            block_size: self.geo.block_size.get(),
            blocks: u64::from(self.geo.blocks_count - overhead),
            bfree,
            bavail: bfree,
            files: u64::from(self.geo.inodes_count),
            ffree,
            namelen: e2l_types::NAME_LEN as u32,
            fsid,
        })
    }

    /// Re-parse options and switch between read-only and writable.
    pub fn remount(&self, option_str: &str, read_only: bool) -> Result<()> {
        if !self.is_read_only() {
            self.sync_fs(true)?;
        }

        let new_opts = { *self.options.lock() }.parse(option_str)?;

        if read_only != self.is_read_only() {
            if read_only {
                // Going read-only: put the saved state back so the
                // filesystem looks cleanly released.
                let restore = {
                    let mut st = self.state.lock();
                    if st.sb.state & VALID_FS == 0 && st.mount_state & VALID_FS != 0 {
                        st.sb.state = st.mount_state;
                        st.sb.mtime = now();
                        true
                    } else {
                        false
                    }
                };
                if restore {
                    self.sync_super(true)?;
                }
                self.read_only.store(true, Ordering::Release);
            } else {
                // Going writable: re-read the current on-disk state, which a
                // checker may have updated behind us.
                {
                    let mut st = self.state.lock();
                    let st = &mut *st;
                    st.mount_state = st.sb.state;
                }
                self.read_only.store(false, Ordering::Release);
                self.check_super();
                self.sync_fs(true)?;
            }
        }

        *self.options.lock() = new_opts;
        Ok(())
    }

    /// Active mount options rendered in the option grammar.
    #[must_use]
    pub fn show_options(&self) -> String {
        let default_errors = self.state.lock().sb.errors;
        self.options.lock().show(default_errors)
    }

    // ── Inode cache ─────────────────────────────────────────────────────

    /// Obtain the interned inode for `ino`, loading it on first reference.
    pub fn iget(&self, ino: InodeNumber) -> Result<InodeRef> {
        let mut cache = self.icache.lock();
        if let Some(entry) = cache.get_mut(&ino.0) {
            entry.refs += 1;
            return Ok(InodeRef {
                ino,
                inode: Arc::clone(&entry.inode),
            });
        }

        let inode = e2l_inode::read_inode(&self.ctx(), ino)?;
        let arc = Arc::new(Mutex::new(inode));
        cache.insert(
            ino.0,
            IcacheEntry {
                inode: Arc::clone(&arc),
                refs: 1,
            },
        );
        Ok(InodeRef { ino, inode: arc })
    }

    /// Register a freshly created inode in the cache with one reference.
    pub(crate) fn insert_new(&self, inode: Inode) -> InodeRef {
        let ino = inode.ino;
        let arc = Arc::new(Mutex::new(inode));
        self.icache.lock().insert(
            ino.0,
            IcacheEntry {
                inode: Arc::clone(&arc),
                refs: 1,
            },
        );
        InodeRef { ino, inode: arc }
    }

    /// Drop a reference; the last one evicts the inode. Eviction of an
    /// inode with no links left deletes it: stamp `dtime`, write it back,
    /// release its data blocks, and clear its bitmap bit.
    pub fn iput(&self, iref: InodeRef) -> Result<()> {
        let mut cache = self.icache.lock();
        let Some(entry) = cache.get_mut(&iref.ino.0) else {
            return Ok(());
        };
        entry.refs -= 1;
        if entry.refs > 0 {
            return Ok(());
        }
        let Some(entry) = cache.remove(&iref.ino.0) else {
            return Ok(());
        };
        // Eviction stays under the cache lock so a concurrent iget of the
        // same number reloads only after the disk state settles.
        let result = self.evict(&entry.inode);
        drop(cache);
        drop(iref);
        result
    }

    fn evict(&self, handle: &Arc<Mutex<Inode>>) -> Result<()> {
        let mut inode = handle.lock();
        let want_delete = inode.links_count == 0 && !self.is_read_only();

        if want_delete {
            debug!(target: "e2l::fs", ino = inode.ino.0, "deleting evicted inode");
            inode.dtime = now();
            inode.dirty = true;
            e2l_inode::write_inode(&self.ctx(), &mut inode)?;
            inode.size = 0;
            if inode.blocks != 0 {
                e2l_inode::truncate_blocks(&self.ctx(), &mut inode, 0)?;
            }
            let ino = inode.ino;
            let was_dir = inode.is_dir();
            drop(inode);
            self.ctx().free_inode(ino, was_dir)?;
        } else if inode.dirty && !self.is_read_only() {
            e2l_inode::write_inode(&self.ctx(), &mut inode)?;
        }
        Ok(())
    }

    /// Root directory handle.
    pub fn root(&self) -> Result<InodeRef> {
        self.iget(InodeNumber::ROOT)
    }
}

/// Every group's bitmap and inode-table blocks must sit inside the group.
fn check_descriptors(geo: &FsGeometry, descs: &[GroupDesc]) -> Result<()> {
    for (i, desc) in descs.iter().enumerate() {
        let group = e2l_types::GroupNumber(i as u32);
        let first = geo.group_first_block(group).0;
        let last = geo.group_last_block(group).0;

        if desc.block_bitmap.0 < first || desc.block_bitmap.0 > last {
            error!(target: "e2l::fs", group = i, block = desc.block_bitmap.0, "block bitmap not in group");
            return Err(Ext2Error::Format("group descriptors corrupted".to_owned()));
        }
        if desc.inode_bitmap.0 < first || desc.inode_bitmap.0 > last {
            error!(target: "e2l::fs", group = i, block = desc.inode_bitmap.0, "inode bitmap not in group");
            return Err(Ext2Error::Format("group descriptors corrupted".to_owned()));
        }
        let table_last = desc.inode_table.0 + geo.itb_per_group - 1;
        if desc.inode_table.0 < first || table_last > last {
            error!(target: "e2l::fs", group = i, block = desc.inode_table.0, "inode table not in group");
            return Err(Ext2Error::Format("group descriptors corrupted".to_owned()));
        }
    }
    Ok(())
}

impl CorruptionSink for Ext2Fs {
    /// The error hook behind every corruption site: log, mark `ERROR_FS`
    /// in memory and on disk, then apply the configured policy.
    fn fs_error(&self, function: &str, detail: &str) {
        error!(target: "e2l::fs", function, detail, "filesystem error");

        if !self.is_read_only() {
            let bytes = {
                let mut st = self.state.lock();
                let st = &mut *st;
                st.mount_state |= ERROR_FS;
                st.sb.state |= ERROR_FS;
                st.sb.wtime = now();
                let off = SUPERBLOCK_OFFSET % self.geo.block_size.as_usize();
                st.sb.patch_dynamic(&mut st.sb_bytes[off..off + SUPERBLOCK_SIZE]);
                st.sb_bytes.clone()
            };
            let _ = self.dev.write_block(self.sb_block(), &bytes);
            let _ = self.dev.flush_block(self.sb_block());
        }

        let policy = self.options.lock().errors;
        match policy {
            ErrorPolicy::Panic => panic!("ext2-lite ({function}): panic from previous error"),
            ErrorPolicy::RemountRo => {
                if !self.is_read_only() {
                    error!(target: "e2l::fs", "remounting filesystem read-only");
                    self.read_only.store(true, Ordering::Release);
                }
            }
            ErrorPolicy::Continue => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use e2l_block::MemoryByteDevice;
    use e2l_types::SUPER_MAGIC;

    fn blank_superblock() -> Superblock {
        Superblock {
            inodes_count: 1024,
            blocks_count: 8193,
            free_blocks_count: 8000,
            free_inodes_count: 1013,
            first_data_block: 1,
            log_block_size: 0,
            block_size: 1024,
            blocks_per_group: 8192,
            inodes_per_group: 1024,
            mnt_count: 0,
            max_mnt_count: 0xFFFF,
            magic: SUPER_MAGIC,
            state: VALID_FS,
            errors: 1,
            minor_rev_level: 0,
            mtime: 0,
            wtime: 0,
            lastcheck: 0,
            checkinterval: 0,
            creator_os: 0,
            rev_level: 1,
            first_ino: 11,
            inode_size: 128,
            feature_compat: 0,
            feature_incompat: 0,
            feature_ro_compat: 0,
            uuid: [7; 16],
            volume_name: [0; 16],
            default_mount_opts: 0,
            first_meta_bg: 0,
        }
    }

    fn image_with_superblock(sb: &Superblock) -> Box<dyn ByteDevice> {
        let mut bytes = vec![0_u8; 4 * 1024 * 1024];
        sb.encode_region(&mut bytes[SUPERBLOCK_OFFSET..SUPERBLOCK_OFFSET + SUPERBLOCK_SIZE]);
        Box::new(MemoryByteDevice::from_vec(bytes))
    }

    #[test]
    fn mount_rejects_bad_magic() {
        let mut sb = blank_superblock();
        sb.magic = 0x1234;
        let mut bytes = vec![0_u8; 1024 * 1024];
        sb.encode_region(&mut bytes[SUPERBLOCK_OFFSET..SUPERBLOCK_OFFSET + SUPERBLOCK_SIZE]);
        let dev: Box<dyn ByteDevice> = Box::new(MemoryByteDevice::from_vec(bytes));
        let err = Ext2Fs::mount(dev, "", true).unwrap_err();
        assert!(matches!(err, Ext2Error::Format(_)));
    }

    #[test]
    fn mount_rejects_feature_bits() {
        let mut sb = blank_superblock();
        sb.feature_incompat = 0x2;
        let err = Ext2Fs::mount(image_with_superblock(&sb), "", true).unwrap_err();
        assert!(matches!(err, Ext2Error::Unsupported(_)));

        let mut sb = blank_superblock();
        sb.feature_ro_compat = 0x1;
        let err = Ext2Fs::mount(image_with_superblock(&sb), "", true).unwrap_err();
        assert!(matches!(err, Ext2Error::Unsupported(_)));
    }

    #[test]
    fn mount_rejects_bad_geometry() {
        let mut sb = blank_superblock();
        sb.blocks_per_group = 9000; // exceeds one bitmap block
        let err = Ext2Fs::mount(image_with_superblock(&sb), "", true).unwrap_err();
        assert!(matches!(err, Ext2Error::Format(_)));
    }

    #[test]
    fn mount_rejects_bad_mount_options() {
        let sb = blank_superblock();
        let err = Ext2Fs::mount(image_with_superblock(&sb), "nosuch", true).unwrap_err();
        assert!(matches!(err, Ext2Error::InvalidInput(_)));
    }

    #[test]
    fn mount_rejects_truncated_device() {
        let dev: Box<dyn ByteDevice> = Box::new(MemoryByteDevice::new(512));
        let err = Ext2Fs::mount(dev, "", true).unwrap_err();
        assert!(matches!(err, Ext2Error::Format(_)));
    }

    #[test]
    fn mount_rejects_descriptors_out_of_group() {
        // Descriptor block exists but points the bitmaps outside the group.
        let sb = blank_superblock();
        let mut bytes = vec![0_u8; 16 * 1024 * 1024];
        sb.encode_region(&mut bytes[SUPERBLOCK_OFFSET..SUPERBLOCK_OFFSET + SUPERBLOCK_SIZE]);
        let desc = GroupDesc {
            block_bitmap: BlockNumber(100_000),
            inode_bitmap: BlockNumber(4),
            inode_table: BlockNumber(5),
            free_blocks_count: 100,
            free_inodes_count: 100,
            used_dirs_count: 0,
        };
        desc.encode_into(&mut bytes[2048..2048 + GROUP_DESC_SIZE]);
        let dev: Box<dyn ByteDevice> = Box::new(MemoryByteDevice::from_vec(bytes));
        let err = Ext2Fs::mount(dev, "", true).unwrap_err();
        assert!(matches!(err, Ext2Error::Format(_)));
    }
}
