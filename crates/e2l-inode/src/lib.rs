#![forbid(unsafe_code)]
//! Inode management.
//!
//! Materialises in-memory inodes from the on-disk inode table, maps logical
//! file blocks to disk blocks through the direct slots, writes inodes back,
//! and truncates their data with contiguous runs freed in single calls.

use e2l_alloc::FsCtx;
use e2l_error::{Ext2Error, Result};
use e2l_ondisk::RawInode;
use e2l_types::{
    is_blk, is_chr, is_dir, is_reg, is_symlink, BlockNumber, DeviceNumber, GroupNumber,
    InodeNumber, FAST_SYMLINK_MAX, NDIR_BLOCKS, N_BLOCKS, ROOT_INO, S_IFMT, S_IFSOCK,
};
use tracing::{debug, trace};

// ── In-memory inode ─────────────────────────────────────────────────────────

/// Per-type behaviour selected at load time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeKind {
    Regular,
    Directory,
    /// Symlink whose target lives in the block-slot bytes (no data blocks).
    FastSymlink,
    /// Symlink served through the data path.
    Symlink,
    CharDev(DeviceNumber),
    BlockDev(DeviceNumber),
    Fifo,
    Socket,
}

impl InodeKind {
    #[must_use]
    pub fn is_device(self) -> bool {
        matches!(self, Self::CharDev(_) | Self::BlockDev(_))
    }
}

/// In-memory inode.
///
/// `size` is 32-bit like the on-disk field; `blocks` counts 512-byte
/// sectors. `data` holds all 15 slots; only the first 12 are ever mapped.
#[derive(Debug, Clone)]
pub struct Inode {
    pub ino: InodeNumber,
    pub mode: u16,
    pub uid: u16,
    pub gid: u16,
    pub size: u32,
    pub atime: u32,
    pub ctime: u32,
    pub mtime: u32,
    pub dtime: u32,
    pub links_count: u16,
    pub blocks: u32,
    pub flags: u32,
    pub data: [u32; N_BLOCKS],
    pub generation: u32,
    pub kind: InodeKind,
    pub block_group: GroupNumber,
    /// Set between allocation and the first write-back; the on-disk bytes
    /// are zeroed before encoding while this holds.
    pub state_new: bool,
    /// Monotonic mutation token; directory readers revalidate against it.
    pub version: u64,
    /// Bit n set once chunk n of a directory has passed structure checks.
    /// Directories cap at `NDIR_BLOCKS` chunks, so a small mask suffices.
    pub checked_chunks: u16,
    pub dirty: bool,
}

impl Inode {
    /// Initialise a freshly allocated inode.
    ///
    /// Flags are copied from the parent directory; the caller sets the link
    /// count and (for devices) re-initialises the kind via `init_special`.
    #[must_use]
    pub fn new_allocated(
        ino: InodeNumber,
        group: GroupNumber,
        mode: u16,
        uid: u16,
        gid: u16,
        parent_flags: u32,
        now: u32,
    ) -> Self {
        Self {
            ino,
            mode,
            uid,
            gid,
            size: 0,
            atime: now,
            ctime: now,
            mtime: now,
            dtime: 0,
            links_count: 1,
            blocks: 0,
            flags: parent_flags,
            data: [0; N_BLOCKS],
            generation: 0,
            kind: kind_for_mode(mode, &[0; N_BLOCKS]),
            block_group: group,
            state_new: true,
            version: 0,
            checked_chunks: 0,
            dirty: true,
        }
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        is_dir(self.mode)
    }

    #[must_use]
    pub fn is_reg(&self) -> bool {
        is_reg(self.mode)
    }

    #[must_use]
    pub fn is_symlink(&self) -> bool {
        is_symlink(self.mode)
    }

    /// A symlink with no data blocks stores its target inline.
    #[must_use]
    pub fn is_fast_symlink(&self) -> bool {
        self.is_symlink() && self.blocks == 0
    }

    /// View the block slots as the little-endian byte array the on-disk
    /// format prescribes (fast-symlink storage).
    #[must_use]
    pub fn data_bytes(&self) -> [u8; FAST_SYMLINK_MAX] {
        let mut out = [0_u8; FAST_SYMLINK_MAX];
        for (n, slot) in self.data.iter().enumerate() {
            out[n * 4..n * 4 + 4].copy_from_slice(&slot.to_le_bytes());
        }
        out
    }

    /// Store a fast-symlink target into the block slots and set the size.
    ///
    /// The target must fit `FAST_SYMLINK_MAX` bytes; the caller checks.
    pub fn set_fast_symlink(&mut self, target: &[u8]) {
        debug_assert!(target.len() <= FAST_SYMLINK_MAX);
        let mut bytes = [0_u8; FAST_SYMLINK_MAX];
        bytes[..target.len()].copy_from_slice(target);
        for (n, slot) in self.data.iter_mut().enumerate() {
            *slot = u32::from_le_bytes(bytes[n * 4..n * 4 + 4].try_into().expect("4 bytes"));
        }
        self.size = target.len() as u32;
        self.kind = InodeKind::FastSymlink;
        self.dirty = true;
    }

    /// Fast-symlink target bytes (clipped to `size`).
    #[must_use]
    pub fn fast_symlink_target(&self) -> Vec<u8> {
        let bytes = self.data_bytes();
        let len = (self.size as usize).min(FAST_SYMLINK_MAX);
        bytes[..len].to_vec()
    }

    /// Re-initialise as a device/fifo/socket inode with the given identity.
    pub fn init_special(&mut self, rdev: DeviceNumber) {
        self.kind = if is_chr(self.mode) {
            InodeKind::CharDev(rdev)
        } else if is_blk(self.mode) {
            InodeKind::BlockDev(rdev)
        } else {
            kind_for_mode(self.mode, &self.data)
        };
        self.dirty = true;
    }

    pub fn touch_atime(&mut self, now: u32) {
        self.atime = now;
        self.dirty = true;
    }

    pub fn touch_mtime_ctime(&mut self, now: u32) {
        self.mtime = now;
        self.ctime = now;
        self.dirty = true;
    }

    pub fn touch_ctime(&mut self, now: u32) {
        self.ctime = now;
        self.dirty = true;
    }

    pub fn bump_version(&mut self) {
        self.version = self.version.wrapping_add(1);
    }
}

fn kind_for_mode(mode: u16, slots: &[u32; N_BLOCKS]) -> InodeKind {
    if is_reg(mode) {
        InodeKind::Regular
    } else if is_dir(mode) {
        InodeKind::Directory
    } else if is_symlink(mode) {
        // Resolved precisely at load time where `blocks` is known.
        InodeKind::Symlink
    } else if is_chr(mode) || is_blk(mode) {
        let rdev = if slots[0] != 0 {
            DeviceNumber::old_decode(slots[0])
        } else {
            DeviceNumber::new_decode(slots[1])
        };
        if is_chr(mode) {
            InodeKind::CharDev(rdev)
        } else {
            InodeKind::BlockDev(rdev)
        }
    } else if mode & S_IFMT == S_IFSOCK {
        InodeKind::Socket
    } else {
        InodeKind::Fifo
    }
}

// ── Inode table location ────────────────────────────────────────────────────

/// Computed on-disk location of an inode within its group's inode table.
#[derive(Debug, Clone, Copy)]
pub struct InodeLocation {
    pub block: BlockNumber,
    pub byte_offset: usize,
}

/// Compute the disk location of an inode.
///
/// Rejects reserved and out-of-range inode numbers as corruption.
pub fn locate_inode(ctx: &FsCtx<'_>, ino: InodeNumber) -> Result<InodeLocation> {
    let geo = ctx.geo;
    if (ino.0 != ROOT_INO && ino.0 < geo.first_ino) || ino.0 == 0 || ino.0 > geo.inodes_count {
        ctx.sink
            .fs_error("locate_inode", &format!("bad inode number: {ino}"));
        return Err(Ext2Error::Corruption {
            block: 0,
            detail: format!("bad inode number {ino}"),
        });
    }

    let group = e2l_types::inode_to_group(ino, geo.inodes_per_group);
    let index = e2l_types::inode_index_in_group(ino, geo.inodes_per_group);
    let desc = ctx.table.snapshot(ctx.sink, group)?;

    let byte_in_table = index as usize * usize::from(geo.inode_size);
    let block_size = geo.block_size.as_usize();
    Ok(InodeLocation {
        block: BlockNumber(desc.inode_table.0 + (byte_in_table / block_size) as u32),
        byte_offset: byte_in_table % block_size,
    })
}

// ── Load ────────────────────────────────────────────────────────────────────

/// Read an inode from the inode table and materialise it.
///
/// A freed on-disk inode (zero link count) is reported as stale rather than
/// decoded; recycled numbers load the live contents.
pub fn read_inode(ctx: &FsCtx<'_>, ino: InodeNumber) -> Result<Inode> {
    trace!(target: "e2l::inode", ino = ino.0, "loading inode");
    let loc = locate_inode(ctx, ino)?;
    let buf = ctx.dev.read_block(loc.block)?;
    let data = buf.as_slice();
    let inode_size = usize::from(ctx.geo.inode_size);

    if loc.byte_offset + inode_size > data.len() {
        ctx.sink.fs_error(
            "read_inode",
            &format!("inode {ino} extends beyond block {}", loc.block),
        );
        return Err(Ext2Error::Corruption {
            block: u64::from(loc.block.0),
            detail: "inode extends beyond block boundary".into(),
        });
    }

    let raw = RawInode::parse_from_bytes(&data[loc.byte_offset..loc.byte_offset + inode_size])?;

    if raw.links_count == 0 {
        return Err(Ext2Error::Stale(ino.0));
    }
    if (raw.size as i32) < 0 {
        ctx.sink
            .fs_error("read_inode", &format!("inode {ino} has negative size"));
        return Err(Ext2Error::Corruption {
            block: u64::from(loc.block.0),
            detail: format!("inode {ino} has negative size"),
        });
    }

    let mut kind = kind_for_mode(raw.mode, &raw.block);
    if kind == InodeKind::Symlink && raw.blocks == 0 {
        kind = InodeKind::FastSymlink;
    }

    Ok(Inode {
        ino,
        mode: raw.mode,
        uid: raw.uid,
        gid: raw.gid,
        size: raw.size,
        atime: raw.atime,
        ctime: raw.ctime,
        mtime: raw.mtime,
        // The on-disk dtime is only meaningful for freed inodes, which were
        // rejected as stale above; a live inode starts with it clear.
        dtime: 0,
        links_count: raw.links_count,
        blocks: raw.blocks,
        flags: raw.flags,
        data: raw.block,
        generation: raw.generation,
        kind,
        block_group: e2l_types::inode_to_group(ino, ctx.geo.inodes_per_group),
        state_new: false,
        version: 0,
        checked_chunks: 0,
        dirty: false,
    })
}

// ── Write-back ──────────────────────────────────────────────────────────────

/// Encode `inode` over its on-disk bytes and write the containing block.
///
/// New inodes get their slot zeroed first so fields this variant does not
/// model start clean. Returns the table block so sync-required callers can
/// force it out.
pub fn write_inode(ctx: &FsCtx<'_>, inode: &mut Inode) -> Result<BlockNumber> {
    let loc = locate_inode(ctx, inode.ino)?;
    let buf = ctx.dev.read_block(loc.block)?;
    let mut block_data = buf.into_inner();
    let inode_size = usize::from(ctx.geo.inode_size);
    let slot = &mut block_data[loc.byte_offset..loc.byte_offset + inode_size];

    if inode.state_new {
        slot.fill(0);
    }

    let mut raw = RawInode {
        mode: inode.mode,
        uid: inode.uid,
        gid: inode.gid,
        size: inode.size,
        atime: inode.atime,
        ctime: inode.ctime,
        mtime: inode.mtime,
        dtime: inode.dtime,
        links_count: inode.links_count,
        blocks: inode.blocks,
        flags: inode.flags,
        block: inode.data,
        generation: inode.generation,
    };

    // Device identities are encoded into the first slots; everything else
    // copies the slot array as-is.
    match inode.kind {
        InodeKind::CharDev(rdev) | InodeKind::BlockDev(rdev) => {
            if rdev.old_valid() {
                raw.block = [0; N_BLOCKS];
                raw.block[0] = rdev.old_encode();
            } else {
                raw.block = [0; N_BLOCKS];
                raw.block[1] = rdev.new_encode();
                raw.block[2] = 0;
            }
        }
        _ => {}
    }

    raw.encode_into(slot);
    ctx.dev.write_block(loc.block, &block_data)?;

    inode.state_new = false;
    inode.dirty = false;
    debug!(target: "e2l::inode", ino = inode.ino.0, block = loc.block.0, "inode written back");
    Ok(loc.block)
}

// ── Block mapping ───────────────────────────────────────────────────────────

/// Result of mapping a logical block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedBlock {
    pub block: BlockNumber,
    /// Set when the block was allocated by this call.
    pub new: bool,
}

/// Map logical block `iblock` of `inode`, optionally allocating it.
///
/// Only direct slots exist: indices at or beyond `NDIR_BLOCKS` are
/// unsupported. Returns `None` when the slot is empty and `create` is false.
pub fn get_blocks(
    ctx: &FsCtx<'_>,
    inode: &mut Inode,
    iblock: u32,
    create: bool,
) -> Result<Option<MappedBlock>> {
    trace!(
        target: "e2l::inode",
        ino = inode.ino.0,
        iblock,
        create,
        "mapping logical block"
    );

    if iblock as usize >= NDIR_BLOCKS {
        return Err(Ext2Error::Unsupported(
            "block index beyond direct slots",
        ));
    }

    let slot = inode.data[iblock as usize];
    if slot > 0 {
        return Ok(Some(MappedBlock {
            block: BlockNumber(slot),
            new: false,
        }));
    }
    if !create {
        return Ok(None);
    }

    let alloc = ctx.new_blocks(inode.block_group, 1)?;
    inode.data[iblock as usize] = alloc.start.0;
    inode.blocks += alloc.count * ctx.geo.block_size.sectors_per_block();
    inode.dirty = true;
    debug!(
        target: "e2l::inode",
        ino = inode.ino.0,
        iblock,
        block = alloc.start.0,
        "allocated block for inode"
    );
    Ok(Some(MappedBlock {
        block: alloc.start,
        new: true,
    }))
}

// ── Truncation ──────────────────────────────────────────────────────────────

/// Free the direct slots from `p` onward, coalescing contiguous runs into
/// single `free_blocks` calls, and charge the freed sectors to the inode.
fn free_data(ctx: &FsCtx<'_>, inode: &mut Inode, from_slot: usize) -> Result<()> {
    let mut block_to_free = 0_u32;
    let mut count = 0_u32;
    let sectors = ctx.geo.block_size.sectors_per_block();

    for slot in from_slot..NDIR_BLOCKS {
        let nr = inode.data[slot];
        if nr == 0 {
            continue;
        }
        inode.data[slot] = 0;
        inode.dirty = true;
        if count == 0 {
            block_to_free = nr;
            count = 1;
        } else if block_to_free + count == nr {
            count += 1;
        } else {
            let freed = ctx.free_blocks(BlockNumber(block_to_free), count)?;
            inode.blocks = inode.blocks.saturating_sub(freed * sectors);
            block_to_free = nr;
            count = 1;
        }
    }
    if count > 0 {
        let freed = ctx.free_blocks(BlockNumber(block_to_free), count)?;
        inode.blocks = inode.blocks.saturating_sub(freed * sectors);
    }
    Ok(())
}

/// Truncate the inode's data down to `new_size` bytes.
///
/// Applies only to regular files, directories, and slow symlinks; fast
/// symlinks and special inodes carry no data blocks.
pub fn truncate_blocks(ctx: &FsCtx<'_>, inode: &mut Inode, new_size: u32) -> Result<()> {
    if !(inode.is_reg() || inode.is_dir() || inode.is_symlink()) {
        return Ok(());
    }
    if inode.is_fast_symlink() {
        return Ok(());
    }

    let block_size = ctx.geo.block_size.get();
    let keep = new_size.div_ceil(block_size) as usize;
    debug!(
        target: "e2l::inode",
        ino = inode.ino.0,
        new_size,
        keep_slots = keep,
        "truncating inode data"
    );
    free_data(ctx, inode, keep.min(NDIR_BLOCKS))
}
