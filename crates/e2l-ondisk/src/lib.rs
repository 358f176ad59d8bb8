#![forbid(unsafe_code)]
//! Byte-exact decode and encode of the ext2-lite on-disk structures.
//!
//! All multi-byte integers are little-endian on disk. The superblock lives at
//! absolute byte offset 1024; the group descriptor table starts in the block
//! after it, and every block group carries a backup of both.

use e2l_types::{
    ensure_slice, put_le_u16, put_le_u32, read_fixed, read_le_u16, read_le_u32, BlockNumber,
    GroupNumber, InodeNumber, ParseError, GOOD_OLD_FIRST_INO, GOOD_OLD_INODE_SIZE, GOOD_OLD_REV,
    N_BLOCKS, SUPERBLOCK_SIZE, SUPER_MAGIC,
};
use serde::{Deserialize, Serialize};

/// Size of one group descriptor on disk.
pub const GROUP_DESC_SIZE: usize = 32;

/// Size of the fixed part of an on-disk inode.
pub const INODE_BASE_SIZE: usize = 128;

// ── Superblock ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Superblock {
    // ── Core geometry ────────────────────────────────────────────────────
    pub inodes_count: u32,
    pub blocks_count: u32,
    pub free_blocks_count: u32,
    pub free_inodes_count: u32,
    pub first_data_block: u32,
    pub log_block_size: u32,
    pub block_size: u32,
    pub blocks_per_group: u32,
    pub inodes_per_group: u32,

    // ── State & error tracking ───────────────────────────────────────────
    pub mnt_count: u16,
    pub max_mnt_count: u16,
    pub magic: u16,
    pub state: u16,
    pub errors: u16,
    pub minor_rev_level: u16,

    // ── Timestamps (32-bit seconds) ──────────────────────────────────────
    pub mtime: u32,
    pub wtime: u32,
    pub lastcheck: u32,
    pub checkinterval: u32,

    // ── Revision ─────────────────────────────────────────────────────────
    pub creator_os: u32,
    pub rev_level: u32,
    pub first_ino: u32,
    pub inode_size: u16,

    // ── Features (all must be zero in this variant) ──────────────────────
    pub feature_compat: u32,
    pub feature_incompat: u32,
    pub feature_ro_compat: u32,

    // ── Identity ─────────────────────────────────────────────────────────
    pub uuid: [u8; 16],
    pub volume_name: [u8; 16],

    pub default_mount_opts: u32,
    pub first_meta_bg: u32,
}

impl Superblock {
    /// Parse a superblock from its 1024-byte on-disk region.
    pub fn parse_region(region: &[u8]) -> Result<Self, ParseError> {
        if region.len() < SUPERBLOCK_SIZE {
            return Err(ParseError::InsufficientData {
                needed: SUPERBLOCK_SIZE,
                offset: 0,
                actual: region.len(),
            });
        }

        let magic = read_le_u16(region, 0x38)?;
        if magic != SUPER_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u32::from(SUPER_MAGIC),
                actual: u32::from(magic),
            });
        }

        let log_block_size = read_le_u32(region, 0x18)?;
        let block_size = 1024_u32
            .checked_shl(log_block_size)
            .ok_or(ParseError::InvalidField {
                field: "s_log_block_size",
                reason: "invalid shift",
            })?;

        let rev_level = read_le_u32(region, 0x4C)?;
        let (inode_size, first_ino) = if rev_level == GOOD_OLD_REV {
            (GOOD_OLD_INODE_SIZE, GOOD_OLD_FIRST_INO)
        } else {
            (read_le_u16(region, 0x58)?, read_le_u32(region, 0x54)?)
        };

        Ok(Self {
            inodes_count: read_le_u32(region, 0x00)?,
            blocks_count: read_le_u32(region, 0x04)?,
            free_blocks_count: read_le_u32(region, 0x0C)?,
            free_inodes_count: read_le_u32(region, 0x10)?,
            first_data_block: read_le_u32(region, 0x14)?,
            log_block_size,
            block_size,
            blocks_per_group: read_le_u32(region, 0x20)?,
            inodes_per_group: read_le_u32(region, 0x28)?,

            mnt_count: read_le_u16(region, 0x34)?,
            max_mnt_count: read_le_u16(region, 0x36)?,
            magic,
            state: read_le_u16(region, 0x3A)?,
            errors: read_le_u16(region, 0x3C)?,
            minor_rev_level: read_le_u16(region, 0x3E)?,

            mtime: read_le_u32(region, 0x2C)?,
            wtime: read_le_u32(region, 0x30)?,
            lastcheck: read_le_u32(region, 0x40)?,
            checkinterval: read_le_u32(region, 0x44)?,

            creator_os: read_le_u32(region, 0x48)?,
            rev_level,
            first_ino,
            inode_size,

            feature_compat: read_le_u32(region, 0x5C)?,
            feature_incompat: read_le_u32(region, 0x60)?,
            feature_ro_compat: read_le_u32(region, 0x64)?,

            uuid: read_fixed::<16>(region, 0x68)?,
            volume_name: read_fixed::<16>(region, 0x78)?,

            default_mount_opts: read_le_u32(region, 0x100)?,
            first_meta_bg: read_le_u32(region, 0x104)?,
        })
    }

    /// Serialize the full superblock into its 1024-byte region.
    ///
    /// Fields this variant does not model are left as the region's existing
    /// bytes, so callers can round-trip a buffer they read from disk.
    pub fn encode_region(&self, region: &mut [u8]) {
        assert!(region.len() >= SUPERBLOCK_SIZE);

        put_le_u32(region, 0x00, self.inodes_count);
        put_le_u32(region, 0x04, self.blocks_count);
        put_le_u32(region, 0x0C, self.free_blocks_count);
        put_le_u32(region, 0x10, self.free_inodes_count);
        put_le_u32(region, 0x14, self.first_data_block);
        put_le_u32(region, 0x18, self.log_block_size);
        put_le_u32(region, 0x20, self.blocks_per_group);
        put_le_u32(region, 0x28, self.inodes_per_group);
        put_le_u32(region, 0x2C, self.mtime);
        put_le_u32(region, 0x30, self.wtime);
        put_le_u16(region, 0x34, self.mnt_count);
        put_le_u16(region, 0x36, self.max_mnt_count);
        put_le_u16(region, 0x38, self.magic);
        put_le_u16(region, 0x3A, self.state);
        put_le_u16(region, 0x3C, self.errors);
        put_le_u16(region, 0x3E, self.minor_rev_level);
        put_le_u32(region, 0x40, self.lastcheck);
        put_le_u32(region, 0x44, self.checkinterval);
        put_le_u32(region, 0x48, self.creator_os);
        put_le_u32(region, 0x4C, self.rev_level);
        put_le_u32(region, 0x54, self.first_ino);
        put_le_u16(region, 0x58, self.inode_size);
        put_le_u32(region, 0x5C, self.feature_compat);
        put_le_u32(region, 0x60, self.feature_incompat);
        put_le_u32(region, 0x64, self.feature_ro_compat);
        region[0x68..0x78].copy_from_slice(&self.uuid);
        region[0x78..0x88].copy_from_slice(&self.volume_name);
        put_le_u32(region, 0x100, self.default_mount_opts);
        put_le_u32(region, 0x104, self.first_meta_bg);
    }

    /// Patch only the fields sync-super rewrites: free counts, timestamps,
    /// state, and mount count.
    pub fn patch_dynamic(&self, region: &mut [u8]) {
        assert!(region.len() >= SUPERBLOCK_SIZE);
        put_le_u32(region, 0x0C, self.free_blocks_count);
        put_le_u32(region, 0x10, self.free_inodes_count);
        put_le_u32(region, 0x2C, self.mtime);
        put_le_u32(region, 0x30, self.wtime);
        put_le_u16(region, 0x34, self.mnt_count);
        put_le_u16(region, 0x3A, self.state);
    }

    /// Whether any feature bit is advertised. This variant supports none.
    #[must_use]
    pub fn has_any_features(&self) -> bool {
        self.feature_compat != 0 || self.feature_incompat != 0 || self.feature_ro_compat != 0
    }

    /// Number of block groups.
    #[must_use]
    pub fn groups_count(&self) -> u32 {
        if self.blocks_per_group == 0 {
            return 0;
        }
        (self
            .blocks_count
            .saturating_sub(self.first_data_block)
            .saturating_sub(1)
            / self.blocks_per_group)
            + 1
    }

    /// Validate geometry bounds that do not depend on the mount state.
    pub fn validate_geometry(&self) -> Result<(), ParseError> {
        if self.blocks_per_group == 0 {
            return Err(ParseError::InvalidField {
                field: "s_blocks_per_group",
                reason: "cannot be zero",
            });
        }
        if self.inodes_per_group == 0 {
            return Err(ParseError::InvalidField {
                field: "s_inodes_per_group",
                reason: "cannot be zero",
            });
        }
        if self.blocks_per_group > self.block_size * 8 {
            return Err(ParseError::InvalidField {
                field: "s_blocks_per_group",
                reason: "does not fit one bitmap block",
            });
        }
        if self.inodes_per_group > self.block_size * 8 {
            return Err(ParseError::InvalidField {
                field: "s_inodes_per_group",
                reason: "does not fit one bitmap block",
            });
        }
        if self.inode_size < GOOD_OLD_INODE_SIZE
            || !self.inode_size.is_power_of_two()
            || u32::from(self.inode_size) > self.block_size
        {
            return Err(ParseError::InvalidField {
                field: "s_inode_size",
                reason: "must be a power of two in 128..=block_size",
            });
        }
        if self.first_data_block >= self.blocks_count {
            return Err(ParseError::InvalidField {
                field: "s_first_data_block",
                reason: "first_data_block >= blocks_count",
            });
        }
        let expected_first = u32::from(self.block_size == 1024);
        if self.first_data_block != expected_first {
            return Err(ParseError::InvalidField {
                field: "s_first_data_block",
                reason: "must be 1 for 1K blocks and 0 otherwise",
            });
        }
        Ok(())
    }

    /// UUID folded into a 64-bit filesystem id (XOR of the two halves).
    #[must_use]
    pub fn fsid(&self) -> u64 {
        let lo = u64::from_le_bytes(self.uuid[0..8].try_into().expect("8 bytes"));
        let hi = u64::from_le_bytes(self.uuid[8..16].try_into().expect("8 bytes"));
        lo ^ hi
    }
}

// ── Group descriptor ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupDesc {
    pub block_bitmap: BlockNumber,
    pub inode_bitmap: BlockNumber,
    pub inode_table: BlockNumber,
    pub free_blocks_count: u16,
    pub free_inodes_count: u16,
    pub used_dirs_count: u16,
}

impl GroupDesc {
    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(bytes, 0, GROUP_DESC_SIZE)?;
        Ok(Self {
            block_bitmap: BlockNumber(read_le_u32(bytes, 0x00)?),
            inode_bitmap: BlockNumber(read_le_u32(bytes, 0x04)?),
            inode_table: BlockNumber(read_le_u32(bytes, 0x08)?),
            free_blocks_count: read_le_u16(bytes, 0x0C)?,
            free_inodes_count: read_le_u16(bytes, 0x0E)?,
            used_dirs_count: read_le_u16(bytes, 0x10)?,
        })
    }

    pub fn encode_into(&self, bytes: &mut [u8]) {
        assert!(bytes.len() >= GROUP_DESC_SIZE);
        put_le_u32(bytes, 0x00, self.block_bitmap.0);
        put_le_u32(bytes, 0x04, self.inode_bitmap.0);
        put_le_u32(bytes, 0x08, self.inode_table.0);
        put_le_u16(bytes, 0x0C, self.free_blocks_count);
        put_le_u16(bytes, 0x0E, self.free_inodes_count);
        put_le_u16(bytes, 0x10, self.used_dirs_count);
        put_le_u16(bytes, 0x12, 0);
        bytes[0x14..GROUP_DESC_SIZE].fill(0);
    }
}

// ── Raw inode ───────────────────────────────────────────────────────────────

/// Decoded on-disk inode. Timestamps are 32-bit seconds; `blocks` counts
/// 512-byte sectors; `block` holds all 15 pointer slots even though only the
/// first 12 are ever mapped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawInode {
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
    pub block: [u32; N_BLOCKS],
    pub generation: u32,
}

impl RawInode {
    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(bytes, 0, INODE_BASE_SIZE)?;

        let mut block = [0_u32; N_BLOCKS];
        for (n, slot) in block.iter_mut().enumerate() {
            *slot = read_le_u32(bytes, 0x28 + n * 4)?;
        }

        Ok(Self {
            mode: read_le_u16(bytes, 0x00)?,
            uid: read_le_u16(bytes, 0x02)?,
            gid: read_le_u16(bytes, 0x18)?,
            size: read_le_u32(bytes, 0x04)?,
            atime: read_le_u32(bytes, 0x08)?,
            ctime: read_le_u32(bytes, 0x0C)?,
            mtime: read_le_u32(bytes, 0x10)?,
            dtime: read_le_u32(bytes, 0x14)?,
            links_count: read_le_u16(bytes, 0x1A)?,
            blocks: read_le_u32(bytes, 0x1C)?,
            flags: read_le_u32(bytes, 0x20)?,
            block,
            generation: read_le_u32(bytes, 0x64)?,
        })
    }

    /// Serialize over the inode's on-disk bytes.
    ///
    /// Only the fields this variant models are written; the caller decides
    /// whether to zero the buffer first (new inodes) or preserve it.
    pub fn encode_into(&self, bytes: &mut [u8]) {
        assert!(bytes.len() >= INODE_BASE_SIZE);
        put_le_u16(bytes, 0x00, self.mode);
        put_le_u16(bytes, 0x02, self.uid);
        put_le_u32(bytes, 0x04, self.size);
        put_le_u32(bytes, 0x08, self.atime);
        put_le_u32(bytes, 0x0C, self.ctime);
        put_le_u32(bytes, 0x10, self.mtime);
        put_le_u32(bytes, 0x14, self.dtime);
        put_le_u16(bytes, 0x18, self.gid);
        put_le_u16(bytes, 0x1A, self.links_count);
        put_le_u32(bytes, 0x1C, self.blocks);
        put_le_u32(bytes, 0x20, self.flags);
        for (n, slot) in self.block.iter().enumerate() {
            put_le_u32(bytes, 0x28 + n * 4, *slot);
        }
        put_le_u32(bytes, 0x64, self.generation);
    }
}

// ── Directory entries ───────────────────────────────────────────────────────

/// Fixed header bytes before a directory entry's name.
pub const DIR_ENTRY_HEADER: usize = 8;

/// On-disk record length for a name of `name_len` bytes: header + name,
/// rounded up to 4.
#[must_use]
pub fn dir_rec_len(name_len: usize) -> u16 {
    ((DIR_ENTRY_HEADER + name_len + 3) & !3) as u16
}

/// Borrowed view of one directory entry within a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirEntry<'a> {
    pub inode: u32,
    pub rec_len: u16,
    pub name_len: u8,
    pub file_type: u8,
    pub name: &'a [u8],
}

impl<'a> DirEntry<'a> {
    /// Decode the entry at `offset` within `chunk`.
    ///
    /// The name is clipped to the chunk; structural validation (alignment,
    /// minimum length, span) is the directory engine's job.
    pub fn parse_at(chunk: &'a [u8], offset: usize) -> Result<Self, ParseError> {
        ensure_slice(chunk, offset, DIR_ENTRY_HEADER)?;
        let inode = read_le_u32(chunk, offset)?;
        let rec_len = read_le_u16(chunk, offset + 4)?;
        let name_len = chunk[offset + 6];
        let file_type = chunk[offset + 7];
        let name = ensure_slice(chunk, offset + DIR_ENTRY_HEADER, usize::from(name_len))?;
        Ok(Self {
            inode,
            rec_len,
            name_len,
            file_type,
            name,
        })
    }

    #[must_use]
    pub fn is_dot(&self) -> bool {
        self.name == b"."
    }

    #[must_use]
    pub fn is_dotdot(&self) -> bool {
        self.name == b".."
    }
}

/// Write an entry header + name at `offset`. `file_type` is always written
/// as zero; readers tolerate unknown values.
pub fn write_dir_entry(
    chunk: &mut [u8],
    offset: usize,
    inode: InodeNumber,
    rec_len: u16,
    name: &[u8],
) {
    put_le_u32(chunk, offset, inode.0);
    put_le_u16(chunk, offset + 4, rec_len);
    chunk[offset + 6] = name.len() as u8;
    chunk[offset + 7] = 0;
    chunk[offset + DIR_ENTRY_HEADER..offset + DIR_ENTRY_HEADER + name.len()].copy_from_slice(name);
}

/// Overwrite just the inode field of the entry at `offset` (tombstoning and
/// `set_link` both go through here), resetting `file_type` to zero.
pub fn write_dir_entry_inode(chunk: &mut [u8], offset: usize, inode: u32) {
    put_le_u32(chunk, offset, inode);
    chunk[offset + 7] = 0;
}

/// Overwrite just the rec_len field of the entry at `offset`.
pub fn write_dir_entry_rec_len(chunk: &mut [u8], offset: usize, rec_len: u16) {
    put_le_u16(chunk, offset + 4, rec_len);
}

// ── Descriptor table layout ─────────────────────────────────────────────────

/// Which descriptor block and offset within it hold `group`'s descriptor.
#[must_use]
pub fn group_desc_location(group: GroupNumber, desc_per_block: u32) -> (usize, usize) {
    let block_index = (group.0 / desc_per_block) as usize;
    let offset = ((group.0 % desc_per_block) as usize) * GROUP_DESC_SIZE;
    (block_index, offset)
}
