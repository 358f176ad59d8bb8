#![forbid(unsafe_code)]
//! Block and inode allocation.
//!
//! Free blocks and inodes are managed by per-group bitmaps. Each block group
//! carries one bitmap block for blocks, one for inodes, a run of inode-table
//! blocks, and data blocks. The group descriptors locate those blocks and
//! cache free counts; they are loaded into the `GroupTable` at mount and
//! written back on sync.
//!
//! The layering follows the disk:
//!
//! 1. **Bitmap** — raw bit manipulation with test-and-set/clear primitives.
//! 2. **GroupTable** — pinned descriptors behind per-group locks.
//! 3. **Block allocator** — linear group walk with greedy extension.
//! 4. **Inode allocator** — parent-group placement with quadratic probing.

use e2l_block::{BlockBuf, BlockDevice};
use e2l_error::{CorruptionSink, Ext2Error, Result};
use e2l_ondisk::{GroupDesc, Superblock, GROUP_DESC_SIZE};
use e2l_types::{BlockNumber, BlockSize, GroupNumber, InodeNumber, SUPERBLOCK_OFFSET};
use parking_lot::{Mutex, MutexGuard};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use tracing::{debug, error, trace};

// ── Bitmap operations ───────────────────────────────────────────────────────

/// Get bit `idx` from a bitmap byte slice.
#[must_use]
pub fn bitmap_get(bitmap: &[u8], idx: u32) -> bool {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx >= bitmap.len() {
        return false;
    }
    (bitmap[byte_idx] >> bit_idx) & 1 == 1
}

/// Set bit `idx`, returning the previous value.
pub fn bitmap_test_and_set(bitmap: &mut [u8], idx: u32) -> bool {
    let prev = bitmap_get(bitmap, idx);
    let byte_idx = (idx / 8) as usize;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] |= 1 << (idx % 8);
    }
    prev
}

/// Clear bit `idx`, returning the previous value.
pub fn bitmap_test_and_clear(bitmap: &mut [u8], idx: u32) -> bool {
    let prev = bitmap_get(bitmap, idx);
    let byte_idx = (idx / 8) as usize;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] &= !(1 << (idx % 8));
    }
    prev
}

/// Count free (zero) bits in the first `count` bits of `bitmap`.
#[must_use]
pub fn bitmap_count_free(bitmap: &[u8], count: u32) -> u32 {
    let full_bytes = (count / 8) as usize;
    let remainder = count % 8;
    let mut free = 0_u32;

    for &byte in bitmap.iter().take(full_bytes) {
        free += byte.count_zeros();
    }

    if remainder > 0 && full_bytes < bitmap.len() {
        let byte = bitmap[full_bytes];
        for bit in 0..remainder {
            if (byte >> bit) & 1 == 0 {
                free += 1;
            }
        }
    }

    free
}

/// Find the next zero bit in `[start, limit)`, without wrapping.
#[must_use]
pub fn bitmap_find_next_zero(bitmap: &[u8], limit: u32, start: u32) -> Option<u32> {
    (start..limit).find(|&idx| !bitmap_get(bitmap, idx))
}

// ── Filesystem geometry ─────────────────────────────────────────────────────

/// Cached geometry derived from the superblock at mount.
#[derive(Debug, Clone)]
pub struct FsGeometry {
    pub block_size: BlockSize,
    pub blocks_count: u32,
    pub inodes_count: u32,
    pub first_data_block: u32,
    pub blocks_per_group: u32,
    pub inodes_per_group: u32,
    pub inode_size: u16,
    pub first_ino: u32,
    pub groups_count: u32,
    pub inodes_per_block: u32,
    pub itb_per_group: u32,
    pub desc_per_block: u32,
    pub gdb_count: u32,
    /// The block holding the (primary) superblock.
    pub sb_block: u32,
}

impl FsGeometry {
    pub fn from_superblock(sb: &Superblock) -> Result<Self> {
        let block_size = BlockSize::new(sb.block_size)?;
        let inodes_per_block = sb.block_size / u32::from(sb.inode_size);
        if inodes_per_block == 0 || sb.inodes_per_group == 0 {
            return Err(Ext2Error::Format(
                "inode size and inodes-per-group must be non-zero".to_owned(),
            ));
        }
        let groups_count = sb.groups_count();
        let desc_per_block = sb.block_size / GROUP_DESC_SIZE as u32;
        Ok(Self {
            block_size,
            blocks_count: sb.blocks_count,
            inodes_count: sb.inodes_count,
            first_data_block: sb.first_data_block,
            blocks_per_group: sb.blocks_per_group,
            inodes_per_group: sb.inodes_per_group,
            inode_size: sb.inode_size,
            first_ino: sb.first_ino,
            groups_count,
            inodes_per_block,
            itb_per_group: sb.inodes_per_group / inodes_per_block,
            desc_per_block,
            gdb_count: groups_count.div_ceil(desc_per_block),
            sb_block: SUPERBLOCK_OFFSET as u32 / sb.block_size,
        })
    }

    /// First block of a block group.
    #[must_use]
    pub fn group_first_block(&self, group: GroupNumber) -> BlockNumber {
        BlockNumber(self.first_data_block + group.0 * self.blocks_per_group)
    }

    /// Last block of a block group (the final group may be short).
    #[must_use]
    pub fn group_last_block(&self, group: GroupNumber) -> BlockNumber {
        let next = self.first_data_block as u64
            + (u64::from(group.0) + 1) * u64::from(self.blocks_per_group);
        BlockNumber((next.min(u64::from(self.blocks_count)) - 1) as u32)
    }

    /// Number of blocks in a group.
    #[must_use]
    pub fn blocks_in_group(&self, group: GroupNumber) -> u32 {
        self.group_last_block(group).0 - self.group_first_block(group).0 + 1
    }

    /// The block holding the `index`-th group-descriptor block.
    #[must_use]
    pub fn desc_block(&self, index: u32) -> BlockNumber {
        BlockNumber(self.first_data_block + 1 + index)
    }

    /// Maximum file size in bytes (direct blocks only).
    #[must_use]
    pub fn max_file_size(&self) -> u64 {
        e2l_types::NDIR_BLOCKS as u64 * u64::from(self.block_size.get())
    }
}

// ── Approximate counters ────────────────────────────────────────────────────

const COUNTER_SHARDS: usize = 8;

/// Sharded counter with eventually-consistent reads.
///
/// Reads are hints only; the group descriptors remain authoritative. The
/// aggregate never reads below zero.
#[derive(Debug)]
pub struct ApproxCounter {
    shards: [AtomicI64; COUNTER_SHARDS],
}

impl ApproxCounter {
    #[must_use]
    pub fn new(initial: i64) -> Self {
        let shards: [AtomicI64; COUNTER_SHARDS] = Default::default();
        shards[0].store(initial, Ordering::Relaxed);
        Self { shards }
    }

    fn shard(&self) -> &AtomicI64 {
        let mut hasher = DefaultHasher::new();
        std::thread::current().id().hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % COUNTER_SHARDS]
    }

    pub fn add(&self, delta: i64) {
        self.shard().fetch_add(delta, Ordering::Relaxed);
    }

    pub fn sub(&self, delta: i64) {
        self.shard().fetch_sub(delta, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.add(1);
    }

    pub fn dec(&self) {
        self.sub(1);
    }

    /// Aggregate value clamped at zero.
    #[must_use]
    pub fn read_positive(&self) -> u64 {
        let sum: i64 = self.shards.iter().map(|s| s.load(Ordering::Relaxed)).sum();
        sum.max(0) as u64
    }
}

/// The three mount-wide approximate counters.
#[derive(Debug)]
pub struct FsCounters {
    pub free_blocks: ApproxCounter,
    pub free_inodes: ApproxCounter,
    pub dirs: ApproxCounter,
}

impl FsCounters {
    #[must_use]
    pub fn new(free_blocks: u64, free_inodes: u64, dirs: u64) -> Self {
        Self {
            free_blocks: ApproxCounter::new(free_blocks as i64),
            free_inodes: ApproxCounter::new(free_inodes as i64),
            dirs: ApproxCounter::new(dirs as i64),
        }
    }
}

// ── Group table ─────────────────────────────────────────────────────────────

/// Pinned group descriptors, one lock per group.
///
/// The per-group lock serialises bit-level bitmap mutations with the
/// descriptor's free-count updates, mirroring the on-disk pairing. Never take
/// two group locks at once.
pub struct GroupTable {
    groups: Vec<Mutex<GroupDesc>>,
    dirty: Vec<AtomicBool>,
}

impl GroupTable {
    #[must_use]
    pub fn new(descs: Vec<GroupDesc>) -> Self {
        let dirty = descs.iter().map(|_| AtomicBool::new(false)).collect();
        Self {
            groups: descs.into_iter().map(Mutex::new).collect(),
            dirty,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Lock and return `group`'s descriptor. Out-of-range groups are
    /// filesystem corruption.
    pub fn lock(&self, sink: &dyn CorruptionSink, group: GroupNumber) -> Result<MutexGuard<'_, GroupDesc>> {
        match self.groups.get(group.0 as usize) {
            Some(m) => Ok(m.lock()),
            None => {
                sink.fs_error(
                    "get_group_desc",
                    &format!("block_group >= groups_count - block_group = {group}, groups_count = {}", self.groups.len()),
                );
                Err(Ext2Error::Corruption {
                    block: 0,
                    detail: format!("group {group} out of range"),
                })
            }
        }
    }

    /// Snapshot a descriptor without holding its lock.
    pub fn snapshot(&self, sink: &dyn CorruptionSink, group: GroupNumber) -> Result<GroupDesc> {
        Ok(*self.lock(sink, group)?)
    }

    pub fn mark_dirty(&self, group: GroupNumber) {
        if let Some(flag) = self.dirty.get(group.0 as usize) {
            flag.store(true, Ordering::Release);
        }
    }

    /// Write every dirty descriptor back into its descriptor block.
    pub fn write_back(&self, dev: &dyn BlockDevice, geo: &FsGeometry) -> Result<()> {
        for block_index in 0..geo.gdb_count {
            let first_group = block_index * geo.desc_per_block;
            let last_group = ((block_index + 1) * geo.desc_per_block).min(geo.groups_count);
            let any_dirty = (first_group..last_group)
                .any(|g| self.dirty[g as usize].load(Ordering::Acquire));
            if !any_dirty {
                continue;
            }

            let desc_block = geo.desc_block(block_index);
            let buf = dev.read_block(desc_block)?;
            let mut bytes = buf.into_inner();
            for group in first_group..last_group {
                let offset = ((group % geo.desc_per_block) as usize) * GROUP_DESC_SIZE;
                let desc = *self.groups[group as usize].lock();
                desc.encode_into(&mut bytes[offset..offset + GROUP_DESC_SIZE]);
            }
            dev.write_block(desc_block, &bytes)?;
            for group in first_group..last_group {
                self.dirty[group as usize].store(false, Ordering::Release);
            }
            trace!(target: "e2l::alloc", block = desc_block.0, "descriptor block written back");
        }
        Ok(())
    }

    /// Sum of `bg_free_blocks_count` over all groups.
    #[must_use]
    pub fn count_free_blocks(&self) -> u64 {
        self.groups
            .iter()
            .map(|g| u64::from(g.lock().free_blocks_count))
            .sum()
    }

    /// Sum of `bg_free_inodes_count` over all groups.
    #[must_use]
    pub fn count_free_inodes(&self) -> u64 {
        self.groups
            .iter()
            .map(|g| u64::from(g.lock().free_inodes_count))
            .sum()
    }

    /// Sum of `bg_used_dirs_count` over all groups.
    #[must_use]
    pub fn count_dirs(&self) -> u64 {
        self.groups
            .iter()
            .map(|g| u64::from(g.lock().used_dirs_count))
            .sum()
    }
}

// ── Block bitmap validation ─────────────────────────────────────────────────

fn in_range(b: u32, first: u32, len: u32) -> bool {
    b >= first && b <= first + len - 1
}

/// Check that a group's block bitmap marks its own metadata as allocated:
/// the block-bitmap block, the inode-bitmap block, and every inode-table
/// block must have their bits set.
fn block_bitmap_valid(
    geo: &FsGeometry,
    desc: &GroupDesc,
    group: GroupNumber,
    bitmap: &[u8],
) -> bool {
    let group_first = geo.group_first_block(group).0;

    let offset = desc.block_bitmap.0.wrapping_sub(group_first);
    if !bitmap_get(bitmap, offset) {
        return false;
    }

    let offset = desc.inode_bitmap.0.wrapping_sub(group_first);
    if !bitmap_get(bitmap, offset) {
        return false;
    }

    let offset = desc.inode_table.0.wrapping_sub(group_first);
    let next_zero = bitmap_find_next_zero(bitmap, offset + geo.itb_per_group, offset);
    next_zero.is_none()
}

/// Read and validate the block bitmap described by an already-held
/// descriptor. Callers inside allocation paths pass the locked descriptor so
/// the read-modify-write stays under the group lock.
fn read_block_bitmap_with(
    dev: &dyn BlockDevice,
    geo: &FsGeometry,
    sink: &dyn CorruptionSink,
    group: GroupNumber,
    desc: &GroupDesc,
) -> Result<BlockBuf> {
    let buf = dev.read_block(desc.block_bitmap)?;

    if !block_bitmap_valid(geo, desc, group, buf.as_slice()) {
        sink.fs_error(
            "read_block_bitmap",
            &format!(
                "Invalid block bitmap - block_group = {group}, block = {}",
                desc.block_bitmap
            ),
        );
        return Err(Ext2Error::Corruption {
            block: u64::from(desc.block_bitmap.0),
            detail: format!("block bitmap of group {group} is not valid"),
        });
    }

    Ok(buf)
}

/// Read and validate the block bitmap for `group`.
pub fn read_block_bitmap(
    dev: &dyn BlockDevice,
    geo: &FsGeometry,
    table: &GroupTable,
    sink: &dyn CorruptionSink,
    group: GroupNumber,
) -> Result<BlockBuf> {
    let desc = table.snapshot(sink, group)?;
    read_block_bitmap_with(dev, geo, sink, group, &desc)
}

// ── Block allocator ─────────────────────────────────────────────────────────

/// Result of a block allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockAlloc {
    /// First allocated block.
    pub start: BlockNumber,
    /// Number of contiguous blocks actually taken (`1..=max`).
    pub count: u32,
}

/// Allocate up to `max` contiguous blocks, preferring `goal_group`.
///
/// Walks every group in linear order modulo the group count, starting from
/// the goal. Within a group: first zero bit, then greedy test-and-set on the
/// following bits until `max` is reached, a bit is taken, or the group ends.
pub fn new_blocks(
    dev: &dyn BlockDevice,
    geo: &FsGeometry,
    table: &GroupTable,
    counters: &FsCounters,
    sink: &dyn CorruptionSink,
    goal_group: GroupNumber,
    max: u32,
) -> Result<BlockAlloc> {
    if max == 0 {
        return Err(Ext2Error::InvalidInput("cannot allocate 0 blocks"));
    }

    // Cheap global check first; the counter is a hint, the walk below is
    // authoritative.
    if counters.free_blocks.read_positive() == 0 {
        return Err(Ext2Error::NoSpace);
    }

    let ngroups = geo.groups_count;
    let mut group_no = goal_group.0 % ngroups.max(1);

    for _ in 0..ngroups {
        let group = GroupNumber(group_no);
        group_no = (group_no + 1) % ngroups;

        // The whole read-modify-write of this group's bitmap happens under
        // its lock, paired with the descriptor count update.
        let mut desc = table.lock(sink, group)?;
        if desc.free_blocks_count == 0 {
            continue;
        }

        let bitmap_buf = read_block_bitmap_with(dev, geo, sink, group, &desc)?;
        let mut bitmap = bitmap_buf.into_inner();
        let nblocks = geo.blocks_in_group(group);

        let Some(first_free) = bitmap_find_next_zero(&bitmap, nblocks, 0) else {
            continue;
        };

        let mut num = 0_u32;
        while num < max
            && first_free + num < nblocks
            && !bitmap_test_and_set(&mut bitmap, first_free + num)
        {
            num += 1;
        }
        if num == 0 {
            continue;
        }

        dev.write_block(desc.block_bitmap, &bitmap)?;
        desc.free_blocks_count -= num as u16;
        drop(desc);
        table.mark_dirty(group);
        counters.free_blocks.sub(i64::from(num));

        let start = BlockNumber(geo.group_first_block(group).0 + first_free);
        debug!(
            target: "e2l::alloc",
            block = start.0,
            count = num,
            group = group.0,
            "allocated block run"
        );
        return Ok(BlockAlloc { start, count: num });
    }

    Err(Ext2Error::NoSpace)
}

/// Validate a candidate free range against the global limits.
fn data_blocks_valid(geo: &FsGeometry, start: BlockNumber, count: u32) -> bool {
    let Some(end) = start.0.checked_add(count.wrapping_sub(1)) else {
        return false;
    };
    if count == 0 || end < start.0 {
        return false;
    }
    if start.0 <= geo.first_data_block {
        return false;
    }
    if end >= geo.blocks_count {
        return false;
    }
    if start.0 <= geo.sb_block && end >= geo.sb_block {
        return false;
    }
    true
}

/// Validate a free range against the group's own metadata blocks.
fn data_blocks_valid_in_group(
    geo: &FsGeometry,
    desc: &GroupDesc,
    start: BlockNumber,
    count: u32,
) -> bool {
    let end = start.0 + count - 1;
    if in_range(desc.block_bitmap.0, start.0, count) {
        return false;
    }
    if in_range(desc.inode_bitmap.0, start.0, count) {
        return false;
    }
    if in_range(start.0, desc.inode_table.0, geo.itb_per_group)
        || in_range(end, desc.inode_table.0, geo.itb_per_group)
    {
        return false;
    }
    true
}

/// Free `count` blocks starting at `block`. Returns how many bits were
/// actually cleared; already-clear bits are reported as corruption and
/// skipped.
pub fn free_blocks(
    dev: &dyn BlockDevice,
    geo: &FsGeometry,
    table: &GroupTable,
    counters: &FsCounters,
    sink: &dyn CorruptionSink,
    block: BlockNumber,
    count: u32,
) -> Result<u32> {
    if !data_blocks_valid(geo, block, count) {
        sink.fs_error(
            "free_blocks",
            &format!("Freeing invalid data blocks - block = {block}, count = {count}"),
        );
        return Err(Ext2Error::Corruption {
            block: u64::from(block.0),
            detail: format!("freeing invalid data blocks: block = {block}, count = {count}"),
        });
    }

    let rel = block.0 - geo.first_data_block;
    let group = GroupNumber(rel / geo.blocks_per_group);
    let bit = rel % geo.blocks_per_group;
    debug!(
        target: "e2l::alloc",
        first = block.0,
        last = block.0 + count - 1,
        group = group.0,
        "freeing block run"
    );

    let mut desc = table.lock(sink, group)?;
    let bitmap_buf = read_block_bitmap_with(dev, geo, sink, group, &desc)?;
    let mut bitmap = bitmap_buf.into_inner();

    if !data_blocks_valid_in_group(geo, &desc, block, count) {
        drop(desc);
        sink.fs_error(
            "free_blocks",
            &format!("Freeing blocks in system zones - Block = {block}, count = {count}"),
        );
        return Err(Ext2Error::Corruption {
            block: u64::from(block.0),
            detail: format!("freeing blocks in system zones: block = {block}, count = {count}"),
        });
    }

    let mut freed = 0_u32;
    let mut already_clear = Vec::new();
    for i in 0..count {
        if !bitmap_test_and_clear(&mut bitmap, bit + i) {
            already_clear.push(block.0 + i);
        } else {
            freed += 1;
        }
    }
    dev.write_block(desc.block_bitmap, &bitmap)?;
    desc.free_blocks_count += freed as u16;
    drop(desc);
    table.mark_dirty(group);

    for bno in already_clear {
        sink.fs_error("free_blocks", &format!("bit already cleared for block {bno}"));
    }
    if freed > 0 {
        counters.free_blocks.add(i64::from(freed));
    }
    trace!(target: "e2l::alloc", freed, "free_blocks done");
    Ok(freed)
}

// ── Inode allocator ─────────────────────────────────────────────────────────

/// Result of an inode allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InodeAlloc {
    pub ino: InodeNumber,
    pub group: GroupNumber,
}

/// Find a group for a new inode.
///
/// Try the parent's group if it has both free inodes and free blocks. Failing
/// that, quadratically probe from `(parent_group + parent_ino) % ngroups` so
/// files in one directory cluster while distinct directories spread. Last
/// resort is a linear scan that accepts any free inode regardless of block
/// availability.
fn find_group(
    table: &GroupTable,
    sink: &dyn CorruptionSink,
    geo: &FsGeometry,
    parent_group: GroupNumber,
    parent_ino: InodeNumber,
) -> Result<Option<GroupNumber>> {
    let ngroups = geo.groups_count;

    let desc = table.snapshot(sink, parent_group)?;
    if desc.free_inodes_count > 0 && desc.free_blocks_count > 0 {
        return Ok(Some(parent_group));
    }

    let mut group = (parent_group.0 + parent_ino.0) % ngroups;
    let mut i = 1;
    while i < ngroups {
        group += i;
        if group >= ngroups {
            group -= ngroups;
        }
        let desc = table.snapshot(sink, GroupNumber(group))?;
        if desc.free_inodes_count > 0 && desc.free_blocks_count > 0 {
            return Ok(Some(GroupNumber(group)));
        }
        i <<= 1;
    }

    let mut group = parent_group.0;
    for _ in 0..ngroups {
        group = (group + 1) % ngroups;
        let desc = table.snapshot(sink, GroupNumber(group))?;
        if desc.free_inodes_count > 0 {
            return Ok(Some(GroupNumber(group)));
        }
    }

    Ok(None)
}

/// Allocate an on-disk inode near `parent_group`.
pub fn new_inode(
    dev: &dyn BlockDevice,
    geo: &FsGeometry,
    table: &GroupTable,
    counters: &FsCounters,
    sink: &dyn CorruptionSink,
    parent_group: GroupNumber,
    parent_ino: InodeNumber,
    is_dir: bool,
) -> Result<InodeAlloc> {
    let Some(mut group) = find_group(table, sink, geo, parent_group, parent_ino)? else {
        return Err(Ext2Error::NoSpace);
    };

    let inodes_pg = geo.inodes_per_group;

    'groups: for _ in 0..geo.groups_count {
        let mut desc = table.lock(sink, group)?;
        let mut bitmap = dev.read_block(desc.inode_bitmap)?.into_inner();

        let mut bit = 0_u32;
        let taken = loop {
            let Some(free) = bitmap_find_next_zero(&bitmap, inodes_pg, bit) else {
                // The group looked free but is exhausted by now; try the
                // next one.
                drop(desc);
                group = GroupNumber((group.0 + 1) % geo.groups_count);
                continue 'groups;
            };
            if bitmap_test_and_set(&mut bitmap, free) {
                // Taken under our feet; resume the scan one past it.
                bit = free + 1;
                if bit >= inodes_pg {
                    drop(desc);
                    group = GroupNumber((group.0 + 1) % geo.groups_count);
                    continue 'groups;
                }
                continue;
            }
            break free;
        };

        dev.write_block(desc.inode_bitmap, &bitmap)?;

        let ino = group.0 * inodes_pg + taken + 1;
        if ino < geo.first_ino || ino > geo.inodes_count {
            drop(desc);
            sink.fs_error(
                "new_inode",
                &format!(
                    "reserved inode or inode > inodes count - block_group = {group}, inode = {ino}"
                ),
            );
            return Err(Ext2Error::Corruption {
                block: 0,
                detail: format!("allocated out-of-range inode {ino}"),
            });
        }

        desc.free_inodes_count -= 1;
        if is_dir {
            desc.used_dirs_count += 1;
        }
        drop(desc);
        table.mark_dirty(group);

        counters.free_inodes.dec();
        if is_dir {
            counters.dirs.inc();
        }

        debug!(target: "e2l::alloc", ino, group = group.0, "allocated inode");
        return Ok(InodeAlloc {
            ino: InodeNumber(ino),
            group,
        });
    }

    Err(Ext2Error::NoSpace)
}

/// Mark an on-disk inode free and release its descriptor accounting.
pub fn free_inode(
    dev: &dyn BlockDevice,
    geo: &FsGeometry,
    table: &GroupTable,
    counters: &FsCounters,
    sink: &dyn CorruptionSink,
    ino: InodeNumber,
    was_dir: bool,
) -> Result<()> {
    debug!(target: "e2l::alloc", ino = ino.0, "freeing inode");

    if ino.0 < geo.first_ino || ino.0 > geo.inodes_count {
        sink.fs_error("free_inode", &format!("reserved or nonexistent inode {ino}"));
        return Err(Ext2Error::Corruption {
            block: 0,
            detail: format!("freeing reserved or nonexistent inode {ino}"),
        });
    }

    let group = e2l_types::inode_to_group(ino, geo.inodes_per_group);
    let bit = e2l_types::inode_index_in_group(ino, geo.inodes_per_group);

    let mut desc = table.lock(sink, group)?;
    let mut bitmap = dev.read_block(desc.inode_bitmap)?.into_inner();

    let cleared = bitmap_test_and_clear(&mut bitmap, bit);
    if cleared {
        desc.free_inodes_count += 1;
        if was_dir {
            desc.used_dirs_count -= 1;
        }
    }
    dev.write_block(desc.inode_bitmap, &bitmap)?;
    drop(desc);

    if cleared {
        table.mark_dirty(group);
        counters.free_inodes.inc();
        if was_dir {
            counters.dirs.dec();
        }
    } else {
        sink.fs_error("free_inode", &format!("bit already cleared for inode {ino}"));
    }
    Ok(())
}

// ── Bundled allocator context ───────────────────────────────────────────────

/// Everything the allocation paths need, bundled for the layers above.
///
/// The free functions remain the primitive API; higher layers thread one of
/// these through instead of five arguments.
#[derive(Clone, Copy)]
pub struct FsCtx<'a> {
    pub dev: &'a dyn BlockDevice,
    pub geo: &'a FsGeometry,
    pub table: &'a GroupTable,
    pub counters: &'a FsCounters,
    pub sink: &'a dyn CorruptionSink,
}

impl<'a> FsCtx<'a> {
    pub fn new_blocks(&self, goal_group: GroupNumber, max: u32) -> Result<BlockAlloc> {
        new_blocks(
            self.dev,
            self.geo,
            self.table,
            self.counters,
            self.sink,
            goal_group,
            max,
        )
    }

    pub fn free_blocks(&self, block: BlockNumber, count: u32) -> Result<u32> {
        free_blocks(
            self.dev,
            self.geo,
            self.table,
            self.counters,
            self.sink,
            block,
            count,
        )
    }

    pub fn new_inode(
        &self,
        parent_group: GroupNumber,
        parent_ino: InodeNumber,
        is_dir: bool,
    ) -> Result<InodeAlloc> {
        new_inode(
            self.dev,
            self.geo,
            self.table,
            self.counters,
            self.sink,
            parent_group,
            parent_ino,
            is_dir,
        )
    }

    pub fn free_inode(&self, ino: InodeNumber, was_dir: bool) -> Result<()> {
        free_inode(
            self.dev,
            self.geo,
            self.table,
            self.counters,
            self.sink,
            ino,
            was_dir,
        )
    }
}

// ── Corruption sink helper ──────────────────────────────────────────────────

/// Sink for contexts with no mounted filesystem (tests, tooling): logs the
/// diagnostic and nothing else.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl CorruptionSink for TracingSink {
    fn fs_error(&self, function: &str, detail: &str) {
        error!(target: "e2l::alloc", function, detail, "filesystem error");
    }
}
