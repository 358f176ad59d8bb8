#![forbid(unsafe_code)]
//! Test tooling for ext2-lite.
//!
//! `ImageSpec`/`build_image` lay out a fresh, valid filesystem image in
//! memory for the end-to-end suites (the engine itself ships no mkfs), and
//! `check_image_invariants` re-derives the on-disk accounting from raw
//! bytes to catch drift the engine's own counters would hide.

use e2l_alloc::{bitmap_count_free, bitmap_get, bitmap_test_and_set};
use e2l_block::{ByteDevice, MemoryByteDevice};
use e2l_error::Result;
use e2l_fs::Ext2Fs;
use e2l_ondisk::{dir_rec_len, DirEntry, GroupDesc, RawInode, Superblock, GROUP_DESC_SIZE};
use e2l_types::{
    is_dir, BlockNumber, InodeNumber, NDIR_BLOCKS, N_BLOCKS, SUPERBLOCK_OFFSET, SUPERBLOCK_SIZE,
    SUPER_MAGIC, VALID_FS,
};
use std::sync::Arc;

/// Geometry of a synthetic image.
#[derive(Debug, Clone, Copy)]
pub struct ImageSpec {
    pub block_size: u32,
    pub groups: u32,
    pub blocks_per_group: u32,
    pub inodes_per_group: u32,
}

impl Default for ImageSpec {
    fn default() -> Self {
        Self {
            block_size: 1024,
            groups: 2,
            blocks_per_group: 8192,
            inodes_per_group: 1024,
        }
    }
}

const INODE_SIZE: u32 = 128;
const RESERVED_INODES: u32 = 10;

struct Layout {
    first_data_block: u32,
    blocks_count: u32,
    gdb_count: u32,
    itb_per_group: u32,
    meta_per_group: u32,
}

impl Layout {
    fn of(spec: &ImageSpec) -> Self {
        let first_data_block = u32::from(spec.block_size == 1024);
        let desc_per_block = spec.block_size / GROUP_DESC_SIZE as u32;
        let gdb_count = spec.groups.div_ceil(desc_per_block);
        let itb_per_group = spec.inodes_per_group / (spec.block_size / INODE_SIZE);
        Self {
            first_data_block,
            blocks_count: first_data_block + spec.groups * spec.blocks_per_group,
            gdb_count,
            itb_per_group,
            // superblock copy + descriptor copies + two bitmaps + table
            meta_per_group: 1 + gdb_count + 2 + itb_per_group,
        }
    }

    fn group_first(&self, spec: &ImageSpec, g: u32) -> u32 {
        self.first_data_block + g * spec.blocks_per_group
    }
}

/// Build a freshly formatted image: superblock and descriptor backups in
/// every group, metadata bits pre-set in the block bitmaps, reserved inodes
/// marked, and an empty root directory.
#[must_use]
pub fn build_image(spec: &ImageSpec) -> Vec<u8> {
    let layout = Layout::of(spec);
    let bs = spec.block_size as usize;
    let mut image = vec![0_u8; layout.blocks_count as usize * bs];

    let root_data_block = layout.group_first(spec, 0) + layout.meta_per_group;

    // ── Group descriptors ───────────────────────────────────────────────
    let mut descs = Vec::new();
    for g in 0..spec.groups {
        let first = layout.group_first(spec, g);
        let bitmap = first + 1 + layout.gdb_count;
        descs.push(GroupDesc {
            block_bitmap: BlockNumber(bitmap),
            inode_bitmap: BlockNumber(bitmap + 1),
            inode_table: BlockNumber(bitmap + 2),
            free_blocks_count: (spec.blocks_per_group
                - layout.meta_per_group
                - u32::from(g == 0)) as u16,
            free_inodes_count: (spec.inodes_per_group - if g == 0 { RESERVED_INODES } else { 0 })
                as u16,
            used_dirs_count: u16::from(g == 0),
        });
    }

    let mut gdt = vec![0_u8; layout.gdb_count as usize * bs];
    for (i, desc) in descs.iter().enumerate() {
        desc.encode_into(&mut gdt[i * GROUP_DESC_SIZE..(i + 1) * GROUP_DESC_SIZE]);
    }

    // ── Superblock ──────────────────────────────────────────────────────
    let sb = Superblock {
        inodes_count: spec.inodes_per_group * spec.groups,
        blocks_count: layout.blocks_count,
        free_blocks_count: descs.iter().map(|d| u32::from(d.free_blocks_count)).sum(),
        free_inodes_count: descs.iter().map(|d| u32::from(d.free_inodes_count)).sum(),
        first_data_block: layout.first_data_block,
        log_block_size: spec.block_size.trailing_zeros() - 10,
        block_size: spec.block_size,
        blocks_per_group: spec.blocks_per_group,
        inodes_per_group: spec.inodes_per_group,
        mnt_count: 0,
        max_mnt_count: 0xFFFF,
        magic: SUPER_MAGIC,
        state: VALID_FS,
        errors: e2l_types::ERRORS_CONTINUE,
        minor_rev_level: 0,
        mtime: 0,
        wtime: 0,
        lastcheck: 0,
        checkinterval: 0,
        creator_os: 0,
        rev_level: 1,
        first_ino: RESERVED_INODES + 1,
        inode_size: INODE_SIZE as u16,
        feature_compat: 0,
        feature_incompat: 0,
        feature_ro_compat: 0,
        uuid: *b"e2l-harness-uuid",
        volume_name: *b"e2l-test\0\0\0\0\0\0\0\0",
        default_mount_opts: 0,
        first_meta_bg: 0,
    };

    // Primary superblock at byte 1024, backups at every group start.
    sb.encode_region(&mut image[SUPERBLOCK_OFFSET..SUPERBLOCK_OFFSET + SUPERBLOCK_SIZE]);
    for g in 1..spec.groups {
        let at = layout.group_first(spec, g) as usize * bs;
        sb.encode_region(&mut image[at..at + SUPERBLOCK_SIZE]);
    }

    // Descriptor table, primary and backups.
    for g in 0..spec.groups {
        let at = (layout.group_first(spec, g) + 1) as usize * bs;
        image[at..at + gdt.len()].copy_from_slice(&gdt);
    }

    // ── Bitmaps ─────────────────────────────────────────────────────────
    for (g, desc) in descs.iter().enumerate() {
        let bitmap_at = desc.block_bitmap.0 as usize * bs;
        {
            let bitmap = &mut image[bitmap_at..bitmap_at + bs];
            for bit in 0..layout.meta_per_group {
                bitmap_test_and_set(bitmap, bit);
            }
            if g == 0 {
                bitmap_test_and_set(bitmap, layout.meta_per_group);
            }
        }

        if g == 0 {
            let ibitmap_at = desc.inode_bitmap.0 as usize * bs;
            let ibitmap = &mut image[ibitmap_at..ibitmap_at + bs];
            for bit in 0..RESERVED_INODES {
                bitmap_test_and_set(ibitmap, bit);
            }
        }
    }

    // ── Root directory ──────────────────────────────────────────────────
    let mut root = RawInode {
        mode: e2l_types::S_IFDIR | 0o755,
        uid: 0,
        gid: 0,
        size: spec.block_size,
        atime: 0,
        ctime: 0,
        mtime: 0,
        dtime: 0,
        links_count: 2,
        blocks: spec.block_size / 512,
        flags: 0,
        block: [0; N_BLOCKS],
        generation: 0,
    };
    root.block[0] = root_data_block;
    let table_at = descs[0].inode_table.0 as usize * bs;
    let root_at = table_at + INODE_SIZE as usize; // index 1 = inode 2
    root.encode_into(&mut image[root_at..root_at + INODE_SIZE as usize]);

    let data_at = root_data_block as usize * bs;
    let chunk = &mut image[data_at..data_at + bs];
    let dot_len = dir_rec_len(1);
    e2l_ondisk::write_dir_entry(chunk, 0, InodeNumber(2), dot_len, b".");
    e2l_ondisk::write_dir_entry(
        chunk,
        usize::from(dot_len),
        InodeNumber(2),
        spec.block_size as u16 - dot_len,
        b"..",
    );

    image
}

/// Build and mount a fresh image; the returned device shares the bytes so
/// callers can inspect them after `unmount`.
pub fn mount_fresh(spec: &ImageSpec, options: &str) -> Result<(Arc<MemoryByteDevice>, Ext2Fs)> {
    let mem = Arc::new(MemoryByteDevice::from_vec(build_image(spec)));
    let dev: Box<dyn ByteDevice> = Box::new(Arc::clone(&mem));
    let fs = Ext2Fs::mount(dev, options, false)?;
    Ok((mem, fs))
}

// ── Raw-image invariant checking ────────────────────────────────────────────

fn block(image: &[u8], bs: usize, bno: u32) -> &[u8] {
    &image[bno as usize * bs..(bno as usize + 1) * bs]
}

/// Re-derive the accounting invariants from raw image bytes and panic with a
/// diagnostic on the first violation:
///
/// * per group, block-bitmap zero bits match `bg_free_blocks_count`;
/// * per group, inode-bitmap zero bits match `bg_free_inodes_count`;
/// * per group, `bg_used_dirs_count` matches the allocated directory inodes;
/// * every directory chunk walks by `rec_len` exactly to the chunk end and
///   starts (chunk 0) with `.` pointing at the directory itself, then `..`.
///
/// Returns the recomputed `(free_blocks, free_inodes)` totals so callers can
/// hold them against the superblock after a clean sync.
pub fn check_image_invariants(image: &[u8]) -> (u64, u64) {
    let sb = Superblock::parse_region(
        &image[SUPERBLOCK_OFFSET..SUPERBLOCK_OFFSET + SUPERBLOCK_SIZE],
    )
    .expect("parse superblock");
    let bs = sb.block_size as usize;
    let groups = sb.groups_count();
    let desc_table = block(image, bs, sb.first_data_block + 1);

    let mut total_free_blocks = 0_u64;
    let mut total_free_inodes = 0_u64;

    for g in 0..groups {
        let desc =
            GroupDesc::parse_from_bytes(&desc_table[g as usize * GROUP_DESC_SIZE..]).expect("desc");

        let group_first = sb.first_data_block + g * sb.blocks_per_group;
        let group_end = (group_first + sb.blocks_per_group).min(sb.blocks_count);
        let blocks_in_group = group_end - group_first;

        let bbitmap = block(image, bs, desc.block_bitmap.0);
        let free = bitmap_count_free(bbitmap, blocks_in_group);
        assert_eq!(
            free,
            u32::from(desc.free_blocks_count),
            "group {g}: block bitmap free bits vs descriptor"
        );
        total_free_blocks += u64::from(free);

        let ibitmap = block(image, bs, desc.inode_bitmap.0);
        let ifree = bitmap_count_free(ibitmap, sb.inodes_per_group);
        assert_eq!(
            ifree,
            u32::from(desc.free_inodes_count),
            "group {g}: inode bitmap free bits vs descriptor"
        );
        total_free_inodes += u64::from(ifree);

        // Count allocated directory inodes from the table itself.
        let mut dirs = 0_u16;
        for index in 0..sb.inodes_per_group {
            if !bitmap_get(ibitmap, index) {
                continue;
            }
            let at = desc.inode_table.0 as usize * bs + index as usize * INODE_SIZE as usize;
            let Ok(raw) = RawInode::parse_from_bytes(&image[at..at + INODE_SIZE as usize]) else {
                continue;
            };
            // Reserved slots other than the root carry no inode.
            if raw.links_count > 0 && is_dir(raw.mode) {
                dirs += 1;
                check_directory(image, &sb, g * sb.inodes_per_group + index + 1, &raw);
            }
        }
        assert_eq!(
            dirs, desc.used_dirs_count,
            "group {g}: allocated directory inodes vs bg_used_dirs_count"
        );
    }

    (total_free_blocks, total_free_inodes)
}

/// Parsed superblock free counts, for comparing against a clean sync.
#[must_use]
pub fn parse_superblock(image: &[u8]) -> Superblock {
    Superblock::parse_region(&image[SUPERBLOCK_OFFSET..SUPERBLOCK_OFFSET + SUPERBLOCK_SIZE])
        .expect("parse superblock")
}

fn check_directory(image: &[u8], sb: &Superblock, ino: u32, raw: &RawInode) {
    let bs = sb.block_size as usize;
    assert_eq!(
        raw.size as usize % bs,
        0,
        "directory {ino}: size not a multiple of the chunk size"
    );
    let chunks = raw.size as usize / bs;

    for n in 0..chunks.min(NDIR_BLOCKS) {
        let bno = raw.block[n];
        assert_ne!(bno, 0, "directory {ino}: chunk {n} unmapped");
        let chunk = block(image, bs, bno);

        let mut offs = 0_usize;
        while offs < bs {
            let de = DirEntry::parse_at(chunk, offs).expect("entry header");
            let rec_len = usize::from(de.rec_len);
            assert!(
                rec_len >= usize::from(dir_rec_len(usize::from(de.name_len).max(1))),
                "directory {ino}: rec_len too small at chunk {n} offset {offs}"
            );
            assert_eq!(rec_len % 4, 0, "directory {ino}: unaligned rec_len");
            assert!(
                offs + rec_len <= bs,
                "directory {ino}: entry crosses chunk boundary"
            );

            if n == 0 && offs == 0 {
                assert_eq!(de.name, b".", "directory {ino}: first entry is not '.'");
                assert_eq!(de.inode, ino, "directory {ino}: '.' does not point to self");
            }
            if n == 0 && offs == usize::from(dir_rec_len(1)) {
                assert_eq!(de.name, b"..", "directory {ino}: second entry is not '..'");
                assert_ne!(de.inode, 0, "directory {ino}: '..' is a tombstone");
            }
            offs += rec_len;
        }
        assert_eq!(offs, bs, "directory {ino}: chunk {n} walk misses the end");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_image_mounts_and_validates() {
        let spec = ImageSpec::default();
        let image = build_image(&spec);
        check_image_invariants(&image);

        let (mem, fs) = mount_fresh(&spec, "").expect("mount");
        let stat = fs.statfs().expect("statfs");
        assert_eq!(stat.files, 2048);
        // Reserved inodes and the root are spoken for.
        assert_eq!(stat.ffree, 2048 - 10);
        fs.unmount().expect("unmount");
        check_image_invariants(&mem.snapshot());
    }

    #[test]
    fn fresh_superblock_counts_match_descriptors() {
        let image = build_image(&ImageSpec::default());
        let sb = parse_superblock(&image);
        assert_eq!(sb.state & VALID_FS, VALID_FS);
        assert!(sb.free_blocks_count > 0);
        assert_eq!(sb.first_ino, 11);
    }

    #[test]
    fn single_group_image_is_valid() {
        let spec = ImageSpec {
            groups: 1,
            ..ImageSpec::default()
        };
        let image = build_image(&spec);
        check_image_invariants(&image);
        let (_, fs) = mount_fresh(&spec, "").expect("mount");
        fs.unmount().expect("unmount");
    }
}
