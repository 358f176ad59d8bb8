use criterion::{black_box, criterion_group, criterion_main, Criterion};
use e2l_ondisk::{GroupDesc, RawInode, Superblock, GROUP_DESC_SIZE};
use e2l_types::{BlockNumber, N_BLOCKS, SUPERBLOCK_SIZE};

fn superblock_region() -> Vec<u8> {
    let sb = Superblock {
        inodes_count: 2048,
        blocks_count: 16384,
        free_blocks_count: 16000,
        free_inodes_count: 2037,
        first_data_block: 1,
        log_block_size: 0,
        block_size: 1024,
        blocks_per_group: 8192,
        inodes_per_group: 1024,
        mnt_count: 1,
        max_mnt_count: 0xFFFF,
        magic: 0xEF53,
        state: 1,
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
        uuid: [0x5A; 16],
        volume_name: [0; 16],
        default_mount_opts: 0,
        first_meta_bg: 0,
    };
    let mut region = vec![0_u8; SUPERBLOCK_SIZE];
    sb.encode_region(&mut region);
    region
}

fn bench_parse(c: &mut Criterion) {
    let sb_region = superblock_region();
    c.bench_function("parse_superblock", |b| {
        b.iter(|| Superblock::parse_region(black_box(&sb_region)).unwrap());
    });

    let mut gd_bytes = [0_u8; GROUP_DESC_SIZE];
    GroupDesc {
        block_bitmap: BlockNumber(3),
        inode_bitmap: BlockNumber(4),
        inode_table: BlockNumber(5),
        free_blocks_count: 7000,
        free_inodes_count: 1014,
        used_dirs_count: 2,
    }
    .encode_into(&mut gd_bytes);
    c.bench_function("parse_group_desc", |b| {
        b.iter(|| GroupDesc::parse_from_bytes(black_box(&gd_bytes)).unwrap());
    });

    let mut inode_bytes = vec![0_u8; 128];
    RawInode {
        mode: 0o100_644,
        uid: 0,
        gid: 0,
        size: 1024,
        atime: 0,
        ctime: 0,
        mtime: 0,
        dtime: 0,
        links_count: 1,
        blocks: 2,
        flags: 0,
        block: [0; N_BLOCKS],
        generation: 0,
    }
    .encode_into(&mut inode_bytes);
    c.bench_function("parse_inode", |b| {
        b.iter(|| RawInode::parse_from_bytes(black_box(&inode_bytes)).unwrap());
    });
}

criterion_group!(benches, bench_parse);
criterion_main!(benches);
