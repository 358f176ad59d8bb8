//! Accounting and concurrency invariants checked from raw image bytes and
//! through the mounted interface.

use e2l_error::Ext2Error;
use e2l_fs::{Ext2Fs, SetAttr};
use e2l_harness::{check_image_invariants, mount_fresh, parse_superblock, ImageSpec};
use e2l_types::{ERROR_FS, VALID_FS};
use std::sync::Arc;

fn fresh() -> (Arc<e2l_block::MemoryByteDevice>, Ext2Fs) {
    mount_fresh(&ImageSpec::default(), "").expect("mount fresh image")
}

#[test]
fn accounting_survives_an_operation_storm() {
    let (mem, fs) = fresh();
    let root = fs.root().unwrap();

    let docs = fs.mkdir(&root, b"docs", 0o755).unwrap();
    let tmp = fs.mkdir(&root, b"tmp", 0o755).unwrap();

    for i in 0..40 {
        let name = format!("note{i:02}");
        let f = fs.create(&docs, name.as_bytes(), 0o644).unwrap();
        let payload = vec![i as u8; 900 * (1 + (i as usize % 3))];
        fs.write_at(&f, 0, &payload).unwrap();
        fs.iput(f).unwrap();
    }
    for i in 0..20 {
        let name = format!("note{i:02}");
        fs.unlink(&docs, name.as_bytes()).unwrap();
    }
    fs.rename(&docs, b"note25", &tmp, b"kept", 0).unwrap();
    let s = fs.symlink(&tmp, b"sym", b"../docs/note30").unwrap();
    fs.iput(s).unwrap();

    let scratch = fs.mkdir(&tmp, b"scratch", 0o755).unwrap();
    fs.iput(scratch).unwrap();
    fs.rmdir(&tmp, b"scratch").unwrap();

    fs.iput(tmp).unwrap();
    fs.iput(docs).unwrap();
    fs.iput(root).unwrap();
    fs.sync_fs(true).unwrap();
    fs.unmount().unwrap();

    let image = mem.snapshot();
    let (free_blocks, free_inodes) = check_image_invariants(&image);

    // After a clean sync the superblock's counts equal the recomputed sums.
    let sb = parse_superblock(&image);
    assert_eq!(u64::from(sb.free_blocks_count), free_blocks);
    assert_eq!(u64::from(sb.free_inodes_count), free_inodes);
}

#[test]
fn alloc_then_free_restores_bitmaps_bit_identically() {
    let (mem, fs) = fresh();
    let root = fs.root().unwrap();
    fs.sync_fs(true).unwrap();

    let before = mem.snapshot();

    let f = fs.create(&root, b"burst", 0o644).unwrap();
    fs.write_at(&f, 0, &vec![0xA5; 8 * 1024]).unwrap();
    fs.iput(f).unwrap();
    fs.unlink(&root, b"burst").unwrap();
    fs.sync_fs(true).unwrap();

    let after = mem.snapshot();

    // Compare every bitmap block: allocation state must be restored.
    let sb = parse_superblock(&before);
    let bs = sb.block_size as usize;
    let desc_table = &before[(sb.first_data_block as usize + 1) * bs..];
    for g in 0..sb.groups_count() {
        let desc = e2l_ondisk::GroupDesc::parse_from_bytes(
            &desc_table[g as usize * e2l_ondisk::GROUP_DESC_SIZE..],
        )
        .unwrap();
        let bb = desc.block_bitmap.0 as usize * bs;
        assert_eq!(
            before[bb..bb + bs],
            after[bb..bb + bs],
            "group {g} block bitmap drifted"
        );
        let ib = desc.inode_bitmap.0 as usize * bs;
        assert_eq!(
            before[ib..ib + bs],
            after[ib..ib + bs],
            "group {g} inode bitmap drifted"
        );
    }

    fs.iput(root).unwrap();
    fs.unmount().unwrap();
}

#[test]
fn write_read_back_with_holes() {
    let (_mem, fs) = fresh();
    let root = fs.root().unwrap();
    let f = fs.create(&root, b"holey", 0o644).unwrap();

    // Write past a hole: block 0 stays unmapped.
    fs.write_at(&f, 2000, &[7_u8; 100]).unwrap();
    assert_eq!(fs.getattr(&f).size, 2100);

    let mut buf = vec![0xFF_u8; 2100];
    let read = fs.read_at(&f, 0, &mut buf).unwrap();
    assert_eq!(read, 2100);
    assert!(buf[..2000].iter().all(|b| *b == 0), "hole must read zeros");
    assert!(buf[2000..].iter().all(|b| *b == 7));

    // Reads clamp at EOF.
    let mut beyond = [0_u8; 64];
    assert_eq!(fs.read_at(&f, 2100, &mut beyond).unwrap(), 0);
    assert_eq!(fs.read_at(&f, 2090, &mut beyond).unwrap(), 10);

    // Overwrite across a block boundary and read it back.
    fs.write_at(&f, 1020, b"boundary").unwrap();
    let mut span = [0_u8; 8];
    fs.read_at(&f, 1020, &mut span).unwrap();
    assert_eq!(&span, b"boundary");

    // Beyond the direct-block limit is refused.
    assert!(matches!(
        fs.write_at(&f, 12 * 1024 - 1, &[1, 2]),
        Err(Ext2Error::Unsupported(_))
    ));

    fs.iput(f).unwrap();
    fs.iput(root).unwrap();
    fs.unmount().unwrap();
}

#[test]
fn truncate_zeroes_the_tail_for_later_extension() {
    let (_mem, fs) = fresh();
    let root = fs.root().unwrap();
    let f = fs.create(&root, b"shrink", 0o644).unwrap();

    fs.write_at(&f, 0, &vec![9_u8; 3000]).unwrap();
    fs.setattr(
        &f,
        &SetAttr {
            size: Some(1500),
            ..SetAttr::default()
        },
    )
    .unwrap();
    assert_eq!(fs.getattr(&f).size, 1500);
    // Block 2 went away.
    assert_eq!(fs.getattr(&f).blocks, 4);

    // Growing the file again must expose zeros, not stale bytes.
    fs.setattr(
        &f,
        &SetAttr {
            size: Some(3000),
            ..SetAttr::default()
        },
    )
    .unwrap();
    let mut buf = vec![0xFF_u8; 1500];
    fs.read_at(&f, 1500, &mut buf).unwrap();
    assert!(buf.iter().all(|b| *b == 0), "stale bytes leaked past the old EOF");

    fs.iput(f).unwrap();
    fs.iput(root).unwrap();
    fs.unmount().unwrap();
}

#[test]
fn unlink_then_iget_reports_stale() {
    let (_mem, fs) = fresh();
    let root = fs.root().unwrap();

    let f = fs.create(&root, b"gone", 0o644).unwrap();
    let ino = f.ino;
    fs.iput(f).unwrap();
    fs.unlink(&root, b"gone").unwrap();

    assert!(matches!(fs.iget(ino), Err(Ext2Error::Stale(_))));

    // And a lookup that somehow raced to the number reports corruption,
    // not the freed contents.
    let recreated = fs.create(&root, b"back", 0o644).unwrap();
    // The allocator recycles the lowest free bit, giving the number back.
    assert_eq!(recreated.ino, ino);
    fs.iput(recreated).unwrap();

    fs.iput(root).unwrap();
    fs.unmount().unwrap();
}

#[test]
fn rename_keeps_a_binding_visible_to_concurrent_lookup() {
    let (_mem, fs) = fresh();
    let fs = Arc::new(fs);
    let root = fs.root().unwrap();
    let f = fs.create(&root, b"ping", 0o644).unwrap();
    fs.iput(f).unwrap();

    std::thread::scope(|scope| {
        let renamer = {
            let fs = Arc::clone(&fs);
            let root = fs.root().unwrap();
            scope.spawn(move || {
                for _ in 0..100 {
                    fs.rename(&root, b"ping", &root, b"pong", 0).unwrap();
                    fs.rename(&root, b"pong", &root, b"ping", 0).unwrap();
                }
                fs.iput(root).unwrap();
            })
        };

        let checker = {
            let fs = Arc::clone(&fs);
            let root = fs.root().unwrap();
            scope.spawn(move || {
                for _ in 0..200 {
                    let ping = fs.lookup(&root, b"ping").unwrap();
                    let pong = fs.lookup(&root, b"pong").unwrap();
                    let ping_again = fs.lookup(&root, b"ping").unwrap();
                    assert!(
                        ping.is_some() || pong.is_some() || ping_again.is_some(),
                        "both names unbound at once"
                    );
                    for handle in [ping, pong, ping_again].into_iter().flatten() {
                        fs.iput(handle).unwrap();
                    }
                }
                fs.iput(root).unwrap();
            })
        };

        renamer.join().unwrap();
        checker.join().unwrap();
    });

    fs.iput(root).unwrap();
    Arc::into_inner(fs).unwrap().unmount().unwrap();
}

#[test]
fn writable_mount_clears_valid_until_unmount() {
    let (mem, fs) = fresh();

    // Mounted writable: the on-disk state must show the fs as in use.
    fs.sync_fs(true).unwrap();
    let sb = parse_superblock(&mem.snapshot());
    assert_eq!(sb.state & VALID_FS, 0);
    assert_eq!(sb.state & ERROR_FS, 0);

    fs.unmount().unwrap();
    let sb = parse_superblock(&mem.snapshot());
    assert_eq!(sb.state & VALID_FS, VALID_FS, "unmount restores VALID_FS");
}

#[test]
fn remount_read_only_rejects_writes() {
    let (_mem, fs) = fresh();
    let root = fs.root().unwrap();

    fs.remount("", true).unwrap();
    assert!(fs.is_read_only());
    assert!(matches!(
        fs.create(&root, b"nope", 0o644),
        Err(Ext2Error::ReadOnly)
    ));

    fs.remount("", false).unwrap();
    let f = fs.create(&root, b"yep", 0o644).unwrap();
    fs.iput(f).unwrap();

    fs.iput(root).unwrap();
    fs.unmount().unwrap();
}

#[test]
fn corruption_policy_remount_ro_flips_the_mount() {
    let (mem, fs) = mount_fresh(&ImageSpec::default(), "errors=remount-ro").expect("mount");
    let root = fs.root().unwrap();

    let f = fs.create(&root, b"victim", 0o644).unwrap();
    fs.iput(f).unwrap();
    fs.iput(root).unwrap();
    fs.unmount().unwrap();

    // Corrupt the image offline, then remount and trip the check.
    let mut image = mem.snapshot();
    // Root directory data block: break its first rec_len.
    let sb = parse_superblock(&image);
    let bs = sb.block_size as usize;
    let desc = e2l_ondisk::GroupDesc::parse_from_bytes(
        &image[(sb.first_data_block as usize + 1) * bs..],
    )
    .unwrap();
    let table_at = desc.inode_table.0 as usize * bs;
    let root_inode =
        e2l_ondisk::RawInode::parse_from_bytes(&image[table_at + 128..table_at + 256]).unwrap();
    let chunk_at = root_inode.block[0] as usize * bs;
    image[chunk_at + 4] = 13; // unaligned rec_len
    image[chunk_at + 5] = 0;

    let dev: Box<dyn e2l_block::ByteDevice> =
        Box::new(e2l_block::MemoryByteDevice::from_vec(image));
    let fs = Ext2Fs::mount(dev, "errors=remount-ro", false).expect("mount survives");
    let root = fs.root().unwrap();

    let err = fs.lookup(&root, b"victim").unwrap_err();
    assert!(err.is_corruption());
    assert!(fs.is_read_only(), "policy must flip the mount read-only");

    fs.iput(root).unwrap();
    fs.unmount().unwrap();
}

#[test]
fn file_backed_image_survives_a_remount() {
    let image = e2l_harness::build_image(&ImageSpec::default());
    let tmp = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(tmp.path(), &image).unwrap();

    let dev = e2l_block::FileByteDevice::open(tmp.path()).unwrap();
    let fs = Ext2Fs::mount(Box::new(dev), "", false).unwrap();
    let root = fs.root().unwrap();
    let f = fs.create(&root, b"persisted", 0o644).unwrap();
    fs.write_at(&f, 0, b"bytes on disk").unwrap();
    fs.iput(f).unwrap();
    fs.iput(root).unwrap();
    fs.unmount().unwrap();

    // A second, read-only mount sees everything the first one wrote.
    let dev = e2l_block::FileByteDevice::open(tmp.path()).unwrap();
    let fs = Ext2Fs::mount(Box::new(dev), "", true).unwrap();
    let file = fs.resolve("/persisted").unwrap();
    let mut buf = [0_u8; 13];
    fs.read_at(&file, 0, &mut buf).unwrap();
    assert_eq!(&buf, b"bytes on disk");
    fs.iput(file).unwrap();
    fs.unmount().unwrap();

    check_image_invariants(&std::fs::read(tmp.path()).unwrap());
}

#[test]
fn show_options_reflects_parsed_set() {
    let (_mem, fs) = mount_fresh(&ImageSpec::default(), "errors=panic,debug").expect("mount");
    assert_eq!(fs.show_options(), ",errors=panic,debug");
    fs.unmount().unwrap();
}
