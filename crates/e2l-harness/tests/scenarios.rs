//! End-to-end scenarios over a freshly built two-group image
//! (1024-byte blocks, 128-byte inodes, 8192 blocks and 1024 inodes per
//! group).

use e2l_error::Ext2Error;
use e2l_fs::{DirCursor, Ext2Fs, InodeRef};
use e2l_harness::{check_image_invariants, mount_fresh, ImageSpec};

fn fresh() -> (std::sync::Arc<e2l_block::MemoryByteDevice>, Ext2Fs) {
    mount_fresh(&ImageSpec::default(), "").expect("mount fresh image")
}

fn names(fs: &Ext2Fs, dir: &InodeRef) -> Vec<String> {
    let mut cursor = DirCursor::default();
    let mut out = Vec::new();
    fs.readdir(dir, &mut cursor, &mut |name, _| {
        out.push(String::from_utf8_lossy(name).into_owned());
        true
    })
    .expect("readdir");
    out
}

#[test]
fn mkdir_and_populate_lists_in_insertion_order() {
    let (_mem, fs) = fresh();
    let root = fs.root().unwrap();

    let a = fs.mkdir(&root, b"a", 0o755).unwrap();
    let b = fs.create(&a, b"b", 0o644).unwrap();
    let c = fs.create(&a, b"c", 0o644).unwrap();

    assert_eq!(names(&fs, &a), vec![".", "..", "b", "c"]);

    fs.iput(c).unwrap();
    fs.iput(b).unwrap();
    fs.iput(a).unwrap();
    fs.iput(root).unwrap();
    fs.unmount().unwrap();
}

#[test]
fn unlink_recovers_the_data_block() {
    let (mem, fs) = fresh();
    let root = fs.root().unwrap();

    let x = fs.create(&root, b"x", 0o644).unwrap();
    fs.write_at(&x, 0, &[0x55; 40]).unwrap();
    fs.iput(x).unwrap();

    let free_after_write = fs.statfs().unwrap().bfree;
    fs.unlink(&root, b"x").unwrap();
    fs.sync_fs(true).unwrap();

    assert_eq!(fs.statfs().unwrap().bfree, free_after_write + 1);

    fs.iput(root).unwrap();
    fs.unmount().unwrap();
    check_image_invariants(&mem.snapshot());
}

#[test]
fn rename_directory_across_parents_repoints_dotdot() {
    let (mem, fs) = fresh();
    let root = fs.root().unwrap();

    let a = fs.mkdir(&root, b"a", 0o755).unwrap();
    let b = fs.mkdir(&root, b"b", 0o755).unwrap();
    let d = fs.mkdir(&a, b"d", 0o755).unwrap();
    fs.iput(d).unwrap();

    let a_links_before = fs.getattr(&a).links;
    let b_links_before = fs.getattr(&b).links;

    fs.rename(&a, b"d", &b, b"d", 0).unwrap();

    // /b/d/.. now resolves to /b.
    let d = fs.lookup(&b, b"d").unwrap().expect("moved dir");
    let dotdot = fs.lookup(&d, b"..").unwrap().expect("..");
    assert_eq!(dotdot.ino, b.ino);
    fs.iput(dotdot).unwrap();
    fs.iput(d).unwrap();

    assert_eq!(fs.getattr(&a).links, a_links_before - 1);
    assert_eq!(fs.getattr(&b).links, b_links_before + 1);
    assert!(fs.lookup(&a, b"d").unwrap().is_none());

    fs.iput(b).unwrap();
    fs.iput(a).unwrap();
    fs.iput(root).unwrap();
    fs.sync_fs(true).unwrap();
    fs.unmount().unwrap();
    check_image_invariants(&mem.snapshot());
}

#[test]
fn rmdir_refuses_non_empty_directory() {
    let (_mem, fs) = fresh();
    let root = fs.root().unwrap();

    let a = fs.mkdir(&root, b"a", 0o755).unwrap();
    let x = fs.create(&a, b"x", 0o644).unwrap();
    fs.iput(x).unwrap();

    assert!(matches!(
        fs.rmdir(&root, b"a"),
        Err(Ext2Error::NotEmpty)
    ));
    // Entries unchanged.
    assert_eq!(names(&fs, &a), vec![".", "..", "x"]);
    let still = fs.lookup(&root, b"a").unwrap().expect("a still present");
    fs.iput(still).unwrap();

    // Emptied, it goes away.
    fs.unlink(&a, b"x").unwrap();
    fs.iput(a).unwrap();
    fs.rmdir(&root, b"a").unwrap();
    assert!(fs.lookup(&root, b"a").unwrap().is_none());

    fs.iput(root).unwrap();
    fs.unmount().unwrap();
}

#[test]
fn inode_exhaustion_then_recycle() {
    let (_mem, fs) = fresh();
    let root = fs.root().unwrap();

    // Spread files over a few directories so no directory outgrows its
    // twelve direct chunks.
    let mut parents = Vec::new();
    for i in 0..4 {
        let name = format!("d{i}");
        parents.push(fs.mkdir(&root, name.as_bytes(), 0o755).unwrap());
    }

    let to_create = fs.statfs().unwrap().ffree;
    for i in 0..to_create {
        let parent = &parents[(i % 4) as usize];
        let name = format!("f{i:04}");
        let file = fs
            .create(parent, name.as_bytes(), 0o644)
            .unwrap_or_else(|err| panic!("create #{i} of {to_create} failed: {err}"));
        fs.iput(file).unwrap();
    }

    assert_eq!(fs.statfs().unwrap().ffree, 0);
    assert!(matches!(
        fs.create(&parents[0], b"straw", 0o644),
        Err(Ext2Error::NoSpace)
    ));

    // Freeing one inode makes the next create succeed.
    fs.unlink(&parents[1], b"f0001").unwrap();
    let again = fs.create(&parents[0], b"straw", 0o644).unwrap();
    fs.iput(again).unwrap();

    for parent in parents {
        fs.iput(parent).unwrap();
    }
    fs.iput(root).unwrap();
    fs.unmount().unwrap();
}

#[test]
fn directory_grows_by_whole_chunks_and_readdir_is_stable() {
    let (_mem, fs) = fresh();
    let root = fs.root().unwrap();
    let d = fs.mkdir(&root, b"d", 0o755).unwrap();

    for i in 0..100 {
        let name = format!("f{i:03}");
        let f = fs.create(&d, name.as_bytes(), 0o644).unwrap();
        fs.iput(f).unwrap();
        assert_eq!(fs.getattr(&d).size % 1024, 0, "size must stay chunk-aligned");
    }

    // Start iterating, then grow the directory mid-walk.
    let mut cursor = DirCursor::default();
    let mut seen = Vec::new();
    fs.readdir(&d, &mut cursor, &mut |name, _| {
        if seen.len() >= 50 {
            return false;
        }
        seen.push(String::from_utf8_lossy(name).into_owned());
        true
    })
    .unwrap();

    for i in 100..200 {
        let name = format!("f{i:03}");
        let f = fs.create(&d, name.as_bytes(), 0o644).unwrap();
        fs.iput(f).unwrap();
    }

    fs.readdir(&d, &mut cursor, &mut |name, _| {
        seen.push(String::from_utf8_lossy(name).into_owned());
        true
    })
    .unwrap();

    // No duplicates, and every pre-growth file shows up exactly once.
    let mut sorted = seen.clone();
    sorted.sort();
    let before_dedup = sorted.len();
    sorted.dedup();
    assert_eq!(sorted.len(), before_dedup, "readdir visited an entry twice");
    for i in 0..100 {
        let name = format!("f{i:03}");
        assert!(seen.contains(&name), "missing {name}");
    }

    // And every name, old or new, resolves.
    for i in 0..200 {
        let name = format!("f{i:03}");
        let f = fs.lookup(&d, name.as_bytes()).unwrap().expect("lookup");
        fs.iput(f).unwrap();
    }

    fs.iput(d).unwrap();
    fs.iput(root).unwrap();
    fs.unmount().unwrap();
}

#[test]
fn symlink_inline_thresholds() {
    let (_mem, fs) = fresh();
    let root = fs.root().unwrap();

    let s = fs.symlink(&root, b"s", b"abc").unwrap();
    assert_eq!(fs.getattr(&s).blocks, 0, "short target stays inline");
    assert_eq!(fs.read_symlink(&s).unwrap(), b"abc");
    fs.iput(s).unwrap();

    let sixty = vec![b'x'; 60];
    let l = fs.symlink(&root, b"l", &sixty).unwrap();
    assert_eq!(fs.getattr(&l).blocks, 0, "60-byte target fits the slot area");
    assert_eq!(fs.read_symlink(&l).unwrap(), sixty);
    fs.iput(l).unwrap();

    let long = vec![b'y'; 1000];
    let big = fs.symlink(&root, b"L", &long).unwrap();
    let attr = fs.getattr(&big);
    assert_eq!(attr.blocks, 2, "long target takes one 1K block");
    assert_eq!(attr.size, 1000);
    assert_eq!(fs.read_symlink(&big).unwrap(), long);
    fs.iput(big).unwrap();

    // Longer than a block is refused outright.
    let too_long = vec![b'z'; 1024];
    assert!(matches!(
        fs.symlink(&root, b"t", &too_long),
        Err(Ext2Error::NameTooLong)
    ));

    fs.iput(root).unwrap();
    fs.unmount().unwrap();
}

#[test]
fn hard_link_shares_the_inode() {
    let (_mem, fs) = fresh();
    let root = fs.root().unwrap();

    let f = fs.create(&root, b"orig", 0o644).unwrap();
    fs.write_at(&f, 0, b"shared contents").unwrap();
    fs.link(&f, &root, b"alias").unwrap();
    assert_eq!(fs.getattr(&f).links, 2);

    let alias = fs.lookup(&root, b"alias").unwrap().expect("alias");
    assert_eq!(alias.ino, f.ino);
    let mut buf = [0_u8; 15];
    fs.read_at(&alias, 0, &mut buf).unwrap();
    assert_eq!(&buf, b"shared contents");
    fs.iput(alias).unwrap();

    // Dropping one name keeps the data reachable through the other.
    fs.unlink(&root, b"orig").unwrap();
    assert_eq!(fs.getattr(&f).links, 1);
    let alias = fs.lookup(&root, b"alias").unwrap().expect("alias survives");
    fs.iput(alias).unwrap();

    fs.iput(f).unwrap();
    fs.iput(root).unwrap();
    fs.unmount().unwrap();
}

#[test]
fn mknod_round_trips_device_numbers() {
    let (_mem, fs) = fresh();
    let root = fs.root().unwrap();

    let small = e2l_types::DeviceNumber::new(8, 1);
    let dev = fs
        .mknod(&root, b"sda1", e2l_types::S_IFBLK | 0o600, small)
        .unwrap();
    assert_eq!(fs.getattr(&dev).rdev, Some(small));
    fs.iput(dev).unwrap();

    let big = e2l_types::DeviceNumber::new(300, 70000);
    let dev = fs
        .mknod(&root, b"huge", e2l_types::S_IFCHR | 0o600, big)
        .unwrap();
    fs.iput(dev).unwrap();

    // Reload through the cache-cold path.
    let found = fs.lookup(&root, b"huge").unwrap().expect("huge");
    assert_eq!(fs.getattr(&found).rdev, Some(big));
    fs.iput(found).unwrap();

    fs.iput(root).unwrap();
    fs.unmount().unwrap();
}

#[test]
fn rename_with_noreplace_refuses_existing_target() {
    let (_mem, fs) = fresh();
    let root = fs.root().unwrap();

    let a = fs.create(&root, b"a", 0o644).unwrap();
    let b = fs.create(&root, b"b", 0o644).unwrap();
    fs.iput(a).unwrap();
    fs.iput(b).unwrap();

    assert!(matches!(
        fs.rename(&root, b"a", &root, b"b", e2l_fs::RENAME_NOREPLACE),
        Err(Ext2Error::Exists)
    ));
    // Plain rename overwrites.
    fs.rename(&root, b"a", &root, b"b", 0).unwrap();
    assert!(fs.lookup(&root, b"a").unwrap().is_none());
    let b = fs.lookup(&root, b"b").unwrap().expect("b");
    fs.iput(b).unwrap();

    // Exchange-style flags are out of scope.
    assert!(matches!(
        fs.rename(&root, b"b", &root, b"c", 2),
        Err(Ext2Error::Unsupported(_))
    ));

    fs.iput(root).unwrap();
    fs.unmount().unwrap();
}

#[test]
fn deep_paths_resolve() {
    let (_mem, fs) = fresh();
    let root = fs.root().unwrap();

    let a = fs.mkdir(&root, b"a", 0o755).unwrap();
    let b = fs.mkdir(&a, b"b", 0o755).unwrap();
    let f = fs.create(&b, b"leaf", 0o644).unwrap();
    fs.write_at(&f, 0, b"deep").unwrap();
    fs.iput(f).unwrap();
    fs.iput(b).unwrap();
    fs.iput(a).unwrap();

    let leaf = fs.resolve("/a/b/leaf").unwrap();
    let mut buf = [0_u8; 4];
    fs.read_at(&leaf, 0, &mut buf).unwrap();
    assert_eq!(&buf, b"deep");
    fs.iput(leaf).unwrap();

    assert!(matches!(
        fs.resolve("/a/missing/leaf"),
        Err(Ext2Error::NotFound(_))
    ));

    fs.iput(root).unwrap();
    fs.unmount().unwrap();
}
