#![forbid(unsafe_code)]
//! Directory operations.
//!
//! Directory content is a sequence of chunks, each one filesystem block.
//! Every entry lies fully within one chunk; the last entry of a chunk
//! absorbs its trailing free space. All mutations follow the same protocol:
//! read the chunk, edit the record bytes, commit (write the chunk back and
//! advance the directory's iversion so concurrent readers revalidate).

use e2l_alloc::FsCtx;
use e2l_error::{Ext2Error, Result};
use e2l_inode::{get_blocks, Inode};
use e2l_ondisk::{
    dir_rec_len, write_dir_entry, write_dir_entry_inode, write_dir_entry_rec_len, DirEntry,
};
use e2l_types::{BlockNumber, InodeNumber, NAME_LEN};
use tracing::{debug, trace};

/// Where an entry lives inside a directory file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryLocation {
    pub chunk: u32,
    pub offset: usize,
}

/// Resume token for `readdir`. `pos` is a byte offset into the directory
/// file; `version` is the directory iversion it was valid against.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirCursor {
    pub pos: u64,
    pub version: u64,
}

fn chunk_size(ctx: &FsCtx<'_>) -> usize {
    ctx.geo.block_size.as_usize()
}

fn n_chunks(ctx: &FsCtx<'_>, dir: &Inode) -> u32 {
    dir.size.div_ceil(ctx.geo.block_size.get())
}

fn not_a_directory() -> Ext2Error {
    Ext2Error::NotDirectory
}

fn chunk_block(ctx: &FsCtx<'_>, dir: &mut Inode, n: u32, create: bool) -> Result<BlockNumber> {
    match get_blocks(ctx, dir, n, create)? {
        Some(mapped) => Ok(mapped.block),
        None => {
            ctx.sink.fs_error(
                "get_chunk",
                &format!("directory {} has no block for chunk {n}", dir.ino),
            );
            Err(Ext2Error::Corruption {
                block: 0,
                detail: format!("directory {} chunk {n} unmapped", dir.ino),
            })
        }
    }
}

// ── Chunk validation ────────────────────────────────────────────────────────

/// Walk a chunk's records, enforcing the layout constraints:
/// minimum and 4-aligned `rec_len`, `rec_len` covering the name, no record
/// crossing the chunk boundary, inode numbers within range, and the walk
/// landing exactly on the chunk end.
fn check_chunk(ctx: &FsCtx<'_>, dir: &Inode, n: u32, chunk: &[u8]) -> Result<()> {
    let limit = chunk.len();
    let min_len = usize::from(dir_rec_len(1));
    let max_inumber = ctx.geo.inodes_count;

    let mut offs = 0_usize;
    let mut error = None;
    while offs + min_len <= limit {
        let Ok(de) = DirEntry::parse_at(chunk, offs) else {
            ctx.sink.fs_error(
                "check_chunk",
                &format!("unreadable entry in directory #{} at offset {offs}", dir.ino),
            );
            return Err(Ext2Error::Corruption {
                block: 0,
                detail: format!("unreadable entry in directory {}", dir.ino),
            });
        };
        let rec_len = usize::from(de.rec_len);

        if rec_len < min_len {
            error = Some("rec_len is smaller than minimal");
        } else if rec_len & 3 != 0 {
            error = Some("unaligned directory entry");
        } else if rec_len < usize::from(dir_rec_len(usize::from(de.name_len))) {
            error = Some("rec_len is too small for name_len");
        } else if offs + rec_len > limit {
            error = Some("directory entry across blocks");
        } else if de.inode > max_inumber {
            error = Some("inode out of bounds");
        }
        if let Some(reason) = error {
            ctx.sink.fs_error(
                "check_chunk",
                &format!(
                    "bad entry in directory #{}: {reason} - offset={}, inode={}, rec_len={}, name_len={}",
                    dir.ino,
                    u64::from(n) * chunk.len() as u64 + offs as u64,
                    de.inode,
                    de.rec_len,
                    de.name_len
                ),
            );
            return Err(Ext2Error::Corruption {
                block: 0,
                detail: format!("bad entry in directory {}: {reason}", dir.ino),
            });
        }
        offs += rec_len;
    }
    if offs != limit {
        ctx.sink.fs_error(
            "check_chunk",
            &format!(
                "entry in directory #{} spans the chunk boundary - offset={}",
                dir.ino,
                u64::from(n) * chunk.len() as u64 + offs as u64,
            ),
        );
        return Err(Ext2Error::Corruption {
            block: 0,
            detail: format!("directory {} chunk {n} does not end on the boundary", dir.ino),
        });
    }
    Ok(())
}

/// Read chunk `n`, running the structure check the first time it is seen.
fn get_chunk(ctx: &FsCtx<'_>, dir: &mut Inode, n: u32) -> Result<Vec<u8>> {
    let block = chunk_block(ctx, dir, n, false)?;
    let bytes = ctx.dev.read_block(block)?.into_inner();
    if dir.checked_chunks & (1 << n) == 0 {
        check_chunk(ctx, dir, n, &bytes)?;
        dir.checked_chunks |= 1 << n;
    }
    Ok(bytes)
}

/// Write chunk `n` back and publish the mutation.
///
/// `pos`/`len` describe the edited byte range within the directory file;
/// growth past i_size extends the directory.
fn commit_chunk(
    ctx: &FsCtx<'_>,
    dir: &mut Inode,
    n: u32,
    bytes: &[u8],
    pos: u64,
    len: usize,
) -> Result<()> {
    let block = chunk_block(ctx, dir, n, true)?;
    ctx.dev.write_block(block, bytes)?;
    dir.bump_version();
    let end = pos + len as u64;
    if end > u64::from(dir.size) {
        dir.size = end as u32;
    }
    dir.dirty = true;
    trace!(target: "e2l::dir", dir = dir.ino.0, chunk = n, "chunk committed");
    Ok(())
}

// ── Lookup ──────────────────────────────────────────────────────────────────

fn match_entry(name: &[u8], de: &DirEntry<'_>) -> bool {
    de.inode != 0 && usize::from(de.name_len) == name.len() && de.name == name
}

/// Find `name` in `dir`. Returns the entry's location and inode number.
pub fn find_entry(
    ctx: &FsCtx<'_>,
    dir: &mut Inode,
    name: &[u8],
) -> Result<Option<(EntryLocation, InodeNumber)>> {
    if !dir.is_dir() {
        return Err(not_a_directory());
    }
    let npages = n_chunks(ctx, dir);
    if npages == 0 {
        return Ok(None);
    }
    let min_len = usize::from(dir_rec_len(1));

    for n in 0..npages {
        let chunk = get_chunk(ctx, dir, n)?;
        let limit = chunk.len() - min_len;
        let mut offs = 0_usize;
        while offs <= limit {
            let de = DirEntry::parse_at(&chunk, offs)?;
            if de.rec_len == 0 {
                ctx.sink
                    .fs_error("find_entry", "zero-length directory entry");
                return Err(Ext2Error::Corruption {
                    block: 0,
                    detail: format!("zero-length entry in directory {}", dir.ino),
                });
            }
            if match_entry(name, &de) {
                return Ok(Some((
                    EntryLocation { chunk: n, offset: offs },
                    InodeNumber(de.inode),
                )));
            }
            offs += usize::from(de.rec_len);
        }
    }
    Ok(None)
}

/// Convenience over `find_entry`: just the inode number.
pub fn inode_by_name(ctx: &FsCtx<'_>, dir: &mut Inode, name: &[u8]) -> Result<Option<InodeNumber>> {
    Ok(find_entry(ctx, dir, name)?.map(|(_, ino)| ino))
}

/// The `..` entry: second record of the first chunk.
pub fn dotdot(ctx: &FsCtx<'_>, dir: &mut Inode) -> Result<(EntryLocation, InodeNumber)> {
    let chunk = get_chunk(ctx, dir, 0)?;
    let dot = DirEntry::parse_at(&chunk, 0)?;
    let offset = usize::from(dot.rec_len);
    let de = DirEntry::parse_at(&chunk, offset)?;
    Ok((EntryLocation { chunk: 0, offset }, InodeNumber(de.inode)))
}

// ── readdir ─────────────────────────────────────────────────────────────────

/// Re-align a resume offset to the start of a valid record in its chunk by
/// summing `rec_len` from the chunk start.
fn validate_entry(chunk: &[u8], target: usize) -> Result<usize> {
    let mut offs = 0_usize;
    while offs < target {
        let de = DirEntry::parse_at(chunk, offs)?;
        if de.rec_len == 0 {
            break;
        }
        offs += usize::from(de.rec_len);
    }
    Ok(offs)
}

/// Iterate entries from the cursor, emitting `(name, inode)` for every live
/// record. `emit` returning false pauses the walk; the cursor then resumes
/// at that entry. Concurrent mutations are tolerated through the iversion
/// token: a stale cursor is re-aligned inside its chunk before use.
pub fn readdir(
    ctx: &FsCtx<'_>,
    dir: &mut Inode,
    cursor: &mut DirCursor,
    emit: &mut dyn FnMut(&[u8], InodeNumber) -> bool,
) -> Result<()> {
    if !dir.is_dir() {
        return Err(not_a_directory());
    }
    let cs = chunk_size(ctx);
    let min_len = usize::from(dir_rec_len(1));
    if cursor.pos + min_len as u64 > u64::from(dir.size) {
        return Ok(());
    }

    let mut need_revalidate = cursor.version != dir.version;
    let npages = n_chunks(ctx, dir);
    let mut n = (cursor.pos / cs as u64) as u32;
    let mut offset = (cursor.pos % cs as u64) as usize;

    while n < npages {
        let chunk = get_chunk(ctx, dir, n)?;
        if need_revalidate {
            if offset != 0 {
                offset = validate_entry(&chunk, offset)?;
                cursor.pos = u64::from(n) * cs as u64 + offset as u64;
            }
            cursor.version = dir.version;
            need_revalidate = false;
        }

        let limit = cs - min_len;
        let mut offs = offset;
        while offs <= limit {
            let de = DirEntry::parse_at(&chunk, offs)?;
            if de.rec_len == 0 {
                ctx.sink.fs_error("readdir", "zero-length directory entry");
                return Err(Ext2Error::Corruption {
                    block: 0,
                    detail: format!("zero-length entry in directory {}", dir.ino),
                });
            }
            if de.inode != 0 && !emit(de.name, InodeNumber(de.inode)) {
                return Ok(());
            }
            cursor.pos += u64::from(de.rec_len);
            offs += usize::from(de.rec_len);
        }

        n += 1;
        offset = 0;
        cursor.pos = u64::from(n) * cs as u64;
    }
    Ok(())
}

// ── Mutation ────────────────────────────────────────────────────────────────

/// Insert `name -> ino` into `dir`.
///
/// Walks every chunk looking for a tombstone of sufficient size or an entry
/// with enough trailing slack to split; collisions are detected during the
/// same scan. Reaching i_size extends the directory by one whole chunk whose
/// synthetic entry then takes the insert.
pub fn add_link(
    ctx: &FsCtx<'_>,
    dir: &mut Inode,
    name: &[u8],
    ino: InodeNumber,
    now: u32,
) -> Result<()> {
    if !dir.is_dir() {
        return Err(not_a_directory());
    }
    if name.is_empty() {
        return Err(Ext2Error::InvalidInput("empty name"));
    }
    if name.len() > NAME_LEN {
        return Err(Ext2Error::NameTooLong);
    }

    let cs = chunk_size(ctx);
    let reclen = usize::from(dir_rec_len(name.len()));
    let npages = n_chunks(ctx, dir);

    for n in 0..=npages {
        // Reaching i_size: extend by one chunk holding a single synthetic
        // free entry spanning it, then fall into the insert path below.
        let (mut chunk, found) = if n == npages {
            let mut chunk = vec![0_u8; cs];
            write_dir_entry_rec_len(&mut chunk, 0, cs as u16);
            // inode stays 0: the whole chunk is one tombstone.
            (chunk, Some((0_usize, cs, 0_usize)))
        } else {
            let chunk = get_chunk(ctx, dir, n)?;
            let mut found = None;
            let mut offs = 0_usize;
            while offs + reclen <= cs {
                let de = DirEntry::parse_at(&chunk, offs)?;
                if de.rec_len == 0 {
                    ctx.sink
                        .fs_error("add_link", "zero-length directory entry");
                    return Err(Ext2Error::Corruption {
                        block: 0,
                        detail: format!("zero-length entry in directory {}", dir.ino),
                    });
                }
                if match_entry(name, &de) {
                    return Err(Ext2Error::Exists);
                }
                let name_used = usize::from(dir_rec_len(usize::from(de.name_len)));
                let rec_len = usize::from(de.rec_len);
                if de.inode == 0 && rec_len >= reclen {
                    found = Some((offs, rec_len, 0));
                    break;
                }
                if rec_len >= name_used + reclen {
                    found = Some((offs, rec_len, name_used));
                    break;
                }
                offs += rec_len;
            }
            (chunk, found)
        };

        let Some((offs, slot_len, used)) = found else {
            continue;
        };

        // Split a live entry: it shrinks to its exact record length and the
        // remainder becomes the new entry.
        let (entry_offs, entry_len) = if used > 0 {
            write_dir_entry_rec_len(&mut chunk, offs, used as u16);
            (offs + used, slot_len - used)
        } else {
            (offs, slot_len)
        };
        write_dir_entry(&mut chunk, entry_offs, ino, entry_len as u16, name);

        let pos = u64::from(n) * cs as u64 + offs as u64;
        commit_chunk(ctx, dir, n, &chunk, pos, slot_len)?;
        dir.touch_mtime_ctime(now);
        debug!(
            target: "e2l::dir",
            dir = dir.ino.0,
            ino = ino.0,
            chunk = n,
            offset = entry_offs,
            "link added"
        );
        return Ok(());
    }

    // Every chunk (plus the extension chunk) refused the insert; with whole-
    // chunk extension that cannot happen on an intact directory.
    ctx.sink.fs_error("add_link", "directory walk found no slot");
    Err(Ext2Error::Corruption {
        block: 0,
        detail: format!("no slot for new entry in directory {}", dir.ino),
    })
}

/// Delete the entry at `loc` by folding its bytes into the previous entry in
/// the same chunk (the first entry is tombstoned instead).
pub fn delete_entry(ctx: &FsCtx<'_>, dir: &mut Inode, loc: EntryLocation, now: u32) -> Result<()> {
    let mut chunk = get_chunk(ctx, dir, loc.chunk)?;
    let victim = DirEntry::parse_at(&chunk, loc.offset)?;
    let to = loc.offset + usize::from(victim.rec_len);

    let mut prev: Option<usize> = None;
    let mut offs = 0_usize;
    while offs < loc.offset {
        let de = DirEntry::parse_at(&chunk, offs)?;
        if de.rec_len == 0 {
            ctx.sink
                .fs_error("delete_entry", "zero-length directory entry");
            return Err(Ext2Error::Corruption {
                block: 0,
                detail: format!("zero-length entry in directory {}", dir.ino),
            });
        }
        prev = Some(offs);
        offs += usize::from(de.rec_len);
    }

    let from = match prev {
        Some(p) => {
            write_dir_entry_rec_len(&mut chunk, p, (to - p) as u16);
            p
        }
        None => loc.offset,
    };
    write_dir_entry_inode(&mut chunk, loc.offset, 0);

    let pos = u64::from(loc.chunk) * chunk.len() as u64 + from as u64;
    commit_chunk(ctx, dir, loc.chunk, &chunk, pos, to - from)?;
    dir.touch_mtime_ctime(now);
    debug!(target: "e2l::dir", dir = dir.ino.0, chunk = loc.chunk, offset = loc.offset, "entry deleted");
    Ok(())
}

/// Repoint the entry at `loc` to `ino`.
pub fn set_link(
    ctx: &FsCtx<'_>,
    dir: &mut Inode,
    loc: EntryLocation,
    ino: InodeNumber,
    update_times: bool,
    now: u32,
) -> Result<()> {
    let mut chunk = get_chunk(ctx, dir, loc.chunk)?;
    let de = DirEntry::parse_at(&chunk, loc.offset)?;
    let len = usize::from(de.rec_len);
    write_dir_entry_inode(&mut chunk, loc.offset, ino.0);

    let pos = u64::from(loc.chunk) * chunk.len() as u64 + loc.offset as u64;
    commit_chunk(ctx, dir, loc.chunk, &chunk, pos, len)?;
    if update_times {
        dir.touch_mtime_ctime(now);
    }
    dir.dirty = true;
    Ok(())
}

/// Lay out the first chunk of a new directory: `.` then `..`, the latter
/// absorbing the rest of the chunk.
pub fn make_empty(ctx: &FsCtx<'_>, dir: &mut Inode, parent: InodeNumber) -> Result<()> {
    let cs = chunk_size(ctx);
    let mut chunk = vec![0_u8; cs];

    let dot_len = dir_rec_len(1);
    write_dir_entry(&mut chunk, 0, dir.ino, dot_len, b".");
    write_dir_entry(
        &mut chunk,
        usize::from(dot_len),
        parent,
        cs as u16 - dot_len,
        b"..",
    );

    commit_chunk(ctx, dir, 0, &chunk, 0, cs)?;
    dir.checked_chunks |= 1;
    Ok(())
}

/// Whether the directory holds nothing but `.` (pointing to itself) and
/// `..`. Structural damage counts as non-empty, erring on the safe side for
/// rmdir.
pub fn empty_dir(ctx: &FsCtx<'_>, dir: &mut Inode) -> Result<bool> {
    let min_len = usize::from(dir_rec_len(1));
    for n in 0..n_chunks(ctx, dir) {
        let chunk = get_chunk(ctx, dir, n)?;
        let limit = chunk.len() - min_len;
        let mut offs = 0_usize;
        while offs <= limit {
            let de = DirEntry::parse_at(&chunk, offs)?;
            if de.rec_len == 0 {
                ctx.sink
                    .fs_error("empty_dir", "zero-length directory entry");
                return Ok(false);
            }
            if de.inode != 0 {
                if de.name.first() != Some(&b'.') {
                    return Ok(false);
                }
                if de.name_len > 2 {
                    return Ok(false);
                }
                if de.name_len < 2 {
                    if de.inode != dir.ino.0 {
                        return Ok(false);
                    }
                } else if de.name[1] != b'.' {
                    return Ok(false);
                }
            }
            offs += usize::from(de.rec_len);
        }
    }
    Ok(true)
}
