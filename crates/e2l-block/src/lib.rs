#![forbid(unsafe_code)]
//! Block I/O layer for ext2-lite.
//!
//! Provides the `ByteDevice` and `BlockDevice` traits, a file-backed device,
//! an in-memory device for tests, and `BufferCache` — a write-back cache with
//! dirty tracking and per-block write-error recording.

use e2l_error::{Ext2Error, Result};
use e2l_types::{BlockNumber, BlockSize, ByteOffset};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, trace, warn};

// ── Buffers ─────────────────────────────────────────────────────────────────

/// Owned block buffer.
///
/// Invariant: length == device block size for the originating device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBuf {
    bytes: Arc<Vec<u8>>,
}

impl BlockBuf {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Arc::new(bytes),
        }
    }

    #[must_use]
    pub fn zeroed(len: usize) -> Self {
        Self::new(vec![0_u8; len])
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    #[must_use]
    pub fn clone_ref(&self) -> Self {
        Self {
            bytes: Arc::clone(&self.bytes),
        }
    }

    /// Whether two buffers share the same backing allocation.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.bytes, &other.bytes)
    }

    pub fn make_mut(&mut self) -> &mut [u8] {
        Arc::make_mut(&mut self.bytes).as_mut_slice()
    }

    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        match Arc::try_unwrap(self.bytes) {
            Ok(bytes) => bytes,
            Err(shared) => shared.as_ref().clone(),
        }
    }
}

// ── Byte-addressed devices ──────────────────────────────────────────────────

/// Byte-addressed device for fixed-offset I/O (pread/pwrite semantics).
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` to `offset`.
    fn write_all_at(&self, offset: ByteOffset, buf: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

impl<D: ByteDevice> ByteDevice for Arc<D> {
    fn len_bytes(&self) -> u64 {
        (**self).len_bytes()
    }

    fn read_exact_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<()> {
        (**self).read_exact_at(offset, buf)
    }

    fn write_all_at(&self, offset: ByteOffset, buf: &[u8]) -> Result<()> {
        (**self).write_all_at(offset, buf)
    }

    fn sync(&self) -> Result<()> {
        (**self).sync()
    }
}

impl ByteDevice for Box<dyn ByteDevice> {
    fn len_bytes(&self) -> u64 {
        (**self).len_bytes()
    }

    fn read_exact_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<()> {
        (**self).read_exact_at(offset, buf)
    }

    fn write_all_at(&self, offset: ByteOffset, buf: &[u8]) -> Result<()> {
        (**self).write_all_at(offset, buf)
    }

    fn sync(&self) -> Result<()> {
        (**self).sync()
    }
}

/// File-backed byte device using `pread`/`pwrite` style I/O.
///
/// `std::os::unix::fs::FileExt` is thread-safe and does not require a shared
/// seek position.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
    writable: bool,
}

impl FileByteDevice {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
            writable,
        })
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.writable
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<()> {
        check_range(offset, buf.len(), self.len)?;
        self.file.read_exact_at(buf, offset.0)?;
        Ok(())
    }

    fn write_all_at(&self, offset: ByteOffset, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(Ext2Error::ReadOnly);
        }
        check_range(offset, buf.len(), self.len)?;
        self.file.write_all_at(buf, offset.0)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// In-memory byte device, used by tests and the image-building harness.
#[derive(Debug)]
pub struct MemoryByteDevice {
    bytes: Mutex<Vec<u8>>,
}

impl MemoryByteDevice {
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            bytes: Mutex::new(vec![0_u8; len]),
        }
    }

    #[must_use]
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Mutex::new(bytes),
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }
}

impl ByteDevice for MemoryByteDevice {
    fn len_bytes(&self) -> u64 {
        self.bytes.lock().len() as u64
    }

    fn read_exact_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<()> {
        let bytes = self.bytes.lock();
        check_range(offset, buf.len(), bytes.len() as u64)?;
        let start = usize::try_from(offset.0)
            .map_err(|_| Ext2Error::Format("offset overflows usize".to_owned()))?;
        buf.copy_from_slice(&bytes[start..start + buf.len()]);
        Ok(())
    }

    fn write_all_at(&self, offset: ByteOffset, buf: &[u8]) -> Result<()> {
        let mut bytes = self.bytes.lock();
        check_range(offset, buf.len(), bytes.len() as u64)?;
        let start = usize::try_from(offset.0)
            .map_err(|_| Ext2Error::Format("offset overflows usize".to_owned()))?;
        bytes[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

fn check_range(offset: ByteOffset, len: usize, device_len: u64) -> Result<()> {
    let end = offset
        .0
        .checked_add(len as u64)
        .ok_or_else(|| Ext2Error::Format("I/O range overflows u64".to_owned()))?;
    if end > device_len {
        return Err(Ext2Error::Format(format!(
            "I/O out of bounds: offset={offset} len={len} device_len={device_len}"
        )));
    }
    Ok(())
}

// ── Block-addressed devices ─────────────────────────────────────────────────

/// Block-addressed I/O interface.
pub trait BlockDevice: Send + Sync {
    /// Read a block by number.
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf>;

    /// Write a block by number. `data.len()` MUST equal `block_size()`.
    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()>;

    /// Device block size in bytes.
    fn block_size(&self) -> u32;

    /// Total number of blocks.
    fn block_count(&self) -> u64;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

/// Adapter exposing a `ByteDevice` at a fixed block size.
#[derive(Debug)]
pub struct ByteBlockDevice<D: ByteDevice> {
    inner: D,
    block_size: BlockSize,
}

impl<D: ByteDevice> ByteBlockDevice<D> {
    pub fn new(inner: D, block_size: u32) -> Result<Self> {
        let block_size = BlockSize::new(block_size)?;
        Ok(Self { inner, block_size })
    }

    #[must_use]
    pub fn inner(&self) -> &D {
        &self.inner
    }
}

impl<D: ByteDevice> BlockDevice for ByteBlockDevice<D> {
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        let mut buf = vec![0_u8; self.block_size.as_usize()];
        self.inner
            .read_exact_at(self.block_size.block_to_byte(block), &mut buf)?;
        Ok(BlockBuf::new(buf))
    }

    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
        if data.len() != self.block_size.as_usize() {
            return Err(Ext2Error::Format(format!(
                "short block write: got {} bytes, block size is {}",
                data.len(),
                self.block_size
            )));
        }
        self.inner
            .write_all_at(self.block_size.block_to_byte(block), data)
    }

    fn block_size(&self) -> u32 {
        self.block_size.get()
    }

    fn block_count(&self) -> u64 {
        self.inner.len_bytes() >> self.block_size.shift()
    }

    fn sync(&self) -> Result<()> {
        self.inner.sync()
    }
}

// ── Write-back buffer cache ─────────────────────────────────────────────────

#[derive(Debug, Default)]
struct CacheState {
    blocks: HashMap<u32, BlockBuf>,
    dirty: BTreeSet<u32>,
    /// Blocks whose last flush attempt failed; kept dirty.
    write_errors: HashSet<u32>,
}

/// Write-back cache over a `BlockDevice`.
///
/// Reads fill the cache; writes land in the cache and are marked dirty until
/// `flush_dirty` (or `sync`) pushes them to the underlying device. A failed
/// flush records the block in a write-error set that callers can consume to
/// drive retry policies.
pub struct BufferCache<D: BlockDevice> {
    inner: D,
    state: Mutex<CacheState>,
}

impl<D: BlockDevice> BufferCache<D> {
    pub fn new(inner: D) -> Self {
        Self {
            inner,
            state: Mutex::new(CacheState::default()),
        }
    }

    #[must_use]
    pub fn inner(&self) -> &D {
        &self.inner
    }

    /// Number of blocks awaiting write-back.
    #[must_use]
    pub fn dirty_count(&self) -> usize {
        self.state.lock().dirty.len()
    }

    /// Consume the recorded write error for `block`, if any.
    ///
    /// Returns true when the previous flush of this block failed. The flag is
    /// cleared, so the next flush attempt proceeds normally.
    pub fn take_write_error(&self, block: BlockNumber) -> bool {
        self.state.lock().write_errors.remove(&block.0)
    }

    /// Write one block through to the device immediately (and drop its dirty
    /// mark). Used by sync-required metadata paths.
    pub fn flush_block(&self, block: BlockNumber) -> Result<()> {
        let data = {
            let state = self.state.lock();
            match state.blocks.get(&block.0) {
                Some(buf) => buf.clone_ref(),
                None => return Ok(()),
            }
        };
        match self.inner.write_block(block, data.as_slice()) {
            Ok(()) => {
                let mut state = self.state.lock();
                // A racing write may have replaced the buffer since we read
                // it; the newer contents keep their dirty mark.
                let unchanged = state
                    .blocks
                    .get(&block.0)
                    .is_some_and(|current| current.ptr_eq(&data));
                if unchanged {
                    state.dirty.remove(&block.0);
                }
                state.write_errors.remove(&block.0);
                Ok(())
            }
            Err(err) => {
                warn!(target: "e2l::block", block = block.0, %err, "block flush failed");
                self.state.lock().write_errors.insert(block.0);
                Err(err)
            }
        }
    }

    /// Push every dirty block to the device in ascending block order.
    ///
    /// Blocks that fail to write stay dirty and are recorded in the
    /// write-error set; the first failure is returned after the sweep.
    pub fn flush_dirty(&self) -> Result<()> {
        let dirty: Vec<u32> = self.state.lock().dirty.iter().copied().collect();
        if !dirty.is_empty() {
            debug!(target: "e2l::block", count = dirty.len(), "flushing dirty blocks");
        }
        let mut first_err = None;
        for bno in dirty {
            if let Err(err) = self.flush_block(BlockNumber(bno)) {
                if first_err.is_none() {
                    first_err = Some(err);
                }
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl<D: BlockDevice> BlockDevice for BufferCache<D> {
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        if let Some(buf) = self.state.lock().blocks.get(&block.0) {
            trace!(target: "e2l::block", block = block.0, "cache hit");
            return Ok(buf.clone_ref());
        }
        let buf = self.inner.read_block(block)?;
        trace!(target: "e2l::block", block = block.0, "cache fill");
        self.state
            .lock()
            .blocks
            .entry(block.0)
            .or_insert_with(|| buf.clone_ref());
        Ok(buf)
    }

    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
        if data.len() != self.inner.block_size() as usize {
            return Err(Ext2Error::Format(format!(
                "short block write: got {} bytes, block size is {}",
                data.len(),
                self.inner.block_size()
            )));
        }
        let mut state = self.state.lock();
        state.blocks.insert(block.0, BlockBuf::new(data.to_vec()));
        state.dirty.insert(block.0);
        Ok(())
    }

    fn block_size(&self) -> u32 {
        self.inner.block_size()
    }

    fn block_count(&self) -> u64 {
        self.inner.block_count()
    }

    fn sync(&self) -> Result<()> {
        self.flush_dirty()?;
        self.inner.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn mem_block_device(blocks: u32, block_size: u32) -> ByteBlockDevice<MemoryByteDevice> {
        let dev = MemoryByteDevice::new((blocks * block_size) as usize);
        ByteBlockDevice::new(dev, block_size).unwrap()
    }

    #[test]
    fn memory_device_round_trip() {
        let dev = MemoryByteDevice::new(4096);
        dev.write_all_at(ByteOffset(100), b"hello").unwrap();
        let mut buf = [0_u8; 5];
        dev.read_exact_at(ByteOffset(100), &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn memory_device_rejects_out_of_bounds() {
        let dev = MemoryByteDevice::new(16);
        let mut buf = [0_u8; 8];
        assert!(dev.read_exact_at(ByteOffset(12), &mut buf).is_err());
        assert!(dev.write_all_at(ByteOffset(12), &buf).is_err());
    }

    #[test]
    fn byte_block_device_geometry() {
        let dev = mem_block_device(8, 1024);
        assert_eq!(dev.block_size(), 1024);
        assert_eq!(dev.block_count(), 8);
    }

    #[test]
    fn byte_block_device_rejects_short_write() {
        let dev = mem_block_device(8, 1024);
        assert!(dev.write_block(BlockNumber(0), &[0_u8; 100]).is_err());
    }

    #[test]
    fn file_device_round_trip() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&vec![0_u8; 8192]).unwrap();
        tmp.flush().unwrap();

        let dev = FileByteDevice::open(tmp.path()).unwrap();
        assert!(dev.is_writable());
        assert_eq!(dev.len_bytes(), 8192);
        dev.write_all_at(ByteOffset(1024), b"ext2").unwrap();
        let mut buf = [0_u8; 4];
        dev.read_exact_at(ByteOffset(1024), &mut buf).unwrap();
        assert_eq!(&buf, b"ext2");
    }

    #[test]
    fn cache_write_back_is_deferred() {
        let dev = mem_block_device(8, 1024);
        let cache = BufferCache::new(dev);

        let data = vec![0xAB_u8; 1024];
        cache.write_block(BlockNumber(3), &data).unwrap();
        assert_eq!(cache.dirty_count(), 1);

        // The underlying device still sees zeros.
        let raw = cache.inner().read_block(BlockNumber(3)).unwrap();
        assert!(raw.as_slice().iter().all(|b| *b == 0));

        // But cached reads observe the write.
        let cached = cache.read_block(BlockNumber(3)).unwrap();
        assert!(cached.as_slice().iter().all(|b| *b == 0xAB));

        cache.flush_dirty().unwrap();
        assert_eq!(cache.dirty_count(), 0);
        let raw = cache.inner().read_block(BlockNumber(3)).unwrap();
        assert!(raw.as_slice().iter().all(|b| *b == 0xAB));
    }

    #[test]
    fn cache_read_fills_and_hits() {
        let dev = mem_block_device(8, 1024);
        dev.write_block(BlockNumber(1), &vec![7_u8; 1024]).unwrap();
        let cache = BufferCache::new(dev);

        let first = cache.read_block(BlockNumber(1)).unwrap();
        let second = cache.read_block(BlockNumber(1)).unwrap();
        assert_eq!(first.as_slice(), second.as_slice());
    }

    /// Block device that fails writes while `failing` is set.
    struct FlakyDevice {
        inner: ByteBlockDevice<MemoryByteDevice>,
        failing: AtomicBool,
    }

    impl BlockDevice for FlakyDevice {
        fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
            self.inner.read_block(block)
        }

        fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(Ext2Error::Io(std::io::Error::other("injected")));
            }
            self.inner.write_block(block, data)
        }

        fn block_size(&self) -> u32 {
            self.inner.block_size()
        }

        fn block_count(&self) -> u64 {
            self.inner.block_count()
        }

        fn sync(&self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn failed_flush_records_write_error_and_retry_succeeds() {
        let flaky = FlakyDevice {
            inner: mem_block_device(8, 1024),
            failing: AtomicBool::new(true),
        };
        let cache = BufferCache::new(flaky);

        cache.write_block(BlockNumber(1), &vec![1_u8; 1024]).unwrap();
        assert!(cache.flush_dirty().is_err());
        // Block stays dirty, error is recorded once.
        assert_eq!(cache.dirty_count(), 1);
        assert!(cache.take_write_error(BlockNumber(1)));
        assert!(!cache.take_write_error(BlockNumber(1)));

        cache.inner().failing.store(false, Ordering::SeqCst);
        cache.flush_dirty().unwrap();
        assert_eq!(cache.dirty_count(), 0);
    }
}
