//! A physical disk and a very simple device controller for it.
//!
//! The device is represented by a memory-mapped host file. Block 0
//! additionally carries a small persistent header (see
//! [`PersistentHeader`]) that this module owns, and that higher layers
//! append their own roots after (see
//! [`Device::block_reads_m`]/[`Device::block_writes_m`]).
//!
//! No provisions are made to lock the backing file against concurrent
//! access; do not open the same image from two processes at once.

use crate::error::{ApiError, Result};
use crate::types::{BlockId, PersistentHeader, MASTER_COOKIE, PERSISTENT_HEADER_SIZE};
use memmap::MmapMut;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

/// Block id reserved for the master block; never allocated, never freed.
pub const MASTER_BLOCK: BlockId = 0;

/// A fixed-capacity array of `blocks_total` blocks of `block_size` bytes,
/// backed by a memory-mapped host file.
#[derive(Debug)]
pub struct Device {
    header: PersistentHeader,
    path: PathBuf,
    mmap: MmapMut,
}

impl Drop for Device {
    /// Persist pending mmap writes before the file handle goes away. A
    /// caller is still expected to call [`Device::close`] to also flush
    /// the in-memory header back into block 0.
    fn drop(&mut self) {
        let _ = self.mmap.flush();
    }
}

impl Device {
    /// Create a brand-new device image at `path`, sized
    /// `block_size * blocks_total` bytes, with an empty freelist and the
    /// bump pointer at block 1 (block 0 is the master block and is never
    /// handed out by [`Device::block_alloc`]).
    ///
    /// Fails if `path` already has a file on it, or if `block_size` is too
    /// small to hold the persistent header.
    pub fn create<P: AsRef<Path>>(path: P, block_size: u64, blocks_total: u64) -> Result<Device> {
        if block_size < *PERSISTENT_HEADER_SIZE {
            return Err(ApiError::Bounds(
                "block_size too small to hold the persistent header",
            ));
        }
        let path = path.as_ref().to_path_buf();
        if path.exists() {
            return Err(ApiError::AlreadyExists(path));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        file.set_len(block_size * blocks_total)?;
        let mmap = unsafe { memmap::MmapOptions::new().map_mut(&file)? };

        let header = PersistentHeader {
            cookie: MASTER_COOKIE,
            first_unused_block: 0,
            last_block: 1,
            block_size,
            blocks_total,
        };
        let mut device = Device { header, path, mmap };
        device.save()?;
        log::debug!(
            "created device {:?}: block_size={} blocks_total={}",
            device.path,
            block_size,
            blocks_total
        );
        Ok(device)
    }

    /// Open an existing device image at `path`, restoring its block size,
    /// capacity, and master fields from the header stored in its block 0.
    ///
    /// Fails if `path` does not exist, the header read is short, the
    /// cookie does not match, or the file's length disagrees with the
    /// restored `block_size * blocks_total`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Device> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            return Err(ApiError::NotFound(path));
        }

        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let mmap = unsafe { memmap::MmapOptions::new().map_mut(&file)? };

        let header: PersistentHeader = bincode::deserialize(&mmap[0..*PERSISTENT_HEADER_SIZE as usize])?;
        if header.cookie != MASTER_COOKIE {
            return Err(ApiError::Bounds("device image has an invalid cookie"));
        }
        let expected_len = header.block_size * header.blocks_total;
        if mmap.len() as u64 != expected_len {
            return Err(ApiError::Bounds(
                "device image length does not match its persisted size",
            ));
        }

        log::debug!(
            "opened device {:?}: block_size={} blocks_total={}",
            path,
            header.block_size,
            header.blocks_total
        );
        Ok(Device { header, path, mmap })
    }

    /// Write the in-memory header back into block 0.
    pub fn save(&mut self) -> Result<()> {
        let bytes = bincode::serialize(&self.header)?;
        self.block_writes_m(MASTER_BLOCK, 0, &bytes)
    }

    /// Save, then drop this device (flushing the mmap).
    pub fn close(mut self) -> Result<()> {
        self.save()
    }

    /// Size of each block, in bytes.
    pub fn block_size(&self) -> u64 {
        self.header.block_size
    }

    /// Total number of blocks in the device.
    pub fn blocks_total(&self) -> u64 {
        self.header.blocks_total
    }

    /// Path of the host file backing this device.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn addr(&self, pid: BlockId, offset: u64) -> u64 {
        pid as u64 * self.header.block_size + offset
    }

    fn check_addressable(&self, pid: BlockId) -> Result<()> {
        if pid <= 0 || pid as u64 >= self.header.blocks_total {
            return Err(ApiError::Bounds("block id out of range"));
        }
        Ok(())
    }

    /// Read exactly one full block (`block_size` bytes) from `pid` into
    /// `buf`. Requires `0 < pid < blocks_total` and `buf.len() == block_size`.
    pub fn block_read(&self, pid: BlockId, buf: &mut [u8]) -> Result<()> {
        self.check_addressable(pid)?;
        if buf.len() as u64 != self.header.block_size {
            return Err(ApiError::Bounds("buffer is not exactly block-sized"));
        }
        self.block_reads_m(pid, 0, buf)
    }

    /// Write exactly one full block (`block_size` bytes) to `pid` from
    /// `buf`. Requires `0 < pid < blocks_total` and `buf.len() == block_size`.
    pub fn block_write(&mut self, pid: BlockId, buf: &[u8]) -> Result<()> {
        self.check_addressable(pid)?;
        if buf.len() as u64 != self.header.block_size {
            return Err(ApiError::Bounds("buffer is not exactly block-sized"));
        }
        self.block_writes_m(pid, 0, buf)
    }

    /// Read `buf.len()` bytes from `pid` starting at `offset`. Requires
    /// `pid != 0` and `offset + buf.len() <= block_size`. A zero-length
    /// call is a successful no-op.
    pub fn block_reads(&self, pid: BlockId, offset: u64, buf: &mut [u8]) -> Result<()> {
        if pid == 0 {
            return Err(ApiError::Bounds("block 0 is reserved for the master block"));
        }
        if offset + buf.len() as u64 > self.header.block_size {
            return Err(ApiError::Bounds("read past the end of the block"));
        }
        self.block_reads_m(pid, offset, buf)
    }

    /// Write `buf.len()` bytes to `pid` starting at `offset`. Requires
    /// `pid != 0` and `offset + buf.len() <= block_size`. A zero-length
    /// call is a successful no-op.
    pub fn block_writes(&mut self, pid: BlockId, offset: u64, buf: &[u8]) -> Result<()> {
        if pid == 0 {
            return Err(ApiError::Bounds("block 0 is reserved for the master block"));
        }
        if offset + buf.len() as u64 > self.header.block_size {
            return Err(ApiError::Bounds("write past the end of the block"));
        }
        self.block_writes_m(pid, offset, buf)
    }

    /// Like [`Device::block_reads`], but with no range checks at all -
    /// including on `pid == 0`. Used to persist higher layers' roots into
    /// the master block; not meant to be reached from outside the storage
    /// stack.
    pub fn block_reads_m(&self, pid: BlockId, offset: u64, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let start = self.addr(pid, offset) as usize;
        let end = start + buf.len();
        if end > self.mmap.len() {
            return Err(ApiError::Bounds("read past the end of the device"));
        }
        buf.copy_from_slice(&self.mmap[start..end]);
        Ok(())
    }

    /// Like [`Device::block_writes`], but with no range checks at all -
    /// including on `pid == 0`. See [`Device::block_reads_m`].
    pub fn block_writes_m(&mut self, pid: BlockId, offset: u64, buf: &[u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let start = self.addr(pid, offset) as usize;
        let end = start + buf.len();
        if end > self.mmap.len() {
            return Err(ApiError::Bounds("write past the end of the device"));
        }
        self.mmap[start..end].copy_from_slice(buf);
        Ok(())
    }

    /// Allocate a fresh block id, preferring the freelist over the bump
    /// pointer. Returns `0` if the device is full.
    pub fn block_alloc(&mut self) -> Result<BlockId> {
        let head = self.header.first_unused_block;
        if head != 0 {
            let mut next_bytes = [0u8; 8];
            self.block_reads_m(head, 0, &mut next_bytes)?;
            self.header.first_unused_block = i64::from_ne_bytes(next_bytes);
            log::trace!("block_alloc: popped {} from freelist", head);
            Ok(head)
        } else {
            let block = self.header.last_block;
            if block as u64 >= self.header.blocks_total {
                log::warn!("block_alloc: device is full (last_block={})", block);
                return Ok(0);
            }
            self.header.last_block += 1;
            log::trace!("block_alloc: bumped to {}", block);
            Ok(block)
        }
    }

    /// Push `pid` onto the freelist. Requires `pid < last_block`.
    pub fn block_free(&mut self, pid: BlockId) -> Result<()> {
        if pid >= self.header.last_block {
            return Err(ApiError::Bounds("freeing a block that was never allocated"));
        }
        let next = self.header.first_unused_block.to_ne_bytes();
        self.block_writes_m(pid, 0, &next)?;
        self.header.first_unused_block = pid;
        log::trace!("block_free: pushed {} onto freelist", pid);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{create_dir_all, remove_dir_all};

    fn scratch_path(name: &str) -> PathBuf {
        let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
        path.push("target");
        path.push("device-tests");
        path.push(name);
        if let Some(parent) = path.parent() {
            create_dir_all(parent).unwrap();
        }
        if path.exists() {
            std::fs::remove_file(&path).unwrap();
        }
        path
    }

    fn cleanup(path: &Path) {
        if path.exists() {
            std::fs::remove_file(path).unwrap();
        }
    }

    #[test]
    fn fresh_device_is_all_zero() {
        let path = scratch_path("fresh_device_is_all_zero");
        let dev = Device::create(&path, 64, 10).unwrap();
        let mut buf = vec![0u8; 64];
        dev.block_read(3, &mut buf).unwrap();
        assert_eq!(buf, vec![0u8; 64]);
        drop(dev);
        cleanup(&path);
    }

    #[test]
    fn out_of_range_block_access_fails() {
        let path = scratch_path("out_of_range_block_access_fails");
        let mut dev = Device::create(&path, 64, 10).unwrap();
        let buf = vec![0u8; 64];
        assert!(dev.block_read(10, &mut buf.clone()).is_err());
        assert!(dev.block_write(10, &buf).is_err());
        assert!(dev.block_read(0, &mut buf.clone()).is_err());
        drop(dev);
        cleanup(&path);
    }

    #[test]
    fn partial_writes_do_not_disturb_neighbors() {
        let path = scratch_path("partial_writes_do_not_disturb_neighbors");
        let mut dev = Device::create(&path, 64, 10).unwrap();
        dev.block_writes(4, 8, &[9, 9, 9]).unwrap();
        let mut buf = vec![0u8; 64];
        dev.block_read(4, &mut buf).unwrap();
        let mut expected = vec![0u8; 64];
        expected[8..11].copy_from_slice(&[9, 9, 9]);
        assert_eq!(buf, expected);
        drop(dev);
        cleanup(&path);
    }

    #[test]
    fn persists_across_reopen() {
        let path = scratch_path("persists_across_reopen");
        let mut dev = Device::create(&path, 64, 8).unwrap();
        dev.block_write(2, &vec![5u8; 64]).unwrap();
        dev.close().unwrap();

        let dev = Device::open(&path).unwrap();
        let mut buf = vec![0u8; 64];
        dev.block_read(2, &mut buf).unwrap();
        assert_eq!(buf, vec![5u8; 64]);
        drop(dev);
        cleanup(&path);
    }

    #[test]
    fn freelist_round_trips_and_bump_advances() {
        let path = scratch_path("freelist_round_trips_and_bump_advances");
        let mut dev = Device::create(&path, 64, 5).unwrap();
        // blocks_total=5, block 0 reserved; 1..5 allocatable.
        let b1 = dev.block_alloc().unwrap();
        let b2 = dev.block_alloc().unwrap();
        assert_eq!(b1, 1);
        assert_eq!(b2, 2);
        dev.block_free(b1).unwrap();
        let b3 = dev.block_alloc().unwrap();
        assert_eq!(b3, b1, "freed block should be reused before bumping");
        let b4 = dev.block_alloc().unwrap();
        assert_eq!(b4, 3);
        let b5 = dev.block_alloc().unwrap();
        assert_eq!(b5, 4);
        let b6 = dev.block_alloc().unwrap();
        assert_eq!(b6, 0, "device should be exhausted");
        drop(dev);
        cleanup(&path);
    }
}
