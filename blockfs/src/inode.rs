//! Inode allocator and the variable-depth block tree each inode's content
//! lives in.
//!
//! Grounded line-by-line on `original_source/inode.h`: the singly-linked
//! inode freelist (`inode_alloc`/`inode_free`), the `BlockPath` cursor for
//! indirect-tree traversal (`get_block_path`/`increment_block_path`), and
//! the grow-only `inode_set_size` promotion logic.

use crate::error::{FsError, Result};
use blockfs_api::device::Device;
use blockfs_api::types::{
    pack_inode_pid, unpack_inode_pid, BlockId, InodeAllocatorState, InodePid, InodeRecord,
    InodeStatus, BLOCKS_PER_INODE, INODE_RECORD_SIZE,
};

/// Smallest block size able to hold one inode record.
pub fn min_block_size() -> u64 {
    *INODE_RECORD_SIZE
}

/// Largest usable block size: past this, the 8-bit in-block slot index in
/// an [`InodePid`] can no longer address every inode in a block.
pub fn max_block_size() -> u64 {
    256 * *INODE_RECORD_SIZE
}

/// Owns the inode freelist head and the inodes-per-block packing constant.
/// Persisted right after the device's own header in block 0.
#[derive(Debug, Clone, Copy, Default)]
pub struct InodeAllocator {
    state: InodeAllocatorState,
}

impl InodeAllocator {
    /// Initialize a fresh allocator for a newly created device.
    pub fn init(block_size: u64) -> Result<InodeAllocator> {
        if block_size < min_block_size() || block_size > max_block_size() {
            return Err(FsError::Corrupt(
                "block size cannot address an inode's worth of slots",
            ));
        }
        Ok(InodeAllocator {
            state: InodeAllocatorState {
                next_inode: 0,
                inodes_per_block: (block_size / *INODE_RECORD_SIZE) as u32,
            },
        })
    }

    /// Restore the allocator's persisted state from `offset` bytes into
    /// block 0.
    pub fn mount(device: &Device, offset: u64) -> Result<InodeAllocator> {
        let mut buf = vec![0u8; size_of_state()];
        device.block_reads_m(0, offset, &mut buf)?;
        let state = bincode::deserialize(&buf)?;
        Ok(InodeAllocator { state })
    }

    /// Persist the allocator's state at `offset` bytes into block 0.
    pub fn unmount(&self, device: &mut Device, offset: u64) -> Result<()> {
        let bytes = bincode::serialize(&self.state)?;
        device.block_writes_m(0, offset, &bytes)?;
        Ok(())
    }

    fn alloc(&mut self, device: &mut Device) -> Result<InodePid> {
        let head = self.state.next_inode;
        if head != 0 {
            let (block, slot) = unpack_inode_pid(head);
            let mut next_bytes = [0u8; 8];
            device.block_reads(block, slot as u64 * *INODE_RECORD_SIZE, &mut next_bytes)?;
            self.state.next_inode = i64::from_ne_bytes(next_bytes);
            Ok(head)
        } else {
            let block = device.block_alloc()?;
            if block == 0 {
                return Err(FsError::OutOfBlocks);
            }
            let mut slot = 1u32;
            while slot < self.state.inodes_per_block - 1 {
                let next = pack_inode_pid(block, slot + 1);
                device.block_writes(
                    block,
                    slot as u64 * *INODE_RECORD_SIZE,
                    &next.to_ne_bytes(),
                )?;
                slot += 1;
            }
            device.block_writes(
                block,
                slot as u64 * *INODE_RECORD_SIZE,
                &0i64.to_ne_bytes(),
            )?;
            self.state.next_inode = pack_inode_pid(block, 1);
            log::trace!("inode_alloc: carved a fresh inode block {}", block);
            Ok(pack_inode_pid(block, 0))
        }
    }

    fn free(&mut self, device: &mut Device, pid: InodePid) -> Result<()> {
        let (block, slot) = unpack_inode_pid(pid);
        let next = self.state.next_inode.to_ne_bytes();
        device.block_writes(block, slot as u64 * *INODE_RECORD_SIZE, &next)?;
        self.state.next_inode = pid;
        log::trace!("inode_free: returned {} to the freelist", pid);
        Ok(())
    }
}

fn size_of_state() -> usize {
    bincode::serialize(&InodeAllocatorState::default())
        .unwrap()
        .len()
}

/// Depth of index tree required to address `mem_size` bytes of content at
/// `block_size` bytes per block. `0` means the direct table reaches the
/// data directly.
pub fn required_level(mem_size: u64, block_size: u64) -> u16 {
    let block_base = block_size / 8;
    let mut capacity = BLOCKS_PER_INODE as u64 * block_size;
    let mut level: u16 = 0;
    while capacity < mem_size {
        capacity *= block_base;
        level += 1;
    }
    level
}

/// Allocate a fresh inode and persist it with an empty, `Buffer`-status
/// record of the given size.
pub fn create(device: &mut Device, allocator: &mut InodeAllocator, mem_size: u64) -> Result<InodeRecord> {
    let pid = allocator.alloc(device)?;
    let record = InodeRecord {
        pid,
        level: required_level(mem_size, device.block_size()),
        status: InodeStatus::Buffer,
        mem_size,
        blocks: [0; BLOCKS_PER_INODE],
    };
    save(device, &record)?;
    Ok(record)
}

/// Write `inode`'s record to its on-disk slot.
pub fn save(device: &mut Device, inode: &InodeRecord) -> Result<()> {
    let (block, slot) = unpack_inode_pid(inode.pid);
    let bytes = bincode::serialize(inode)?;
    device.block_writes(block, slot as u64 * *INODE_RECORD_SIZE, &bytes)?;
    Ok(())
}

/// Read the inode record stored at `pid`.
pub fn restore(device: &Device, pid: InodePid) -> Result<InodeRecord> {
    let (block, slot) = unpack_inode_pid(pid);
    let mut buf = vec![0u8; *INODE_RECORD_SIZE as usize];
    device.block_reads(block, slot as u64 * *INODE_RECORD_SIZE, &mut buf)?;
    Ok(bincode::deserialize(&buf)?)
}

fn free_all(device: &mut Device, pid: BlockId, level: u16) -> Result<()> {
    if pid != 0 {
        if level > 0 {
            let slots = device.block_size() / 8;
            for i in 0..slots {
                let mut next_bytes = [0u8; 8];
                device.block_reads(pid, i * 8, &mut next_bytes)?;
                free_all(device, i64::from_ne_bytes(next_bytes), level - 1)?;
            }
        }
        device.block_free(pid)?;
    }
    Ok(())
}

/// Free every block reachable from `inode`'s tree, then the inode slot
/// itself. `inode` is left zeroed and `Invalid`.
pub fn destroy(device: &mut Device, allocator: &mut InodeAllocator, inode: &mut InodeRecord) -> Result<()> {
    for i in 0..BLOCKS_PER_INODE {
        free_all(device, inode.blocks[i], inode.level)?;
        inode.blocks[i] = 0;
    }
    inode.level = 0;
    inode.status = InodeStatus::Invalid;
    inode.mem_size = 0;
    save(device, inode)?;
    allocator.free(device, inode.pid)?;
    Ok(())
}

fn alloc_block_pids(device: &mut Device, above_pid: BlockId, pid_index: i64) -> Result<BlockId> {
    let pid = device.block_alloc()?;
    if pid == 0 {
        return Err(FsError::OutOfBlocks);
    }
    let zeros = vec![0u8; device.block_size() as usize];
    device.block_write(pid, &zeros)?;
    if above_pid != 0 {
        device.block_writes(above_pid, pid_index as u64 * 8, &pid.to_ne_bytes())?;
    }
    Ok(pid)
}

fn get_block_pid(
    device: &mut Device,
    above_pid: BlockId,
    pid_index: i64,
    alloc_if_missing: bool,
) -> Result<BlockId> {
    if above_pid == 0 {
        return Ok(0);
    }
    let mut bytes = [0u8; 8];
    device.block_reads(above_pid, pid_index as u64 * 8, &mut bytes)?;
    let mut pid = i64::from_ne_bytes(bytes);
    if alloc_if_missing && pid == 0 {
        pid = alloc_block_pids(device, above_pid, pid_index)?;
    }
    Ok(pid)
}

/// Which guarantee a [`BlockPath`] traversal gives about the blocks it
/// passes over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncrementMode {
    /// Missing index/data blocks are allocated as the cursor reaches them.
    Write,
    /// Missing blocks are reported as holes (pid `0`), never allocated.
    Read,
    /// Every block the cursor steps over, including index blocks, is
    /// freed once left behind.
    Free,
}

/// A cursor into an inode's indirect block tree: the digit decomposition
/// of a block offset (one digit per tree level, base `block_size / 8`),
/// plus the block id found at each level along the way. Stepping it
/// forward costs amortized O(1) disk reads per data block instead of a
/// fresh root-to-leaf walk for every block.
#[derive(Debug)]
pub struct BlockPath {
    level: usize,
    block_base: i64,
    digits: Vec<i64>,
    pids: Vec<i64>,
    mode: IncrementMode,
}

impl BlockPath {
    /// Build a cursor pointing at the data block `block_offset` blocks
    /// into `inode`'s content.
    pub fn seek(
        device: &mut Device,
        inode: &mut InodeRecord,
        block_offset: i64,
        mode: IncrementMode,
    ) -> Result<BlockPath> {
        let level = inode.level as usize;
        let block_base = (device.block_size() / 8) as i64;
        let mut digits = vec![0i64; level + 1];
        let mut pids = vec![0i64; level + 1];
        let mut offset = block_offset;
        for digit in digits.iter_mut().take(level) {
            *digit = offset % block_base;
            offset /= block_base;
        }
        if offset as usize >= BLOCKS_PER_INODE {
            return Err(FsError::InvalidOffset(
                "block offset overflows the inode's direct table",
            ));
        }
        let top_index = offset as usize;
        let mut top_pid = inode.blocks[top_index];
        if mode == IncrementMode::Write && top_pid == 0 {
            top_pid = alloc_block_pids(device, 0, 0)?;
            inode.blocks[top_index] = top_pid;
        }
        digits[level] = top_index as i64;
        pids[level] = top_pid;
        for i in (0..level).rev() {
            top_pid = get_block_pid(device, top_pid, digits[i], mode == IncrementMode::Write)?;
            pids[i] = top_pid;
        }
        Ok(BlockPath {
            level,
            block_base,
            digits,
            pids,
            mode,
        })
    }

    /// The block the cursor currently points at; `0` marks a sparse hole.
    pub fn pid(&self) -> BlockId {
        self.pids[0]
    }

    /// Advance the cursor by up to `blocks_stepped_max` data blocks.
    /// Returns the block reached (`0` once the tree is exhausted) and how
    /// many blocks were actually stepped over - more than one when
    /// `Read`/`Free` mode skips a run of sparse holes.
    pub fn increment(
        &mut self,
        device: &mut Device,
        inode: &mut InodeRecord,
        blocks_stepped_max: i64,
    ) -> Result<(BlockId, i64)> {
        let level = self.level as isize;
        let block_base = self.block_base;
        let mut blocks_stepped: i64 = 1;
        if blocks_stepped > blocks_stepped_max {
            return Ok((0, blocks_stepped_max));
        }
        loop {
            let mut carried_pid: i64 = 0;
            let mut i: isize = 0;
            loop {
                if i >= level {
                    let li = level as usize;
                    if self.digits[li] + 1 >= BLOCKS_PER_INODE as i64 {
                        for j in (0..=i).rev() {
                            let j = j as usize;
                            if self.mode == IncrementMode::Free {
                                device.block_free(self.pids[j])?;
                            }
                            self.pids[j] = 0;
                        }
                        return Ok((0, blocks_stepped_max));
                    }
                    self.digits[li] += 1;
                    let idx = self.digits[li] as usize;
                    carried_pid = inode.blocks[idx];
                    if self.mode == IncrementMode::Write && carried_pid == 0 {
                        carried_pid = alloc_block_pids(device, 0, 0)?;
                        inode.blocks[idx] = carried_pid;
                    }
                    if self.mode == IncrementMode::Free && self.pids[li] != 0 {
                        device.block_free(self.pids[li])?;
                    }
                    self.pids[li] = carried_pid;
                    i = level - 1;
                    break;
                }
                let ui = i as usize;
                if self.digits[ui] + 1 >= block_base {
                    self.digits[ui] = 0;
                    i += 1;
                } else {
                    carried_pid = self.pids[ui + 1];
                    self.digits[ui] += 1;
                    if self.mode == IncrementMode::Write || carried_pid != 0 {
                        break;
                    }
                    blocks_stepped += (block_base - self.digits[ui]) * block_base.pow(ui as u32);
                    if blocks_stepped > blocks_stepped_max {
                        return Ok((0, blocks_stepped_max));
                    }
                    self.digits[ui] = 0;
                    i += 1;
                }
            }
            for j in (0..=i).rev() {
                let j = j as usize;
                carried_pid = get_block_pid(
                    device,
                    carried_pid,
                    self.digits[j],
                    self.mode == IncrementMode::Write,
                )?;
                if self.mode == IncrementMode::Free && self.pids[j] != 0 {
                    device.block_free(self.pids[j])?;
                }
                self.pids[j] = carried_pid;
            }
            if self.mode == IncrementMode::Write || self.pids[0] != 0 {
                return Ok((self.pids[0], blocks_stepped));
            }
            blocks_stepped += 1;
            if blocks_stepped > blocks_stepped_max {
                return Ok((0, blocks_stepped_max));
            }
        }
    }
}

/// Grow (or shrink the logical length of, without reclaiming blocks -
/// shrink is a Non-goal, see `DESIGN.md`) `inode` to `mem_size` bytes,
/// promoting its tree to a deeper level first if growth requires it.
pub fn set_size(device: &mut Device, inode: &mut InodeRecord, mem_size: u64) -> Result<()> {
    let block_size = device.block_size();
    if mem_size > inode.mem_size {
        let new_level = required_level(mem_size, block_size);
        if new_level > inode.level {
            let mut bottom_pid = alloc_block_pids(device, 0, 0)?;
            let mut direct_bytes = Vec::with_capacity(BLOCKS_PER_INODE * 8);
            for block in &inode.blocks {
                direct_bytes.extend_from_slice(&block.to_ne_bytes());
            }
            device.block_writes(bottom_pid, 0, &direct_bytes)?;
            for _ in 0..(new_level - inode.level - 1) {
                let cur_pid = alloc_block_pids(device, 0, 0)?;
                device.block_writes(cur_pid, 0, &bottom_pid.to_ne_bytes())?;
                bottom_pid = cur_pid;
            }
            inode.blocks = [0; BLOCKS_PER_INODE];
            inode.blocks[0] = bottom_pid;
            inode.level = new_level;
            log::debug!("promoted inode {} to level {}", inode.pid, new_level);
        }
        inode.mem_size = mem_size;
    } else if mem_size < inode.mem_size {
        inode.mem_size = mem_size;
    }
    Ok(())
}

/// Write `mem` into `inode`'s content starting at `mem_offset`, growing
/// the inode first if the write extends past its current length. Does
/// not persist `inode`'s own record; the caller decides when to save it.
pub fn write(device: &mut Device, inode: &mut InodeRecord, mem_offset: u64, mem: &[u8]) -> Result<()> {
    let mem_size = mem.len() as u64;
    if mem_offset.checked_add(mem_size).is_none() {
        return Err(FsError::InvalidOffset("write range overflows a 64-bit offset"));
    }
    if mem_offset + mem_size > inode.mem_size {
        set_size(device, inode, mem_offset + mem_size)?;
    }
    if mem_size == 0 {
        return Ok(());
    }

    let block_size = device.block_size();
    let internal_offset = mem_offset % block_size;
    let block_offset = (mem_offset / block_size) as i64;
    let mut path = BlockPath::seek(device, inode, block_offset, IncrementMode::Write)?;

    let write_size0 = (block_size - internal_offset).min(mem_size);
    device.block_writes(path.pid(), internal_offset, &mem[..write_size0 as usize])?;
    let mut written = write_size0 as usize;

    while (written as u64) < mem_size {
        let remaining = mem_size - written as u64;
        let steps_needed = ((remaining + block_size - 1) / block_size) as i64;
        let (pid, _steps) = path.increment(device, inode, steps_needed)?;
        debug_assert!(pid != 0, "a write-mode cursor always materializes its next block");
        if pid == 0 {
            return Err(FsError::Corrupt("write-mode cursor failed to materialize a block"));
        }
        if remaining >= block_size {
            device.block_write(pid, &mem[written..written + block_size as usize])?;
            written += block_size as usize;
        } else {
            device.block_writes(pid, 0, &mem[written..])?;
            written = mem.len();
        }
    }
    Ok(())
}

/// Read `mem.len()` bytes of `inode`'s content starting at `mem_offset`
/// into `mem`. Sparse holes read back as zero.
pub fn read(device: &mut Device, inode: &mut InodeRecord, mem_offset: u64, mem: &mut [u8]) -> Result<()> {
    let mem_size = mem.len() as u64;
    if mem_offset.checked_add(mem_size).is_none() || mem_offset + mem_size > inode.mem_size {
        return Err(FsError::InvalidOffset("read range is out of bounds for this inode"));
    }
    if mem_size == 0 {
        return Ok(());
    }

    let block_size = device.block_size();
    let internal_offset = mem_offset % block_size;
    let block_offset = (mem_offset / block_size) as i64;
    let mut path = BlockPath::seek(device, inode, block_offset, IncrementMode::Read)?;

    let read_size0 = (block_size - internal_offset).min(mem_size);
    if path.pid() == 0 {
        for b in mem[..read_size0 as usize].iter_mut() {
            *b = 0;
        }
    } else {
        device.block_reads(path.pid(), internal_offset, &mut mem[..read_size0 as usize])?;
    }
    let mut filled = read_size0 as usize;

    while (filled as u64) < mem_size {
        let remaining = mem_size - filled as u64;
        let steps_needed = ((remaining + block_size - 1) / block_size) as i64;
        let (pid, steps) = path.increment(device, inode, steps_needed)?;
        if pid == 0 {
            let zero_len = remaining.min(steps as u64 * block_size) as usize;
            for b in mem[filled..filled + zero_len].iter_mut() {
                *b = 0;
            }
            filled += zero_len;
            break;
        }
        if steps > 1 {
            let skipped = ((steps - 1) as u64 * block_size) as usize;
            for b in mem[filled..filled + skipped].iter_mut() {
                *b = 0;
            }
            filled += skipped;
        }
        let remaining = mem_size - filled as u64;
        if remaining >= block_size {
            device.block_read(pid, &mut mem[filled..filled + block_size as usize])?;
            filled += block_size as usize;
        } else if remaining > 0 {
            device.block_reads(pid, 0, &mut mem[filled..filled + remaining as usize])?;
            filled += remaining as usize;
        } else {
            break;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::create_dir_all;
    use std::path::PathBuf;

    fn scratch_device(name: &str, block_size: u64, blocks_total: u64) -> (Device, PathBuf) {
        let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
        path.push("target");
        path.push("inode-tests");
        create_dir_all(path.parent().unwrap()).unwrap();
        path.push(name);
        if path.exists() {
            std::fs::remove_file(&path).unwrap();
        }
        let device = Device::create(&path, block_size, blocks_total).unwrap();
        (device, path)
    }

    #[test]
    fn required_level_matches_direct_capacity_boundary() {
        let block_size = 64u64;
        let direct_capacity = BLOCKS_PER_INODE as u64 * block_size;
        assert_eq!(required_level(direct_capacity, block_size), 0);
        assert_eq!(required_level(direct_capacity + 1, block_size), 1);
    }

    #[test]
    fn create_destroy_round_trips_the_freelist() {
        let (mut device, path) = scratch_device("create_destroy_round_trips_the_freelist", 128, 64);
        let mut allocator = InodeAllocator::init(128).unwrap();
        let mut a = create(&mut device, &mut allocator, 0).unwrap();
        let b = create(&mut device, &mut allocator, 0).unwrap();
        destroy(&mut device, &mut allocator, &mut a).unwrap();
        let c = create(&mut device, &mut allocator, 0).unwrap();
        assert_eq!(c.pid, a.pid, "destroyed inode slot should be reused");
        assert_ne!(b.pid, c.pid);
        drop(device);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn write_then_read_round_trips_across_many_blocks() {
        let (mut device, path) = scratch_device("write_then_read_round_trips_across_many_blocks", 128, 256);
        let mut allocator = InodeAllocator::init(128).unwrap();
        let mut inode = create(&mut device, &mut allocator, 0).unwrap();

        let payload: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
        write(&mut device, &mut inode, 0, &payload).unwrap();
        save(&mut device, &inode).unwrap();

        let mut restored = restore(&device, inode.pid).unwrap();
        let mut out = vec![0u8; payload.len()];
        read(&mut device, &mut restored, 0, &mut out).unwrap();
        assert_eq!(out, payload);
        drop(device);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn sparse_hole_reads_back_as_zero() {
        let (mut device, path) = scratch_device("sparse_hole_reads_back_as_zero", 128, 256);
        let mut allocator = InodeAllocator::init(128).unwrap();
        let mut inode = create(&mut device, &mut allocator, 0).unwrap();

        write(&mut device, &mut inode, 1000, &[7u8; 10]).unwrap();
        let mut out = vec![0xffu8; 20];
        read(&mut device, &mut inode, 500, &mut out).unwrap();
        assert_eq!(out, vec![0u8; 20]);
        drop(device);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn growth_promotes_tree_level_monotonically() {
        let (mut device, path) = scratch_device("growth_promotes_tree_level_monotonically", 128, 4096);
        let mut allocator = InodeAllocator::init(128).unwrap();
        let mut inode = create(&mut device, &mut allocator, 0).unwrap();
        assert_eq!(inode.level, 0);

        let direct_capacity = BLOCKS_PER_INODE as u64 * 128;
        write(&mut device, &mut inode, direct_capacity, &[1u8]).unwrap();
        assert!(inode.level >= 1);
        let level_after_first_grow = inode.level;

        write(&mut device, &mut inode, direct_capacity * 20, &[2u8]).unwrap();
        assert!(inode.level >= level_after_first_grow);
        drop(device);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn free_mode_cursor_frees_each_block_it_steps_away_from() {
        let (mut device, path) = scratch_device("free_mode_cursor_frees_each_block_it_steps_away_from", 128, 64);
        let mut allocator = InodeAllocator::init(128).unwrap();
        let mut inode = create(&mut device, &mut allocator, 0).unwrap();

        // Three direct blocks, no index tree (level stays 0).
        write(&mut device, &mut inode, 0, &[1u8; 128 * 3]).unwrap();
        assert_eq!(inode.level, 0);
        let (p0, p1, p2) = (inode.blocks[0], inode.blocks[1], inode.blocks[2]);
        assert!(p0 != 0 && p1 != 0 && p2 != 0);

        let mut cursor = BlockPath::seek(&mut device, &mut inode, 0, IncrementMode::Free).unwrap();
        assert_eq!(cursor.pid(), p0);

        let (next, steps) = cursor.increment(&mut device, &mut inode, 1).unwrap();
        assert_eq!((next, steps), (p1, 1));
        let (next, steps) = cursor.increment(&mut device, &mut inode, 1).unwrap();
        assert_eq!((next, steps), (p2, 1));

        // p0 and p1 were stepped away from and should now be back on the
        // freelist, most recently freed first.
        assert_eq!(device.block_alloc().unwrap(), p1);
        assert_eq!(device.block_alloc().unwrap(), p0);

        drop(device);
        std::fs::remove_file(&path).unwrap();
    }
}
