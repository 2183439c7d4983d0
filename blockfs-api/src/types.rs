//! The handful of fixed-size records persisted inside block 0 and inside
//! inode slots. Everything here derives `Serialize`/`Deserialize` so it can
//! be written through `bincode`.

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};

/// 64-bit signed id of a block on the device. `0` is reserved ("none").
pub type BlockId = i64;

/// 64-bit packed inode id: low 8 bits are the slot index within the owning
/// block, the remaining bits are that block's id. `0` is reserved ("none").
pub type InodePid = i64;

/// Number of bits of an [`InodePid`] reserved for the in-block slot index.
pub const INODE_SLOT_BITS: u32 = 8;
/// Mask selecting the in-block slot index out of an [`InodePid`].
pub const INODE_SLOT_MASK: i64 = (1 << INODE_SLOT_BITS) - 1;

/// Pack a block id and a slot index into an [`InodePid`].
pub fn pack_inode_pid(block: BlockId, slot: u32) -> InodePid {
    (block << INODE_SLOT_BITS) | (slot as i64 & INODE_SLOT_MASK)
}

/// Split an [`InodePid`] back into its owning block id and slot index.
pub fn unpack_inode_pid(pid: InodePid) -> (BlockId, u32) {
    (pid >> INODE_SLOT_BITS, (pid & INODE_SLOT_MASK) as u32)
}

/// Magic cookie stamped into a freshly created device image.
pub const MASTER_COOKIE: u64 = 1234567890;

/// The persistent header stored at offset 0 of block 0.
///
/// Carries `block_size`/`blocks_total` alongside the master fields so that
/// `Device::open` can restore a device's shape from nothing but a path.
///
/// Immediately following this header, higher layers append their own
/// persistent roots (the inode allocator state, then the root inode id);
/// see [`crate::device::Device`] for the offsets those are written at.
#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PersistentHeader {
    /// Sanity-checked on open; sidesteps the device being mounted as the
    /// wrong kind of file entirely.
    pub cookie: u64,
    /// Head of the free-block list. `0` means "list empty, use `last_block`".
    pub first_unused_block: BlockId,
    /// Bump pointer: the next never-yet-allocated block id.
    pub last_block: BlockId,
    /// Size of each block, in bytes.
    pub block_size: u64,
    /// Total number of blocks in the device, including block 0.
    pub blocks_total: u64,
}

lazy_static! {
    /// Size of [`PersistentHeader`] once serialized, computed once at
    /// runtime since `bincode`'s exact framing isn't a `const fn`.
    pub static ref PERSISTENT_HEADER_SIZE: u64 =
        bincode::serialize(&PersistentHeader::default()).unwrap().len() as u64;
}

/// Number of direct block-table slots every inode carries.
pub const BLOCKS_PER_INODE: usize = 13;

/// What an inode slot currently holds.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq)]
pub enum InodeStatus {
    /// Slot is on the inode freelist.
    Invalid,
    /// Freshly allocated, not yet assigned a kind by the filesystem layer.
    Buffer,
    /// Holds a directory's entries.
    Directory,
    /// Holds a regular file's bytes.
    RegularFile,
}

impl Default for InodeStatus {
    fn default() -> Self {
        InodeStatus::Invalid
    }
}

/// On-disk inode record: fixed size, packed `BLOCKS_PER_INODE` per-inode
/// direct table plus the root of a variable-depth index tree.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct InodeRecord {
    /// This inode's own id (redundant with its on-disk position, kept so
    /// an in-memory copy can be handed around without its address).
    pub pid: InodePid,
    /// Depth of the indirect tree; `0` means the direct table holds data
    /// blocks directly.
    pub level: u16,
    /// What kind of content this inode currently holds.
    pub status: InodeStatus,
    /// Logical byte length of this inode's content.
    pub mem_size: u64,
    /// Direct table: `BLOCKS_PER_INODE` block ids, meaning depends on `level`.
    pub blocks: [BlockId; BLOCKS_PER_INODE],
}

lazy_static! {
    /// Size of [`InodeRecord`] once serialized.
    pub static ref INODE_RECORD_SIZE: u64 =
        bincode::serialize(&InodeRecord::default()).unwrap().len() as u64;
}

/// Persistent state of the inode allocator, stored right after the
/// [`PersistentHeader`] in block 0.
#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct InodeAllocatorState {
    /// Head of the free-inode list. `0` means "list empty".
    pub next_inode: InodePid,
    /// How many inode slots fit in one block (`block_size / INODE_RECORD_SIZE`).
    pub inodes_per_block: u32,
}

lazy_static! {
    /// Size of [`InodeAllocatorState`] once serialized.
    pub static ref INODE_ALLOCATOR_STATE_SIZE: u64 =
        bincode::serialize(&InodeAllocatorState::default()).unwrap().len() as u64;
}
