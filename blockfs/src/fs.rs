//! The filesystem layer: name resolution, directory content
//! (de)serialization, and mount/unmount bookkeeping, tying the block
//! device and inode tree together into the tree of files a caller wants.
//!
//! Grounded on `original_source/fs.h`'s `FS`/`File` pair, redesigned per
//! the data-model expansion to use an arena of [`Node`]s addressed by
//! [`NodeId`] instead of intrusive `Filename`/`File` pointer chains.

use crate::cache::{Arena, Node, NodeId, NodeKind};
use crate::dirent;
use crate::error::{FsError, Result};
use crate::inode::{self, InodeAllocator};
use blockfs_api::device::Device;
use blockfs_api::types::{
    InodePid, InodeStatus, INODE_ALLOCATOR_STATE_SIZE, PERSISTENT_HEADER_SIZE,
};
use std::path::Path;

const ROOT_NAME: &str = "/";

/// Byte offset into block 0, right after the device's own header and the
/// inode allocator's state, where the root inode's id is persisted.
fn root_pid_offset() -> u64 {
    *PERSISTENT_HEADER_SIZE + *INODE_ALLOCATOR_STATE_SIZE
}

/// A mounted filesystem: the block device, the inode allocator, and the
/// arena of every directory and file node visited so far.
pub struct Filesystem {
    device: Device,
    allocator: InodeAllocator,
    arena: Arena,
    root: NodeId,
}

impl Filesystem {
    /// Create a brand-new filesystem image at `path`, sized
    /// `block_size * blocks_total` bytes, with an empty root directory.
    pub fn init<P: AsRef<Path>>(path: P, block_size: u64, blocks_total: u64) -> Result<Filesystem> {
        let mut device = Device::create(path, block_size, blocks_total)?;
        let mut allocator = InodeAllocator::init(block_size)?;

        let mut root_inode = inode::create(&mut device, &mut allocator, 0)?;
        root_inode.status = InodeStatus::Directory;
        inode::save(&mut device, &root_inode)?;

        let mut arena = Arena::default();
        let root = arena.insert(Node::new(ROOT_NAME.to_string(), NodeKind::Directory, root_inode));
        arena.get_mut(root).children_loaded = true;

        let mut fs = Filesystem {
            device,
            allocator,
            arena,
            root,
        };
        fs.save()?;
        Ok(fs)
    }

    /// Mount an existing filesystem image at `path`, restoring the root
    /// directory and its children.
    pub fn mount<P: AsRef<Path>>(path: P) -> Result<Filesystem> {
        let device = Device::open(path)?;
        let allocator = InodeAllocator::mount(&device, *PERSISTENT_HEADER_SIZE)?;

        let mut root_pid_bytes = [0u8; 8];
        device.block_reads_m(0, root_pid_offset(), &mut root_pid_bytes)?;
        let root_pid: InodePid = i64::from_ne_bytes(root_pid_bytes);
        if root_pid == 0 {
            return Err(FsError::Corrupt("device has no root inode recorded"));
        }
        let root_inode = inode::restore(&device, root_pid)?;
        if root_inode.status != InodeStatus::Directory {
            return Err(FsError::Corrupt("root inode is not a directory"));
        }

        let mut arena = Arena::default();
        let root = arena.insert(Node::new(ROOT_NAME.to_string(), NodeKind::Directory, root_inode));

        let mut fs = Filesystem {
            device,
            allocator,
            arena,
            root,
        };
        fs.restore_dir(fs.root)?;
        Ok(fs)
    }

    /// The root directory's handle.
    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Whether `id` names a directory.
    pub fn is_dir(&self, id: NodeId) -> bool {
        self.arena.get(id).kind == NodeKind::Directory
    }

    /// `id`'s file name.
    pub fn name(&self, id: NodeId) -> &str {
        &self.arena.get(id).name
    }

    /// `id`'s logical content length, in bytes.
    pub fn size(&self, id: NodeId) -> u64 {
        self.arena.get(id).inode.mem_size
    }

    /// Persist the root inode id, the inode allocator's state, and every
    /// dirty node's content and record, without closing the device.
    pub fn save(&mut self) -> Result<()> {
        let root_pid = self.arena.get(self.root).inode.pid;
        self.device
            .block_writes_m(0, root_pid_offset(), &root_pid.to_ne_bytes())?;
        self.save_all(self.root)?;
        self.allocator.unmount(&mut self.device, *PERSISTENT_HEADER_SIZE)?;
        self.device.save()?;
        Ok(())
    }

    /// Save, then close the device.
    pub fn unmount(mut self) -> Result<()> {
        self.save()
    }

    fn save_all(&mut self, id: NodeId) -> Result<()> {
        if self.is_dir(id) {
            if self.arena.get(id).dirty {
                self.save_dir(id)?;
            }
            let children = self.arena.get(id).children.clone();
            for child in children {
                self.save_all(child)?;
            }
        } else if self.arena.get(id).dirty {
            let inode = self.arena.get(id).inode.clone();
            inode::save(&mut self.device, &inode)?;
            self.arena.get_mut(id).dirty = false;
        }
        Ok(())
    }

    fn save_dir(&mut self, id: NodeId) -> Result<()> {
        debug_assert!(self.is_dir(id));
        let children = self.arena.get(id).children.clone();
        let mut inode = self.arena.get(id).inode.clone();

        let mut offset = 0u64;
        for child in &children {
            let child_node = self.arena.get(*child);
            let bytes = dirent::encode(child_node.inode.pid, &child_node.name)?;
            inode::write(&mut self.device, &mut inode, offset, &bytes)?;
            offset += bytes.len() as u64;
        }
        // Always re-set the size, even if it shrank - matches the
        // original's own `fs_save_dir`, which never reclaims blocks
        // trailing the new, smaller content (shrink is unimplemented).
        inode::set_size(&mut self.device, &mut inode, offset)?;
        inode::save(&mut self.device, &inode)?;

        let node = self.arena.get_mut(id);
        node.inode = inode;
        node.dirty = false;
        Ok(())
    }

    fn restore_dir(&mut self, id: NodeId) -> Result<()> {
        if self.arena.get(id).children_loaded {
            return Ok(());
        }
        let inode = self.arena.get(id).inode.clone();
        let total = inode.mem_size;
        let header_size = *dirent::DIR_ENTRY_HEADER_SIZE;

        let mut offset = 0u64;
        let mut children = Vec::new();
        while offset < total {
            let mut reader = inode.clone();
            let mut header_bytes = vec![0u8; header_size as usize];
            inode::read(&mut self.device, &mut reader, offset, &mut header_bytes)?;
            let header = dirent::decode_header(&header_bytes)?;
            offset += header_size;

            let mut reader = inode.clone();
            let mut name_bytes = vec![0u8; header.name_len as usize];
            inode::read(&mut self.device, &mut reader, offset, &mut name_bytes)?;
            offset += header.name_len as u64;
            let name = String::from_utf8(name_bytes)
                .map_err(|_| FsError::Corrupt("directory entry name is not valid UTF-8"))?;

            let child_inode = inode::restore(&self.device, header.pid)?;
            let kind = match child_inode.status {
                InodeStatus::Directory => NodeKind::Directory,
                _ => NodeKind::File,
            };
            children.push(self.arena.insert(Node::new(name, kind, child_inode)));
        }

        let node = self.arena.get_mut(id);
        node.children = children;
        node.children_loaded = true;
        Ok(())
    }

    /// The children directly under `dir`, restoring them from disk first
    /// if this is the first time `dir` has been listed.
    pub fn children(&mut self, dir: NodeId) -> Result<&[NodeId]> {
        if !self.is_dir(dir) {
            return Err(FsError::NotADirectory);
        }
        self.restore_dir(dir)?;
        Ok(&self.arena.get(dir).children)
    }

    /// Look up `name` directly under `dir`, whatever kind of node it is.
    /// When more than one entry shares a name (duplicates are not
    /// rejected at creation time), the most recently created one wins.
    pub fn get_any(&mut self, dir: NodeId, name: &str) -> Result<Option<NodeId>> {
        if !self.is_dir(dir) {
            return Err(FsError::NotADirectory);
        }
        self.restore_dir(dir)?;
        Ok(self
            .arena
            .get(dir)
            .children
            .iter()
            .copied()
            .find(|child| self.arena.get(*child).name == name))
    }

    /// Like [`Filesystem::get_any`], but `None` if `name` names a
    /// directory.
    pub fn get_file(&mut self, dir: NodeId, name: &str) -> Result<Option<NodeId>> {
        Ok(self.get_any(dir, name)?.filter(|id| !self.is_dir(*id)))
    }

    /// Like [`Filesystem::get_any`], but `None` if `name` names a file.
    pub fn get_dir(&mut self, dir: NodeId, name: &str) -> Result<Option<NodeId>> {
        Ok(self.get_any(dir, name)?.filter(|id| self.is_dir(*id)))
    }

    /// Find `name` under `dir`, creating an empty file there if it
    /// doesn't already exist. `Ok(None)` if `name` already names a
    /// directory (the original name stays reserved for it).
    pub fn open_file(&mut self, dir: NodeId, name: &str) -> Result<Option<NodeId>> {
        if !self.is_dir(dir) {
            return Err(FsError::NotADirectory);
        }
        match self.get_any(dir, name)? {
            Some(id) if self.is_dir(id) => Ok(None),
            Some(id) => Ok(Some(id)),
            None => Ok(Some(self.create_child(dir, name, NodeKind::File)?)),
        }
    }

    /// Find `name` under `dir`, creating an empty directory there if it
    /// doesn't already exist. `Ok(None)` if `name` already names a file.
    pub fn open_dir(&mut self, dir: NodeId, name: &str) -> Result<Option<NodeId>> {
        if !self.is_dir(dir) {
            return Err(FsError::NotADirectory);
        }
        match self.get_any(dir, name)? {
            Some(id) if !self.is_dir(id) => Ok(None),
            Some(id) => Ok(Some(id)),
            None => Ok(Some(self.create_child(dir, name, NodeKind::Directory)?)),
        }
    }

    fn create_child(&mut self, dir: NodeId, name: &str, kind: NodeKind) -> Result<NodeId> {
        let status = match kind {
            NodeKind::Directory => InodeStatus::Directory,
            NodeKind::File => InodeStatus::RegularFile,
        };
        let mut child_inode = inode::create(&mut self.device, &mut self.allocator, 0)?;
        child_inode.status = status;
        inode::save(&mut self.device, &child_inode)?;

        let child = self.arena.insert(Node::new(name.to_string(), kind, child_inode));
        self.restore_dir(dir)?;
        let parent = self.arena.get_mut(dir);
        // New children are prepended, matching the original's
        // `new_child->next = parent->head_child`.
        parent.children.insert(0, child);
        parent.dirty = true;
        Ok(child)
    }

    /// Read `buf.len()` bytes of `file`'s content starting at `offset`.
    pub fn read(&mut self, file: NodeId, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut node_inode = self.arena.get(file).inode.clone();
        inode::read(&mut self.device, &mut node_inode, offset, buf)
    }

    /// Write `buf` into `file`'s content starting at `offset`, growing
    /// the file first if necessary. Marks `file` dirty; its record is
    /// not persisted until the next [`Filesystem::save`].
    pub fn write(&mut self, file: NodeId, offset: u64, buf: &[u8]) -> Result<()> {
        let mut node_inode = self.arena.get(file).inode.clone();
        inode::write(&mut self.device, &mut node_inode, offset, buf)?;
        let node = self.arena.get_mut(file);
        node.inode = node_inode;
        node.dirty = true;
        Ok(())
    }

    /// Grow or logically shrink `file` to `mem_size` bytes. See
    /// `DESIGN.md` for why shrinking never reclaims blocks.
    pub fn set_size(&mut self, file: NodeId, mem_size: u64) -> Result<()> {
        let mut node_inode = self.arena.get(file).inode.clone();
        inode::set_size(&mut self.device, &mut node_inode, mem_size)?;
        let node = self.arena.get_mut(file);
        node.inode = node_inode;
        node.dirty = true;
        Ok(())
    }
}
