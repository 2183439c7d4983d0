//! An in-memory arena of directory entries: a `Vec`-backed arena owned by
//! the [`Filesystem`](crate::fs::Filesystem) hands out [`NodeId`] handles
//! instead of raw pointers, so no node ever needs to know who else points
//! at it.

use blockfs_api::types::InodeRecord;

/// An index into the [`Filesystem`](crate::fs::Filesystem)'s node arena.
/// There is no eviction policy, so a `NodeId` stays valid for as long as
/// the filesystem it came from is mounted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub usize);

/// What kind of file a [`Node`] represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Directory,
    File,
}

/// One cached directory or file: its name, its inode record, and (for
/// directories) the children restored from it so far.
#[derive(Debug, Clone)]
pub struct Node {
    pub name: String,
    pub kind: NodeKind,
    pub inode: InodeRecord,
    /// Set once this node's content has been written since it was last
    /// saved to disk.
    pub dirty: bool,
    /// Directories restore their children lazily, the first time they're
    /// listed; this is `false` until that first restore happens.
    pub children_loaded: bool,
    pub children: Vec<NodeId>,
}

impl Node {
    pub fn new(name: String, kind: NodeKind, inode: InodeRecord) -> Node {
        let children_loaded = kind == NodeKind::File;
        Node {
            name,
            kind,
            inode,
            dirty: false,
            children_loaded,
            children: Vec::new(),
        }
    }
}

/// Owns every [`Node`] restored or created during a mount.
#[derive(Debug, Default)]
pub struct Arena {
    nodes: Vec<Node>,
}

impl Arena {
    pub fn insert(&mut self, node: Node) -> NodeId {
        self.nodes.push(node);
        NodeId(self.nodes.len() - 1)
    }

    pub fn get(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn get_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0]
    }
}
