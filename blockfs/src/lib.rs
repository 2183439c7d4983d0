//! The inode allocator, the variable-depth block tree, and the filesystem
//! layer built on top of `blockfs-api`'s raw block device.
//!
//! This crate turns the array of blocks `blockfs-api` provides into a
//! tree of named files and directories: [`fs::Filesystem`] is the entry
//! point most callers want.

pub mod cache;
pub mod dirent;
pub mod error;
pub mod fs;
pub mod inode;

pub use cache::{NodeId, NodeKind};
pub use error::{FsError, Result};
pub use fs::Filesystem;
