//! Error type used by the inode and filesystem layers.
//!
//! Layers on top of [`blockfs_api::error::ApiError`] via `#[from]`.

use blockfs_api::error::ApiError;
use thiserror::Error;

/// Error type used above the raw block device.
#[derive(Error, Debug)]
pub enum FsError {
    /// Propagated from the block device layer.
    #[error(transparent)]
    Device(#[from] ApiError),

    /// (De)serializing a directory entry header failed.
    #[error("serialization error in the directory layer")]
    Serde(#[from] bincode::Error),

    /// The device has no free blocks left; inodes are carved from blocks
    /// on demand, so this also covers inode exhaustion.
    #[error("no free blocks left on the device")]
    OutOfBlocks,

    /// A read or write offset/size argument was invalid.
    #[error("invalid offset or size: {0}")]
    InvalidOffset(&'static str),

    /// An operation that requires a directory was given a file, or vice
    /// versa.
    #[error("expected a directory, found a file, or vice versa")]
    NotADirectory,

    /// On-disk structure violated an invariant the filesystem relies on.
    #[error("on-disk structure is corrupt: {0}")]
    Corrupt(&'static str),
}

/// Generic alias for a `Result` with the error type [`FsError`].
pub type Result<T> = std::result::Result<T, FsError>;
