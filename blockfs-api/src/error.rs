//! Error type used by the device layer.
//!
//! An enum deriving [`thiserror::Error`], with `#[from]` wrapping the
//! underlying `io`/`bincode` errors so `?` works at every call site, plus
//! a transparent `anyhow` catch-all for the rare case where a caller wants
//! to stuff an arbitrary error through the same `Result`.

use thiserror::Error;

/// Error type used in the block device layer.
#[derive(Error, Debug)]
pub enum ApiError {
    /// A host file read, write, or seek failed or was short.
    #[error("I/O error in the block device")]
    Io(#[from] std::io::Error),

    /// (De)serializing a persistent record failed.
    #[error("serialization error in the block device")]
    Serde(#[from] bincode::Error),

    /// An address or size argument was out of bounds.
    #[error("invalid device input: {0}")]
    Bounds(&'static str),

    /// `create` was called with a path that already has a file on it.
    #[error("device image already exists: {0}")]
    AlreadyExists(std::path::PathBuf),

    /// `open` was called with a path that has no file on it.
    #[error("device image not found: {0}")]
    NotFound(std::path::PathBuf),

    /// Escape hatch for ad-hoc errors raised by callers/tests.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Generic alias for a `Result` with the error type [`ApiError`].
pub type Result<T> = std::result::Result<T, ApiError>;
