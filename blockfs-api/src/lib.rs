//! Low-level building blocks of the on-disk storage stack: the raw block
//! device and the handful of record types that get serialized into it.
//!
//! Nothing in this crate knows about inodes, trees, or directories - that
//! lives one layer up, in `blockfs`. This crate only knows how to turn a
//! host file into a fixed-size array of blocks, and how to (de)serialize
//! the small persistent records that the layers above store inside it.

pub mod device;
pub mod error;
pub mod types;
