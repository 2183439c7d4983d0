//! Directory entry header: the child inode id plus a length-prefixed
//! name, written back to back inside a directory inode's byte content.
//!
//! Names here are variable-length and length-prefixed, since nothing in
//! this design caps a file name.

use crate::error::{FsError, Result};
use blockfs_api::types::InodePid;
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};

/// Fixed-size prefix of a directory entry: which inode it names, and how
/// many bytes of name text immediately follow.
#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DirEntryHeader {
    pub pid: InodePid,
    pub name_len: u16,
}

lazy_static! {
    /// Size of [`DirEntryHeader`] once serialized.
    pub static ref DIR_ENTRY_HEADER_SIZE: u64 =
        bincode::serialize(&DirEntryHeader::default()).unwrap().len() as u64;
}

/// Encode one directory entry (header plus raw name bytes) ready to be
/// appended to a directory inode's content.
pub fn encode(pid: InodePid, name: &str) -> Result<Vec<u8>> {
    if name.len() > u16::MAX as usize {
        return Err(FsError::InvalidOffset("file name is too long to encode"));
    }
    let header = DirEntryHeader {
        pid,
        name_len: name.len() as u16,
    };
    let mut bytes = bincode::serialize(&header)?;
    bytes.extend_from_slice(name.as_bytes());
    Ok(bytes)
}

/// Decode a [`DirEntryHeader`] from its serialized bytes.
pub fn decode_header(bytes: &[u8]) -> Result<DirEntryHeader> {
    Ok(bincode::deserialize(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips_through_encode() {
        let bytes = encode(7, "hello.txt").unwrap();
        let header = decode_header(&bytes[..*DIR_ENTRY_HEADER_SIZE as usize]).unwrap();
        assert_eq!(header.pid, 7);
        assert_eq!(header.name_len, 9);
        assert_eq!(&bytes[*DIR_ENTRY_HEADER_SIZE as usize..], b"hello.txt");
    }
}
