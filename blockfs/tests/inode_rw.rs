//! Integration tests for inode content read/write: cross-block-boundary
//! writes, grow monotonicity, and the direct-table/level invariant.

mod common;

use blockfs_api::device::Device;
use blockfs_api::types::BLOCKS_PER_INODE;
use blockfs::inode::{self, InodeAllocator};
use common::{disk_prep_path, disk_unprep_path};
use rand::Rng;

#[test]
fn write_spanning_many_blocks_reads_back_exactly() {
    let path = disk_prep_path("write_spanning_many_blocks_reads_back_exactly");
    let mut device = Device::create(&path, 128, 2048).unwrap();
    let mut allocator = InodeAllocator::init(128).unwrap();
    let mut record = inode::create(&mut device, &mut allocator, 0).unwrap();

    let mut rng = rand::thread_rng();
    let payload: Vec<u8> = (0..50_000).map(|_| rng.gen()).collect();
    inode::write(&mut device, &mut record, 37, &payload).unwrap();

    let mut out = vec![0u8; payload.len()];
    inode::read(&mut device, &mut record, 37, &mut out).unwrap();
    assert_eq!(out, payload);
    drop(device);
    disk_unprep_path(&path);
}

#[test]
fn grow_is_monotonic_and_never_drops_below_requested_level() {
    let path = disk_prep_path("grow_is_monotonic_and_never_drops_below_requested_level");
    let mut device = Device::create(&path, 128, 8192).unwrap();
    let mut allocator = InodeAllocator::init(128).unwrap();
    let mut record = inode::create(&mut device, &mut allocator, 0).unwrap();

    let mut last_level = record.level;
    for size in [100u64, 10_000, 200_000, 1_000_000] {
        inode::set_size(&mut device, &mut record, size).unwrap();
        assert!(record.level >= last_level);
        assert_eq!(record.mem_size, size);
        last_level = record.level;
    }
    drop(device);
    disk_unprep_path(&path);
}

#[test]
fn level_zero_inode_uses_only_the_direct_table() {
    let path = disk_prep_path("level_zero_inode_uses_only_the_direct_table");
    let mut device = Device::create(&path, 128, 256).unwrap();
    let mut allocator = InodeAllocator::init(128).unwrap();
    let mut record = inode::create(&mut device, &mut allocator, 0).unwrap();

    let direct_capacity = BLOCKS_PER_INODE as u64 * 128;
    inode::write(&mut device, &mut record, direct_capacity - 1, &[9u8]).unwrap();
    assert_eq!(record.level, 0);
    drop(device);
    disk_unprep_path(&path);
}

#[test]
fn sparse_grow_then_read_in_the_gap_is_zero() {
    let path = disk_prep_path("sparse_grow_then_read_in_the_gap_is_zero");
    let mut device = Device::create(&path, 128, 4096).unwrap();
    let mut allocator = InodeAllocator::init(128).unwrap();
    let mut record = inode::create(&mut device, &mut allocator, 0).unwrap();

    inode::set_size(&mut device, &mut record, 100_000).unwrap();
    let mut buf = vec![0xaau8; 100];
    inode::read(&mut device, &mut record, 50_000, &mut buf).unwrap();
    assert_eq!(buf, vec![0u8; 100]);
    drop(device);
    disk_unprep_path(&path);
}
