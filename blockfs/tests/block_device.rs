//! Integration tests for the raw block device's freelist and capacity
//! bookkeeping, exercised through `blockfs-api` directly.

mod common;

use blockfs_api::device::Device;
use common::{disk_prep_path, disk_unprep_path};
use rand::seq::SliceRandom;
use rand::thread_rng;

#[test]
fn capacity_exhaustion_reports_failure_once_full() {
    let path = disk_prep_path("capacity_exhaustion_reports_failure_once_full");
    let mut device = Device::create(&path, 64, 64).unwrap();

    for expected in 1..64 {
        assert_eq!(device.block_alloc().unwrap(), expected);
    }
    assert_eq!(
        device.block_alloc().unwrap(),
        0,
        "device should report exhaustion rather than erroring"
    );
    drop(device);
    disk_unprep_path(&path);
}

#[test]
fn interleaved_alloc_free_never_hands_out_a_live_block_twice() {
    let path = disk_prep_path("interleaved_alloc_free_never_hands_out_a_live_block_twice");
    let mut device = Device::create(&path, 64, 200).unwrap();
    let mut rng = thread_rng();

    let mut live = Vec::new();
    for _ in 0..500 {
        if !live.is_empty() && live.len() % 3 == 0 {
            let idx = (0..live.len()).collect::<Vec<_>>();
            let chosen = *idx.choose(&mut rng).unwrap();
            let pid = live.remove(chosen);
            device.block_free(pid).unwrap();
        } else {
            let pid = device.block_alloc().unwrap();
            if pid == 0 {
                break;
            }
            assert!(!live.contains(&pid), "block {} handed out while still live", pid);
            live.push(pid);
        }
    }
    drop(device);
    disk_unprep_path(&path);
}

#[test]
fn zero_length_partial_io_at_block_boundary_is_a_no_op() {
    let path = disk_prep_path("zero_length_partial_io_at_block_boundary_is_a_no_op");
    let mut device = Device::create(&path, 64, 8).unwrap();
    device.block_writes(2, 32, &[]).unwrap();
    device.block_reads(2, 32, &mut []).unwrap();
    drop(device);
    disk_unprep_path(&path);
}
