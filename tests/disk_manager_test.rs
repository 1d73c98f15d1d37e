//! Integration tests for the disk layer.

use std::sync::Arc;

use silo::common::{PageId, PAGE_SIZE};
use silo::storage::disk::{DiskManager, DiskScheduler};

use tempfile::NamedTempFile;

#[test]
fn test_round_trip_through_scheduler() {
    let temp_file = NamedTempFile::new().unwrap();
    let dm = Arc::new(DiskManager::new(temp_file.path()).unwrap());
    let scheduler = DiskScheduler::new(Arc::clone(&dm));

    for i in 0..8u32 {
        let mut buf: Box<[u8; PAGE_SIZE]> = Box::new([0u8; PAGE_SIZE]);
        buf[0] = i as u8;
        buf[PAGE_SIZE - 1] = 0xFF - i as u8;
        scheduler.schedule_write_sync(PageId::new(i), buf).unwrap();
    }

    for i in 0..8u32 {
        let buf = scheduler.schedule_read_sync(PageId::new(i)).unwrap();
        assert_eq!(buf[0], i as u8);
        assert_eq!(buf[PAGE_SIZE - 1], 0xFF - i as u8);
    }

    assert_eq!(dm.num_writes(), 8);
    assert_eq!(dm.num_reads(), 8);
}

#[test]
fn test_unwritten_page_reads_zeroed() {
    let temp_file = NamedTempFile::new().unwrap();
    let dm = Arc::new(DiskManager::new(temp_file.path()).unwrap());
    let scheduler = DiskScheduler::new(dm);

    let buf = scheduler.schedule_read_sync(PageId::new(42)).unwrap();
    assert!(buf.iter().all(|&b| b == 0));
}

#[test]
fn test_scheduler_from_many_threads() {
    let temp_file = NamedTempFile::new().unwrap();
    let dm = Arc::new(DiskManager::new(temp_file.path()).unwrap());
    let scheduler = Arc::new(DiskScheduler::new(dm));

    let mut handles = Vec::new();
    for t in 0..4u32 {
        let scheduler = Arc::clone(&scheduler);
        handles.push(std::thread::spawn(move || {
            for i in 0..16u32 {
                let pid = PageId::new(t * 16 + i);
                let mut buf: Box<[u8; PAGE_SIZE]> = Box::new([0u8; PAGE_SIZE]);
                buf[0..4].copy_from_slice(&pid.as_u32().to_le_bytes());
                scheduler.schedule_write_sync(pid, buf).unwrap();

                let read = scheduler.schedule_read_sync(pid).unwrap();
                assert_eq!(u32::from_le_bytes(read[0..4].try_into().unwrap()), pid.as_u32());
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
}
