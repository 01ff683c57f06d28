//! End-to-end scenarios run against every device backend.

mod common;

use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use rand::thread_rng;
use tempfile::tempdir;

use common::{CallbackRecorder, Completion, CAPACITY, SECTOR, SEGMENT_SIZE};
use faster_io::device::{PollerMode, StorageDevice};
use faster_io::error::EINVAL;
use faster_io::{AlignedBuffer, DeviceError};

const TIMEOUT: Duration = Duration::from_secs(10);

fn write_then_read_pattern(device: &dyn StorageDevice) {
    assert_eq!(device.sector_size(), SECTOR);
    assert_eq!(device.capacity(), Some(CAPACITY));
    assert_eq!(device.segment_size(), Some(SEGMENT_SIZE));

    let pattern = AlignedBuffer::filled(SECTOR as usize, 512, 0xAB).unwrap();
    let (tx, rx) = mpsc::channel();
    let write_tx = tx.clone();
    unsafe {
        device
            .write_async(
                pattern.as_ptr(),
                0,
                0,
                512,
                Box::new(move |code, bytes, _| {
                    let _ = write_tx.send((code, bytes));
                }),
                Arc::new(()),
            )
            .unwrap();
    }
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), (0, 512));

    let mut out = AlignedBuffer::zeroed(SECTOR as usize, 512).unwrap();
    unsafe {
        device
            .read_async(
                0,
                0,
                out.as_mut_ptr(),
                512,
                Box::new(move |code, bytes, _| {
                    let _ = tx.send((code, bytes));
                }),
                Arc::new(()),
            )
            .unwrap();
    }
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), (0, 512));
    assert!(out.as_slice().iter().all(|&b| b == 0xAB));
    // The counter drops after the callback returns.
    assert!(common::wait_idle(device, TIMEOUT));
}

fn thousand_concurrent_writes(device: Arc<dyn StorageDevice>) {
    let mut addresses: Vec<(u64, u64)> = (0..1000u64)
        .map(|i| (i % 1024, (i / 1024) * u64::from(SECTOR)))
        .collect();
    addresses.shuffle(&mut thread_rng());

    let recorder = CallbackRecorder::new();
    let buffer = Arc::new(AlignedBuffer::filled(SECTOR as usize, SECTOR as usize, 0x5C).unwrap());

    let chunks: Vec<Vec<(u64, (u64, u64))>> = addresses
        .into_iter()
        .enumerate()
        .map(|(i, addr)| (i as u64, addr))
        .collect::<Vec<_>>()
        .chunks(125)
        .map(|c| c.to_vec())
        .collect();

    let threads: Vec<_> = chunks
        .into_iter()
        .map(|chunk| {
            let device = Arc::clone(&device);
            let recorder = Arc::clone(&recorder);
            let buffer = Arc::clone(&buffer);
            std::thread::spawn(move || {
                for (id, (segment, offset)) in chunk {
                    unsafe {
                        device
                            .write_async(
                                buffer.as_ptr(),
                                segment,
                                offset,
                                SECTOR,
                                recorder.callback(id),
                                Arc::new(id),
                            )
                            .unwrap();
                    }
                }
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }

    assert!(recorder.wait_for(1000, TIMEOUT), "only {} callbacks fired", recorder.total());
    assert!(common::wait_idle(device.as_ref(), TIMEOUT));
    assert_eq!(recorder.total(), 1000);
    assert_eq!(recorder.distinct(), 1000);
    assert!(recorder.all_exactly_once());
    for id in 0..1000 {
        assert_eq!(recorder.get(id), vec![Completion { code: 0, bytes: SECTOR }]);
    }
    assert_eq!(device.pending_operations(), 0);

    let stats = device.stats();
    assert_eq!(stats.writes_completed, 1000);
    assert_eq!(stats.bytes_written, 1000 * u64::from(SECTOR));
}

fn out_of_range_fails_synchronously(device: &dyn StorageDevice) {
    let before = device.pending_operations();
    let data = AlignedBuffer::zeroed(SECTOR as usize, 512).unwrap();
    let (tx, rx) = mpsc::channel();
    let segment_past_end = CAPACITY / SEGMENT_SIZE;
    unsafe {
        device
            .write_async(
                data.as_ptr(),
                segment_past_end,
                0,
                512,
                Box::new(move |code, bytes, _| {
                    let _ = tx.send((code, bytes));
                }),
                Arc::new(()),
            )
            .unwrap();
    }
    // Delivered before write_async returned.
    assert_eq!(rx.try_recv().unwrap(), (EINVAL, 0));
    assert_eq!(device.pending_operations(), before);
    assert_eq!(device.stats().submit_failures, 1);
}

fn io_after_dispose_is_refused(device: &dyn StorageDevice) {
    device.dispose();
    let mut out = AlignedBuffer::zeroed(SECTOR as usize, 512).unwrap();
    let recorder = CallbackRecorder::new();
    let result = unsafe { device.read_async(0, 0, out.as_mut_ptr(), 512, recorder.callback(1), Arc::new(1u64)) };
    assert!(matches!(result, Err(DeviceError::Disposed)));
    assert_eq!(recorder.total(), 0);
    assert!(!device.throttle());
    // Second dispose returns immediately.
    device.dispose();
}

#[test]
fn test_file_write_then_read() {
    let dir = tempdir().unwrap();
    write_then_read_pattern(&common::file_device(dir.path()));
}

#[test]
fn test_native_pinned_write_then_read() {
    let (_driver, pool) = common::memory_pool(PollerMode::Pinned, 1);
    write_then_read_pattern(&common::native_device(&pool, "hlog"));
}

#[test]
fn test_native_shared_write_then_read() {
    let (_driver, pool) = common::memory_pool(PollerMode::Shared, 2);
    write_then_read_pattern(&common::native_device(&pool, "hlog"));
}

#[test]
fn test_file_thousand_concurrent_writes() {
    let dir = tempdir().unwrap();
    thousand_concurrent_writes(Arc::new(common::file_device(dir.path())));
}

#[test]
fn test_native_pinned_thousand_concurrent_writes() {
    let (_driver, pool) = common::memory_pool(PollerMode::Pinned, 1);
    thousand_concurrent_writes(Arc::new(common::native_device(&pool, "hlog")));
}

#[test]
fn test_native_shared_thousand_concurrent_writes() {
    let (_driver, pool) = common::memory_pool(PollerMode::Shared, 2);
    thousand_concurrent_writes(Arc::new(common::native_device(&pool, "hlog")));
}

#[test]
fn test_file_out_of_range() {
    let dir = tempdir().unwrap();
    out_of_range_fails_synchronously(&common::file_device(dir.path()));
}

#[test]
fn test_native_out_of_range() {
    let (_driver, pool) = common::memory_pool(PollerMode::Pinned, 1);
    out_of_range_fails_synchronously(&common::native_device(&pool, "hlog"));
}

#[test]
fn test_file_dispose() {
    let dir = tempdir().unwrap();
    io_after_dispose_is_refused(&common::file_device(dir.path()));
}

#[test]
fn test_native_dispose() {
    let (_driver, pool) = common::memory_pool(PollerMode::Pinned, 1);
    io_after_dispose_is_refused(&common::native_device(&pool, "hlog"));
}
