//! File backend: configuration driven open, segment lifecycle and teardown.

mod common;

use std::fs;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use tempfile::tempdir;

use common::{CallbackRecorder, Completion, SECTOR, SEGMENT_SIZE};
use faster_io::device::{FileDevice, FileDeviceConfig, FileLayout, StorageDevice};
use faster_io::error::EIO;
use faster_io::{AlignedBuffer, FasterIoConfig};

const TIMEOUT: Duration = Duration::from_secs(10);

#[test]
fn test_open_from_toml() {
    let dir = tempdir().unwrap();
    let config_path = dir.path().join("faster-io.toml");
    let log_path = dir.path().join("logs").join("hlog");
    fs::write(
        &config_path,
        format!(
            r#"
[device]
kind = "file"
name = "hlog"
path = "{}"
layout = "segment_files"
sector_size = 4096
capacity = 1073741824
throttle_limit = 32
io_threads = 2
"#,
            log_path.display()
        ),
    )
    .unwrap();

    let config = FasterIoConfig::load_from_path(&config_path).unwrap();
    let mut device = config.open_file_device().unwrap().expect("file device configured");
    assert_eq!(device.name(), "hlog");
    assert_eq!(device.sector_size(), 4096);
    assert_eq!(device.layout(), FileLayout::SegmentFiles);
    device.initialize(SEGMENT_SIZE).unwrap();
    assert_eq!(device.capacity(), Some(1 << 30));

    let data = AlignedBuffer::filled(4096, 4096, 0x42).unwrap();
    let (tx, rx) = mpsc::channel();
    unsafe {
        device
            .write_async(
                data.as_ptr(),
                5,
                4096,
                4096,
                Box::new(move |code, bytes, _| {
                    let _ = tx.send((code, bytes));
                }),
                Arc::new(()),
            )
            .unwrap();
    }
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), (0, 4096));
    assert_eq!(fs::metadata(dir.path().join("logs").join("hlog.5")).unwrap().len(), 8192);
}

#[test]
fn test_capacity_rounds_down_to_segment_multiple() {
    let dir = tempdir().unwrap();
    let config = FileDeviceConfig::new("hlog", dir.path().join("hlog.log"))
        .with_capacity(3 * SEGMENT_SIZE + 12345);
    let mut device = FileDevice::open(config).unwrap();
    assert_eq!(device.capacity(), Some(3 * SEGMENT_SIZE + 12345));
    device.initialize(SEGMENT_SIZE).unwrap();
    assert_eq!(device.capacity(), Some(3 * SEGMENT_SIZE));
}

#[test]
fn test_unbounded_capacity() {
    let dir = tempdir().unwrap();
    let mut device = FileDevice::open(FileDeviceConfig::new("hlog", dir.path().join("h"))).unwrap();
    device.initialize(1 << 12).unwrap();
    assert_eq!(device.capacity(), None);

    let recorder = CallbackRecorder::new();
    let data = AlignedBuffer::filled(SECTOR as usize, SECTOR as usize, 1).unwrap();
    unsafe {
        device
            .write_async(data.as_ptr(), 10_000, 0, SECTOR, recorder.callback(1), Arc::new(1u64))
            .unwrap();
    }
    assert!(recorder.wait_for(1, TIMEOUT));
    assert_eq!(recorder.get(1)[0].code, 0);
}

#[test]
fn test_remove_segment_async_after_writes() {
    let dir = tempdir().unwrap();
    let config = FileDeviceConfig::new("hlog", dir.path().join("hlog"))
        .with_layout(FileLayout::SegmentFiles);
    let mut device = FileDevice::open(config).unwrap();
    device.initialize(1 << 16).unwrap();

    let recorder = CallbackRecorder::new();
    let data = AlignedBuffer::filled(SECTOR as usize, SECTOR as usize, 7).unwrap();
    for segment in 0..4u64 {
        unsafe {
            device
                .write_async(data.as_ptr(), segment, 0, SECTOR, recorder.callback(segment), Arc::new(segment))
                .unwrap();
        }
    }
    assert!(recorder.wait_for(4, TIMEOUT));

    let (tx, rx) = mpsc::channel();
    for segment in 0..2u64 {
        let tx = tx.clone();
        device.remove_segment_async(
            segment,
            Box::new(move |result| {
                let _ = tx.send((segment, result.is_ok()));
            }),
        );
    }
    let mut removed: Vec<_> = (0..2).map(|_| rx.recv_timeout(TIMEOUT).unwrap()).collect();
    removed.sort();
    assert_eq!(removed, vec![(0, true), (1, true)]);

    for segment in 0..4u64 {
        let exists = device.segment_path(segment).unwrap().exists();
        assert_eq!(exists, segment >= 2, "segment {segment}");
    }
}

#[test]
fn test_remove_after_dispose() {
    let dir = tempdir().unwrap();
    let device = common::file_device(dir.path());
    device.dispose();
    assert!(device.remove_segment(0).is_err());

    let (tx, rx) = mpsc::channel();
    device.remove_segment_async(
        0,
        Box::new(move |result| {
            let _ = tx.send(result.is_err());
        }),
    );
    assert!(rx.try_recv().unwrap());
}

#[test]
fn test_drop_drains_in_flight_writes() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("hlog.log");
    let recorder = CallbackRecorder::new();
    let data = Arc::new(AlignedBuffer::filled(SECTOR as usize, 64 * 1024, 0xEE).unwrap());
    {
        let mut device = FileDevice::open(FileDeviceConfig::new("hlog", &path)).unwrap();
        device.initialize(1 << 20).unwrap();
        for id in 0..32u64 {
            unsafe {
                device
                    .write_async(data.as_ptr(), id, 0, 64 * 1024, recorder.callback(id), Arc::new(id))
                    .unwrap();
            }
        }
    }
    // Dropping the device waited for every write.
    assert_eq!(recorder.total(), 32);
    assert!(recorder.all_exactly_once());
    assert_eq!(fs::metadata(&path).unwrap().len(), (31 << 20) + 64 * 1024);
}

#[test]
fn test_shut_down_runtime_fails_instead_of_stranding() {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .build()
        .unwrap();
    let dir = tempdir().unwrap();
    let config = FileDeviceConfig::new("hlog", dir.path().join("hlog"))
        .with_layout(FileLayout::SegmentFiles);
    let mut device = FileDevice::with_runtime(config, runtime.handle().clone()).unwrap();
    device.initialize(SEGMENT_SIZE).unwrap();
    runtime.shutdown_background();

    let recorder = CallbackRecorder::new();
    let data = AlignedBuffer::filled(SECTOR as usize, SECTOR as usize, 3).unwrap();
    unsafe {
        device
            .write_async(data.as_ptr(), 0, 0, SECTOR, recorder.callback(1), Arc::new(1u64))
            .unwrap();
    }
    assert!(recorder.wait_for(1, TIMEOUT));
    assert_eq!(recorder.get(1), vec![Completion { code: EIO, bytes: 0 }]);
    assert!(common::wait_idle(&device, TIMEOUT));
    assert_eq!(device.outstanding_contexts(), 0);

    let (tx, rx) = mpsc::channel();
    device.remove_segment_async(
        0,
        Box::new(move |result| {
            let _ = tx.send(result.is_err());
        }),
    );
    assert!(rx.recv_timeout(TIMEOUT).unwrap());
    assert!(common::wait_idle(&device, TIMEOUT));

    // Teardown has nothing left to wait for.
    drop(device);
}

#[test]
fn test_panicking_callback_does_not_leak() {
    let dir = tempdir().unwrap();
    let device = common::file_device(dir.path());
    let data = AlignedBuffer::filled(SECTOR as usize, SECTOR as usize, 4).unwrap();
    unsafe {
        device
            .write_async(
                data.as_ptr(),
                0,
                0,
                SECTOR,
                Box::new(|_, _, _| panic!("callback failure")),
                Arc::new(()),
            )
            .unwrap();
    }
    assert!(common::wait_idle(&device, TIMEOUT));
    assert_eq!(device.outstanding_contexts(), 0);

    let recorder = CallbackRecorder::new();
    unsafe {
        device
            .write_async(data.as_ptr(), 1, 0, SECTOR, recorder.callback(2), Arc::new(2u64))
            .unwrap();
    }
    assert!(recorder.wait_for(1, TIMEOUT));
    assert_eq!(recorder.get(2), vec![Completion { code: 0, bytes: SECTOR }]);
    device.dispose();
}
