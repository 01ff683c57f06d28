//! Shared test utilities for device integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use faster_io::device::{
    FileDevice, FileDeviceConfig, IoCompletionCallback, MemoryDriver, NativeDevice,
    NativeDeviceConfig, PollerMode, PollerPool, PollerPoolConfig, StorageDevice,
};

/// Sector size used by every scenario
pub const SECTOR: u32 = 512;
/// Segment size used by every scenario (2^20 bytes)
pub const SEGMENT_SIZE: u64 = 1 << 20;
/// Device capacity used by every scenario (2^30 bytes)
pub const CAPACITY: u64 = 1 << 30;

/// One observed callback invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    /// Error code (0 = success)
    pub code: u32,
    /// Bytes transferred
    pub bytes: u32,
}

/// Records completion callbacks keyed by operation id.
///
/// Every callback built by [`CallbackRecorder::callback`] records exactly one
/// entry per invocation, so duplicate deliveries show up as extra entries.
#[derive(Default)]
pub struct CallbackRecorder {
    seen: Mutex<HashMap<u64, Vec<Completion>>>,
    total: AtomicUsize,
}

impl CallbackRecorder {
    /// Create a shared recorder
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Build a completion callback for operation `id`
    pub fn callback(self: &Arc<Self>, id: u64) -> IoCompletionCallback {
        let recorder = Arc::clone(self);
        Box::new(move |code, bytes, ctx| {
            if let Some(expected) = ctx.downcast_ref::<u64>() {
                assert_eq!(*expected, id, "callback received another operation's context");
            }
            recorder
                .seen
                .lock()
                .entry(id)
                .or_default()
                .push(Completion { code, bytes });
            recorder.total.fetch_add(1, Ordering::AcqRel);
        })
    }

    /// Total callbacks observed
    pub fn total(&self) -> usize {
        self.total.load(Ordering::Acquire)
    }

    /// Block until at least `count` callbacks fired or `timeout` elapsed
    pub fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.total() < count {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        true
    }

    /// Completions recorded for operation `id`
    pub fn get(&self, id: u64) -> Vec<Completion> {
        self.seen.lock().get(&id).cloned().unwrap_or_default()
    }

    /// Number of distinct operations that completed
    pub fn distinct(&self) -> usize {
        self.seen.lock().len()
    }

    /// Whether every recorded operation completed exactly once
    pub fn all_exactly_once(&self) -> bool {
        self.seen.lock().values().all(|v| v.len() == 1)
    }
}

/// Wait until `device` reports no in-flight operations
pub fn wait_idle(device: &dyn StorageDevice, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while device.pending_operations() != 0 {
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    true
}

/// Open and initialize a single-file device with the standard geometry
pub fn file_device(dir: &Path) -> FileDevice {
    let config = FileDeviceConfig::new("hlog", dir.join("hlog.log"))
        .with_sector_size(SECTOR)
        .with_capacity(CAPACITY);
    let mut device = FileDevice::open(config).expect("open file device");
    device.initialize(SEGMENT_SIZE).expect("initialize file device");
    device
}

/// Build a memory-driver pool whose namespace fits the standard geometry
pub fn memory_pool(
    mode: PollerMode,
    slots: usize,
) -> (Arc<MemoryDriver>, Arc<PollerPool<MemoryDriver>>) {
    let driver = Arc::new(MemoryDriver::new().with_namespace(1, CAPACITY, SECTOR));
    let config = PollerPoolConfig {
        slots,
        mode,
        first_core: i32::try_from(slots).unwrap_or(0) - 1,
        acquire_timeout: Duration::from_millis(200),
        ..Default::default()
    };
    let pool = PollerPool::new(Arc::clone(&driver), config).expect("build poller pool");
    (driver, pool)
}

/// Open and initialize a native device with the standard geometry
pub fn native_device(pool: &Arc<PollerPool<MemoryDriver>>, name: &str) -> NativeDevice<MemoryDriver> {
    let mut device =
        NativeDevice::open(pool, NativeDeviceConfig::new(name)).expect("open native device");
    device.initialize(SEGMENT_SIZE).expect("initialize native device");
    device
}
