//! Process-scoped native driver pool
//!
//! A [`PollerPool`] owns the one-time driver initialization and a fixed set of
//! native device handles, each paired with a CPU core. Devices check a handle out
//! through [`PollerPool::acquire`] and keep the returned [`PollerLease`] for
//! their lifetime.
//!
//! Two polling modes are supported:
//!
//! - [`PollerMode::Pinned`]: each lease gets exclusive use of one handle and the
//!   driver starts its own poller thread for it, pinned to the handle's core.
//!   Submissions are forwarded to that thread by the driver, so drivers with
//!   single-threaded queues are safe. Leasing blocks while every handle is taken
//!   and fails with [`DeviceError::PollerExhausted`] after the configured timeout.
//! - [`PollerMode::Shared`]: the pool runs one poll thread per handle and leases
//!   are handed out round-robin. Requires a driver with thread-safe submission.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::Deserialize;

use crate::device::native_common::{poll_until_stopped, NativeDriver};
use crate::error::DeviceError;

/// How native handles are polled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollerMode {
    /// One driver-owned poller per leased handle
    #[default]
    Pinned,
    /// Pool-owned poll threads; handles shared between devices
    Shared,
}

impl std::str::FromStr for PollerMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pinned" => Ok(Self::Pinned),
            "shared" => Ok(Self::Shared),
            other => Err(format!("unknown poller mode '{other}'")),
        }
    }
}

/// Pool configuration
#[derive(Debug, Clone)]
pub struct PollerPoolConfig {
    /// Namespace every handle is created on
    pub nsid: u32,
    /// Number of native handles
    pub slots: usize,
    /// Core of slot 0. Slot `i` is paired with `first_core - i`; negative cores
    /// mean no pinning.
    pub first_core: i32,
    /// Completions processed per poll call
    pub poll_batch: u32,
    /// How long a pinned lease waits for a free handle
    pub acquire_timeout: Duration,
    /// Polling mode
    pub mode: PollerMode,
}

impl Default for PollerPoolConfig {
    fn default() -> Self {
        Self {
            nsid: 1,
            slots: 4,
            first_core: -1,
            poll_batch: crate::constants::DEFAULT_POLL_BATCH,
            acquire_timeout: Duration::from_secs(10),
            mode: PollerMode::Pinned,
        }
    }
}

impl PollerPoolConfig {
    /// Core paired with `slot`
    pub fn core_for_slot(&self, slot: usize) -> i32 {
        let offset = i32::try_from(slot).unwrap_or(i32::MAX);
        self.first_core.saturating_sub(offset).max(-1)
    }
}

struct PoolPoller {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

/// Shared owner of a native driver and its device handles.
pub struct PollerPool<D: NativeDriver> {
    driver: Arc<D>,
    config: PollerPoolConfig,
    devices: Vec<D::Device>,
    ns_size: u64,
    sector_size: u32,
    free: Mutex<Vec<usize>>,
    released: Condvar,
    next: AtomicUsize,
    pollers: Mutex<Vec<PoolPoller>>,
}

impl<D: NativeDriver> PollerPool<D> {
    /// Initialize `driver` and create the pool's handles.
    pub fn new(driver: Arc<D>, config: PollerPoolConfig) -> Result<Arc<Self>, DeviceError> {
        if config.slots == 0 {
            return Err(DeviceError::InvalidConfig(
                "poller pool needs at least one slot".into(),
            ));
        }
        if config.mode == PollerMode::Shared && !driver.thread_safe_submission() {
            return Err(DeviceError::InvalidConfig(
                "shared polling requires a driver with thread-safe submission".into(),
            ));
        }

        let rc = driver.init();
        if rc != 0 {
            return Err(DeviceError::DriverInit(rc));
        }

        let ns_size = driver.ns_size(config.nsid);
        let sector_size = driver.ns_sector_size(config.nsid);
        if ns_size == 0 || sector_size == 0 {
            return Err(DeviceError::NamespaceNotFound { nsid: config.nsid });
        }

        let mut devices = Vec::with_capacity(config.slots);
        for _ in 0..config.slots {
            match driver.create(config.nsid) {
                Some(device) => devices.push(device),
                None => {
                    for device in devices {
                        driver.destroy(device);
                    }
                    return Err(DeviceError::NativeCreate { nsid: config.nsid });
                }
            }
        }

        let pool = Arc::new(Self {
            free: Mutex::new((0..config.slots).rev().collect()),
            released: Condvar::new(),
            next: AtomicUsize::new(0),
            pollers: Mutex::new(Vec::new()),
            driver,
            devices,
            ns_size,
            sector_size,
            config,
        });

        if pool.config.mode == PollerMode::Shared {
            pool.start_shared_pollers()?;
        }

        tracing::info!(
            nsid = pool.config.nsid,
            slots = pool.config.slots,
            mode = ?pool.config.mode,
            ns_size,
            sector_size,
            "native poller pool ready"
        );
        Ok(pool)
    }

    fn start_shared_pollers(&self) -> Result<(), DeviceError> {
        let mut pollers = self.pollers.lock();
        for (slot, device) in self.devices.iter().enumerate() {
            let stop = Arc::new(AtomicBool::new(false));
            let driver = Arc::clone(&self.driver);
            let device = device.clone();
            let batch = self.config.poll_batch;
            let thread_stop = Arc::clone(&stop);
            let thread = thread::Builder::new()
                .name(format!("faster-io-poller-{slot}"))
                .spawn(move || {
                    poll_until_stopped(&thread_stop, || driver.poll(&device, batch));
                })?;
            pollers.push(PoolPoller { stop, thread });
        }
        Ok(())
    }

    /// Lease a native handle.
    pub fn acquire(self: &Arc<Self>) -> Result<PollerLease<D>, DeviceError> {
        match self.config.mode {
            PollerMode::Shared => {
                let slot = self.next.fetch_add(1, Ordering::Relaxed) % self.devices.len();
                Ok(PollerLease {
                    pool: Arc::clone(self),
                    slot,
                    pinned: false,
                })
            }
            PollerMode::Pinned => {
                let slot = self.checkout()?;
                let core = self.config.core_for_slot(slot);
                let rc = self.driver.begin_poll(&self.devices[slot], core);
                if rc != 0 {
                    self.checkin(slot);
                    return Err(DeviceError::BeginPoll { code: rc });
                }
                tracing::debug!(slot, core, "leased pinned poller");
                Ok(PollerLease {
                    pool: Arc::clone(self),
                    slot,
                    pinned: true,
                })
            }
        }
    }

    fn checkout(&self) -> Result<usize, DeviceError> {
        let started = Instant::now();
        let deadline = started + self.config.acquire_timeout;
        let mut free = self.free.lock();
        loop {
            if let Some(slot) = free.pop() {
                return Ok(slot);
            }
            if self.released.wait_until(&mut free, deadline).timed_out() {
                if let Some(slot) = free.pop() {
                    return Ok(slot);
                }
                let waited = started.elapsed();
                tracing::error!(
                    slots = self.config.slots,
                    ?waited,
                    "no native poller slot became available"
                );
                return Err(DeviceError::PollerExhausted {
                    slots: self.config.slots,
                    waited,
                });
            }
        }
    }

    fn checkin(&self, slot: usize) {
        self.free.lock().push(slot);
        self.released.notify_one();
    }

    /// The shared driver
    pub fn driver(&self) -> &Arc<D> {
        &self.driver
    }

    /// Pool configuration
    pub fn config(&self) -> &PollerPoolConfig {
        &self.config
    }

    /// Namespace size in bytes
    pub fn ns_size(&self) -> u64 {
        self.ns_size
    }

    /// Namespace sector size in bytes
    pub fn sector_size(&self) -> u32 {
        self.sector_size
    }

    /// Handles not currently leased (pinned mode)
    pub fn available(&self) -> usize {
        match self.config.mode {
            PollerMode::Pinned => self.free.lock().len(),
            PollerMode::Shared => self.devices.len(),
        }
    }
}

impl<D: NativeDriver> Drop for PollerPool<D> {
    fn drop(&mut self) {
        let pollers = std::mem::take(&mut *self.pollers.lock());
        for poller in pollers {
            poller.stop.store(true, Ordering::Release);
            poller.thread.thread().unpark();
            if poller.thread.join().is_err() {
                tracing::warn!("pool poller thread panicked");
            }
        }
        for device in self.devices.drain(..) {
            self.driver.destroy(device);
        }
        tracing::debug!(nsid = self.config.nsid, "native poller pool destroyed");
    }
}

/// Exclusive (pinned) or shared use of one pool handle.
///
/// Dropping a pinned lease stops its driver-owned poller and returns the handle
/// to the pool.
pub struct PollerLease<D: NativeDriver> {
    pool: Arc<PollerPool<D>>,
    slot: usize,
    pinned: bool,
}

impl<D: NativeDriver> PollerLease<D> {
    /// The leased native handle
    pub fn device(&self) -> &D::Device {
        &self.pool.devices[self.slot]
    }

    /// The shared driver
    pub fn driver(&self) -> &Arc<D> {
        &self.pool.driver
    }

    /// The pool this lease came from
    pub fn pool(&self) -> &Arc<PollerPool<D>> {
        &self.pool
    }

    /// Slot index within the pool
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Core paired with the leased slot
    pub fn core(&self) -> i32 {
        self.pool.config.core_for_slot(self.slot)
    }

    /// Whether the lease has exclusive use of its handle
    pub fn is_pinned(&self) -> bool {
        self.pinned
    }
}

impl<D: NativeDriver> Drop for PollerLease<D> {
    fn drop(&mut self) {
        if self.pinned {
            self.pool.driver.stop_poll(self.device());
            self.pool.checkin(self.slot);
            tracing::debug!(slot = self.slot, "returned pinned poller");
        }
    }
}
