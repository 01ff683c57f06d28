//! Native driver backed storage device
//!
//! `NativeDevice` submits I/O to a poll-driven [`NativeDriver`]. Each operation's
//! callback is parked in the device's [`CompletionPort`] and only the slot handle
//! crosses the driver boundary; the poller that discovers the completion hands
//! the handle back to the port, which resolves it exactly once.
//!
//! The device leases its native handle from a [`PollerPool`] at open time and
//! returns it on dispose. Several devices may share one namespace by giving each
//! a distinct `base_offset` and `capacity`.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::address::AddressTranslator;
use crate::constants::DEFAULT_THROTTLE_LIMIT;
use crate::device::completion::CompletionPort;
use crate::device::context_pool::ContextToken;
use crate::device::native_common::{CompletionSink, NativeDriver};
use crate::device::native_pool::{PollerLease, PollerPool};
use crate::device::stats::DeviceStatsSnapshot;
use crate::device::traits::{
    IoCallbackContext, IoCompletionCallback, IoOperation, StorageDevice,
};
use crate::error::{normalize_code, DeviceError, EINVAL};
use crate::utility::round_down;

/// Configuration for a [`NativeDevice`]
#[derive(Debug, Clone)]
pub struct NativeDeviceConfig {
    /// Device name, used for tracing
    pub name: String,
    /// Offset of this device's partition within the namespace
    pub base_offset: u64,
    /// Advisory throttle limit
    pub throttle_limit: u64,
    /// Partition size. `None` uses the rest of the namespace.
    pub capacity: Option<u64>,
}

impl NativeDeviceConfig {
    /// Create a configuration with default throttle limit and no partitioning
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_offset: 0,
            throttle_limit: DEFAULT_THROTTLE_LIMIT,
            capacity: None,
        }
    }

    /// Place the device at `base_offset` within the namespace
    pub fn with_base_offset(mut self, base_offset: u64) -> Self {
        self.base_offset = base_offset;
        self
    }

    /// Limit the device to `capacity` bytes
    pub fn with_capacity(mut self, capacity: u64) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Set the throttle limit
    pub fn with_throttle_limit(mut self, throttle_limit: u64) -> Self {
        self.throttle_limit = throttle_limit;
        self
    }
}

impl Default for NativeDeviceConfig {
    fn default() -> Self {
        Self::new("native")
    }
}

/// Storage device on a poll-driven native driver.
pub struct NativeDevice<D: NativeDriver> {
    port: Arc<CompletionPort>,
    sink: Arc<dyn CompletionSink>,
    driver: Arc<D>,
    device: D::Device,
    lease: Mutex<Option<PollerLease<D>>>,
    sector_size: u32,
    base_offset: u64,
    available: u64,
    capacity: Option<u64>,
    translator: Option<AddressTranslator>,
}

impl<D: NativeDriver> NativeDevice<D> {
    /// Open a device on a handle leased from `pool`.
    ///
    /// In pinned mode this blocks until a handle is free and fails with
    /// [`DeviceError::PollerExhausted`] if none frees up in time.
    pub fn open(pool: &Arc<PollerPool<D>>, config: NativeDeviceConfig) -> Result<Self, DeviceError> {
        if config.base_offset >= pool.ns_size() {
            return Err(DeviceError::InvalidConfig(format!(
                "base offset {} is beyond namespace size {}",
                config.base_offset,
                pool.ns_size()
            )));
        }

        let lease = pool.acquire()?;
        let remaining = pool.ns_size() - config.base_offset;
        let available = config.capacity.map_or(remaining, |c| c.min(remaining));
        let port = Arc::new(CompletionPort::new(config.name.as_str(), config.throttle_limit));
        let sink: Arc<dyn CompletionSink> = port.clone();

        tracing::debug!(
            device = %config.name,
            slot = lease.slot(),
            pinned = lease.is_pinned(),
            base_offset = config.base_offset,
            capacity = available,
            "opened native device"
        );

        Ok(Self {
            driver: Arc::clone(lease.driver()),
            device: lease.device().clone(),
            lease: Mutex::new(Some(lease)),
            sector_size: pool.sector_size(),
            base_offset: config.base_offset,
            available,
            capacity: None,
            translator: None,
            port,
            sink,
        })
    }

    /// Native handle this device submits to
    pub fn native_device(&self) -> &D::Device {
        &self.device
    }

    /// Partition offset within the namespace
    pub fn base_offset(&self) -> u64 {
        self.base_offset
    }

    /// Context slots currently checked out
    pub fn outstanding_contexts(&self) -> usize {
        self.port.outstanding_contexts()
    }

    fn prepare(
        &self,
        segment: u64,
        offset: u64,
        length: u32,
    ) -> Result<(AddressTranslator, bool), DeviceError> {
        let translator = self.translator.ok_or(DeviceError::NotInitialized)?;
        let capacity = self.capacity.unwrap_or(self.available);
        Ok((translator, translator.fits(segment, offset, length, capacity)))
    }

    fn finish_submit(&self, token: ContextToken, operation: IoOperation, rc: i32) {
        if rc == 0 {
            self.port.submitted(operation);
        } else {
            self.port.fail_submission(token, normalize_code(rc));
        }
    }
}

impl<D: NativeDriver> StorageDevice for NativeDevice<D> {
    fn name(&self) -> &str {
        self.port.name()
    }

    fn sector_size(&self) -> u32 {
        self.sector_size
    }

    fn capacity(&self) -> Option<u64> {
        Some(self.capacity.unwrap_or(self.available))
    }

    fn segment_size(&self) -> Option<u64> {
        self.translator.map(|t| t.segment_size())
    }

    fn initialize(&mut self, segment_size: u64) -> Result<(), DeviceError> {
        if self.translator.is_some() {
            return Err(DeviceError::AlreadyInitialized);
        }
        let translator = AddressTranslator::from_segment_size(segment_size, self.base_offset)?;
        if segment_size < u64::from(self.sector_size) {
            return Err(DeviceError::InvalidSegmentSize {
                segment_size,
                reason: "segment size is smaller than the sector size",
            });
        }
        let capacity = round_down(self.available, segment_size);
        if capacity == 0 {
            return Err(DeviceError::InvalidSegmentSize {
                segment_size,
                reason: "segment size exceeds device capacity",
            });
        }

        self.translator = Some(translator);
        self.capacity = Some(capacity);
        tracing::debug!(device = %self.name(), segment_size, capacity, "initialized native device");
        Ok(())
    }

    fn throttle(&self) -> bool {
        self.port.throttled()
    }

    fn pending_operations(&self) -> u64 {
        self.port.pending_operations()
    }

    unsafe fn read_async(
        &self,
        segment: u64,
        source_offset: u64,
        destination: *mut u8,
        length: u32,
        callback: IoCompletionCallback,
        context: IoCallbackContext,
    ) -> Result<(), DeviceError> {
        tracing::trace!(device = %self.name(), segment, source_offset, length, "read_async enter");
        let (translator, in_range) = self.prepare(segment, source_offset, length)?;
        let token = self.port.begin(IoOperation::Read, callback, context)?;

        let rc = if in_range {
            let address = translator.translate(segment, source_offset);
            // SAFETY: forwarded caller contract on `destination`.
            unsafe {
                self.driver.submit_read(
                    &self.device,
                    address,
                    destination,
                    length,
                    &self.sink,
                    token.into_handle(),
                )
            }
        } else {
            EINVAL as i32
        };
        self.finish_submit(token, IoOperation::Read, rc);

        tracing::trace!(device = %self.name(), "read_async exit");
        Ok(())
    }

    unsafe fn write_async(
        &self,
        source: *const u8,
        segment: u64,
        destination_offset: u64,
        length: u32,
        callback: IoCompletionCallback,
        context: IoCallbackContext,
    ) -> Result<(), DeviceError> {
        tracing::trace!(
            device = %self.name(),
            segment,
            destination_offset,
            length,
            "write_async enter"
        );
        let (translator, in_range) = self.prepare(segment, destination_offset, length)?;
        let token = self.port.begin(IoOperation::Write, callback, context)?;

        let rc = if in_range {
            let address = translator.translate(segment, destination_offset);
            // SAFETY: forwarded caller contract on `source`.
            unsafe {
                self.driver.submit_write(
                    &self.device,
                    source,
                    address,
                    length,
                    &self.sink,
                    token.into_handle(),
                )
            }
        } else {
            EINVAL as i32
        };
        self.finish_submit(token, IoOperation::Write, rc);

        tracing::trace!(device = %self.name(), "write_async exit");
        Ok(())
    }

    fn remove_segment(&self, segment: u64) -> Result<(), DeviceError> {
        tracing::trace!(device = %self.name(), segment, "remove_segment enter");
        // Space is not reclaimed on native namespaces.
        tracing::warn!(device = %self.name(), segment, "segment removal is a no-op on native devices");
        tracing::trace!(device = %self.name(), "remove_segment exit");
        Ok(())
    }

    fn dispose(&self) {
        self.port.dispose();
        if let Some(lease) = self.lease.lock().take() {
            let slot = lease.slot();
            drop(lease);
            tracing::debug!(device = %self.name(), slot, "disposed native device");
        }
    }

    fn stats(&self) -> DeviceStatsSnapshot {
        self.port.stats()
    }
}

impl<D: NativeDriver> Drop for NativeDevice<D> {
    fn drop(&mut self) {
        self.dispose();
    }
}
