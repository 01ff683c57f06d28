//! Storage device traits for the hybrid log
//!
//! This module defines the contract every device backend implements. The hybrid
//! log owns one device per log, calls `initialize` once with its segment size, and
//! then issues asynchronous reads and writes from many threads.

use std::any::Any;
use std::sync::Arc;

use crate::device::stats::DeviceStatsSnapshot;
use crate::error::DeviceError;

/// Opaque, engine-owned context handed back to the completion callback.
pub type IoCallbackContext = Arc<dyn Any + Send + Sync>;

/// Completion callback: `(error_code, bytes_transferred, context)`.
///
/// `error_code == 0` means success. The callback runs exactly once, either
/// synchronously inside `read_async`/`write_async` (submission failure) or later
/// on a completion thread.
pub type IoCompletionCallback = Box<dyn FnOnce(u32, u32, IoCallbackContext) + Send + 'static>;

/// Continuation for [`StorageDevice::remove_segment_async`].
pub type RemoveSegmentCallback = Box<dyn FnOnce(Result<(), DeviceError>) + Send + 'static>;

/// Operation type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOperation {
    /// Read operation
    Read,
    /// Write operation
    Write,
}

/// Segmented asynchronous storage device.
///
/// Implementations: [`FileDevice`](crate::device::FileDevice) (OS file I/O) and
/// [`NativeDevice`](crate::device::NativeDevice) (poll-driven native driver).
pub trait StorageDevice: Send + Sync {
    /// Device name, used for tracing
    fn name(&self) -> &str;

    /// Sector size in bytes, fixed at open time
    fn sector_size(&self) -> u32;

    /// Capacity in bytes, if known.
    ///
    /// After `initialize` this is a whole multiple of the segment size.
    fn capacity(&self) -> Option<u64>;

    /// Segment size in bytes, once initialized
    fn segment_size(&self) -> Option<u64>;

    /// Configure the segment size. Must be called once, before any I/O.
    fn initialize(&mut self, segment_size: u64) -> Result<(), DeviceError>;

    /// Advisory back-pressure signal: true while more operations are in flight
    /// than the configured throttle limit.
    fn throttle(&self) -> bool;

    /// Number of operations currently in flight
    fn pending_operations(&self) -> u64;

    /// Read `length` bytes at (`segment`, `source_offset`) into `destination`.
    ///
    /// Returns `Err(DeviceError::Disposed)` without submitting once the device is
    /// being disposed; the callback is dropped in that case. Every other outcome,
    /// including submission failures, is reported through `callback`.
    ///
    /// # Safety
    /// `destination` must be valid for writes of `length` bytes and must not be
    /// accessed by the caller until the callback has run.
    unsafe fn read_async(
        &self,
        segment: u64,
        source_offset: u64,
        destination: *mut u8,
        length: u32,
        callback: IoCompletionCallback,
        context: IoCallbackContext,
    ) -> Result<(), DeviceError>;

    /// Write `length` bytes from `source` to (`segment`, `destination_offset`).
    ///
    /// Same delivery contract as [`read_async`](Self::read_async).
    ///
    /// # Safety
    /// `source` must be valid for reads of `length` bytes and must not be
    /// modified until the callback has run.
    unsafe fn write_async(
        &self,
        source: *const u8,
        segment: u64,
        destination_offset: u64,
        length: u32,
        callback: IoCompletionCallback,
        context: IoCallbackContext,
    ) -> Result<(), DeviceError>;

    /// Remove a segment's backing storage.
    fn remove_segment(&self, segment: u64) -> Result<(), DeviceError>;

    /// Remove a segment and then invoke `callback` with the result.
    ///
    /// Backends whose removal is synchronous invoke the callback before returning.
    fn remove_segment_async(&self, segment: u64, callback: RemoveSegmentCallback) {
        callback(self.remove_segment(segment));
    }

    /// Wait for all in-flight operations to drain, refuse new ones, and release
    /// backend resources. Idempotent.
    fn dispose(&self);

    /// Snapshot of the device's I/O statistics
    fn stats(&self) -> DeviceStatsSnapshot;
}
