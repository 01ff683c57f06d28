//! In-flight operation tracking
//!
//! One atomic counter per device drives both back-pressure and teardown. `begin`
//! increments before submission and `end` decrements after the completion (or
//! the synchronous failure) has been delivered. Teardown swaps the counter from
//! zero to a large negative sentinel, after which every `begin` fails.

use std::sync::atomic::{AtomicI64, Ordering};
use std::thread;

use crate::error::DeviceError;

/// Counter value held once the device is disposed
pub const DISPOSED: i64 = i64::MIN;

/// Atomic in-flight counter with an advisory throttle limit.
#[derive(Debug)]
pub struct PendingTracker {
    pending: AtomicI64,
    throttle_limit: u64,
}

impl PendingTracker {
    /// Create a tracker that reports saturation above `throttle_limit`
    pub fn new(throttle_limit: u64) -> Self {
        Self {
            pending: AtomicI64::new(0),
            throttle_limit,
        }
    }

    /// Register a new in-flight operation.
    ///
    /// Fails with [`DeviceError::Disposed`] once teardown has claimed the counter;
    /// the counter is left at the sentinel in that case.
    #[inline]
    pub fn begin(&self) -> Result<(), DeviceError> {
        if self.pending.fetch_add(1, Ordering::AcqRel) < 0 {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            return Err(DeviceError::Disposed);
        }
        Ok(())
    }

    /// Retire an in-flight operation
    #[inline]
    pub fn end(&self) {
        let prev = self.pending.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "pending counter underflow");
    }

    /// Current in-flight count (zero once disposed)
    #[inline]
    pub fn pending(&self) -> u64 {
        u64::try_from(self.pending.load(Ordering::Acquire)).unwrap_or(0)
    }

    /// True while the live count strictly exceeds the throttle limit
    #[inline]
    pub fn throttled(&self) -> bool {
        self.pending.load(Ordering::Acquire) > i64::try_from(self.throttle_limit).unwrap_or(i64::MAX)
    }

    /// Configured throttle limit
    pub fn throttle_limit(&self) -> u64 {
        self.throttle_limit
    }

    /// Whether teardown has claimed the counter
    pub fn is_disposed(&self) -> bool {
        self.pending.load(Ordering::Acquire) < 0
    }

    /// Block until every in-flight operation has drained, then claim the
    /// disposed state. Returns immediately if already disposed.
    pub fn dispose(&self) {
        while self.pending.load(Ordering::Acquire) >= 0 {
            if self
                .pending
                .compare_exchange(0, DISPOSED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
            thread::yield_now();
        }
    }
}
