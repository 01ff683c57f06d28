//! Native driver boundary
//!
//! A native driver is a poll-driven I/O engine (a user-space NVMe driver such as
//! SPDK) that never calls back on its own: completions are discovered only when a
//! thread polls the device handle. The driver identifies each operation by the
//! single integer [`IoHandle`] supplied at submission and hands it back, together
//! with a result code, to the [`CompletionSink`] supplied alongside it.
//!
//! [`NativeDriver`] mirrors the narrow C surface of such a driver. Only
//! [`NativeDevice`](crate::device::NativeDevice) and the
//! [`PollerPool`](crate::device::PollerPool) talk to it.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam::utils::Backoff;

pub use crate::device::context_pool::IoHandle;

/// Receives completions discovered while polling.
///
/// `result` is `0` on success or an errno value, possibly negated.
pub trait CompletionSink: Send + Sync {
    /// Deliver one completion
    fn complete(&self, handle: IoHandle, result: i32, bytes_transferred: u32);
}

/// Poll-driven native I/O driver.
///
/// Result codes follow the C convention: `0` is success, anything else is an
/// errno-style failure whose sign is driver specific.
pub trait NativeDriver: Send + Sync + 'static {
    /// Handle to one native device (an I/O queue pair on a namespace).
    ///
    /// Cloning yields another reference to the same queue, not a new queue.
    type Device: Clone + Send + Sync + 'static;

    /// One-time driver initialization. Called once per process-scoped pool.
    fn init(&self) -> i32;

    /// Size of namespace `nsid` in bytes (0 if unknown)
    fn ns_size(&self, nsid: u32) -> u64;

    /// Sector size of namespace `nsid` in bytes (0 if unknown)
    fn ns_sector_size(&self, nsid: u32) -> u32;

    /// Create a device handle on namespace `nsid`
    fn create(&self, nsid: u32) -> Option<Self::Device>;

    /// Destroy a device handle. Stops any driver-owned poller first.
    fn destroy(&self, device: Self::Device);

    /// Submit a read of `length` bytes at byte address `source`.
    ///
    /// A nonzero return means the operation was not accepted and `sink` will
    /// never see `handle`.
    ///
    /// # Safety
    /// `destination` must be valid for writes of `length` bytes until `sink`
    /// receives `handle`.
    unsafe fn submit_read(
        &self,
        device: &Self::Device,
        source: u64,
        destination: *mut u8,
        length: u32,
        sink: &Arc<dyn CompletionSink>,
        handle: IoHandle,
    ) -> i32;

    /// Submit a write of `length` bytes to byte address `destination`.
    ///
    /// # Safety
    /// `source` must be valid for reads of `length` bytes for the duration of
    /// the call. Drivers stage the payload before returning.
    unsafe fn submit_write(
        &self,
        device: &Self::Device,
        source: *const u8,
        destination: u64,
        length: u32,
        sink: &Arc<dyn CompletionSink>,
        handle: IoHandle,
    ) -> i32;

    /// Process up to `batch` completions on the calling thread.
    ///
    /// Returns the number of completions delivered, or a negative code.
    fn poll(&self, device: &Self::Device, batch: u32) -> i32;

    /// Start a driver-owned poller for `device`, pinned to core `affinity`
    /// (negative for no pinning). Fails if the device is already being polled.
    fn begin_poll(&self, device: &Self::Device, affinity: i32) -> i32;

    /// Stop the driver-owned poller started by `begin_poll`
    fn stop_poll(&self, device: &Self::Device);

    /// Whether submissions may race with a poller thread that is not owned by
    /// the driver. Drivers whose queues are single-threaded return `false` and
    /// must be used with driver-owned pollers.
    fn thread_safe_submission(&self) -> bool {
        true
    }
}

/// Call `poll` until `stop` is set, backing off while idle. After `stop` is
/// observed, keeps polling until a call reports no completions so stragglers
/// are still delivered.
///
/// A panic raised by a completion callback is logged and the loop keeps
/// running, so one caller's bug does not strand every later completion on the
/// handle.
pub fn poll_until_stopped(stop: &AtomicBool, mut poll: impl FnMut() -> i32) {
    let backoff = Backoff::new();
    while !stop.load(Ordering::Acquire) {
        if poll_once(&mut poll) > 0 {
            backoff.reset();
        } else if backoff.is_completed() {
            thread::park_timeout(Duration::from_micros(50));
        } else {
            backoff.snooze();
        }
    }
    while poll_once(&mut poll) > 0 {}
}

fn poll_once(poll: &mut impl FnMut() -> i32) -> i32 {
    match panic::catch_unwind(AssertUnwindSafe(poll)) {
        Ok(n) => n,
        Err(_) => {
            tracing::error!("poll loop recovered from a panicking completion");
            // Made progress before the panic; poll again immediately.
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn test_poll_until_stopped_drains_after_stop() {
        let stop = AtomicBool::new(true);
        let mut remaining = 3;
        let calls = AtomicU32::new(0);
        poll_until_stopped(&stop, || {
            calls.fetch_add(1, Ordering::Relaxed);
            if remaining > 0 {
                remaining -= 1;
                1
            } else {
                0
            }
        });
        assert_eq!(remaining, 0);
        assert_eq!(calls.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn test_poll_until_stopped_survives_panics() {
        let stop = AtomicBool::new(true);
        let calls = AtomicU32::new(0);
        poll_until_stopped(&stop, || match calls.fetch_add(1, Ordering::Relaxed) {
            0 => panic!("callback bug"),
            1 => 1,
            _ => 0,
        });
        assert_eq!(calls.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn test_poll_until_stopped_runs_until_flag() {
        let stop = Arc::new(AtomicBool::new(false));
        let calls = Arc::new(AtomicU32::new(0));
        let handle = {
            let stop = Arc::clone(&stop);
            let calls = Arc::clone(&calls);
            thread::spawn(move || {
                poll_until_stopped(&stop, || {
                    calls.fetch_add(1, Ordering::Relaxed);
                    0
                })
            })
        };
        while calls.load(Ordering::Relaxed) < 10 {
            thread::yield_now();
        }
        stop.store(true, Ordering::Release);
        handle.join().unwrap();
        assert!(calls.load(Ordering::Relaxed) >= 10);
    }
}
