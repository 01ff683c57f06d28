//! Shared submission and completion bookkeeping
//!
//! Both backends route every operation through a [`CompletionPort`]:
//!
//! 1. [`begin`](CompletionPort::begin) bumps the pending counter, checks out a
//!    context slot and stores the caller's callback in it.
//! 2. The backend submits the native or OS operation tagged with the slot's
//!    [`IoHandle`].
//! 3. On completion, [`complete`](CompletionPort::complete) resolves the handle,
//!    invokes the callback, releases the slot and decrements the counter, in that
//!    order, so a concurrent throttle check never under-reports work in flight.
//!    The slot and counter are retired even if the callback panics.
//!
//! A submission the backend rejects synchronously goes through
//! [`fail_submission`](CompletionPort::fail_submission) instead, which decrements
//! the counter and then runs the callback on the submitting thread.

use std::sync::Arc;

use crate::device::context_pool::{ContextToken, IoHandle, OpContextPool};
use crate::device::native_common::CompletionSink;
use crate::device::pending::PendingTracker;
use crate::device::stats::{DeviceStats, DeviceStatsSnapshot};
use crate::device::traits::{IoCallbackContext, IoCompletionCallback, IoOperation};
use crate::error::{normalize_code, DeviceError};

/// Per-device completion state shared with completion threads.
pub struct CompletionPort {
    name: Arc<str>,
    contexts: OpContextPool,
    pending: PendingTracker,
    stats: DeviceStats,
}

impl CompletionPort {
    /// Create a port for the named device
    pub fn new(name: impl Into<Arc<str>>, throttle_limit: u64) -> Self {
        Self {
            name: name.into(),
            contexts: OpContextPool::new(),
            pending: PendingTracker::new(throttle_limit),
            stats: DeviceStats::new(),
        }
    }

    /// Device name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register an operation and park its callback in a context slot.
    ///
    /// On `Err(Disposed)` nothing was registered and the callback is dropped.
    pub fn begin(
        &self,
        operation: IoOperation,
        callback: IoCompletionCallback,
        context: IoCallbackContext,
    ) -> Result<ContextToken, DeviceError> {
        self.pending.begin()?;
        let token = self.contexts.acquire();
        self.contexts.init(token, operation, callback, context);
        Ok(token)
    }

    /// Mark an operation as accepted by the backend
    pub fn submitted(&self, operation: IoOperation) {
        self.stats.record_submit(operation);
    }

    /// Unwind an operation the backend rejected synchronously.
    ///
    /// The callback runs on the calling thread with `error_code` and zero bytes.
    pub fn fail_submission(&self, token: ContextToken, error_code: u32) {
        let resolved = self.contexts.take(token);
        self.contexts.release(token);
        self.pending.end();
        self.stats.record_submit_failure();

        if tracing::enabled!(tracing::Level::DEBUG) {
            tracing::debug!(device = %self.name, error_code, "submission rejected");
        }
        match resolved {
            Some(op) => (op.callback)(error_code, 0, op.context),
            None => debug_assert!(false, "failed submission lost its context"),
        }
    }

    /// Deliver a completion. Stale or duplicate handles are ignored.
    pub fn complete(&self, token: ContextToken, error_code: u32, bytes_transferred: u32) {
        tracing::trace!(device = %self.name, handle = token.into_handle(), "completion enter");

        let Some(op) = self.contexts.take(token) else {
            if tracing::enabled!(tracing::Level::WARN) {
                tracing::warn!(
                    device = %self.name,
                    handle = token.into_handle(),
                    "completion for unknown or already resolved operation"
                );
            }
            return;
        };

        self.stats.record_completion(
            op.operation,
            error_code,
            bytes_transferred,
            op.submitted_at.elapsed(),
        );
        // Release and end still run if the callback unwinds.
        let retire = Retire { port: self, token };
        (op.callback)(error_code, bytes_transferred, op.context);
        drop(retire);

        tracing::trace!(device = %self.name, "completion exit");
    }

    /// Count background work that is not an I/O operation (such as an
    /// asynchronous segment removal) as in flight, so dispose waits for it.
    pub fn enter(&self) -> Result<(), DeviceError> {
        self.pending.begin()
    }

    /// Retire work registered with [`enter`](Self::enter)
    pub fn exit(&self) {
        self.pending.end();
    }

    /// Drain in-flight operations and refuse new ones
    pub fn dispose(&self) {
        self.pending.dispose();
    }

    /// Whether teardown has started
    pub fn is_disposed(&self) -> bool {
        self.pending.is_disposed()
    }

    /// Advisory throttle signal
    pub fn throttled(&self) -> bool {
        self.pending.throttled()
    }

    /// Operations currently in flight
    pub fn pending_operations(&self) -> u64 {
        self.pending.pending()
    }

    /// Context slots currently checked out
    pub fn outstanding_contexts(&self) -> usize {
        self.contexts.outstanding()
    }

    /// Statistics snapshot
    pub fn stats(&self) -> DeviceStatsSnapshot {
        self.stats.snapshot()
    }
}

/// Returns a resolved slot to the pool and retires its pending count on drop.
struct Retire<'a> {
    port: &'a CompletionPort,
    token: ContextToken,
}

impl Drop for Retire<'_> {
    fn drop(&mut self) {
        self.port.contexts.release(self.token);
        self.port.pending.end();
        if std::thread::panicking() {
            tracing::error!(device = %self.port.name, "completion callback panicked");
        }
    }
}

/// Native drivers hand completions back through the port: the handle is decoded
/// into the waiting context and the driver's (possibly negated) result code is
/// normalized before the caller sees it.
impl CompletionSink for CompletionPort {
    fn complete(&self, handle: IoHandle, result: i32, bytes_transferred: u32) {
        CompletionPort::complete(
            self,
            ContextToken::from_handle(handle),
            normalize_code(result),
            bytes_transferred,
        );
    }
}
