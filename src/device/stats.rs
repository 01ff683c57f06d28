//! Per-device I/O statistics

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::device::traits::IoOperation;

/// Lock-free I/O counters updated on the submit and completion paths.
#[derive(Debug, Default)]
pub struct DeviceStats {
    reads_submitted: AtomicU64,
    reads_completed: AtomicU64,
    writes_submitted: AtomicU64,
    writes_completed: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    read_errors: AtomicU64,
    write_errors: AtomicU64,
    submit_failures: AtomicU64,
    total_read_latency_ns: AtomicU64,
    total_write_latency_ns: AtomicU64,
}

impl DeviceStats {
    /// Create zeroed statistics
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an accepted submission
    pub fn record_submit(&self, op: IoOperation) {
        match op {
            IoOperation::Read => self.reads_submitted.fetch_add(1, Ordering::Relaxed),
            IoOperation::Write => self.writes_submitted.fetch_add(1, Ordering::Relaxed),
        };
    }

    /// Record a submission the backend rejected synchronously
    pub fn record_submit_failure(&self) {
        self.submit_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a completion. A nonzero `error_code` counts as an error.
    pub fn record_completion(&self, op: IoOperation, error_code: u32, bytes: u32, latency: Duration) {
        let latency_ns = u64::try_from(latency.as_nanos()).unwrap_or(u64::MAX);
        match (op, error_code) {
            (IoOperation::Read, 0) => {
                self.reads_completed.fetch_add(1, Ordering::Relaxed);
                self.bytes_read.fetch_add(u64::from(bytes), Ordering::Relaxed);
                self.total_read_latency_ns.fetch_add(latency_ns, Ordering::Relaxed);
            }
            (IoOperation::Write, 0) => {
                self.writes_completed.fetch_add(1, Ordering::Relaxed);
                self.bytes_written.fetch_add(u64::from(bytes), Ordering::Relaxed);
                self.total_write_latency_ns.fetch_add(latency_ns, Ordering::Relaxed);
            }
            (IoOperation::Read, _) => {
                self.read_errors.fetch_add(1, Ordering::Relaxed);
            }
            (IoOperation::Write, _) => {
                self.write_errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Take a consistent-enough snapshot for reporting
    pub fn snapshot(&self) -> DeviceStatsSnapshot {
        let reads_completed = self.reads_completed.load(Ordering::Relaxed);
        let writes_completed = self.writes_completed.load(Ordering::Relaxed);
        let read_ns = self.total_read_latency_ns.load(Ordering::Relaxed);
        let write_ns = self.total_write_latency_ns.load(Ordering::Relaxed);
        DeviceStatsSnapshot {
            reads_submitted: self.reads_submitted.load(Ordering::Relaxed),
            reads_completed,
            writes_submitted: self.writes_submitted.load(Ordering::Relaxed),
            writes_completed,
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            read_errors: self.read_errors.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
            submit_failures: self.submit_failures.load(Ordering::Relaxed),
            avg_read_latency_us: (read_ns / reads_completed.max(1)) / 1000,
            avg_write_latency_us: (write_ns / writes_completed.max(1)) / 1000,
        }
    }
}

/// Point-in-time copy of [`DeviceStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceStatsSnapshot {
    /// Total reads accepted by the backend
    pub reads_submitted: u64,
    /// Reads completed successfully
    pub reads_completed: u64,
    /// Total writes accepted by the backend
    pub writes_submitted: u64,
    /// Writes completed successfully
    pub writes_completed: u64,
    /// Total bytes read
    pub bytes_read: u64,
    /// Total bytes written
    pub bytes_written: u64,
    /// Reads that completed with an error
    pub read_errors: u64,
    /// Writes that completed with an error
    pub write_errors: u64,
    /// Operations rejected at submission
    pub submit_failures: u64,
    /// Average read latency in microseconds
    pub avg_read_latency_us: u64,
    /// Average write latency in microseconds
    pub avg_write_latency_us: u64,
}

impl DeviceStatsSnapshot {
    /// Reads accepted but not yet completed
    pub fn pending_reads(&self) -> u64 {
        self.reads_submitted
            .saturating_sub(self.reads_completed + self.read_errors)
    }

    /// Writes accepted but not yet completed
    pub fn pending_writes(&self) -> u64 {
        self.writes_submitted
            .saturating_sub(self.writes_completed + self.write_errors)
    }
}
