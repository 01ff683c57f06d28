//! Device errors and I/O completion codes
//!
//! Per-operation outcomes never travel through `Result`: they are delivered to the
//! completion callback as an errno-style `u32` code where `0` means success.
//! `DeviceError` covers everything else (lifecycle misuse, configuration and
//! native driver setup).

use std::io;
use std::time::Duration;

/// Completion code for a successful operation
pub const OK: u32 = 0;
/// I/O error
pub const EIO: u32 = 5;
/// Out of memory
pub const ENOMEM: u32 = 12;
/// Resource busy
pub const EBUSY: u32 = 16;
/// Invalid argument (misaligned length, out-of-range address)
pub const EINVAL: u32 = 22;
/// No buffer space available (driver submission queue full)
pub const ENOBUFS: u32 = 105;

/// Map an `io::Error` to a completion code.
pub fn io_error_code(err: &io::Error) -> u32 {
    match err.raw_os_error() {
        Some(code) => normalize_code(code),
        None => match err.kind() {
            io::ErrorKind::InvalidInput => EINVAL,
            io::ErrorKind::OutOfMemory => ENOMEM,
            _ => EIO,
        },
    }
}

/// Normalize a driver result code.
///
/// Native drivers report failures as negated errno values; callers always see the
/// absolute value.
#[inline]
pub const fn normalize_code(code: i32) -> u32 {
    code.unsigned_abs()
}

/// Errors returned by device lifecycle and setup operations.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    /// The device has been disposed; no further I/O may start.
    #[error("cannot operate on disposed device")]
    Disposed,
    /// An I/O method was called before `initialize`.
    #[error("device not initialized")]
    NotInitialized,
    /// `initialize` was called twice.
    #[error("device already initialized")]
    AlreadyInitialized,
    /// Segment size rejected by `initialize`.
    #[error("invalid segment size {segment_size}: {reason}")]
    InvalidSegmentSize {
        /// Requested segment size in bytes.
        segment_size: u64,
        /// Why it was rejected.
        reason: &'static str,
    },
    /// The native driver failed its one-time initialization.
    #[error("native driver initialization failed with code {0}")]
    DriverInit(i32),
    /// The configured namespace does not exist on the native driver.
    #[error("namespace {nsid} not found")]
    NamespaceNotFound {
        /// Namespace id.
        nsid: u32,
    },
    /// The native driver could not create a device handle.
    #[error("failed to create native device for namespace {nsid}")]
    NativeCreate {
        /// Namespace id.
        nsid: u32,
    },
    /// The native driver refused to start polling a handle.
    #[error("failed to start polling native device (code {code})")]
    BeginPoll {
        /// Driver return code.
        code: i32,
    },
    /// No polling slot became available. This is a configuration error.
    #[error("no polling slot available after {waited:?} ({slots} slots configured)")]
    PollerExhausted {
        /// Number of slots in the pool.
        slots: usize,
        /// How long the caller waited.
        waited: Duration,
    },
    /// Invalid device or pool configuration.
    #[error("invalid device configuration: {0}")]
    InvalidConfig(String),
    /// I/O error while opening or removing backing storage.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}
