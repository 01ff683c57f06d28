//! faster-io - Device I/O layer for a FASTER-style hybrid log
//!
//! This crate provides the segmented, asynchronous storage devices that sit
//! beneath a hybrid in-memory/on-disk log:
//! - **FileDevice**: reads and writes through the host file system, completed on
//!   a blocking thread pool
//! - **NativeDevice**: reads and writes through a poll-driven native driver
//!   (a user-space NVMe driver such as SPDK), completed by poller threads
//!
//! # Features
//!
//! - Lock-free pending-operation tracking with advisory throttling
//! - Pooled per-operation contexts resolved exactly once through integer handles
//! - Drain-before-dispose teardown
//! - TOML and environment based configuration
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use faster_io::prelude::*;
//!
//! let mut device = FileDevice::open(FileDeviceConfig::new("hlog", "/data/hlog.log"))?;
//! device.initialize(1 << 30)?;
//!
//! let buffer = AlignedBuffer::filled(512, 512, 0xAB).unwrap();
//! unsafe {
//!     device.write_async(
//!         buffer.as_ptr(),
//!         0,
//!         0,
//!         512,
//!         Box::new(|code, bytes, _ctx| assert_eq!((code, bytes), (0, 512))),
//!         Arc::new(()),
//!     )?;
//! }
//! ```

#![warn(missing_docs)]

pub mod address;
pub mod config;
pub mod device;
pub mod error;
pub mod utility;

// Re-exports for convenience
pub use address::{AddressTranslator, SegmentAddress};
pub use config::{ConfigError, DeviceConfig, FasterIoConfig};
pub use error::DeviceError;
pub use utility::AlignedBuffer;

/// Constants used throughout the library
pub mod constants {
    /// Default advisory throttle limit (operations in flight)
    pub const DEFAULT_THROTTLE_LIMIT: u64 = 256;

    /// Default sector size for file-backed devices
    pub const DEFAULT_SECTOR_SIZE: u32 = 512;

    /// Default number of completions processed per poll call
    pub const DEFAULT_POLL_BATCH: u32 = 8;
}

/// Utility for size literals (e.g., 1_GiB)
pub mod size {
    /// 1 KiB in bytes
    pub const KIB: u64 = 1024;
    /// 1 MiB in bytes
    pub const MIB: u64 = 1024 * KIB;
    /// 1 GiB in bytes
    pub const GIB: u64 = 1024 * MIB;
}

/// Prelude module for common imports
pub mod prelude {
    pub use std::sync::Arc;

    pub use crate::address::{AddressTranslator, SegmentAddress};
    pub use crate::device::{
        FileDevice, FileDeviceConfig, FileLayout, IoCallbackContext, IoCompletionCallback,
        NativeDevice, NativeDeviceConfig, PollerMode, PollerPool, PollerPoolConfig,
        StorageDevice,
    };
    pub use crate::error::DeviceError;
    pub use crate::utility::AlignedBuffer;
}
