//! Storage devices for the hybrid log
//!
//! This module provides the segmented asynchronous device contract and its two
//! backends: [`FileDevice`] on host files and [`NativeDevice`] on a poll-driven
//! native driver.

mod completion;
mod context_pool;
mod file_device;
mod native_common;
mod native_device;
mod native_memory;
mod native_pool;
#[cfg(feature = "spdk")]
mod native_spdk;
mod pending;
mod stats;
mod traits;

pub use completion::CompletionPort;
pub use context_pool::{ContextToken, IoHandle, OpContextPool, ResolvedOp};
pub use file_device::{FileDevice, FileDeviceConfig, FileLayout};
pub use native_common::{poll_until_stopped, CompletionSink, NativeDriver};
pub use native_device::{NativeDevice, NativeDeviceConfig};
pub use native_memory::{MemoryDriver, MemoryNamespace, MemoryQpair};
pub use native_pool::{PollerLease, PollerMode, PollerPool, PollerPoolConfig};
#[cfg(feature = "spdk")]
pub use native_spdk::{SpdkDriver, SpdkIoDevice};
pub use pending::{PendingTracker, DISPOSED};
pub use stats::{DeviceStats, DeviceStatsSnapshot};
pub use traits::{
    IoCallbackContext, IoCompletionCallback, IoOperation, RemoveSegmentCallback, StorageDevice,
};
