//! SPDK driver binding
//!
//! Binds the C shim `libspdk_io_device`, which wraps one SPDK NVMe queue pair
//! per device handle. The shim reports completions through a C function pointer
//! plus a `void *` context; here the context is a boxed [`Trampoline`] holding the
//! completion sink and the integer handle, reclaimed exactly once either by the
//! completion trampoline or by the submitter when the shim rejects the request.
//!
//! SPDK queue pairs are not thread safe. Once `begin_poll` has attached the
//! shim's poller thread, submissions are forwarded to it through a ring, so this
//! driver only supports [`PollerMode::Pinned`](crate::device::PollerMode::Pinned).

use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::device::native_common::{CompletionSink, IoHandle, NativeDriver};

mod ffi {
    use std::ffi::c_void;

    #[repr(C)]
    pub struct spdk_io_device {
        _private: [u8; 0],
    }

    pub type AsyncIoCallback =
        extern "C" fn(context: *mut c_void, result: i32, bytes_transferred: u32);

    #[link(name = "spdk_io_device")]
    extern "C" {
        #[link_name = "init"]
        pub fn spdk_io_device_init() -> i32;

        pub fn spdk_io_device_get_ns_size(nsid: i32) -> u64;

        pub fn spdk_io_device_get_ns_sector_size(nsid: i32) -> u32;

        pub fn spdk_io_device_create(nsid: u32) -> *mut spdk_io_device;

        pub fn spdk_io_device_destroy(io_device: *mut spdk_io_device);

        pub fn spdk_io_device_read_async(
            io_device: *mut spdk_io_device,
            source: u64,
            dest: *mut c_void,
            length: u32,
            callback: AsyncIoCallback,
            callback_context: *mut c_void,
        ) -> i32;

        pub fn spdk_io_device_write_async(
            io_device: *mut spdk_io_device,
            source: *const c_void,
            dest: u64,
            length: u32,
            callback: AsyncIoCallback,
            callback_context: *mut c_void,
        ) -> i32;

        pub fn spdk_io_device_poll(io_device: *mut spdk_io_device, batch_num: u32) -> i32;

        pub fn spdk_io_device_begin_poll(io_device: *mut spdk_io_device, affinity: i32) -> i32;

        pub fn spdk_io_device_stop_poll(io_device: *mut spdk_io_device);
    }
}

/// Handle to one shim device (an NVMe queue pair)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpdkIoDevice(NonNull<ffi::spdk_io_device>);

// SAFETY: the shim serializes access through its poller ring once polling has
// begun, and handles are only destroyed by the pool after every lease is gone.
unsafe impl Send for SpdkIoDevice {}
unsafe impl Sync for SpdkIoDevice {}

impl SpdkIoDevice {
    fn as_ptr(self) -> *mut ffi::spdk_io_device {
        self.0.as_ptr()
    }
}

struct Trampoline {
    sink: Arc<dyn CompletionSink>,
    handle: IoHandle,
}

impl Trampoline {
    fn into_raw(sink: &Arc<dyn CompletionSink>, handle: IoHandle) -> *mut c_void {
        Box::into_raw(Box::new(Self {
            sink: Arc::clone(sink),
            handle,
        })) as *mut c_void
    }

    /// # Safety
    /// `raw` must come from [`Trampoline::into_raw`] and not have been reclaimed.
    unsafe fn from_raw(raw: *mut c_void) -> Box<Self> {
        unsafe { Box::from_raw(raw as *mut Self) }
    }
}

extern "C" fn complete_trampoline(context: *mut c_void, result: i32, bytes_transferred: u32) {
    // SAFETY: the shim invokes the callback once with the context we submitted.
    let trampoline = unsafe { Trampoline::from_raw(context) };
    // Unwinding out of an `extern "C"` function aborts.
    let delivered = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        trampoline
            .sink
            .complete(trampoline.handle, result, bytes_transferred)
    }));
    if delivered.is_err() {
        tracing::error!(handle = trampoline.handle, "completion callback panicked");
    }
}

/// SPDK NVMe driver accessed through the C shim.
#[derive(Debug, Default)]
pub struct SpdkDriver;

impl SpdkDriver {
    /// Create the driver. Initialization happens when a pool is built.
    pub fn new() -> Self {
        Self
    }
}

fn nsid_arg(nsid: u32) -> i32 {
    i32::try_from(nsid).unwrap_or(i32::MAX)
}

impl NativeDriver for SpdkDriver {
    type Device = SpdkIoDevice;

    fn init(&self) -> i32 {
        // SAFETY: plain C call; the pool calls it once.
        unsafe { ffi::spdk_io_device_init() }
    }

    fn ns_size(&self, nsid: u32) -> u64 {
        unsafe { ffi::spdk_io_device_get_ns_size(nsid_arg(nsid)) }
    }

    fn ns_sector_size(&self, nsid: u32) -> u32 {
        unsafe { ffi::spdk_io_device_get_ns_sector_size(nsid_arg(nsid)) }
    }

    fn create(&self, nsid: u32) -> Option<SpdkIoDevice> {
        NonNull::new(unsafe { ffi::spdk_io_device_create(nsid) }).map(SpdkIoDevice)
    }

    fn destroy(&self, device: SpdkIoDevice) {
        // The shim stops its poller before freeing the queue pair.
        unsafe { ffi::spdk_io_device_destroy(device.as_ptr()) }
    }

    unsafe fn submit_read(
        &self,
        device: &SpdkIoDevice,
        source: u64,
        destination: *mut u8,
        length: u32,
        sink: &Arc<dyn CompletionSink>,
        handle: IoHandle,
    ) -> i32 {
        let context = Trampoline::into_raw(sink, handle);
        let rc = unsafe {
            ffi::spdk_io_device_read_async(
                device.as_ptr(),
                source,
                destination as *mut c_void,
                length,
                complete_trampoline,
                context,
            )
        };
        if rc != 0 {
            drop(unsafe { Trampoline::from_raw(context) });
        }
        rc
    }

    unsafe fn submit_write(
        &self,
        device: &SpdkIoDevice,
        source: *const u8,
        destination: u64,
        length: u32,
        sink: &Arc<dyn CompletionSink>,
        handle: IoHandle,
    ) -> i32 {
        let context = Trampoline::into_raw(sink, handle);
        let rc = unsafe {
            ffi::spdk_io_device_write_async(
                device.as_ptr(),
                source as *const c_void,
                destination,
                length,
                complete_trampoline,
                context,
            )
        };
        if rc != 0 {
            drop(unsafe { Trampoline::from_raw(context) });
        }
        rc
    }

    fn poll(&self, device: &SpdkIoDevice, batch: u32) -> i32 {
        unsafe { ffi::spdk_io_device_poll(device.as_ptr(), batch) }
    }

    fn begin_poll(&self, device: &SpdkIoDevice, affinity: i32) -> i32 {
        unsafe { ffi::spdk_io_device_begin_poll(device.as_ptr(), affinity) }
    }

    fn stop_poll(&self, device: &SpdkIoDevice) {
        unsafe { ffi::spdk_io_device_stop_poll(device.as_ptr()) }
    }

    fn thread_safe_submission(&self) -> bool {
        false
    }
}
