//! In-process poll-driven driver
//!
//! `MemoryDriver` behaves like a user-space NVMe driver without any hardware:
//! namespaces are sparse in-memory byte arrays, submissions are queued on the
//! device handle, and nothing completes until someone polls. Writes are staged
//! at submission and reads are copied out at completion, like a DMA bounce
//! buffer. Completion failures are reported as negated errno values.
//!
//! It backs [`NativeDevice`](crate::device::NativeDevice) on hosts without SPDK
//! and in tests, where its fault hooks exercise the error paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::queue::SegQueue;
use parking_lot::Mutex;

use crate::device::native_common::{poll_until_stopped, CompletionSink, IoHandle, NativeDriver};
use crate::error::EINVAL;

/// Granularity of the sparse namespace storage
const CHUNK_SIZE: usize = 1 << 16;

/// Completions processed per poll by a driver-owned poller
const DRIVER_POLL_BATCH: u32 = 8;

/// Sparse in-memory namespace
pub struct MemoryNamespace {
    nsid: u32,
    size: u64,
    sector_size: u32,
    chunks: Mutex<HashMap<u64, Box<[u8]>>>,
}

impl MemoryNamespace {
    fn new(nsid: u32, size: u64, sector_size: u32) -> Self {
        Self {
            nsid,
            size,
            sector_size,
            chunks: Mutex::new(HashMap::new()),
        }
    }

    /// Namespace id
    pub fn nsid(&self) -> u32 {
        self.nsid
    }

    /// Bytes currently backed by memory
    pub fn resident_bytes(&self) -> usize {
        self.chunks.lock().len() * CHUNK_SIZE
    }

    fn read(&self, mut address: u64, mut dst: &mut [u8]) {
        let chunks = self.chunks.lock();
        while !dst.is_empty() {
            let within = (address % CHUNK_SIZE as u64) as usize;
            let n = dst.len().min(CHUNK_SIZE - within);
            let (head, tail) = dst.split_at_mut(n);
            match chunks.get(&(address / CHUNK_SIZE as u64)) {
                Some(chunk) => head.copy_from_slice(&chunk[within..within + n]),
                None => head.fill(0),
            }
            dst = tail;
            address += n as u64;
        }
    }

    fn write(&self, mut address: u64, mut src: &[u8]) {
        let mut chunks = self.chunks.lock();
        while !src.is_empty() {
            let within = (address % CHUNK_SIZE as u64) as usize;
            let n = src.len().min(CHUNK_SIZE - within);
            let chunk = chunks
                .entry(address / CHUNK_SIZE as u64)
                .or_insert_with(|| vec![0u8; CHUNK_SIZE].into_boxed_slice());
            chunk[within..within + n].copy_from_slice(&src[..n]);
            src = &src[n..];
            address += n as u64;
        }
    }
}

#[derive(Default)]
struct FaultState {
    next_submission: AtomicI32,
    completion_count: AtomicU32,
    completion_code: AtomicI32,
}

impl FaultState {
    fn take_submission_fault(&self) -> i32 {
        self.next_submission.swap(0, Ordering::AcqRel)
    }

    fn take_completion_fault(&self) -> Option<i32> {
        self.completion_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .ok()
            .map(|_| self.completion_code.load(Ordering::Acquire))
    }
}

struct DestinationPtr(*mut u8);

// Safety: the submitter guarantees the destination stays valid until completion.
unsafe impl Send for DestinationPtr {}

impl DestinationPtr {
    fn get(&self) -> *mut u8 {
        self.0
    }
}

enum QueuedKind {
    Read(DestinationPtr),
    Write(Vec<u8>),
}

struct QueuedIo {
    kind: QueuedKind,
    address: u64,
    length: u32,
    sink: Arc<dyn CompletionSink>,
    handle: IoHandle,
}

struct DriverPoller {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

struct QpairInner {
    namespace: Arc<MemoryNamespace>,
    faults: Arc<FaultState>,
    queue: SegQueue<QueuedIo>,
    poll_lock: Mutex<()>,
    poller: Mutex<Option<DriverPoller>>,
    affinity: AtomicI32,
}

/// Device handle of a [`MemoryDriver`]: one submission/completion queue.
#[derive(Clone)]
pub struct MemoryQpair(Arc<QpairInner>);

impl MemoryQpair {
    /// Namespace this queue targets
    pub fn namespace(&self) -> &Arc<MemoryNamespace> {
        &self.0.namespace
    }

    /// Submissions not yet completed
    pub fn queued(&self) -> usize {
        self.0.queue.len()
    }

    /// Whether a driver-owned poller is attached
    pub fn is_polling(&self) -> bool {
        self.0.poller.lock().is_some()
    }

    /// Core the driver-owned poller was pinned to (-1 if none)
    pub fn affinity(&self) -> i32 {
        self.0.affinity.load(Ordering::Acquire)
    }

    /// Whether two handles refer to the same queue
    pub fn same_queue(&self, other: &MemoryQpair) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    fn process(&self, batch: u32) -> i32 {
        // A queue is polled by at most one thread at a time.
        let Some(_guard) = self.0.poll_lock.try_lock() else {
            return 0;
        };

        let mut done = 0;
        while done < batch {
            let Some(io) = self.0.queue.pop() else {
                break;
            };
            let (result, bytes) = match self.0.faults.take_completion_fault() {
                Some(code) => (code, 0),
                None => {
                    match &io.kind {
                        QueuedKind::Read(dst) => {
                            // SAFETY: guaranteed valid by the submit_read caller.
                            let dst = unsafe {
                                std::slice::from_raw_parts_mut(dst.get(), io.length as usize)
                            };
                            self.0.namespace.read(io.address, dst);
                        }
                        QueuedKind::Write(data) => self.0.namespace.write(io.address, data),
                    }
                    (0, io.length)
                }
            };
            io.sink.complete(io.handle, result, bytes);
            done += 1;
        }
        done as i32
    }

    fn validate(&self, address: u64, length: u32) -> i32 {
        let ns = &self.0.namespace;
        if length % ns.sector_size != 0 {
            if tracing::enabled!(tracing::Level::DEBUG) {
                tracing::debug!(length, sector_size = ns.sector_size, "io size is not sector aligned");
            }
            return EINVAL as i32;
        }
        match address.checked_add(u64::from(length)) {
            Some(end) if end <= ns.size => 0,
            _ => EINVAL as i32,
        }
    }
}

/// Poll-driven in-memory driver.
pub struct MemoryDriver {
    namespaces: Vec<Arc<MemoryNamespace>>,
    faults: Arc<FaultState>,
    initialized: AtomicBool,
}

impl MemoryDriver {
    /// Create a driver with no namespaces
    pub fn new() -> Self {
        Self {
            namespaces: Vec::new(),
            faults: Arc::new(FaultState::default()),
            initialized: AtomicBool::new(false),
        }
    }

    /// Add a namespace of `size` bytes with the given sector size
    pub fn with_namespace(mut self, nsid: u32, size: u64, sector_size: u32) -> Self {
        self.namespaces
            .push(Arc::new(MemoryNamespace::new(nsid, size, sector_size)));
        self
    }

    /// Whether `init` has succeeded
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Make the next submission return `code` without queueing
    pub fn fail_next_submission(&self, code: i32) {
        self.faults.next_submission.store(code, Ordering::Release);
    }

    /// Make the next `count` completions report `code` (drivers report negated
    /// errno values, e.g. `-5`)
    pub fn fail_next_completions(&self, count: u32, code: i32) {
        self.faults.completion_code.store(code, Ordering::Release);
        self.faults.completion_count.store(count, Ordering::Release);
    }

    fn namespace(&self, nsid: u32) -> Option<&Arc<MemoryNamespace>> {
        self.namespaces.iter().find(|ns| ns.nsid == nsid)
    }

    fn enqueue(&self, device: &MemoryQpair, io: QueuedIo) -> i32 {
        let fault = self.faults.take_submission_fault();
        if fault != 0 {
            return fault;
        }
        device.0.queue.push(io);
        0
    }
}

impl Default for MemoryDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl NativeDriver for MemoryDriver {
    type Device = MemoryQpair;

    fn init(&self) -> i32 {
        if self.namespaces.is_empty() {
            tracing::warn!("no namespace found");
            return 1;
        }
        self.initialized.store(true, Ordering::Release);
        0
    }

    fn ns_size(&self, nsid: u32) -> u64 {
        self.namespace(nsid).map_or(0, |ns| ns.size)
    }

    fn ns_sector_size(&self, nsid: u32) -> u32 {
        self.namespace(nsid).map_or(0, |ns| ns.sector_size)
    }

    fn create(&self, nsid: u32) -> Option<MemoryQpair> {
        let namespace = Arc::clone(self.namespace(nsid)?);
        Some(MemoryQpair(Arc::new(QpairInner {
            namespace,
            faults: Arc::clone(&self.faults),
            queue: SegQueue::new(),
            poll_lock: Mutex::new(()),
            poller: Mutex::new(None),
            affinity: AtomicI32::new(-1),
        })))
    }

    fn destroy(&self, device: MemoryQpair) {
        self.stop_poll(&device);
    }

    unsafe fn submit_read(
        &self,
        device: &MemoryQpair,
        source: u64,
        destination: *mut u8,
        length: u32,
        sink: &Arc<dyn CompletionSink>,
        handle: IoHandle,
    ) -> i32 {
        let rc = device.validate(source, length);
        if rc != 0 {
            return rc;
        }
        self.enqueue(
            device,
            QueuedIo {
                kind: QueuedKind::Read(DestinationPtr(destination)),
                address: source,
                length,
                sink: Arc::clone(sink),
                handle,
            },
        )
    }

    unsafe fn submit_write(
        &self,
        device: &MemoryQpair,
        source: *const u8,
        destination: u64,
        length: u32,
        sink: &Arc<dyn CompletionSink>,
        handle: IoHandle,
    ) -> i32 {
        let rc = device.validate(destination, length);
        if rc != 0 {
            return rc;
        }
        // SAFETY: caller guarantees `source` is readable for `length` bytes.
        let staged = unsafe { std::slice::from_raw_parts(source, length as usize) }.to_vec();
        self.enqueue(
            device,
            QueuedIo {
                kind: QueuedKind::Write(staged),
                address: destination,
                length,
                sink: Arc::clone(sink),
                handle,
            },
        )
    }

    fn poll(&self, device: &MemoryQpair, batch: u32) -> i32 {
        device.process(batch)
    }

    fn begin_poll(&self, device: &MemoryQpair, affinity: i32) -> i32 {
        let mut poller = device.0.poller.lock();
        if poller.is_some() {
            tracing::warn!(affinity, "device is already being polled");
            return -1;
        }

        let stop = Arc::new(AtomicBool::new(false));
        let qpair = device.clone();
        let thread_stop = Arc::clone(&stop);
        let spawned = thread::Builder::new()
            .name(format!("poller-{affinity}"))
            .spawn(move || {
                poll_until_stopped(&thread_stop, || qpair.process(DRIVER_POLL_BATCH));
            });
        match spawned {
            Ok(thread) => {
                device.0.affinity.store(affinity, Ordering::Release);
                *poller = Some(DriverPoller { stop, thread });
                0
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to spawn poller thread");
                -1
            }
        }
    }

    fn stop_poll(&self, device: &MemoryQpair) {
        let Some(poller) = device.0.poller.lock().take() else {
            return;
        };
        poller.stop.store(true, Ordering::Release);
        poller.thread.thread().unpark();
        if poller.thread.join().is_err() {
            tracing::warn!("poller thread panicked");
        }
        device.0.affinity.store(-1, Ordering::Release);
    }
}
