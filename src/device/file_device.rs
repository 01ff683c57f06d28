//! File system storage device
//!
//! `FileDevice` issues positioned reads and writes against host files. Each
//! operation runs on the blocking pool of a Tokio runtime, which plays the role
//! of the OS completion thread: the callback fires there once the system call
//! returns.
//!
//! Two layouts are supported:
//! - [`FileLayout::SingleFile`]: one file (or raw block device). Physical
//!   addresses come from the [`AddressTranslator`], so `base_offset` partitions
//!   the file. Segment removal does not reclaim space.
//! - [`FileLayout::SegmentFiles`]: one file per segment, named
//!   `<path>.<segment>`, addressed by intra-segment offset. Segment removal
//!   deletes the file.

use std::collections::HashMap;
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use tokio::runtime::{Handle, Runtime};

use crate::address::AddressTranslator;
use crate::constants::{DEFAULT_SECTOR_SIZE, DEFAULT_THROTTLE_LIMIT};
use crate::device::completion::CompletionPort;
use crate::device::context_pool::ContextToken;
use crate::device::stats::DeviceStatsSnapshot;
use crate::device::traits::{
    IoCallbackContext, IoCompletionCallback, IoOperation, RemoveSegmentCallback, StorageDevice,
};
use crate::error::{io_error_code, DeviceError, EINVAL, EIO, OK};
use crate::utility::{is_power_of_two, round_down};

/// How a file device maps segments onto files
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileLayout {
    /// All segments in one file
    #[default]
    SingleFile,
    /// One file per segment
    SegmentFiles,
}

impl std::str::FromStr for FileLayout {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "single_file" | "single" => Ok(Self::SingleFile),
            "segment_files" | "segmented" => Ok(Self::SegmentFiles),
            other => Err(format!("unknown file layout '{other}'")),
        }
    }
}

/// Configuration for a [`FileDevice`]
#[derive(Debug, Clone)]
pub struct FileDeviceConfig {
    /// Device name, used for tracing and thread names
    pub name: String,
    /// Backing file, or the prefix of segment files
    pub path: PathBuf,
    /// Segment to file mapping
    pub layout: FileLayout,
    /// Sector size in bytes (power of two)
    pub sector_size: u32,
    /// Device capacity. `None` means unbounded.
    pub capacity: Option<u64>,
    /// Offset added to every physical address (single-file layout)
    pub base_offset: u64,
    /// Advisory throttle limit
    pub throttle_limit: u64,
    /// Maximum number of blocking I/O threads
    pub io_threads: usize,
    /// Delete backing files on dispose
    pub delete_on_close: bool,
}

impl FileDeviceConfig {
    /// Create a single-file configuration with defaults
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            layout: FileLayout::SingleFile,
            sector_size: DEFAULT_SECTOR_SIZE,
            capacity: None,
            base_offset: 0,
            throttle_limit: DEFAULT_THROTTLE_LIMIT,
            io_threads: 4,
            delete_on_close: false,
        }
    }

    /// Set the layout
    pub fn with_layout(mut self, layout: FileLayout) -> Self {
        self.layout = layout;
        self
    }

    /// Set the sector size
    pub fn with_sector_size(mut self, sector_size: u32) -> Self {
        self.sector_size = sector_size;
        self
    }

    /// Bound the device to `capacity` bytes
    pub fn with_capacity(mut self, capacity: u64) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Set the base offset
    pub fn with_base_offset(mut self, base_offset: u64) -> Self {
        self.base_offset = base_offset;
        self
    }

    /// Set the throttle limit
    pub fn with_throttle_limit(mut self, throttle_limit: u64) -> Self {
        self.throttle_limit = throttle_limit;
        self
    }

    /// Set the number of blocking I/O threads
    pub fn with_io_threads(mut self, io_threads: usize) -> Self {
        self.io_threads = io_threads;
        self
    }

    /// Delete backing files on dispose
    pub fn with_delete_on_close(mut self, delete_on_close: bool) -> Self {
        self.delete_on_close = delete_on_close;
        self
    }

    fn validate(&self) -> Result<(), DeviceError> {
        if !is_power_of_two(u64::from(self.sector_size)) {
            return Err(DeviceError::InvalidConfig(format!(
                "sector size {} is not a power of two",
                self.sector_size
            )));
        }
        if self.io_threads == 0 {
            return Err(DeviceError::InvalidConfig(
                "io_threads must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

fn open_rw(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
}

/// Lazily opened per-segment files
struct SegmentFiles {
    path: PathBuf,
    files: RwLock<HashMap<u64, Arc<File>>>,
}

impl SegmentFiles {
    fn segment_path(&self, segment: u64) -> PathBuf {
        let mut name = OsString::from(self.path.as_os_str());
        name.push(format!(".{segment}"));
        PathBuf::from(name)
    }

    fn get_or_open(&self, segment: u64) -> io::Result<Arc<File>> {
        if let Some(file) = self.files.read().get(&segment) {
            return Ok(Arc::clone(file));
        }
        let mut files = self.files.write();
        if let Some(file) = files.get(&segment) {
            return Ok(Arc::clone(file));
        }
        let file = Arc::new(open_rw(&self.segment_path(segment))?);
        files.insert(segment, Arc::clone(&file));
        Ok(file)
    }

    fn remove(&self, segment: u64) -> Result<(), DeviceError> {
        self.files.write().remove(&segment);
        match fs::remove_file(self.segment_path(segment)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Segment files present on disk
    fn on_disk(&self) -> io::Result<Vec<PathBuf>> {
        let Some(prefix) = self.path.file_name().and_then(|n| n.to_str()) else {
            return Ok(Vec::new());
        };
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let mut found = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let is_segment = name
                .strip_prefix(prefix)
                .and_then(|rest| rest.strip_prefix('.'))
                .is_some_and(|id| !id.is_empty() && id.bytes().all(|b| b.is_ascii_digit()));
            if is_segment {
                found.push(entry.path());
            }
        }
        Ok(found)
    }
}

enum Backing {
    Single(Arc<File>),
    Segments(Arc<SegmentFiles>),
}

/// Where an accepted operation lands. Segment files are opened by the
/// blocking task, never on the submitting thread.
enum Target {
    Single {
        file: Arc<File>,
        position: u64,
    },
    Segment {
        segments: Arc<SegmentFiles>,
        segment: u64,
        position: u64,
    },
}

impl Target {
    fn open(self) -> io::Result<(Arc<File>, u64)> {
        match self {
            Target::Single { file, position } => Ok((file, position)),
            Target::Segment {
                segments,
                segment,
                position,
            } => Ok((segments.get_or_open(segment)?, position)),
        }
    }
}

/// An operation handed to the blocking pool.
///
/// If the task is dropped without running (the runtime was shut down), the
/// operation completes with `EIO` so its context and pending count are
/// still retired.
struct InFlight {
    port: Arc<CompletionPort>,
    token: Option<ContextToken>,
}

impl InFlight {
    fn new(port: Arc<CompletionPort>, token: ContextToken) -> Self {
        Self {
            port,
            token: Some(token),
        }
    }

    fn finish(mut self, error_code: u32, bytes_transferred: u32) {
        if let Some(token) = self.token.take() {
            self.port.complete(token, error_code, bytes_transferred);
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            tracing::warn!(device = %self.port.name(), "file io task dropped before it ran");
            self.port.complete(token, EIO, 0);
        }
    }
}

/// Background work registered with [`CompletionPort::enter`]; exits on drop.
struct BackgroundWork(Arc<CompletionPort>);

impl Drop for BackgroundWork {
    fn drop(&mut self) {
        self.0.exit();
    }
}

/// An asynchronous segment removal. The continuation always runs, with an
/// error if the task is dropped without running, before the work exits.
struct PendingRemoval {
    callback: Option<RemoveSegmentCallback>,
    work: BackgroundWork,
}

impl PendingRemoval {
    fn finish(mut self, result: Result<(), DeviceError>) {
        if let Some(callback) = self.callback.take() {
            callback(result);
        }
    }
}

impl Drop for PendingRemoval {
    fn drop(&mut self) {
        if let Some(callback) = self.callback.take() {
            tracing::warn!(device = %self.work.0.name(), "segment removal task dropped before it ran");
            callback(Err(DeviceError::Io(io::Error::new(
                io::ErrorKind::Interrupted,
                "segment removal task dropped before it ran",
            ))));
        }
    }
}

/// Raw I/O buffer handed to a blocking task.
struct RawBuf {
    ptr: *mut u8,
    len: usize,
}

// SAFETY: the submitter keeps the buffer alive and untouched until completion.
unsafe impl Send for RawBuf {}

impl RawBuf {
    /// # Safety
    /// The buffer must be valid for reads of `len` bytes.
    unsafe fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    /// # Safety
    /// The buffer must be valid for writes of `len` bytes.
    unsafe fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

#[cfg(unix)]
fn read_full_at(file: &File, mut buf: &mut [u8], mut position: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;

    let mut total = 0;
    while !buf.is_empty() {
        match file.read_at(buf, position) {
            Ok(0) => break,
            Ok(n) => {
                total += n;
                position += n as u64;
                buf = &mut buf[n..];
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(total)
}

#[cfg(unix)]
fn write_full_at(file: &File, buf: &[u8], position: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;

    file.write_all_at(buf, position)?;
    Ok(buf.len())
}

#[cfg(windows)]
fn read_full_at(file: &File, mut buf: &mut [u8], mut position: u64) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;

    let mut total = 0;
    while !buf.is_empty() {
        match file.seek_read(buf, position) {
            Ok(0) => break,
            Ok(n) => {
                total += n;
                position += n as u64;
                buf = &mut buf[n..];
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(total)
}

#[cfg(windows)]
fn write_full_at(file: &File, mut buf: &[u8], mut position: u64) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;

    let len = buf.len();
    while !buf.is_empty() {
        match file.seek_write(buf, position) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => {
                position += n as u64;
                buf = &buf[n..];
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(len)
}

/// Storage device backed by host files.
pub struct FileDevice {
    port: Arc<CompletionPort>,
    config: FileDeviceConfig,
    backing: Backing,
    runtime: Mutex<Option<Runtime>>,
    handle: Handle,
    translator: Option<AddressTranslator>,
    capacity: Option<u64>,
    closed: AtomicBool,
}

impl FileDevice {
    /// Open a device with its own blocking I/O pool.
    pub fn open(config: FileDeviceConfig) -> Result<Self, DeviceError> {
        config.validate()?;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(config.io_threads)
            .thread_name(format!("{}-io", config.name))
            .build()?;
        let handle = runtime.handle().clone();
        Self::open_inner(config, Some(runtime), handle)
    }

    /// Open a device whose I/O runs on an existing runtime.
    pub fn with_runtime(config: FileDeviceConfig, handle: Handle) -> Result<Self, DeviceError> {
        config.validate()?;
        Self::open_inner(config, None, handle)
    }

    fn open_inner(
        config: FileDeviceConfig,
        runtime: Option<Runtime>,
        handle: Handle,
    ) -> Result<Self, DeviceError> {
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let backing = match config.layout {
            FileLayout::SingleFile => Backing::Single(Arc::new(open_rw(&config.path)?)),
            FileLayout::SegmentFiles => Backing::Segments(Arc::new(SegmentFiles {
                path: config.path.clone(),
                files: RwLock::new(HashMap::new()),
            })),
        };

        tracing::debug!(
            device = %config.name,
            path = %config.path.display(),
            layout = ?config.layout,
            "opened file device"
        );

        Ok(Self {
            port: Arc::new(CompletionPort::new(config.name.as_str(), config.throttle_limit)),
            capacity: config.capacity,
            config,
            backing,
            runtime: Mutex::new(runtime),
            handle,
            translator: None,
            closed: AtomicBool::new(false),
        })
    }

    /// Backing file, or segment file prefix
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// File layout
    pub fn layout(&self) -> FileLayout {
        self.config.layout
    }

    /// Path of the file holding `segment` (segment-files layout)
    pub fn segment_path(&self, segment: u64) -> Option<PathBuf> {
        match &self.backing {
            Backing::Single(_) => None,
            Backing::Segments(segments) => Some(segments.segment_path(segment)),
        }
    }

    /// Context slots currently checked out
    pub fn outstanding_contexts(&self) -> usize {
        self.port.outstanding_contexts()
    }

    /// Range-check an operation and pick its backing target, or the error code
    /// to fail it with. Nothing here touches the file system.
    fn target(
        &self,
        translator: AddressTranslator,
        segment: u64,
        offset: u64,
        length: u32,
    ) -> Result<Target, u32> {
        if let Some(capacity) = self.capacity {
            if !translator.fits(segment, offset, length, capacity) {
                return Err(EINVAL);
            }
        }
        match &self.backing {
            Backing::Single(file) => Ok(Target::Single {
                file: Arc::clone(file),
                position: translator.translate(segment, offset),
            }),
            Backing::Segments(segments) => {
                if offset + u64::from(length) > translator.segment_size() {
                    return Err(EINVAL);
                }
                Ok(Target::Segment {
                    segments: Arc::clone(segments),
                    segment,
                    position: offset,
                })
            }
        }
    }

    fn submit(
        &self,
        operation: IoOperation,
        segment: u64,
        offset: u64,
        mut buf: RawBuf,
        callback: IoCompletionCallback,
        context: IoCallbackContext,
    ) -> Result<(), DeviceError> {
        let translator = self.translator.ok_or(DeviceError::NotInitialized)?;
        let length = u32::try_from(buf.len).unwrap_or(u32::MAX);
        let token: ContextToken = self.port.begin(operation, callback, context)?;

        let target = match self.target(translator, segment, offset, length) {
            Ok(target) => target,
            Err(code) => {
                self.port.fail_submission(token, code);
                return Ok(());
            }
        };

        self.port.submitted(operation);
        let in_flight = InFlight::new(Arc::clone(&self.port), token);
        drop(self.handle.spawn_blocking(move || {
            let result = target.open().and_then(|(file, position)| match operation {
                // SAFETY: the caller keeps the buffer valid until the callback runs.
                IoOperation::Read => read_full_at(&file, unsafe { buf.as_mut_slice() }, position),
                IoOperation::Write => write_full_at(&file, unsafe { buf.as_slice() }, position),
            });
            match result {
                Ok(n) => in_flight.finish(OK, u32::try_from(n).unwrap_or(u32::MAX)),
                Err(e) => {
                    tracing::warn!(device = %in_flight.port.name(), error = %e, ?operation, "file io failed");
                    in_flight.finish(io_error_code(&e), 0);
                }
            }
        }));
        Ok(())
    }

    fn delete_backing_files(&self) {
        let paths = match &self.backing {
            Backing::Single(_) => Ok(vec![self.config.path.clone()]),
            Backing::Segments(segments) => {
                segments.files.write().clear();
                segments.on_disk()
            }
        };
        let paths = match paths {
            Ok(paths) => paths,
            Err(e) => {
                tracing::warn!(device = %self.name(), error = %e, "failed to list segment files");
                return;
            }
        };
        for path in paths {
            if let Err(e) = fs::remove_file(&path) {
                if e.kind() != io::ErrorKind::NotFound {
                    tracing::warn!(path = %path.display(), error = %e, "failed to delete file");
                }
            }
        }
    }
}

impl StorageDevice for FileDevice {
    fn name(&self) -> &str {
        self.port.name()
    }

    fn sector_size(&self) -> u32 {
        self.config.sector_size
    }

    fn capacity(&self) -> Option<u64> {
        self.capacity
    }

    fn segment_size(&self) -> Option<u64> {
        self.translator.map(|t| t.segment_size())
    }

    fn initialize(&mut self, segment_size: u64) -> Result<(), DeviceError> {
        if self.translator.is_some() {
            return Err(DeviceError::AlreadyInitialized);
        }
        let translator = AddressTranslator::from_segment_size(segment_size, self.config.base_offset)?;
        if segment_size < u64::from(self.config.sector_size) {
            return Err(DeviceError::InvalidSegmentSize {
                segment_size,
                reason: "segment size is smaller than the sector size",
            });
        }
        if let Some(capacity) = self.config.capacity {
            let rounded = round_down(capacity, segment_size);
            if rounded == 0 {
                return Err(DeviceError::InvalidSegmentSize {
                    segment_size,
                    reason: "segment size exceeds device capacity",
                });
            }
            self.capacity = Some(rounded);
        }

        self.translator = Some(translator);
        tracing::debug!(device = %self.name(), segment_size, capacity = ?self.capacity, "initialized file device");
        Ok(())
    }

    fn throttle(&self) -> bool {
        self.port.throttled()
    }

    fn pending_operations(&self) -> u64 {
        self.port.pending_operations()
    }

    unsafe fn read_async(
        &self,
        segment: u64,
        source_offset: u64,
        destination: *mut u8,
        length: u32,
        callback: IoCompletionCallback,
        context: IoCallbackContext,
    ) -> Result<(), DeviceError> {
        tracing::trace!(device = %self.name(), segment, source_offset, length, "read_async enter");
        let buf = RawBuf {
            ptr: destination,
            len: length as usize,
        };
        let result = self.submit(IoOperation::Read, segment, source_offset, buf, callback, context);
        tracing::trace!(device = %self.name(), "read_async exit");
        result
    }

    unsafe fn write_async(
        &self,
        source: *const u8,
        segment: u64,
        destination_offset: u64,
        length: u32,
        callback: IoCompletionCallback,
        context: IoCallbackContext,
    ) -> Result<(), DeviceError> {
        tracing::trace!(
            device = %self.name(),
            segment,
            destination_offset,
            length,
            "write_async enter"
        );
        let buf = RawBuf {
            ptr: source as *mut u8,
            len: length as usize,
        };
        let result = self.submit(
            IoOperation::Write,
            segment,
            destination_offset,
            buf,
            callback,
            context,
        );
        tracing::trace!(device = %self.name(), "write_async exit");
        result
    }

    fn remove_segment(&self, segment: u64) -> Result<(), DeviceError> {
        tracing::trace!(device = %self.name(), segment, "remove_segment enter");
        if self.port.is_disposed() {
            return Err(DeviceError::Disposed);
        }
        let result = match &self.backing {
            Backing::Single(_) => Ok(()),
            Backing::Segments(segments) => segments.remove(segment),
        };
        tracing::trace!(device = %self.name(), "remove_segment exit");
        result
    }

    fn remove_segment_async(&self, segment: u64, callback: RemoveSegmentCallback) {
        tracing::trace!(device = %self.name(), segment, "remove_segment_async enter");
        let segments = match &self.backing {
            Backing::Single(_) => {
                callback(self.remove_segment(segment));
                return;
            }
            Backing::Segments(segments) => Arc::clone(segments),
        };
        if let Err(e) = self.port.enter() {
            callback(Err(e));
            return;
        }
        let removal = PendingRemoval {
            callback: Some(callback),
            work: BackgroundWork(Arc::clone(&self.port)),
        };
        drop(self.handle.spawn_blocking(move || {
            removal.finish(segments.remove(segment));
        }));
        tracing::trace!(device = %self.name(), "remove_segment_async exit");
    }

    fn dispose(&self) {
        self.port.dispose();
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(runtime) = self.runtime.lock().take() {
            runtime.shutdown_background();
        }
        if self.config.delete_on_close {
            self.delete_backing_files();
        }
        tracing::debug!(device = %self.name(), "disposed file device");
    }

    fn stats(&self) -> DeviceStatsSnapshot {
        self.port.stats()
    }
}

impl Drop for FileDevice {
    fn drop(&mut self) {
        self.dispose();
    }
}
