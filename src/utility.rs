//! Alignment helpers and sector-aligned buffers

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;

/// Check if a value is a power of two
#[inline]
pub const fn is_power_of_two(n: u64) -> bool {
    n != 0 && (n & (n - 1)) == 0
}

/// Round `value` down to a whole multiple of `unit`.
#[inline]
pub const fn round_down(value: u64, unit: u64) -> u64 {
    (value / unit) * unit
}

/// Owned, zero-initialized, sector-aligned memory for device I/O.
///
/// Device reads and writes take raw pointers that must stay valid until the
/// completion callback runs; an `AlignedBuffer` that outlives the operation
/// satisfies that, and its alignment satisfies direct-I/O style drivers.
pub struct AlignedBuffer {
    ptr: NonNull<u8>,
    size: usize,
    layout: Layout,
}

impl AlignedBuffer {
    /// Allocate a zeroed buffer of `size` bytes aligned to `alignment`.
    ///
    /// Returns `None` if the layout is invalid (alignment not a power of two,
    /// zero size) or allocation fails.
    pub fn zeroed(alignment: usize, size: usize) -> Option<Self> {
        if size == 0 {
            return None;
        }
        let layout = Layout::from_size_align(size, alignment).ok()?;
        // SAFETY: layout has non-zero size.
        let ptr = NonNull::new(unsafe { alloc_zeroed(layout) })?;
        Some(Self { ptr, size, layout })
    }

    /// Allocate a buffer filled with `byte`.
    pub fn filled(alignment: usize, size: usize, byte: u8) -> Option<Self> {
        let mut buf = Self::zeroed(alignment, size)?;
        buf.as_mut_slice().fill(byte);
        Some(buf)
    }

    /// Get a pointer to the buffer
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr() as *const u8
    }

    /// Get a mutable pointer to the buffer
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Get the size of the buffer
    pub fn size(&self) -> usize {
        self.size
    }

    /// Get the alignment of the buffer
    pub fn alignment(&self) -> usize {
        self.layout.align()
    }

    /// Get a slice view of the buffer
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.size) }
    }

    /// Get a mutable slice view of the buffer
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.size) }
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        // SAFETY: ptr was allocated with exactly this layout.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

// Safety: AlignedBuffer owns its memory and doesn't share references
unsafe impl Send for AlignedBuffer {}
unsafe impl Sync for AlignedBuffer {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_power_of_two() {
        assert!(!is_power_of_two(0));
        assert!(is_power_of_two(1));
        assert!(is_power_of_two(512));
        assert!(!is_power_of_two(1023));
        assert!(is_power_of_two(1 << 30));
    }

    #[test]
    fn test_round_down() {
        assert_eq!(round_down((1 << 30) + 17, 1 << 20), 1 << 30);
        assert_eq!(round_down(5 << 20, 1 << 20), 5 << 20);
        assert_eq!(round_down(100, 1 << 20), 0);
    }

    #[test]
    fn test_aligned_buffer() {
        let mut buf = AlignedBuffer::zeroed(512, 4096).unwrap();
        assert_eq!(buf.size(), 4096);
        assert_eq!(buf.alignment(), 512);
        assert_eq!(buf.as_ptr() as usize % 512, 0);
        assert!(buf.as_slice().iter().all(|&b| b == 0));

        buf.as_mut_slice()[0] = 42;
        assert_eq!(buf.as_slice()[0], 42);

        let filled = AlignedBuffer::filled(512, 512, 0xAB).unwrap();
        assert!(filled.as_slice().iter().all(|&b| b == 0xAB));

        assert!(AlignedBuffer::zeroed(3, 512).is_none());
        assert!(AlignedBuffer::zeroed(512, 0).is_none());
    }
}
