//! Segment address translation
//!
//! The hybrid log addresses device storage as a (segment id, intra-segment offset)
//! pair. Each backend issues I/O at a single flat physical address, which is the
//! segment id shifted above the offset bits plus a device-specific base offset.
//! The base offset lets several logical devices share one namespace by
//! partitioning it.

use std::fmt;

use crate::error::DeviceError;
use crate::utility::is_power_of_two;

/// A logical device address: segment id plus offset within the segment.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct SegmentAddress {
    /// Segment id
    pub segment: u64,
    /// Offset within the segment
    pub offset: u64,
}

impl SegmentAddress {
    /// Create a new segment address
    #[inline]
    pub const fn new(segment: u64, offset: u64) -> Self {
        Self { segment, offset }
    }
}

impl fmt::Debug for SegmentAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmentAddress")
            .field("segment", &self.segment)
            .field("offset", &self.offset)
            .finish()
    }
}

impl fmt::Display for SegmentAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.segment, self.offset)
    }
}

/// Maps segment addresses to physical device addresses.
///
/// `physical = ((segment << segment_size_bits) | offset) + base_offset`
///
/// Offsets must be smaller than the segment size. This is a caller contract and is
/// only checked in debug builds: an offset that spills into the segment bits
/// produces an address inside a different segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressTranslator {
    segment_size_bits: u32,
    base_offset: u64,
}

impl AddressTranslator {
    /// Create a translator for segments of `2^segment_size_bits` bytes.
    #[inline]
    pub const fn new(segment_size_bits: u32, base_offset: u64) -> Self {
        debug_assert!(segment_size_bits < 64);
        Self {
            segment_size_bits,
            base_offset,
        }
    }

    /// Create a translator from a segment size in bytes.
    ///
    /// The segment size must be a power of two.
    pub fn from_segment_size(segment_size: u64, base_offset: u64) -> Result<Self, DeviceError> {
        if !is_power_of_two(segment_size) {
            return Err(DeviceError::InvalidSegmentSize {
                segment_size,
                reason: "segment size must be a power of two",
            });
        }
        Ok(Self::new(segment_size.trailing_zeros(), base_offset))
    }

    /// Number of offset bits in a logical address
    #[inline]
    pub const fn segment_size_bits(&self) -> u32 {
        self.segment_size_bits
    }

    /// Segment size in bytes
    #[inline]
    pub const fn segment_size(&self) -> u64 {
        1u64 << self.segment_size_bits
    }

    /// Device base offset added to every address
    #[inline]
    pub const fn base_offset(&self) -> u64 {
        self.base_offset
    }

    /// Translate a (segment, offset) pair into a physical address.
    #[inline]
    pub const fn translate(&self, segment: u64, offset: u64) -> u64 {
        debug_assert!(offset < (1u64 << self.segment_size_bits));
        ((segment << self.segment_size_bits) | offset).wrapping_add(self.base_offset)
    }

    /// Device-relative address of (`segment`, `offset`) before the base offset is
    /// applied, or `None` if it does not fit in 64 bits.
    #[inline]
    pub fn logical_address(&self, segment: u64, offset: u64) -> Option<u64> {
        segment
            .checked_mul(self.segment_size())?
            .checked_add(offset)
    }

    /// Whether `length` bytes at (`segment`, `offset`) lie within `capacity`.
    #[inline]
    pub fn fits(&self, segment: u64, offset: u64, length: u32, capacity: u64) -> bool {
        self.logical_address(segment, offset)
            .and_then(|start| start.checked_add(u64::from(length)))
            .is_some_and(|end| end <= capacity)
    }

    /// Translate a [`SegmentAddress`].
    #[inline]
    pub const fn translate_address(&self, address: SegmentAddress) -> u64 {
        self.translate(address.segment, address.offset)
    }
}
