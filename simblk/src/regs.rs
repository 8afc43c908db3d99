//! Register map and typed register access.
//!
//! The control region is the only memory shared by the guest driver and the
//! host model. Every field has exactly one producer: the driver writes the
//! request descriptor, the host publishes everything else. The producer role
//! is encoded in the type of each field handle, so the driver cannot write a
//! host-owned field or read back a descriptor field by accident.
//!
//! # Layout
//!
//! ```text
//! 0x00  ADDR                8B  driver -> host  guest buffer address
//! 0x08  OFFSET              4B  driver -> host  starting sector
//! 0x0C  LEN                 4B  driver -> host  sector count
//! 0x10  WRITE               1B  driver -> host  1 = write
//! 0x11  REQUEST             1B  host -> driver  read to submit, returns tag
//! 0x12  NREQUEST            1B  host -> driver  free tags
//! 0x13  COMPLETE            1B  host -> driver  read to pop a completed tag
//! 0x14  NCOMPLETE           1B  host -> driver  completions pending
//! 0x15  COMPLETE_STATUS     1B  host -> driver  status of last popped tag
//! 0x18  NSECTORS            4B  host -> driver  capacity, 0 = no device
//! 0x1C  MAX_REQUEST_LENGTH  4B  host -> driver  LEN bound
//! ```
//!
//! REQUEST and COMPLETE have side effects on read; every other read is pure.

use std::marker::PhantomData;
use std::ptr::{read_volatile, write_volatile};
use std::sync::Arc;
use std::sync::atomic::{Ordering, fence};

/// Size of the control region in bytes.
pub const REGION_SIZE: usize = 0x20;

/// One field of the control region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    /// Guest buffer address.
    Addr,
    /// Starting sector.
    Offset,
    /// Sector count.
    Len,
    /// Write flag.
    Write,
    /// Submit-and-return-tag.
    Request,
    /// Free tag count.
    NRequest,
    /// Pop-completed-tag.
    Complete,
    /// Pending completion count.
    NComplete,
    /// Status of the completion last popped through `Complete`.
    CompleteStatus,
    /// Device capacity in sectors.
    NSectors,
    /// Per-request sector bound.
    MaxRequestLength,
}

impl Field {
    /// Every field, in address order.
    pub const ALL: [Self; 11] = [
        Self::Addr,
        Self::Offset,
        Self::Len,
        Self::Write,
        Self::Request,
        Self::NRequest,
        Self::Complete,
        Self::NComplete,
        Self::CompleteStatus,
        Self::NSectors,
        Self::MaxRequestLength,
    ];

    /// Byte offset of the field within the region.
    pub const fn offset(self) -> usize {
        match self {
            Self::Addr => 0x00,
            Self::Offset => 0x08,
            Self::Len => 0x0C,
            Self::Write => 0x10,
            Self::Request => 0x11,
            Self::NRequest => 0x12,
            Self::Complete => 0x13,
            Self::NComplete => 0x14,
            Self::CompleteStatus => 0x15,
            Self::NSectors => 0x18,
            Self::MaxRequestLength => 0x1C,
        }
    }

    /// Access width of the field in bytes.
    pub const fn width(self) -> usize {
        match self {
            Self::Addr => 8,
            Self::Offset | Self::Len | Self::NSectors | Self::MaxRequestLength => 4,
            _ => 1,
        }
    }

    /// Returns `true` if the driver is the producer of this field.
    pub const fn driver_writes(self) -> bool {
        matches!(self, Self::Addr | Self::Offset | Self::Len | Self::Write)
    }

    /// Resolves an access to the field it targets.
    ///
    /// Returns `None` unless the access hits a field at its exact offset and
    /// width.
    pub fn decode(offset: usize, width: usize) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|f| f.offset() == offset && f.width() == width)
    }
}

/// Integer types that can sit in a register field.
pub trait RegisterValue: Copy {
    /// Access width in bytes.
    const WIDTH: usize;

    /// Truncates a raw bus value to this type.
    fn from_raw(raw: u64) -> Self;

    /// Widens the value for the bus.
    fn into_raw(self) -> u64;
}

macro_rules! register_value {
    ($($ty:ty),*) => {
        $(
            impl RegisterValue for $ty {
                const WIDTH: usize = std::mem::size_of::<$ty>();

                #[inline]
                #[allow(clippy::cast_possible_truncation)] // Bus values are sized by WIDTH
                fn from_raw(raw: u64) -> Self {
                    raw as $ty
                }

                #[inline]
                fn into_raw(self) -> u64 {
                    u64::from(self)
                }
            }
        )*
    };
}

register_value!(u8, u32, u64);

/// Byte-addressed access to a control region.
///
/// Implemented by the simulated device ([`crate::register_file::RegisterFile`])
/// and by real mapped hardware ([`MmioRegion`]). Accesses never block.
pub trait RegisterBus {
    /// Reads `width` bytes at `offset`.
    fn read(&self, offset: usize, width: usize) -> u64;

    /// Writes the low `width` bytes of `value` at `offset`.
    fn write(&self, offset: usize, width: usize, value: u64);
}

impl<T: RegisterBus + ?Sized> RegisterBus for Arc<T> {
    fn read(&self, offset: usize, width: usize) -> u64 {
        (**self).read(offset, width)
    }

    fn write(&self, offset: usize, width: usize, value: u64) {
        (**self).write(offset, width, value);
    }
}

impl<T: RegisterBus + ?Sized> RegisterBus for &T {
    fn read(&self, offset: usize, width: usize) -> u64 {
        (**self).read(offset, width)
    }

    fn write(&self, offset: usize, width: usize, value: u64) {
        (**self).write(offset, width, value);
    }
}

/// Handle to a field the driver may only read.
#[derive(Debug, Clone, Copy)]
pub struct ReadOnly<T> {
    field: Field,
    _value: PhantomData<fn() -> T>,
}

impl<T: RegisterValue> ReadOnly<T> {
    const fn new(field: Field) -> Self {
        Self {
            field,
            _value: PhantomData,
        }
    }

    /// The field this handle reads.
    pub const fn field(&self) -> Field {
        self.field
    }

    /// Reads the field.
    #[inline]
    pub fn read<B: RegisterBus + ?Sized>(&self, bus: &B) -> T {
        T::from_raw(bus.read(self.field.offset(), T::WIDTH))
    }
}

/// Handle to a field the driver may only write.
#[derive(Debug, Clone, Copy)]
pub struct WriteOnly<T> {
    field: Field,
    _value: PhantomData<fn(T)>,
}

impl<T: RegisterValue> WriteOnly<T> {
    const fn new(field: Field) -> Self {
        Self {
            field,
            _value: PhantomData,
        }
    }

    /// The field this handle writes.
    pub const fn field(&self) -> Field {
        self.field
    }

    /// Writes the field.
    #[inline]
    pub fn write<B: RegisterBus + ?Sized>(&self, bus: &B, value: T) {
        bus.write(self.field.offset(), T::WIDTH, value.into_raw());
    }
}

/// Guest buffer address.
pub const ADDR: WriteOnly<u64> = WriteOnly::new(Field::Addr);
/// Starting sector.
pub const OFFSET: WriteOnly<u32> = WriteOnly::new(Field::Offset);
/// Sector count.
pub const LEN: WriteOnly<u32> = WriteOnly::new(Field::Len);
/// 1 for a write, 0 for a read.
pub const WRITE: WriteOnly<u8> = WriteOnly::new(Field::Write);
/// Reading submits the latched descriptor and returns its tag.
pub const REQUEST: ReadOnly<u8> = ReadOnly::new(Field::Request);
/// Free tags.
pub const NREQUEST: ReadOnly<u8> = ReadOnly::new(Field::NRequest);
/// Reading pops one completed tag.
pub const COMPLETE: ReadOnly<u8> = ReadOnly::new(Field::Complete);
/// Completions waiting to be popped.
pub const NCOMPLETE: ReadOnly<u8> = ReadOnly::new(Field::NComplete);
/// Status of the tag last returned by COMPLETE.
pub const COMPLETE_STATUS: ReadOnly<u8> = ReadOnly::new(Field::CompleteStatus);
/// Device capacity in sectors.
pub const NSECTORS: ReadOnly<u32> = ReadOnly::new(Field::NSectors);
/// Per-request sector bound.
pub const MAX_REQUEST_LENGTH: ReadOnly<u32> = ReadOnly::new(Field::MaxRequestLength);

/// Orders descriptor stores before the submitting REQUEST read.
#[inline]
pub fn write_barrier() {
    fence(Ordering::Release);
}

/// Orders a tag or count read before anything that depends on it.
#[inline]
pub fn read_barrier() {
    fence(Ordering::Acquire);
}

/// Control region backed by real memory-mapped registers.
///
/// All accesses are volatile. Out-of-range or misaligned accesses read as
/// zero and drop writes.
#[derive(Debug)]
pub struct MmioRegion {
    base: *mut u8,
    size: usize,
}

// SAFETY: The region is plain device memory; concurrent access is serialized
// by the driver's lock, and volatile single-width accesses are atomic on the
// platforms that map this device.
unsafe impl Send for MmioRegion {}

// SAFETY: See the `Send` impl. Shared references only issue volatile loads and
// stores through the raw base pointer.
unsafe impl Sync for MmioRegion {}

impl MmioRegion {
    /// Wraps a mapped control region.
    ///
    /// # Safety
    ///
    /// The caller must ensure:
    /// - `base` points to a mapped region of at least `size` bytes
    /// - `base` is 8-byte aligned
    /// - the mapping outlives the returned value
    pub const unsafe fn new(base: *mut u8, size: usize) -> Self {
        Self { base, size }
    }

    fn in_bounds(&self, offset: usize, width: usize) -> bool {
        offset
            .checked_add(width)
            .is_some_and(|end| end <= self.size)
            && offset.is_multiple_of(width)
    }
}

impl RegisterBus for MmioRegion {
    fn read(&self, offset: usize, width: usize) -> u64 {
        if !self.in_bounds(offset, width) {
            return 0;
        }
        // SAFETY: `new` guarantees a mapped, 8-byte aligned region of `size`
        // bytes; `in_bounds` checked the range and natural alignment.
        unsafe {
            let ptr = self.base.add(offset);
            match width {
                1 => u64::from(read_volatile(ptr)),
                2 => u64::from(read_volatile(ptr.cast::<u16>())),
                4 => u64::from(read_volatile(ptr.cast::<u32>())),
                8 => read_volatile(ptr.cast::<u64>()),
                _ => 0,
            }
        }
    }

    #[allow(clippy::cast_possible_truncation)] // Values are truncated to the access width
    fn write(&self, offset: usize, width: usize, value: u64) {
        if !self.in_bounds(offset, width) {
            return;
        }
        // SAFETY: Same invariants as `read`.
        unsafe {
            let ptr = self.base.add(offset);
            match width {
                1 => write_volatile(ptr, value as u8),
                2 => write_volatile(ptr.cast::<u16>(), value as u16),
                4 => write_volatile(ptr.cast::<u32>(), value as u32),
                8 => write_volatile(ptr.cast::<u64>(), value),
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fields_do_not_overlap() {
        for (i, a) in Field::ALL.iter().enumerate() {
            assert!(a.offset() + a.width() <= REGION_SIZE);
            assert!(a.offset().is_multiple_of(a.width()), "{a:?} misaligned");
            for b in &Field::ALL[i + 1..] {
                let disjoint = a.offset() + a.width() <= b.offset()
                    || b.offset() + b.width() <= a.offset();
                assert!(disjoint, "{a:?} overlaps {b:?}");
            }
        }
    }

    #[test]
    fn test_decode_requires_exact_width() {
        assert_eq!(Field::decode(0, 8), Some(Field::Addr));
        assert_eq!(Field::decode(0x11, 1), Some(Field::Request));
        assert_eq!(Field::decode(0x15, 1), Some(Field::CompleteStatus));
        assert_eq!(Field::decode(0x1C, 4), Some(Field::MaxRequestLength));
        assert_eq!(Field::decode(0, 4), None);
        assert_eq!(Field::decode(0x16, 1), None);
    }

    #[test]
    fn test_producer_roles() {
        assert!(ADDR.field().driver_writes());
        assert!(WRITE.field().driver_writes());
        assert!(!REQUEST.field().driver_writes());
        assert!(!NSECTORS.field().driver_writes());
    }

    #[test]
    fn test_mmio_region_round_trip() {
        let mut backing = [0u64; REGION_SIZE / 8];
        // SAFETY: `backing` is 8-byte aligned, REGION_SIZE bytes long, and
        // outlives `region`.
        let region = unsafe { MmioRegion::new(backing.as_mut_ptr().cast::<u8>(), REGION_SIZE) };

        ADDR.write(&region, 0xDEAD_BEEF_0000_1000);
        OFFSET.write(&region, 10);
        LEN.write(&region, 4);
        WRITE.write(&region, 1);

        assert_eq!(region.read(Field::Addr.offset(), 8), 0xDEAD_BEEF_0000_1000);
        assert_eq!(region.read(Field::Offset.offset(), 4), 10);
        assert_eq!(region.read(Field::Len.offset(), 4), 4);
        assert_eq!(region.read(Field::Write.offset(), 1), 1);

        // Out-of-range and misaligned accesses are inert.
        region.write(REGION_SIZE, 1, 0xFF);
        assert_eq!(region.read(REGION_SIZE, 1), 0);
        assert_eq!(region.read(0x09, 4), 0);
        assert_eq!(backing[0], 0xDEAD_BEEF_0000_1000);
    }
}
