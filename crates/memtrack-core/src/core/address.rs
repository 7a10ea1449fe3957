use serde::{Deserialize, Serialize};

use super::macros::impl_ops;

impl_ops!(Va, u64, "Guest Virtual Address");

impl Va {
    /// Rounds the address down to a multiple of `alignment`.
    ///
    /// `alignment` must be a power of two.
    pub const fn align_down(self, alignment: u64) -> Self {
        Self(self.0 & !(alignment - 1))
    }

    /// Rounds the address up to a multiple of `alignment`.
    ///
    /// `alignment` must be a power of two. Returns `None` if the rounded
    /// address does not fit in 64 bits.
    pub const fn align_up(self, alignment: u64) -> Option<Self> {
        match self.0.checked_add(alignment - 1) {
            Some(value) => Some(Self(value & !(alignment - 1))),
            None => None,
        }
    }

    /// Checks if the address is a multiple of `alignment`.
    pub const fn is_aligned(self, alignment: u64) -> bool {
        self.0 & (alignment - 1) == 0
    }
}

/// A half-open range of guest virtual addresses, `[address, address + size)`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AddressRange {
    /// The first address of the range.
    pub address: Va,

    /// The size of the range in bytes.
    pub size: u64,
}

impl AddressRange {
    /// Creates a new address range.
    ///
    /// The caller is responsible for `address + size` not overflowing;
    /// use [`checked`] for untrusted input.
    ///
    /// [`checked`]: Self::checked
    pub const fn new(address: Va, size: u64) -> Self {
        Self { address, size }
    }

    /// Creates a new address range, returning `None` if its end address
    /// does not fit in 64 bits.
    pub const fn checked(address: Va, size: u64) -> Option<Self> {
        match address.checked_add(size) {
            Some(_) => Some(Self { address, size }),
            None => None,
        }
    }

    /// Creates a new address range, cut short at the end of the address
    /// space.
    pub const fn saturating(address: Va, size: u64) -> Self {
        let limit = u64::MAX - address.0;

        Self {
            address,
            size: if size > limit { limit } else { size },
        }
    }

    /// Creates a range from its start and (exclusive) end address.
    pub fn from_bounds(start: Va, end: Va) -> Self {
        debug_assert!(start <= end);
        Self::new(start, end - start)
    }

    /// Returns the exclusive end address of the range.
    pub fn end(self) -> Va {
        self.address + self.size
    }

    /// Checks if the range covers no bytes.
    pub const fn is_empty(self) -> bool {
        self.size == 0
    }

    /// Checks if `address` lies inside the range.
    pub fn contains(self, address: Va) -> bool {
        self.address <= address && address < self.end()
    }

    /// Checks if `other` lies entirely inside the range.
    ///
    /// An empty `other` is contained when its address is within the bounds
    /// of this range.
    pub fn contains_range(self, other: AddressRange) -> bool {
        self.address <= other.address && other.end() <= self.end()
    }

    /// Checks if the two ranges share at least one byte.
    pub fn overlaps(self, other: AddressRange) -> bool {
        self.address < other.end() && other.address < self.end()
    }

    /// Returns the bytes shared by both ranges, if any.
    pub fn intersection(self, other: AddressRange) -> Option<AddressRange> {
        if !self.overlaps(other) {
            return None;
        }

        let start = self.address.max(other.address);
        let end = self.end().min(other.end());
        Some(Self::from_bounds(start, end))
    }

    /// Expands the range outward to whole pages.
    ///
    /// The start is rounded down and the end rounded up, so the result
    /// always covers the input range. `page_size` must be a power of two.
    /// Returns `None` if the aligned end does not fit in 64 bits.
    pub fn page_align(self, page_size: u64) -> Option<AddressRange> {
        let start = self.address.align_down(page_size);
        let end = self.address.checked_add(self.size)?.align_up(page_size)?;
        Some(Self::from_bounds(start, end))
    }

    /// Splits the range into consecutive sub-ranges of `granularity` bytes.
    ///
    /// The last sub-range is shorter when `granularity` does not divide the
    /// size.
    ///
    /// # Panics
    ///
    /// Panics if `granularity` is zero.
    pub fn chunks(self, granularity: u64) -> Chunks {
        assert!(granularity != 0, "granularity must be non-zero");

        Chunks {
            remaining: self,
            granularity,
        }
    }
}

impl std::fmt::Display for AddressRange {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "[{}, {})", self.address, self.end())
    }
}

/// Iterator returned by [`AddressRange::chunks`].
#[derive(Debug, Clone)]
pub struct Chunks {
    remaining: AddressRange,
    granularity: u64,
}

impl Iterator for Chunks {
    type Item = AddressRange;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining.is_empty() {
            return None;
        }

        let size = self.remaining.size.min(self.granularity);
        let chunk = AddressRange::new(self.remaining.address, size);
        self.remaining = AddressRange::new(chunk.end(), self.remaining.size - size);
        Some(chunk)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let count = self.remaining.size.div_ceil(self.granularity) as usize;
        (count, Some(count))
    }
}

impl ExactSizeIterator for Chunks {}
