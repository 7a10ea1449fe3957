use memtrack_core::{AddressRange, TrackingBackend, TrackingError, Va};

use super::RegionHandle;
use crate::MemoryTracking;

/// One handle of a smart multi-region handle together with its recent
/// dirty history.
struct SmartGranule<Backend>
where
    Backend: TrackingBackend,
{
    handle: RegionHandle<Backend>,

    /// One bit per observation, most recent in bit 0. Set bits are dirty
    /// observations.
    history: u32,

    /// The number of observations recorded in `history`, saturating at the
    /// merge threshold.
    checks: u32,
}

impl<Backend> SmartGranule<Backend>
where
    Backend: TrackingBackend,
{
    fn new(handle: RegionHandle<Backend>) -> Self {
        Self {
            handle,
            history: 0,
            checks: 0,
        }
    }

    /// Records the result of one query.
    fn observe(&mut self, dirty: bool, threshold: u32) {
        let mask = u32::MAX >> (32 - threshold);
        self.history = ((self.history << 1) | dirty as u32) & mask;
        self.checks = (self.checks + 1).min(threshold);
    }

    fn settled(&self, threshold: u32) -> bool {
        self.checks >= threshold
    }

    fn is_coalesced(&self, granularity: u64) -> bool {
        self.handle.size() > granularity
    }
}

/// A tracked range with adaptive granularity.
///
/// Behaves like a [`MultiRegionHandle`] whose granules are merged and split
/// on the fly:
///
/// - Neighbouring handles with identical dirty/clean history over the last
///   [`merge_threshold`] queries are coalesced into one handle. Ranges that
///   are never written merge, and so do ranges written on every query.
/// - A coalesced handle is split back into granules when a query cuts
///   through it, or when it was dirtied by a write that did not cover all of
///   it. The granules start with an empty history.
///
/// Uniformly accessed ranges thus end up with few handles and few
/// protection changes, while non-uniform access keeps full precision.
///
/// [`MultiRegionHandle`]: super::MultiRegionHandle
/// [`merge_threshold`]: memtrack_core::TrackingConfig::merge_threshold
pub struct SmartMultiRegionHandle<Backend>
where
    Backend: TrackingBackend,
{
    tracking: MemoryTracking<Backend>,
    range: AddressRange,
    granularity: u64,
    merge_threshold: u32,

    /// Handles covering `range` without gaps, in address order.
    granules: Vec<SmartGranule<Backend>>,
}

impl<Backend> SmartMultiRegionHandle<Backend>
where
    Backend: TrackingBackend,
{
    pub(crate) fn new(
        tracking: MemoryTracking<Backend>,
        range: AddressRange,
        granularity: u64,
    ) -> Result<Self, TrackingError> {
        let granules = range
            .chunks(granularity)
            .map(|chunk| tracking.track(chunk).map(SmartGranule::new))
            .collect::<Result<Vec<_>, _>>()?;

        tracing::debug!(%range, granularity, granules = granules.len(), "begin smart tracking");

        Ok(Self {
            merge_threshold: tracking.merge_threshold(),
            tracking,
            range,
            granularity,
            granules,
        })
    }

    /// Returns the first address of the tracked range.
    pub fn address(&self) -> Va {
        self.range.address
    }

    /// Returns the size of the tracked range.
    pub fn size(&self) -> u64 {
        self.range.size
    }

    /// Returns the tracked range.
    pub fn range(&self) -> AddressRange {
        self.range
    }

    /// Returns the finest granularity the handle reports at.
    pub fn granularity(&self) -> u64 {
        self.granularity
    }

    /// Returns the number of granules at the finest granularity.
    pub fn granule_count(&self) -> usize {
        self.range.size.div_ceil(self.granularity) as usize
    }

    /// Returns the number of region handles currently backing the range.
    pub fn handle_count(&self) -> usize {
        self.granules.len()
    }

    /// Returns the ranges of the region handles currently backing the range.
    pub fn handle_ranges(&self) -> Vec<AddressRange> {
        self.granules
            .iter()
            .map(|granule| granule.handle.range())
            .collect()
    }

    /// Checks if any part of the range is dirty.
    pub fn dirty(&self) -> bool {
        self.granules.iter().any(|granule| granule.handle.dirty())
    }

    /// Marks the whole range dirty.
    pub fn signal_write(&self) -> Result<(), TrackingError> {
        self.granules
            .iter()
            .try_for_each(|granule| granule.handle.force_dirty())
    }

    /// Marks every handle overlapping `[address, address + size)` dirty.
    pub fn force_dirty(&self, address: Va, size: u64) -> Result<(), TrackingError> {
        let Some(query) = self.clamp(address, size) else {
            return Ok(());
        };

        self.granules[self.first_index(query.address)..]
            .iter()
            .take_while(|granule| granule.handle.address() < query.end())
            .try_for_each(|granule| granule.handle.force_dirty())
    }

    /// Returns the indices of the dirty granules and clears them.
    ///
    /// Indices always refer to granules at the finest granularity,
    /// regardless of how handles are currently merged.
    pub fn take_dirty_granules(&mut self) -> Result<Vec<usize>, TrackingError> {
        let base = self.range.address;
        let granularity = self.granularity;
        let mut result = Vec::new();

        self.query_modified(|range| {
            let first = (range.address - base) / granularity;
            let last = (range.end() - base).div_ceil(granularity);
            result.extend(first as usize..last as usize);
        })?;

        Ok(result)
    }

    /// Reports every dirty part of the range and clears it.
    ///
    /// Consecutive dirty parts are reported as one range.
    pub fn query_modified(
        &mut self,
        on_modified: impl FnMut(AddressRange),
    ) -> Result<(), TrackingError> {
        self.query_modified_range(self.range.address, self.range.size, on_modified)
    }

    /// Reports every dirty part overlapping `[address, address + size)` and
    /// clears it.
    ///
    /// Consecutive dirty parts are reported as one range. Each query is one
    /// observation for the merge/split policy of the handles it touches.
    pub fn query_modified_range(
        &mut self,
        address: Va,
        size: u64,
        mut on_modified: impl FnMut(AddressRange),
    ) -> Result<(), TrackingError> {
        let Some(query) = self.clamp(address, size) else {
            return Ok(());
        };

        //
        // Split coalesced handles that the query cuts through or that were
        // written only in part, so the report below is exact.
        //

        let mut index = self.first_index(query.address);
        while index < self.granules.len() && self.granules[index].handle.address() < query.end() {
            let granule = &self.granules[index];

            if granule.is_coalesced(self.granularity)
                && (granule.handle.partially_written()
                    || !query.contains_range(granule.handle.range()))
            {
                index += self.split(index)?;
            }
            else {
                index += 1;
            }
        }

        //
        // Report and clear.
        //

        let first = self.first_index(query.address);
        let mut pending: Option<AddressRange> = None;

        for granule in &mut self.granules[first..] {
            if granule.handle.address() >= query.end() {
                break;
            }

            let dirty = granule.handle.consume_dirty()?;
            granule.observe(dirty, self.merge_threshold);

            if !dirty {
                if let Some(range) = pending.take() {
                    on_modified(range);
                }

                continue;
            }

            pending = match pending {
                Some(range) => Some(AddressRange::from_bounds(
                    range.address,
                    granule.handle.end_address(),
                )),
                None => Some(granule.handle.range()),
            };
        }

        if let Some(range) = pending {
            on_modified(range);
        }

        //
        // Coalesce neighbours with a settled and identical history.
        //

        let mut index = first;
        while index + 1 < self.granules.len() {
            let left = &self.granules[index];
            let right = &self.granules[index + 1];

            if !query.contains_range(right.handle.range()) {
                break;
            }

            if query.contains_range(left.handle.range()) && self.can_merge(left, right) {
                self.merge(index)?;
            }
            else {
                index += 1;
            }
        }

        Ok(())
    }

    /// Stops tracking the range.
    ///
    /// Every handle is released even if some fail. The first error is
    /// returned.
    pub fn dispose(self) -> Result<(), TrackingError> {
        let mut result = Ok(());

        for granule in self.granules {
            if let Err(err) = granule.handle.dispose() {
                result = result.and(Err(err));
            }
        }

        result
    }

    fn can_merge(&self, left: &SmartGranule<Backend>, right: &SmartGranule<Backend>) -> bool {
        !left.handle.dirty()
            && !right.handle.dirty()
            && left.settled(self.merge_threshold)
            && right.settled(self.merge_threshold)
            && left.history == right.history
    }

    /// Replaces the handle at `index` with granule-sized handles.
    ///
    /// Returns the number of new handles.
    fn split(&mut self, index: usize) -> Result<usize, TrackingError> {
        let range = self.granules[index].handle.range();

        let pieces = range
            .chunks(self.granularity)
            .map(|chunk| self.tracking.track(chunk).map(SmartGranule::new))
            .collect::<Result<Vec<_>, _>>()?;

        // The new handles are attached, so no write can be missed from here.
        if self.granules[index].handle.dirty() {
            for piece in &pieces {
                piece.handle.force_dirty()?;
            }
        }

        tracing::debug!(%range, pieces = pieces.len(), "splitting smart handle");

        let count = pieces.len();
        let old = self.granules.splice(index..=index, pieces).collect::<Vec<_>>();

        for granule in old {
            granule.handle.dispose()?;
        }

        Ok(count)
    }

    /// Replaces the handles at `index` and `index + 1` with one handle
    /// covering both.
    fn merge(&mut self, index: usize) -> Result<(), TrackingError> {
        let range = AddressRange::from_bounds(
            self.granules[index].handle.address(),
            self.granules[index + 1].handle.end_address(),
        );

        let handle = self.tracking.track(range)?;

        if self.granules[index].handle.dirty() || self.granules[index + 1].handle.dirty() {
            handle.force_dirty()?;
        }

        tracing::debug!(%range, "merging smart handles");

        let merged = SmartGranule {
            handle,
            history: self.granules[index].history,
            checks: self.granules[index].checks,
        };

        let right = self.granules.remove(index + 1);
        let left = std::mem::replace(&mut self.granules[index], merged);

        let result = left.handle.dispose();
        result.and(right.handle.dispose())
    }

    /// Returns the index of the first handle ending after `address`.
    fn first_index(&self, address: Va) -> usize {
        self.granules
            .partition_point(|granule| granule.handle.end_address() <= address)
    }

    /// Intersects `[address, address + size)` with the tracked range.
    fn clamp(&self, address: Va, size: u64) -> Option<AddressRange> {
        self.range
            .intersection(AddressRange::saturating(address, size))
    }
}

impl<Backend> std::fmt::Debug for SmartMultiRegionHandle<Backend>
where
    Backend: TrackingBackend,
{
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("SmartMultiRegionHandle")
            .field("range", &self.range)
            .field("granularity", &self.granularity)
            .field("handles", &self.handle_ranges())
            .finish()
    }
}
