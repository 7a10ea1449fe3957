use std::sync::Arc;

use memtrack_core::{AddressRange, TrackingBackend, TrackingError, Va};

use super::{RegionAction, RegionHandle};
use crate::MemoryTracking;

/// A tracked range split into fixed-size granules.
///
/// Each granule is backed by its own [`RegionHandle`] and keeps its own
/// dirty flag, so a consumer can invalidate only the parts of a large
/// resource that were actually written. The last granule is shorter when the
/// granularity does not divide the range.
pub struct MultiRegionHandle<Backend>
where
    Backend: TrackingBackend,
{
    range: AddressRange,
    granularity: u64,
    granules: Vec<RegionHandle<Backend>>,
}

impl<Backend> MultiRegionHandle<Backend>
where
    Backend: TrackingBackend,
{
    pub(crate) fn new(
        tracking: &MemoryTracking<Backend>,
        range: AddressRange,
        granularity: u64,
    ) -> Result<Self, TrackingError> {
        let granules = range
            .chunks(granularity)
            .map(|chunk| tracking.track(chunk))
            .collect::<Result<Vec<_>, _>>()?;

        tracing::debug!(%range, granularity, granules = granules.len(), "begin granular tracking");

        Ok(Self {
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

    /// Returns the granule size.
    pub fn granularity(&self) -> u64 {
        self.granularity
    }

    /// Returns the number of granules.
    pub fn granule_count(&self) -> usize {
        self.granules.len()
    }

    /// Returns the handles backing the granules, in address order.
    pub fn granules(&self) -> &[RegionHandle<Backend>] {
        &self.granules
    }

    /// Returns the handle backing granule `index`.
    pub fn granule(&self, index: usize) -> Option<&RegionHandle<Backend>> {
        self.granules.get(index)
    }

    /// Checks if any granule is dirty.
    pub fn dirty(&self) -> bool {
        self.granules.iter().any(RegionHandle::dirty)
    }

    /// Checks if granule `index` is dirty.
    pub fn is_granule_dirty(&self, index: usize) -> bool {
        self.granules.get(index).is_some_and(RegionHandle::dirty)
    }

    /// Marks the whole range dirty.
    pub fn signal_write(&self) -> Result<(), TrackingError> {
        self.granules.iter().try_for_each(RegionHandle::force_dirty)
    }

    /// Marks every granule overlapping `[address, address + size)` dirty.
    pub fn force_dirty(&self, address: Va, size: u64) -> Result<(), TrackingError> {
        self.granule_indices(address, size)
            .try_for_each(|index| self.granules[index].force_dirty())
    }

    /// Registers a one-shot action on every granule overlapping
    /// `[address, address + size)`.
    ///
    /// The action is shared: each granule invokes it at most once, on the
    /// first access to that granule.
    pub fn register_action(
        &self,
        address: Va,
        size: u64,
        action: impl Fn(AddressRange) + Send + Sync + 'static,
    ) -> Result<(), TrackingError> {
        let action: RegionAction = Arc::new(action);

        self.granule_indices(address, size)
            .try_for_each(|index| self.granules[index].register_shared_action(Arc::clone(&action)))
    }

    /// Sets the dirty flag of every granule overlapping
    /// `[address, address + size)` and updates protection to match.
    pub fn reprotect_region(
        &self,
        address: Va,
        size: u64,
        as_dirty: bool,
    ) -> Result<(), TrackingError> {
        self.granule_indices(address, size)
            .try_for_each(|index| self.granules[index].reprotect(as_dirty))
    }

    /// Returns the indices of the dirty granules and clears them.
    pub fn take_dirty_granules(&self) -> Result<Vec<usize>, TrackingError> {
        let mut result = Vec::new();

        for (index, granule) in self.granules.iter().enumerate() {
            if granule.consume_dirty()? {
                result.push(index);
            }
        }

        Ok(result)
    }

    /// Reports every dirty part of the range and clears it.
    ///
    /// Consecutive dirty granules are reported as one range.
    pub fn query_modified(
        &self,
        on_modified: impl FnMut(AddressRange),
    ) -> Result<(), TrackingError> {
        self.query_modified_range(self.range.address, self.range.size, on_modified)
    }

    /// Reports every dirty granule overlapping `[address, address + size)`
    /// and clears it.
    ///
    /// Consecutive dirty granules are reported as one range. Granules
    /// outside the query keep their state.
    pub fn query_modified_range(
        &self,
        address: Va,
        size: u64,
        mut on_modified: impl FnMut(AddressRange),
    ) -> Result<(), TrackingError> {
        let mut pending: Option<AddressRange> = None;

        for index in self.granule_indices(address, size) {
            let granule = &self.granules[index];

            if !granule.consume_dirty()? {
                if let Some(range) = pending.take() {
                    on_modified(range);
                }

                continue;
            }

            pending = match pending {
                Some(range) => Some(AddressRange::from_bounds(range.address, granule.end_address())),
                None => Some(granule.range()),
            };
        }

        if let Some(range) = pending {
            on_modified(range);
        }

        Ok(())
    }

    /// Stops tracking every granule.
    ///
    /// Every granule is released even if some fail. The first error is
    /// returned.
    pub fn dispose(self) -> Result<(), TrackingError> {
        let mut result = Ok(());

        for granule in self.granules {
            if let Err(err) = granule.dispose() {
                result = result.and(Err(err));
            }
        }

        result
    }

    /// Returns the indices of the granules overlapping
    /// `[address, address + size)`.
    fn granule_indices(&self, address: Va, size: u64) -> std::ops::Range<usize> {
        let query = AddressRange::saturating(address, size);

        let Some(overlap) = self.range.intersection(query) else {
            return 0..0;
        };

        let first = (overlap.address - self.range.address) / self.granularity;
        let last = (overlap.end() - self.range.address).div_ceil(self.granularity);

        first as usize..last as usize
    }
}

impl<Backend> std::fmt::Debug for MultiRegionHandle<Backend>
where
    Backend: TrackingBackend,
{
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("MultiRegionHandle")
            .field("range", &self.range)
            .field("granularity", &self.granularity)
            .field("granules", &self.granules.len())
            .finish()
    }
}
