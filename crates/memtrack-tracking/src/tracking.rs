use std::{
    collections::BTreeSet,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use memtrack_core::{
    AddressRange, MemoryPermission, TrackingBackend, TrackingConfig, TrackingError, Va,
};
use memtrack_range::{NonOverlappingRangeList, RangeItem as _};
use parking_lot::Mutex;

use crate::{
    handle::{
        HandleState, MultiRegionHandle, Notifications, RegionAction, RegionHandle,
        SmartMultiRegionHandle,
    },
    region::VirtualRegion,
};

/// A snapshot of one virtual region, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionInfo {
    /// The page-aligned range of the region.
    pub range: AddressRange,

    /// The number of handles covering the region.
    pub handles: usize,

    /// Whether the region is fully backed by host memory.
    pub mapped: bool,

    /// The permission last applied to the host, if known.
    pub protection: Option<MemoryPermission>,
}

/// The tracking coordinator.
///
/// Owns the index of virtual regions and serializes every structural change
/// of the region/handle graph under one lock. Cloning is cheap: clones share
/// the same state.
///
/// # Fault path
///
/// The host runtime forwards page-protection faults to [`signal_access`].
/// The return value tells the runtime what to do with the fault:
///
/// - `Ok(true)`: the fault was caused by tracking. State and protection have
///   been updated; resume the guest.
/// - `Ok(false)`: the address is mapped but not tracked. Its page has been
///   widened to read/write; treat the fault as a genuine access violation.
/// - `Err(TrackingError::InvalidMemoryRegion { .. })`: the address is not
///   mapped at all.
///
/// [`signal_access`]: Self::signal_access
pub struct MemoryTracking<Backend>
where
    Backend: TrackingBackend,
{
    inner: Arc<TrackingInner<Backend>>,
}

pub(crate) struct TrackingInner<Backend>
where
    Backend: TrackingBackend,
{
    backend: Backend,
    page_size: u64,
    merge_threshold: u32,
    host_protection: AtomicBool,
    next_handle_id: AtomicU64,
    state: Mutex<TrackingState>,
}

struct TrackingState {
    regions: NonOverlappingRangeList<VirtualRegion>,

    /// Untracked pages already widened to read/write by the fault path.
    relaxed_pages: BTreeSet<Va>,

    /// Start addresses of regions to remove, reused across releases.
    scratch: Vec<Va>,
}

impl<Backend> TrackingInner<Backend>
where
    Backend: TrackingBackend,
{
    /// Changes host protection, unless tracking is purely logical.
    pub(crate) fn protect(
        &self,
        range: AddressRange,
        permission: MemoryPermission,
    ) -> Result<(), TrackingError> {
        if !self.host_protection.load(Ordering::Acquire) {
            return Ok(());
        }

        tracing::trace!(%range, %permission, "reprotect");
        self.backend.reprotect(range.address, range.size, permission)
    }
}

impl<Backend> Clone for MemoryTracking<Backend>
where
    Backend: TrackingBackend,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<Backend> MemoryTracking<Backend>
where
    Backend: TrackingBackend,
{
    /// Creates a new tracker on top of `backend`.
    pub fn new(backend: Backend, config: TrackingConfig) -> Result<Self, TrackingError> {
        config.validate()?;

        Ok(Self {
            inner: Arc::new(TrackingInner {
                backend,
                page_size: config.page_size,
                merge_threshold: config.merge_threshold,
                host_protection: AtomicBool::new(config.host_protection),
                next_handle_id: AtomicU64::new(1),
                state: Mutex::new(TrackingState {
                    regions: NonOverlappingRangeList::new(),
                    relaxed_pages: BTreeSet::new(),
                    scratch: Vec::new(),
                }),
            }),
        })
    }

    /// Returns the memory backend.
    pub fn backend(&self) -> &Backend {
        &self.inner.backend
    }

    /// Returns the host page size.
    pub fn page_size(&self) -> u64 {
        self.inner.page_size
    }

    /// Returns the merge threshold used by smart multi-region handles.
    pub fn merge_threshold(&self) -> u32 {
        self.inner.merge_threshold
    }

    /// Checks if host page protection is changed, as opposed to purely
    /// logical tracking.
    pub fn host_protection(&self) -> bool {
        self.inner.host_protection.load(Ordering::Acquire)
    }

    /// Enables host page protection.
    ///
    /// The required protection is re-applied to every mapped region.
    pub fn enable_host_protection(&self) -> Result<(), TrackingError> {
        let inner = &*self.inner;
        let mut state = inner.state.lock();

        if inner.host_protection.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        tracing::debug!(regions = state.regions.len(), "enabling host protection");

        for region in state.regions.iter_mut() {
            region.invalidate_protection();
        }

        update_protection(inner, state.regions.iter_mut())
    }

    /// Disables host page protection, switching to purely logical tracking.
    ///
    /// Every protected region is widened back to read/write first.
    pub fn disable_host_protection(&self) -> Result<(), TrackingError> {
        let inner = &*self.inner;
        let mut state = inner.state.lock();

        if !inner.host_protection.load(Ordering::Acquire) {
            return Ok(());
        }

        tracing::debug!(regions = state.regions.len(), "disabling host protection");

        let mut result = Ok(());
        for region in state.regions.iter_mut() {
            if let Err(err) = region.widen(inner) {
                result = result.and(Err(err));
            }
        }

        inner.host_protection.store(false, Ordering::Release);
        result
    }

    /// Expands `[address, address + size)` outward to whole pages.
    ///
    /// The result always covers the requested range. Fails for empty ranges
    /// and ranges whose aligned end does not fit in 64 bits.
    pub fn page_align(&self, address: Va, size: u64) -> Result<AddressRange, TrackingError> {
        if size == 0 {
            return Err(TrackingError::InvalidRange { address, size });
        }

        AddressRange::new(address, size)
            .page_align(self.inner.page_size)
            .ok_or(TrackingError::InvalidRange { address, size })
    }

    /// Notifies the tracker that a guest range became backed by host memory.
    ///
    /// Every region overlapping the range that is now fully mapped treats
    /// the event as a write (the content is unknown) and re-applies its
    /// protection. All regions are signalled before any protection changes,
    /// so a backend error never leaves a region unsignalled.
    pub fn map(&self, address: Va, size: u64) -> Result<(), TrackingError> {
        let range = checked_range(address, size)?;
        let inner = &*self.inner;

        tracing::debug!(%range, "map");

        let mut notifications = Notifications::new();
        let result = {
            let mut state = inner.state.lock();

            for region in state.regions.overlaps_mut(range) {
                let region_range = region.range();

                if inner
                    .backend
                    .is_range_mapped(region_range.address, region_range.size)
                {
                    region.signal_mapping_changed(true, &mut notifications);
                }
            }

            update_protection(inner, state.regions.overlaps_mut(range))
        };

        fire(notifications);
        result
    }

    /// Notifies the tracker that a guest range is about to lose its backing.
    ///
    /// Handles overlapping the range are marked dirty and unmapped. The
    /// regions themselves stay in the index.
    pub fn unmap(&self, address: Va, size: u64) -> Result<(), TrackingError> {
        let range = checked_range(address, size)?;
        let inner = &*self.inner;

        tracing::debug!(%range, "unmap");

        let mut notifications = Notifications::new();
        {
            let mut state = inner.state.lock();

            for region in state.regions.overlaps_mut(range) {
                region.signal_mapping_changed(false, &mut notifications);
            }

            let page_size = inner.page_size;
            state
                .relaxed_pages
                .retain(|&page| !AddressRange::new(page, page_size).overlaps(range));
        }

        fire(notifications);
        Ok(())
    }

    /// Starts tracking writes to `[address, address + size)`.
    ///
    /// The range is expanded to whole pages. The handle starts clean when
    /// the range is mapped and dirty otherwise.
    pub fn begin_tracking(
        &self,
        address: Va,
        size: u64,
    ) -> Result<RegionHandle<Backend>, TrackingError> {
        let range = self.page_align(address, size)?;
        self.track(range)
    }

    /// Starts tracking writes to `[address, address + size)` at a fixed
    /// granularity.
    ///
    /// `granularity` must be a non-zero multiple of the page size.
    pub fn begin_granular_tracking(
        &self,
        address: Va,
        size: u64,
        granularity: u64,
    ) -> Result<MultiRegionHandle<Backend>, TrackingError> {
        let range = self.page_align(address, size)?;
        self.check_granularity(granularity)?;

        MultiRegionHandle::new(self, range, granularity)
    }

    /// Starts tracking writes to `[address, address + size)` with adaptive
    /// granularity.
    ///
    /// `granularity` is the finest precision the handle reports at and must
    /// be a non-zero multiple of the page size.
    pub fn begin_smart_granular_tracking(
        &self,
        address: Va,
        size: u64,
        granularity: u64,
    ) -> Result<SmartMultiRegionHandle<Backend>, TrackingError> {
        let range = self.page_align(address, size)?;
        self.check_granularity(granularity)?;

        SmartMultiRegionHandle::new(self.clone(), range, granularity)
    }

    /// Signals a one-byte access at `address`.
    ///
    /// See [`signal_access`](Self::signal_access).
    pub fn signal_byte_access(&self, address: Va, is_write: bool) -> Result<bool, TrackingError> {
        self.signal_access(address, 1, is_write)
    }

    /// Signals an access to `[address, address + size)`.
    ///
    /// This is the fault-path entry point. A `size` of zero is treated as a
    /// one-byte access. See the [type-level documentation](Self) for the
    /// meaning of the result.
    pub fn signal_access(
        &self,
        address: Va,
        size: u64,
        is_write: bool,
    ) -> Result<bool, TrackingError> {
        let range = AddressRange::checked(address, size.max(1))
            .ok_or(TrackingError::InvalidRange { address, size })?;

        let mut notifications = Notifications::new();
        let result = self.signal_access_locked(range, is_write, &mut notifications);

        fire(notifications);
        result
    }

    fn signal_access_locked(
        &self,
        range: AddressRange,
        is_write: bool,
        notifications: &mut Notifications,
    ) -> Result<bool, TrackingError> {
        let inner = &*self.inner;
        let mut state = inner.state.lock();

        let mut found = false;
        for region in state.regions.overlaps_mut(range) {
            found = true;
            region.signal(range, is_write, notifications);
        }

        if found {
            tracing::trace!(%range, is_write, "tracked access");

            update_protection(inner, state.regions.overlaps_mut(range))?;
            return Ok(true);
        }

        if !inner.backend.is_mapped(range.address) {
            tracing::error!(%range, is_write, "access to invalid memory region");

            return Err(TrackingError::InvalidMemoryRegion {
                address: range.address,
                size: range.size,
            });
        }

        //
        // The address is mapped but no handle covers it. Protection was
        // narrowed at page granularity around a neighbouring handle, or a
        // region was released while a fault was in flight. Widen the page so
        // the access does not fault again.
        //

        let page = range.address.align_down(inner.page_size);
        if state.relaxed_pages.insert(page) {
            tracing::debug!(%page, "relaxing protection of untracked page");

            if let Err(err) = inner.protect(
                AddressRange::new(page, inner.page_size),
                MemoryPermission::RW,
            ) {
                state.relaxed_pages.remove(&page);
                return Err(err);
            }
        }

        Ok(false)
    }

    /// Changes host protection of `[address, address + size)`.
    ///
    /// Does nothing while host protection is disabled.
    pub fn protect_region(
        &self,
        address: Va,
        size: u64,
        permission: MemoryPermission,
    ) -> Result<(), TrackingError> {
        self.inner.protect(checked_range(address, size)?, permission)
    }

    /// Returns the number of virtual regions in the index.
    pub fn region_count(&self) -> usize {
        self.inner.state.lock().regions.len()
    }

    /// Returns a snapshot of every virtual region, in address order.
    pub fn regions(&self) -> Vec<RegionInfo> {
        self.inner
            .state
            .lock()
            .regions
            .iter()
            .map(|region| RegionInfo {
                range: region.range(),
                handles: region.handles().len(),
                mapped: region.is_mapped(),
                protection: region.protection(),
            })
            .collect()
    }

    fn check_granularity(&self, granularity: u64) -> Result<(), TrackingError> {
        if granularity == 0 || granularity % self.inner.page_size != 0 {
            return Err(TrackingError::InvalidGranularity(granularity));
        }

        Ok(())
    }

    /// Creates a handle over a page-aligned range.
    pub(crate) fn track(&self, range: AddressRange) -> Result<RegionHandle<Backend>, TrackingError> {
        let state = self.register(range)?;
        Ok(RegionHandle::new(self.clone(), state))
    }

    /// Attaches a new handle state to every region covering `range`,
    /// creating and splitting regions as needed.
    fn register(&self, range: AddressRange) -> Result<Arc<HandleState>, TrackingError> {
        debug_assert!(range.address.is_aligned(self.inner.page_size));
        debug_assert!(range.end().is_aligned(self.inner.page_size));

        let inner = &*self.inner;
        let mut guard = inner.state.lock();
        let state = &mut *guard;

        let mapped = inner.backend.is_range_mapped(range.address, range.size);
        let id = inner.next_handle_id.fetch_add(1, Ordering::Relaxed);
        let handle = Arc::new(HandleState::new(id, range, mapped));

        tracing::debug!(id, %range, mapped, "begin tracking");

        if !state.relaxed_pages.is_empty() {
            state.relaxed_pages.retain(|&page| !range.contains(page));
        }

        let mut result = Ok(());
        let regions = state.regions.get_or_insert_with(range, |range| {
            let mapped = inner.backend.is_range_mapped(range.address, range.size);
            tracing::debug!(%range, mapped, "creating virtual region");
            VirtualRegion::new(range, mapped)
        });

        for region in regions {
            region.add_handle(Arc::clone(&handle));

            if result.is_ok() {
                result = region.update_protection(inner);
            }
        }

        match result {
            Ok(()) => Ok(handle),
            Err(err) => {
                if let Err(detach_err) = Self::detach_locked(inner, state, &handle) {
                    tracing::warn!(id, %detach_err, "failed to roll back handle registration");
                }

                Err(err)
            }
        }
    }

    /// Sets the dirty flag of a handle and updates protection to match.
    ///
    /// A handle that could not be protected everywhere is left dirty.
    pub(crate) fn reprotect_handle(
        &self,
        handle: &HandleState,
        as_dirty: bool,
    ) -> Result<(), TrackingError> {
        let inner = &*self.inner;
        let mut state = inner.state.lock();

        handle.set_dirty(as_dirty);

        let result = update_protection(inner, state.regions.overlaps_mut(handle.range()));
        if result.is_err() && !as_dirty {
            handle.set_dirty(true);
        }

        result
    }

    /// Marks a handle dirty as if its whole range had been written.
    pub(crate) fn force_dirty(&self, handle: &HandleState) -> Result<(), TrackingError> {
        let inner = &*self.inner;

        let mut notifications = Notifications::new();
        let result = {
            let mut state = inner.state.lock();

            handle.mark_dirty(&mut notifications);

            update_protection(inner, state.regions.overlaps_mut(handle.range()))
        };

        fire(notifications);
        result
    }

    /// Installs a pending action on a handle.
    pub(crate) fn register_action(
        &self,
        handle: &HandleState,
        action: RegionAction,
    ) -> Result<(), TrackingError> {
        let inner = &*self.inner;
        let mut state = inner.state.lock();

        handle.set_action(action);

        update_protection(inner, state.regions.overlaps_mut(handle.range()))
    }

    /// Detaches a handle from every region it covers.
    pub(crate) fn detach(&self, handle: &Arc<HandleState>) -> Result<(), TrackingError> {
        let inner = &*self.inner;
        let mut guard = inner.state.lock();

        Self::detach_locked(inner, &mut guard, handle)
    }

    /// Detaches a handle, removing regions left without handles and joining
    /// neighbours whose handle sets became identical.
    ///
    /// Keeps going after a backend error so the index stays consistent, and
    /// returns the first error.
    fn detach_locked(
        inner: &TrackingInner<Backend>,
        state: &mut TrackingState,
        handle: &Arc<HandleState>,
    ) -> Result<(), TrackingError> {
        tracing::debug!(id = handle.id(), range = %handle.range(), "end tracking");

        let mut result = Ok(());
        let mut empty = std::mem::take(&mut state.scratch);
        empty.clear();

        for region in state.regions.overlaps_mut(handle.range()) {
            region.remove_handle(handle);

            if region.is_empty() {
                empty.push(region.range().address);
            }
            else if let Err(err) = region.update_protection(inner) {
                result = result.and(Err(err));
            }
        }

        for &address in &empty {
            let Some(mut region) = state.regions.remove(address) else {
                continue;
            };

            tracing::debug!(range = %region.range(), "removing virtual region");

            if let Err(err) = region.widen(inner) {
                result = result.and(Err(err));
            }
        }

        empty.clear();
        state.scratch = empty;

        let joined = state.regions.coalesce(handle.range());
        if joined > 0 {
            tracing::debug!(joined, range = %handle.range(), "joined virtual regions");
        }

        result
    }
}

fn checked_range(address: Va, size: u64) -> Result<AddressRange, TrackingError> {
    if size == 0 {
        return Err(TrackingError::InvalidRange { address, size });
    }

    AddressRange::checked(address, size).ok_or(TrackingError::InvalidRange { address, size })
}

/// Updates the protection of every region, returning the first error.
fn update_protection<'a, Backend>(
    inner: &TrackingInner<Backend>,
    regions: impl Iterator<Item = &'a mut VirtualRegion>,
) -> Result<(), TrackingError>
where
    Backend: TrackingBackend,
{
    let mut result = Ok(());

    for region in regions {
        if let Err(err) = region.update_protection(inner) {
            result = result.and(Err(err));
        }
    }

    result
}

fn fire(notifications: Notifications) {
    for notification in notifications {
        notification.fire();
    }
}
