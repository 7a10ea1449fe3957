//! Tracking handles.
//!
//! A [`RegionHandle`] is the unit of tracking: one contiguous, page-aligned
//! range with a dirty flag. [`MultiRegionHandle`] and
//! [`SmartMultiRegionHandle`] partition a larger range into granules, each
//! backed by its own region handle.
//!
//! The state a handle shares with the virtual regions it overlaps lives in
//! [`HandleState`]. Regions keep strong references to it, while the
//! consumer-facing handle keeps the state and a clone of the tracker. Nothing
//! in the state points back at regions: on release, the handle looks its
//! regions up again through the tracker.

mod multi;
mod smart;

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use memtrack_core::{AddressRange, MemoryPermission, TrackingBackend, TrackingError, Va};
use parking_lot::Mutex;
use smallvec::SmallVec;

pub use self::{multi::MultiRegionHandle, smart::SmartMultiRegionHandle};
use crate::MemoryTracking;

/// Callback invoked on the next access that overlaps a handle.
///
/// The callback receives the accessed range.
pub type RegionAction = Arc<dyn Fn(AddressRange) + Send + Sync>;

/// Callback invoked whenever a handle turns from clean to dirty.
pub type DirtyEvent = Arc<dyn Fn() + Send + Sync>;

/// A callback collected under the tracking lock, fired after releasing it.
pub(crate) enum Notification {
    Action(RegionAction, AddressRange),
    Dirty(DirtyEvent),
}

impl Notification {
    pub(crate) fn fire(self) {
        match self {
            Self::Action(action, range) => action(range),
            Self::Dirty(event) => event(),
        }
    }
}

/// Callbacks collected during one tracker operation.
///
/// Inline capacity covers the common case so the fault path does not
/// allocate. Larger bursts spill to the heap.
pub(crate) type Notifications = SmallVec<[Notification; 4]>;

/// State shared between a [`RegionHandle`] and the regions it overlaps.
pub(crate) struct HandleState {
    id: u64,
    range: AddressRange,

    /// Set by writes, remaps and unmaps; cleared only by the consumer.
    dirty: AtomicBool,

    /// Whether the last mapping event for this handle was an unmap.
    unmapped: AtomicBool,

    /// Whether a write since the last clear covered only part of the range.
    partial: AtomicBool,

    action: Mutex<Option<RegionAction>>,
    dirty_event: Mutex<Option<DirtyEvent>>,
}

impl HandleState {
    /// Memory that is not mapped has indeterminate content, so a handle
    /// over it starts dirty.
    pub(crate) fn new(id: u64, range: AddressRange, mapped: bool) -> Self {
        Self {
            id,
            range,
            dirty: AtomicBool::new(!mapped),
            unmapped: AtomicBool::new(!mapped),
            partial: AtomicBool::new(false),
            action: Mutex::new(None),
            dirty_event: Mutex::new(None),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn range(&self) -> AddressRange {
        self.range
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub(crate) fn is_unmapped(&self) -> bool {
        self.unmapped.load(Ordering::Acquire)
    }

    pub(crate) fn is_partially_written(&self) -> bool {
        self.partial.load(Ordering::Acquire)
    }

    /// Sets the dirty flag as requested by the consumer.
    ///
    /// Must be called under the tracking lock, before the protection of the
    /// overlapping regions is recomputed.
    pub(crate) fn set_dirty(&self, dirty: bool) {
        if !dirty {
            self.partial.store(false, Ordering::Release);
        }

        self.dirty.store(dirty, Ordering::Release);
    }

    /// Marks the handle dirty, queueing the dirty event on a clean to dirty
    /// transition.
    pub(crate) fn mark_dirty(&self, notifications: &mut Notifications) {
        if self.dirty.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(event) = self.dirty_event.lock().clone() {
            notifications.push(Notification::Dirty(event));
        }
    }

    /// Delivers an access that overlaps the handle.
    pub(crate) fn signal(
        &self,
        range: AddressRange,
        is_write: bool,
        notifications: &mut Notifications,
    ) {
        if let Some(action) = self.action.lock().take() {
            notifications.push(Notification::Action(action, range));
        }

        if is_write {
            if !range.contains_range(self.range) {
                self.partial.store(true, Ordering::Release);
            }

            self.mark_dirty(notifications);
        }
    }

    /// Delivers a map or unmap of memory under the handle.
    ///
    /// Both directions make the content indeterminate, so both dirty the
    /// handle.
    pub(crate) fn signal_mapping_changed(&self, mapped: bool, notifications: &mut Notifications) {
        self.unmapped.store(!mapped, Ordering::Release);
        self.mark_dirty(notifications);
    }

    pub(crate) fn set_action(&self, action: RegionAction) {
        *self.action.lock() = Some(action);
    }

    pub(crate) fn set_dirty_event(&self, event: DirtyEvent) {
        *self.dirty_event.lock() = Some(event);
    }

    /// Returns the host permission this handle needs on its range.
    ///
    /// A pending action needs every access to fault. A clean handle needs
    /// writes to fault. A dirty handle needs nothing.
    pub(crate) fn required_permission(&self) -> MemoryPermission {
        if self.action.lock().is_some() {
            MemoryPermission::NONE
        }
        else if self.is_dirty() {
            MemoryPermission::RW
        }
        else {
            MemoryPermission::R
        }
    }
}

impl std::fmt::Debug for HandleState {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("HandleState")
            .field("id", &self.id)
            .field("range", &self.range)
            .field("dirty", &self.is_dirty())
            .field("unmapped", &self.is_unmapped())
            .finish()
    }
}

/// A tracked range of guest memory.
///
/// The handle is dirty once any write overlapping its range has been
/// signaled, and stays dirty until the consumer clears it with
/// [`consume_dirty`] or [`reprotect`]. The dirty flag can be read at any
/// time without taking the tracking lock.
///
/// Dropping the handle stops tracking. Use [`dispose`] to observe errors
/// raised while restoring host protection.
///
/// [`consume_dirty`]: Self::consume_dirty
/// [`reprotect`]: Self::reprotect
/// [`dispose`]: Self::dispose
pub struct RegionHandle<Backend>
where
    Backend: TrackingBackend,
{
    tracking: MemoryTracking<Backend>,
    state: Arc<HandleState>,
    disposed: bool,
}

impl<Backend> RegionHandle<Backend>
where
    Backend: TrackingBackend,
{
    pub(crate) fn new(tracking: MemoryTracking<Backend>, state: Arc<HandleState>) -> Self {
        Self {
            tracking,
            state,
            disposed: false,
        }
    }

    /// Returns the identifier of the handle, unique within its tracker.
    pub fn id(&self) -> u64 {
        self.state.id()
    }

    /// Returns the first address of the tracked range.
    pub fn address(&self) -> Va {
        self.state.range().address
    }

    /// Returns the size of the tracked range.
    pub fn size(&self) -> u64 {
        self.state.range().size
    }

    /// Returns the exclusive end address of the tracked range.
    pub fn end_address(&self) -> Va {
        self.state.range().end()
    }

    /// Returns the tracked range.
    pub fn range(&self) -> AddressRange {
        self.state.range()
    }

    /// Checks if the tracked range intersects `[address, address + size)`.
    pub fn overlaps(&self, address: Va, size: u64) -> bool {
        self.state
            .range()
            .overlaps(AddressRange::saturating(address, size))
    }

    /// Checks if memory in the range was written since the last clear.
    pub fn dirty(&self) -> bool {
        self.state.is_dirty()
    }

    /// Checks if the last mapping event for the range was an unmap.
    pub fn unmapped(&self) -> bool {
        self.state.is_unmapped()
    }

    pub(crate) fn partially_written(&self) -> bool {
        self.state.is_partially_written()
    }

    /// Returns whether the handle was dirty, clearing it and re-arming
    /// write detection if so.
    pub fn consume_dirty(&self) -> Result<bool, TrackingError> {
        if !self.dirty() {
            return Ok(false);
        }

        self.reprotect(false)?;
        Ok(true)
    }

    /// Sets the dirty flag and updates host protection to match.
    ///
    /// `reprotect(false)` is the usual way to acknowledge a write: the flag
    /// is cleared and the next write faults again. Read the tracked memory
    /// after this call, not before, so that no write slips in between.
    pub fn reprotect(&self, as_dirty: bool) -> Result<(), TrackingError> {
        self.tracking.reprotect_handle(&self.state, as_dirty)
    }

    /// Marks the handle dirty without a write having been signaled.
    pub fn force_dirty(&self) -> Result<(), TrackingError> {
        self.tracking.force_dirty(&self.state)
    }

    /// Registers a one-shot callback fired on the next access, read or
    /// write, that overlaps the handle.
    ///
    /// While the action is pending, host protection on the range is removed
    /// entirely so that reads fault too. The callback runs after the
    /// tracking lock has been released and may call back into the tracker.
    pub fn register_action(
        &self,
        action: impl Fn(AddressRange) + Send + Sync + 'static,
    ) -> Result<(), TrackingError> {
        self.register_shared_action(Arc::new(action))
    }

    pub(crate) fn register_shared_action(&self, action: RegionAction) -> Result<(), TrackingError> {
        self.tracking.register_action(&self.state, action)
    }

    /// Registers a callback fired on every clean to dirty transition.
    ///
    /// Replaces a previously registered callback.
    pub fn register_dirty_event(&self, event: impl Fn() + Send + Sync + 'static) {
        self.state.set_dirty_event(Arc::new(event));
    }

    /// Stops tracking the range.
    ///
    /// The handle is detached from every region it overlaps. Regions left
    /// without handles are removed and their host protection is restored.
    pub fn dispose(mut self) -> Result<(), TrackingError> {
        self.disposed = true;
        self.tracking.detach(&self.state)
    }
}

impl<Backend> Drop for RegionHandle<Backend>
where
    Backend: TrackingBackend,
{
    fn drop(&mut self) {
        if self.disposed {
            return;
        }

        if let Err(err) = self.tracking.detach(&self.state) {
            tracing::warn!(id = self.state.id(), %err, "failed to release region handle");
        }
    }
}

impl<Backend> std::fmt::Debug for RegionHandle<Backend>
where
    Backend: TrackingBackend,
{
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("RegionHandle")
            .field("id", &self.id())
            .field("range", &self.range())
            .field("dirty", &self.dirty())
            .field("unmapped", &self.unmapped())
            .finish()
    }
}
