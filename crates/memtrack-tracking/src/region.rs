use std::sync::Arc;

use memtrack_core::{AddressRange, MemoryPermission, TrackingBackend, TrackingError, Va};
use memtrack_range::RangeItem;
use smallvec::SmallVec;

use crate::{
    handle::{HandleState, Notifications},
    tracking::TrackingInner,
};

/// An entry of the interval index: a page-aligned range together with every
/// handle whose range covers it.
///
/// Regions are created and split so that each attached handle covers the
/// whole region.
pub(crate) struct VirtualRegion {
    range: AddressRange,
    handles: SmallVec<[Arc<HandleState>; 2]>,

    /// Whether every page of the region is backed by host memory.
    mapped: bool,

    /// The permission last applied to the host, if known.
    protection: Option<MemoryPermission>,
}

impl VirtualRegion {
    pub(crate) fn new(range: AddressRange, mapped: bool) -> Self {
        Self {
            range,
            handles: SmallVec::new(),
            mapped,
            protection: None,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub(crate) fn add_handle(&mut self, handle: Arc<HandleState>) {
        debug_assert!(handle.range().contains_range(self.range));
        self.handles.push(handle);
    }

    pub(crate) fn remove_handle(&mut self, handle: &Arc<HandleState>) -> bool {
        match self.handles.iter().position(|h| Arc::ptr_eq(h, handle)) {
            Some(index) => {
                self.handles.swap_remove(index);
                true
            }
            None => false,
        }
    }

    /// Forwards an access to every handle overlapping `range`.
    pub(crate) fn signal(
        &self,
        range: AddressRange,
        is_write: bool,
        notifications: &mut Notifications,
    ) {
        for handle in &self.handles {
            if handle.range().overlaps(range) {
                handle.signal(range, is_write, notifications);
            }
        }
    }

    /// Forwards a mapping change to every handle.
    ///
    /// The host protection of freshly mapped or unmapped memory is unknown,
    /// so the cached permission is dropped.
    pub(crate) fn signal_mapping_changed(&mut self, mapped: bool, notifications: &mut Notifications) {
        self.mapped = mapped;
        self.protection = None;

        for handle in &self.handles {
            handle.signal_mapping_changed(mapped, notifications);
        }
    }

    /// Returns the most restrictive permission required by the handles.
    pub(crate) fn required_permission(&self) -> MemoryPermission {
        self.handles
            .iter()
            .fold(MemoryPermission::RW, |result, handle| {
                result & handle.required_permission()
            })
    }

    /// Forgets the permission last applied, forcing the next update to
    /// reprotect.
    pub(crate) fn invalidate_protection(&mut self) {
        self.protection = None;
    }

    /// Applies the required permission to the host, if it changed.
    ///
    /// Regions that are not fully mapped are left alone.
    pub(crate) fn update_protection<Backend>(
        &mut self,
        tracking: &TrackingInner<Backend>,
    ) -> Result<(), TrackingError>
    where
        Backend: TrackingBackend,
    {
        if !self.mapped {
            return Ok(());
        }

        let permission = self.required_permission();
        if self.protection == Some(permission) {
            return Ok(());
        }

        tracking.protect(self.range, permission)?;
        self.protection = Some(permission);
        Ok(())
    }

    /// Restores full access on the region.
    pub(crate) fn widen<Backend>(
        &mut self,
        tracking: &TrackingInner<Backend>,
    ) -> Result<(), TrackingError>
    where
        Backend: TrackingBackend,
    {
        if !self.mapped || self.protection == Some(MemoryPermission::RW) {
            return Ok(());
        }

        tracking.protect(self.range, MemoryPermission::RW)?;
        self.protection = Some(MemoryPermission::RW);
        Ok(())
    }

    pub(crate) fn handles(&self) -> &[Arc<HandleState>] {
        &self.handles
    }

    pub(crate) fn is_mapped(&self) -> bool {
        self.mapped
    }

    pub(crate) fn protection(&self) -> Option<MemoryPermission> {
        self.protection
    }
}

impl RangeItem for VirtualRegion {
    fn range(&self) -> AddressRange {
        self.range
    }

    fn split(&mut self, at: Va) -> Self {
        let head = AddressRange::from_bounds(self.range.address, at);
        let tail = AddressRange::from_bounds(at, self.range.end());

        let handles = self
            .handles
            .iter()
            .filter(|handle| handle.range().overlaps(tail))
            .cloned()
            .collect();

        self.handles.retain(|handle| handle.range().overlaps(head));
        self.range = head;

        Self {
            range: tail,
            handles,
            mapped: self.mapped,
            protection: self.protection,
        }
    }

    /// Neighbours are joined when they are covered by exactly the same
    /// handles and agree on mapping and applied protection.
    fn can_join(&self, next: &Self) -> bool {
        self.range.end() == next.range.address
            && self.mapped == next.mapped
            && self.protection == next.protection
            && self.handles.len() == next.handles.len()
            && self
                .handles
                .iter()
                .all(|handle| next.handles.iter().any(|other| Arc::ptr_eq(handle, other)))
    }

    fn join(&mut self, next: Self) {
        debug_assert!(self.can_join(&next));
        self.range = AddressRange::from_bounds(self.range.address, next.range.end());
    }
}

impl std::fmt::Debug for VirtualRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("VirtualRegion")
            .field("range", &self.range)
            .field("handles", &self.handles.len())
            .field("mapped", &self.mapped)
            .field("protection", &self.protection)
            .finish()
    }
}
