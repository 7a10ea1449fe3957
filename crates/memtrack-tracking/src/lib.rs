//! Write tracking for emulated guest memory.
//!
//! [`MemoryTracking`] narrows host page protection around tracked guest
//! ranges so that writes fault. The host runtime forwards those faults to
//! [`MemoryTracking::signal_access`], which flags the affected handles as
//! dirty and restores access. Consumers such as a GPU texture cache poll the
//! dirty flags to decide what has to be re-uploaded.
//!
//! Three kinds of handles are available:
//!
//! - [`RegionHandle`]: one dirty flag for a whole page-aligned range.
//! - [`MultiRegionHandle`]: one dirty flag per fixed-size granule.
//! - [`SmartMultiRegionHandle`]: granules that merge and split depending on
//!   how uniformly they are written.
//!
//! Tracked ranges are indexed as non-overlapping virtual regions, each
//! referencing every handle that covers it. All structural changes happen
//! under one lock. Dirty flags are atomics and can be read without it.

mod handle;
mod region;
mod tracking;

#[cfg(test)]
mod mock;

pub use memtrack_core::{
    AddressRange, MemoryPermission, TrackingBackend, TrackingConfig, TrackingError, Va,
};

pub use self::{
    handle::{DirtyEvent, MultiRegionHandle, RegionAction, RegionHandle, SmartMultiRegionHandle},
    tracking::{MemoryTracking, RegionInfo},
};
