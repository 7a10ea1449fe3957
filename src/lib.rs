//! Page-protection based write tracking for emulated guest memory.
//!
//! This crate re-exports the workspace crates behind one facade:
//!
//! - [`memtrack_core`]: addresses, permissions, the backend contract, errors
//!   and configuration. Always available.
//! - [`range`]: the non-overlapping interval index (feature `range`).
//! - [`MemoryTracking`] and the region handles (feature `tracking`).
//!
//! # Example
//!
//! ```no_run
//! # use memtrack::{MemoryTracking, TrackingBackend, TrackingConfig, TrackingError, Va};
//! # fn example(backend: impl TrackingBackend) -> Result<(), TrackingError> {
//! let tracking = MemoryTracking::new(backend, TrackingConfig::default())?;
//! let handle = tracking.begin_tracking(Va(0x1000), 0x1000)?;
//!
//! // Called by the fault handler of the host runtime.
//! tracking.signal_access(Va(0x1500), 4, true)?;
//!
//! if handle.consume_dirty()? {
//!     // Re-upload the range.
//! }
//! # Ok(())
//! # }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]

pub use memtrack_core::*;

/// Non-overlapping address interval index.
#[cfg(feature = "range")]
#[cfg_attr(docsrs, doc(cfg(feature = "range")))]
pub mod range {
    pub use memtrack_range::*;
}

#[cfg(feature = "tracking")]
#[cfg_attr(docsrs, doc(cfg(feature = "tracking")))]
pub use memtrack_tracking::{
    DirtyEvent, MemoryTracking, MultiRegionHandle, RegionAction, RegionHandle, RegionInfo,
    SmartMultiRegionHandle,
};
