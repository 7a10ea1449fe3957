use serde::{Deserialize, Serialize};

use crate::TrackingError;

/// Configuration of a memory tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    /// The host page size in bytes. Must be a power of two.
    pub page_size: u64,

    /// Whether host page protection is changed at all.
    ///
    /// When `false`, tracking is purely logical: handles still record
    /// signaled accesses but the backend is never asked to reprotect.
    pub host_protection: bool,

    /// The number of consecutive identical observations after which the
    /// smart multi-region handle coalesces neighbouring granules.
    /// Must be in `1..=32`.
    pub merge_threshold: u32,
}

impl TrackingConfig {
    /// The default host page size.
    pub const DEFAULT_PAGE_SIZE: u64 = 0x1000;

    /// The default merge threshold of smart multi-region handles.
    pub const DEFAULT_MERGE_THRESHOLD: u32 = 4;

    /// Sets the page size.
    pub fn with_page_size(self, page_size: u64) -> Self {
        Self { page_size, ..self }
    }

    /// Enables or disables host page protection.
    pub fn with_host_protection(self, host_protection: bool) -> Self {
        Self {
            host_protection,
            ..self
        }
    }

    /// Sets the merge threshold of smart multi-region handles.
    pub fn with_merge_threshold(self, merge_threshold: u32) -> Self {
        Self {
            merge_threshold,
            ..self
        }
    }

    /// Checks the configuration for values the tracker cannot work with.
    pub fn validate(&self) -> Result<(), TrackingError> {
        if !self.page_size.is_power_of_two() {
            return Err(TrackingError::InvalidPageSize(self.page_size));
        }

        if !(1..=32).contains(&self.merge_threshold) {
            return Err(TrackingError::InvalidConfig(
                "merge threshold must be in 1..=32",
            ));
        }

        Ok(())
    }
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            page_size: Self::DEFAULT_PAGE_SIZE,
            host_protection: true,
            merge_threshold: Self::DEFAULT_MERGE_THRESHOLD,
        }
    }
}
