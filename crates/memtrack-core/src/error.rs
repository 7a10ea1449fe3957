use crate::Va;

/// An error that can occur while tracking guest memory.
#[derive(thiserror::Error, Debug)]
pub enum TrackingError {
    /// An error occurred in the memory backend.
    #[error(transparent)]
    Backend(Box<dyn std::error::Error + Send + Sync>),

    /// An access hit an address that is neither tracked nor mapped.
    ///
    /// This is not a tracking artifact: the guest touched memory that does
    /// not exist.
    #[error("Invalid memory region ({address}, size: {size:#x})")]
    InvalidMemoryRegion {
        /// The faulting address.
        address: Va,

        /// The size of the faulting access.
        size: u64,
    },

    /// The given range is empty or its end does not fit in 64 bits.
    #[error("Invalid range ({address}, size: {size:#x})")]
    InvalidRange {
        /// The start of the rejected range.
        address: Va,

        /// The size of the rejected range.
        size: u64,
    },

    /// The given granularity is zero or not a multiple of the page size.
    #[error("Invalid granularity {0:#x}")]
    InvalidGranularity(u64),

    /// The given page size is zero or not a power of two.
    #[error("Invalid page size {0:#x}")]
    InvalidPageSize(u64),

    /// The configuration was rejected.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

impl TrackingError {
    /// Wraps an error returned by the memory backend.
    pub fn backend(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Backend(Box::new(err))
    }
}
