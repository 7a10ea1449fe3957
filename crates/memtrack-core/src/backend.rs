use crate::{MemoryPermission, TrackingError, Va};

/// The host virtual-memory manager that backs guest memory.
///
/// The tracker never maps or unmaps memory itself. It only asks whether
/// guest ranges are backed and narrows or widens host page protection to
/// observe writes.
pub trait TrackingBackend {
    /// Checks if the page containing `address` is backed by host memory.
    fn is_mapped(&self, address: Va) -> bool;

    /// Checks if every page of `[address, address + size)` is backed by host
    /// memory.
    fn is_range_mapped(&self, address: Va, size: u64) -> bool;

    /// Changes the host protection of a page-aligned range.
    fn reprotect(
        &self,
        address: Va,
        size: u64,
        permission: MemoryPermission,
    ) -> Result<(), TrackingError>;
}

impl<T> TrackingBackend for &T
where
    T: TrackingBackend + ?Sized,
{
    fn is_mapped(&self, address: Va) -> bool {
        (**self).is_mapped(address)
    }

    fn is_range_mapped(&self, address: Va, size: u64) -> bool {
        (**self).is_range_mapped(address, size)
    }

    fn reprotect(
        &self,
        address: Va,
        size: u64,
        permission: MemoryPermission,
    ) -> Result<(), TrackingError> {
        (**self).reprotect(address, size, permission)
    }
}

impl<T> TrackingBackend for std::sync::Arc<T>
where
    T: TrackingBackend + ?Sized,
{
    fn is_mapped(&self, address: Va) -> bool {
        (**self).is_mapped(address)
    }

    fn is_range_mapped(&self, address: Va, size: u64) -> bool {
        (**self).is_range_mapped(address, size)
    }

    fn reprotect(
        &self,
        address: Va,
        size: u64,
        permission: MemoryPermission,
    ) -> Result<(), TrackingError> {
        (**self).reprotect(address, size, permission)
    }
}
