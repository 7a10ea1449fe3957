use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use memtrack_core::{MemoryPermission, TrackingBackend, TrackingConfig, TrackingError, Va};
use parking_lot::Mutex;

use crate::MemoryTracking;

pub(crate) const PAGE_SIZE: u64 = 0x1000;

/// In-memory stand-in for the host virtual-memory manager.
///
/// Every mapped page carries its current host permission. Freshly mapped
/// pages are read/write.
pub(crate) struct MockBackend {
    pages: Mutex<BTreeMap<Va, MemoryPermission>>,
    reprotects: AtomicUsize,
    fail: AtomicBool,
}

impl MockBackend {
    pub(crate) fn new() -> Self {
        Self {
            pages: Mutex::new(BTreeMap::new()),
            reprotects: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
        }
    }

    /// Backs `[address, address + size)` with host memory.
    pub(crate) fn map_range(&self, address: u64, size: u64) {
        let mut pages = self.pages.lock();
        for page in (address..address + size).step_by(PAGE_SIZE as usize) {
            pages.insert(Va(page), MemoryPermission::RW);
        }
    }

    /// Removes the backing of `[address, address + size)`.
    pub(crate) fn unmap_range(&self, address: u64, size: u64) {
        let mut pages = self.pages.lock();
        for page in (address..address + size).step_by(PAGE_SIZE as usize) {
            pages.remove(&Va(page));
        }
    }

    /// Returns the host permission of the page at `address`, `None` if the
    /// page is not mapped.
    pub(crate) fn permission(&self, address: u64) -> Option<MemoryPermission> {
        self.pages
            .lock()
            .get(&Va(address).align_down(PAGE_SIZE))
            .copied()
    }

    /// Returns the number of successful `reprotect` calls.
    pub(crate) fn reprotect_count(&self) -> usize {
        self.reprotects.load(Ordering::SeqCst)
    }

    /// Makes every following `reprotect` call fail.
    pub(crate) fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

impl TrackingBackend for MockBackend {
    fn is_mapped(&self, address: Va) -> bool {
        self.pages
            .lock()
            .contains_key(&address.align_down(PAGE_SIZE))
    }

    fn is_range_mapped(&self, address: Va, size: u64) -> bool {
        let pages = self.pages.lock();
        let start = address.align_down(PAGE_SIZE).0;

        (start..address.0 + size)
            .step_by(PAGE_SIZE as usize)
            .all(|page| pages.contains_key(&Va(page)))
    }

    fn reprotect(
        &self,
        address: Va,
        size: u64,
        permission: MemoryPermission,
    ) -> Result<(), TrackingError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(TrackingError::backend(std::io::Error::other(
                "injected reprotect failure",
            )));
        }

        let mut pages = self.pages.lock();
        for page in (address.0..address.0 + size).step_by(PAGE_SIZE as usize) {
            match pages.get_mut(&Va(page)) {
                Some(current) => *current = permission,
                None => {
                    return Err(TrackingError::backend(std::io::Error::other(format!(
                        "reprotect of unmapped page {}",
                        Va(page)
                    ))));
                }
            }
        }

        self.reprotects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Routes log output of the code under test to the test harness.
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .try_init();
}

/// Creates a tracker over a fresh mock backend with `mapped` pre-mapped.
pub(crate) fn tracker(
    mapped: &[(u64, u64)],
) -> Result<(Arc<MockBackend>, MemoryTracking<Arc<MockBackend>>), TrackingError> {
    tracker_with(mapped, TrackingConfig::default())
}

/// Like [`tracker`], with a custom configuration.
pub(crate) fn tracker_with(
    mapped: &[(u64, u64)],
    config: TrackingConfig,
) -> Result<(Arc<MockBackend>, MemoryTracking<Arc<MockBackend>>), TrackingError> {
    init_tracing();

    let backend = Arc::new(MockBackend::new());
    for &(address, size) in mapped {
        backend.map_range(address, size);
    }

    let tracking = MemoryTracking::new(Arc::clone(&backend), config)?;
    Ok((backend, tracking))
}
