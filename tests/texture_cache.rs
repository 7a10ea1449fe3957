//! A minimal texture cache driven by guest writes, exercised through the
//! public facade.

use std::{collections::BTreeMap, sync::Arc};

use memtrack::{
    MemoryPermission, MemoryTracking, MultiRegionHandle, RegionHandle, TrackingBackend,
    TrackingConfig, TrackingError, Va,
};
use parking_lot::Mutex;

const PAGE_SIZE: u64 = 0x1000;

/// Guest memory with byte contents and host permissions per page.
#[derive(Default)]
struct GuestMemory {
    pages: Mutex<BTreeMap<Va, (MemoryPermission, Vec<u8>)>>,
}

impl GuestMemory {
    fn map(&self, address: u64, size: u64) {
        let mut pages = self.pages.lock();
        for page in (address..address + size).step_by(PAGE_SIZE as usize) {
            pages.insert(Va(page), (MemoryPermission::RW, vec![0; PAGE_SIZE as usize]));
        }
    }

    /// Performs a guest write the way an emulated CPU would: fault first if
    /// the page is not writable, then store.
    fn write<Backend>(
        &self,
        tracking: &MemoryTracking<Backend>,
        address: u64,
        value: u8,
    ) -> Result<(), TrackingError>
    where
        Backend: TrackingBackend,
    {
        let page = Va(address).align_down(PAGE_SIZE);
        let writable = self
            .pages
            .lock()
            .get(&page)
            .is_some_and(|(permission, _)| permission.contains(MemoryPermission::W));

        if !writable {
            let handled = tracking.signal_access(Va(address), 1, true)?;
            tracing::debug!(address, handled, "write fault");
        }

        let mut pages = self.pages.lock();
        if let Some((_, bytes)) = pages.get_mut(&page) {
            bytes[(address - page.0) as usize] = value;
        }

        Ok(())
    }

    fn read(&self, address: u64) -> u8 {
        let page = Va(address).align_down(PAGE_SIZE);
        self.pages
            .lock()
            .get(&page)
            .map_or(0, |(_, bytes)| bytes[(address - page.0) as usize])
    }
}

impl TrackingBackend for GuestMemory {
    fn is_mapped(&self, address: Va) -> bool {
        self.pages
            .lock()
            .contains_key(&address.align_down(PAGE_SIZE))
    }

    fn is_range_mapped(&self, address: Va, size: u64) -> bool {
        let pages = self.pages.lock();
        (address.align_down(PAGE_SIZE).0..address.0 + size)
            .step_by(PAGE_SIZE as usize)
            .all(|page| pages.contains_key(&Va(page)))
    }

    fn reprotect(
        &self,
        address: Va,
        size: u64,
        permission: MemoryPermission,
    ) -> Result<(), TrackingError> {
        let mut pages = self.pages.lock();
        for page in (address.0..address.0 + size).step_by(PAGE_SIZE as usize) {
            if let Some((current, _)) = pages.get_mut(&Va(page)) {
                *current = permission;
            }
        }

        Ok(())
    }
}

/// A cached copy of a guest texture, refreshed only where the guest wrote.
struct Texture {
    handle: MultiRegionHandle<Arc<GuestMemory>>,
    copy: Vec<u8>,
    uploads: usize,
}

impl Texture {
    fn refresh(&mut self, memory: &GuestMemory) -> Result<(), TrackingError> {
        let base = self.handle.address();
        let copy = &mut self.copy;
        let uploads = &mut self.uploads;

        self.handle.query_modified(|range| {
            *uploads += 1;
            for address in range.address.0..range.end().0 {
                copy[(address - base.0) as usize] = memory.read(address);
            }
        })
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

#[test]
fn texture_follows_guest_writes() -> Result<(), TrackingError> {
    init_tracing();

    let memory = Arc::new(GuestMemory::default());
    memory.map(0x10000, 0x8000);

    let tracking = MemoryTracking::new(Arc::clone(&memory), TrackingConfig::default())?;

    let mut texture = Texture {
        handle: tracking.begin_granular_tracking(Va(0x10000), 0x4000, PAGE_SIZE)?,
        copy: vec![0; 0x4000],
        uploads: 0,
    };

    memory.write(&tracking, 0x10010, 0xaa)?;
    memory.write(&tracking, 0x10011, 0xbb)?;
    memory.write(&tracking, 0x12fff, 0xcc)?;

    // Writes outside the texture are untracked.
    memory.write(&tracking, 0x16000, 0xdd)?;

    texture.refresh(&memory)?;
    assert_eq!(texture.uploads, 2);
    assert_eq!(&texture.copy[0x10..0x12], &[0xaa, 0xbb]);
    assert_eq!(texture.copy[0x2fff], 0xcc);

    // Nothing changed since the last refresh.
    texture.refresh(&memory)?;
    assert_eq!(texture.uploads, 2);

    // The refresh re-armed write detection.
    memory.write(&tracking, 0x10010, 0xee)?;
    texture.refresh(&memory)?;
    assert_eq!(texture.uploads, 3);
    assert_eq!(texture.copy[0x10], 0xee);

    texture.handle.dispose()?;
    assert_eq!(tracking.region_count(), 0);

    Ok(())
}

#[test]
fn buffer_invalidation_with_plain_handle() -> Result<(), TrackingError> {
    init_tracing();

    let memory = Arc::new(GuestMemory::default());
    memory.map(0x0, 0x4000);

    let tracking = MemoryTracking::new(Arc::clone(&memory), TrackingConfig::default())?;
    let buffer: RegionHandle<_> = tracking.begin_tracking(Va(0x1000), 0x2000)?;

    for address in (0x0..0x1000).step_by(0x100) {
        memory.write(&tracking, address, 1)?;
    }
    assert!(!buffer.consume_dirty()?);

    memory.write(&tracking, 0x2abc, 1)?;
    assert!(buffer.consume_dirty()?);
    assert!(!buffer.consume_dirty()?);

    Ok(())
}
