use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::common::{FrameId, PageKey};

/// CacheEntry wraps one resident page buffer.
///
/// `usages` counts active borrowers; an entry with usages is never evicted.
/// The buffer lock doubles as the page lock: shared for readers, exclusive
/// for writers.
pub struct CacheEntry {
    /// Slot of the entry inside its cache
    frame_id: FrameId,
    /// The page held by this entry (`None` if the slot is empty)
    page_key: Mutex<Option<PageKey>>,
    usages: AtomicU32,
    dirty: AtomicBool,
    pub(crate) data: Arc<RwLock<Box<[u8]>>>,
}

impl CacheEntry {
    pub fn new(frame_id: FrameId, page_size: usize) -> Self {
        Self {
            frame_id,
            page_key: Mutex::new(None),
            usages: AtomicU32::new(0),
            dirty: AtomicBool::new(false),
            data: Arc::new(RwLock::new(vec![0u8; page_size].into_boxed_slice())),
        }
    }

    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }

    pub fn page_key(&self) -> Option<PageKey> {
        *self.page_key.lock()
    }

    pub fn set_page_key(&self, key: Option<PageKey>) {
        *self.page_key.lock() = key;
    }

    pub fn usages(&self) -> u32 {
        self.usages.load(Ordering::Acquire)
    }

    /// Increments the usage counter and returns the new value.
    pub fn pin(&self) -> u32 {
        self.usages.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Decrements the usage counter and returns the new value,
    /// or `None` if it was already zero.
    pub fn unpin(&self) -> Option<u32> {
        loop {
            let current = self.usages.load(Ordering::Acquire);
            if current == 0 {
                return None;
            }
            if self
                .usages
                .compare_exchange(current, current - 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return Some(current - 1);
            }
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn set_dirty(&self, dirty: bool) {
        self.dirty.store(dirty, Ordering::Release);
    }

    pub fn copy_from(&self, data: &[u8]) {
        self.data.write().copy_from_slice(data);
    }

    pub fn copy_to(&self, data: &mut [u8]) {
        data.copy_from_slice(&self.data.read());
    }

    /// Empties the slot. Only valid while nobody uses the entry.
    pub fn reset(&self) {
        self.set_page_key(None);
        self.usages.store(0, Ordering::Release);
        self.dirty.store(false, Ordering::Release);
        self.data.write().fill(0);
    }
}
