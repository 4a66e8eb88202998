use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::RawRwLock;

use crate::common::PageKey;

use super::CacheEntry;

/// Called once when a guard goes away, with the page key and whether the
/// page was modified through the guard.
pub(crate) type ReleaseCallback = Box<dyn FnOnce(PageKey, bool) + Send + Sync>;

type SharedData = ArcRwLockReadGuard<RawRwLock, Box<[u8]>>;
type ExclusiveData = ArcRwLockWriteGuard<RawRwLock, Box<[u8]>>;

/// Common part of both guards: the pinned entry and its release hook.
struct GuardBase {
    key: PageKey,
    entry: Arc<CacheEntry>,
    release_callback: Option<ReleaseCallback>,
    is_dirty: bool,
}

impl GuardBase {
    fn new(key: PageKey, entry: Arc<CacheEntry>, release_callback: ReleaseCallback) -> Self {
        Self {
            key,
            entry,
            release_callback: Some(release_callback),
            is_dirty: false,
        }
    }

    fn release(&mut self) {
        if let Some(callback) = self.release_callback.take() {
            callback(self.key, self.is_dirty);
        }
    }
}

/// RAII guard holding a page's shared lock and one usage of its entry.
pub struct ReadPageGuard {
    base: GuardBase,
    data: Option<SharedData>,
}

impl ReadPageGuard {
    /// Takes the shared lock; the entry must already be pinned for the guard.
    pub(crate) fn new(key: PageKey, entry: Arc<CacheEntry>, release_callback: ReleaseCallback) -> Self {
        let data = entry.data.read_arc();
        Self {
            base: GuardBase::new(key, entry, release_callback),
            data: Some(data),
        }
    }

    pub fn page_key(&self) -> PageKey {
        self.base.key
    }

    pub fn page_index(&self) -> u64 {
        self.base.key.page_index
    }

    pub fn entry(&self) -> &Arc<CacheEntry> {
        &self.base.entry
    }

    pub fn data(&self) -> &[u8] {
        match &self.data {
            Some(data) => &data[..],
            None => &[],
        }
    }
}

impl Deref for ReadPageGuard {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.data()
    }
}

impl Drop for ReadPageGuard {
    fn drop(&mut self) {
        // unlock before the usage is given back
        self.data.take();
        self.base.release();
    }
}

/// RAII guard holding a page's exclusive lock and one usage of its entry.
/// Mutable access marks the page dirty.
pub struct WritePageGuard {
    base: GuardBase,
    data: Option<ExclusiveData>,
}

impl WritePageGuard {
    /// Takes the exclusive lock; the entry must already be pinned for the guard.
    pub(crate) fn new(key: PageKey, entry: Arc<CacheEntry>, release_callback: ReleaseCallback) -> Self {
        let data = entry.data.write_arc();
        Self {
            base: GuardBase::new(key, entry, release_callback),
            data: Some(data),
        }
    }

    /// Wraps an exclusive lock taken by the caller.
    pub(crate) fn with_lock(
        key: PageKey,
        entry: Arc<CacheEntry>,
        data: ExclusiveData,
        release_callback: ReleaseCallback,
    ) -> Self {
        Self {
            base: GuardBase::new(key, entry, release_callback),
            data: Some(data),
        }
    }

    pub fn page_key(&self) -> PageKey {
        self.base.key
    }

    pub fn page_index(&self) -> u64 {
        self.base.key.page_index
    }

    pub fn entry(&self) -> &Arc<CacheEntry> {
        &self.base.entry
    }

    pub fn data(&self) -> &[u8] {
        match &self.data {
            Some(data) => &data[..],
            None => &[],
        }
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        self.base.is_dirty = true;
        match &mut self.data {
            Some(data) => &mut data[..],
            None => &mut [],
        }
    }

    pub fn mark_dirty(&mut self) {
        self.base.is_dirty = true;
    }
}

impl Deref for WritePageGuard {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.data()
    }
}

impl DerefMut for WritePageGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.data_mut()
    }
}

impl Drop for WritePageGuard {
    fn drop(&mut self) {
        if self.base.is_dirty {
            self.base.entry.set_dirty(true);
        }
        self.data.take();
        self.base.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{FileId, FrameId};
    use std::sync::atomic::{AtomicBool, Ordering};

    fn key() -> PageKey {
        PageKey::new(FileId::new(1), 4)
    }

    #[test]
    fn test_read_page_guard() {
        let entry = Arc::new(CacheEntry::new(FrameId::new(0), 1024));
        let mut data = vec![0u8; 1024];
        data[0] = 42;
        entry.copy_from(&data);

        let released = Arc::new(AtomicBool::new(false));
        let released_clone = released.clone();

        let guard = ReadPageGuard::new(
            key(),
            entry.clone(),
            Box::new(move |_, _| released_clone.store(true, Ordering::SeqCst)),
        );

        assert_eq!(guard.page_key(), key());
        assert_eq!(guard[0], 42);
        assert!(!released.load(Ordering::SeqCst));

        // shared lock allows a second reader
        assert!(entry.data.try_read().is_some());
        assert!(entry.data.try_write().is_none());

        drop(guard);
        assert!(released.load(Ordering::SeqCst));
        assert!(entry.data.try_write().is_some());
    }

    #[test]
    fn test_write_page_guard_marks_dirty() {
        let entry = Arc::new(CacheEntry::new(FrameId::new(0), 1024));
        let dirty = Arc::new(AtomicBool::new(false));
        let dirty_clone = dirty.clone();

        let mut guard = WritePageGuard::new(
            key(),
            entry.clone(),
            Box::new(move |_, is_dirty| dirty_clone.store(is_dirty, Ordering::SeqCst)),
        );
        assert!(entry.data.try_read().is_none());

        guard.data_mut()[0] = 42;
        drop(guard);

        assert!(dirty.load(Ordering::SeqCst));
        assert!(entry.is_dirty());

        let mut read_back = vec![0u8; 1024];
        entry.copy_to(&mut read_back);
        assert_eq!(read_back[0], 42);
    }

    #[test]
    fn test_untouched_write_guard_stays_clean() {
        let entry = Arc::new(CacheEntry::new(FrameId::new(0), 1024));
        let guard = WritePageGuard::new(key(), entry.clone(), Box::new(|_, _| {}));
        assert_eq!(guard.data().len(), 1024);
        drop(guard);
        assert!(!entry.is_dirty());
    }
}
