use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::lock_api::ArcRwLockWriteGuard;
use parking_lot::{Mutex, RawRwLock, RwLock};
use tracing::{debug, info};

use crate::common::{CacheConfig, FileId, FrameId, PageKey, Result, StoreError};
use crate::storage::disk::{IoService, PagedFile};

use super::page_guard::ReleaseCallback;
use super::{CacheEntry, LruKReplacer, PageCache, ReadPageGuard, WritePageGuard};

type FreshFrameLock = ArcRwLockWriteGuard<RawRwLock, Box<[u8]>>;

/// Page table, free list and replacer; always updated together.
struct CacheState {
    page_table: HashMap<PageKey, FrameId>,
    free_list: VecDeque<FrameId>,
    replacer: LruKReplacer,
}

struct DiskCacheInner {
    frames: Vec<Arc<CacheEntry>>,
    state: Mutex<CacheState>,
}

impl DiskCacheInner {
    /// Gives back one usage of a frame.
    fn release(&self, frame_id: FrameId, dirty: bool) {
        let mut state = self.state.lock();
        let frame = &self.frames[frame_id.as_usize()];
        if dirty {
            frame.set_dirty(true);
        }
        if let Some(0) = frame.unpin() {
            state.replacer.set_evictable(frame_id, true);
        }
    }
}

#[derive(Default)]
struct FileRegistry {
    open: HashMap<FileId, Arc<PagedFile>>,
    /// Names keep their id across close and reopen
    ids: HashMap<String, FileId>,
    next_id: u32,
}

/// DiskCache keeps a fixed number of page frames over the paged files of
/// one directory. Misses read through to the file; when every frame is in
/// use the LRU-K victim is written back (if dirty) and reused.
pub struct DiskCache {
    config: CacheConfig,
    root: PathBuf,
    io: Arc<IoService>,
    inner: Arc<DiskCacheInner>,
    files: RwLock<FileRegistry>,
}

impl DiskCache {
    pub fn new<P: AsRef<Path>>(root: P, config: CacheConfig, io: Arc<IoService>) -> Result<Self> {
        config.validate()?;
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;

        let mut frames = Vec::with_capacity(config.capacity_pages);
        let mut free_list = VecDeque::with_capacity(config.capacity_pages);
        for i in 0..config.capacity_pages {
            let frame_id = FrameId::new(i as u32);
            frames.push(Arc::new(CacheEntry::new(frame_id, config.page_size)));
            free_list.push_back(frame_id);
        }

        let inner = Arc::new(DiskCacheInner {
            frames,
            state: Mutex::new(CacheState {
                page_table: HashMap::new(),
                free_list,
                replacer: LruKReplacer::new(config.lru_k, config.capacity_pages),
            }),
        });

        info!(
            root = %root.display(),
            capacity = config.capacity_pages,
            page_size = config.page_size,
            "disk cache created"
        );

        Ok(Self {
            config,
            root,
            io,
            inner,
            files: RwLock::new(FileRegistry::default()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn pool_size(&self) -> usize {
        self.inner.frames.len()
    }

    pub fn free_frame_count(&self) -> usize {
        self.inner.state.lock().free_list.len()
    }

    /// Usage count of a resident page, `None` if it is not resident.
    pub fn pin_count(&self, key: PageKey) -> Option<u32> {
        let state = self.inner.state.lock();
        state
            .page_table
            .get(&key)
            .map(|frame_id| self.inner.frames[frame_id.as_usize()].usages())
    }

    fn file(&self, file_id: FileId) -> Result<Arc<PagedFile>> {
        self.files
            .read()
            .open
            .get(&file_id)
            .cloned()
            .ok_or(StoreError::UnknownFile(file_id))
    }

    fn page_offset(&self, key: PageKey) -> u64 {
        key.page_index * self.config.page_size as u64
    }

    fn release_callback(&self, frame_id: FrameId) -> ReleaseCallback {
        let inner = Arc::clone(&self.inner);
        Box::new(move |_, dirty| inner.release(frame_id, dirty))
    }

    /// Pins the frame of `key`. On a miss a frame is claimed for the page and
    /// returned together with its write lock, for the caller to fill.
    fn pin_page(&self, key: PageKey) -> Result<(Arc<CacheEntry>, Option<FreshFrameLock>)> {
        let mut state = self.inner.state.lock();
        if let Some(&frame_id) = state.page_table.get(&key) {
            let frame = Arc::clone(&self.inner.frames[frame_id.as_usize()]);
            frame.pin();
            state.replacer.record_access(frame_id);
            state.replacer.set_evictable(frame_id, false);
            return Ok((frame, None));
        }

        let frame_id = self.take_frame(&mut state)?;
        let (frame, lock) = self.install(&mut state, frame_id, key);
        Ok((frame, Some(lock)))
    }

    /// Maps a claimed frame to `key` and pins it.
    fn install(&self, state: &mut CacheState, frame_id: FrameId, key: PageKey) -> (Arc<CacheEntry>, FreshFrameLock) {
        let frame = Arc::clone(&self.inner.frames[frame_id.as_usize()]);
        // Nobody uses a claimed frame, so this does not block.
        let lock = frame.data.write_arc();
        frame.set_page_key(Some(key));
        frame.set_dirty(false);
        frame.pin();

        state.page_table.insert(key, frame_id);
        state.replacer.record_access(frame_id);
        state.replacer.set_evictable(frame_id, false);
        (frame, lock)
    }

    /// Claims a frame from the free list, or evicts one.
    fn take_frame(&self, state: &mut CacheState) -> Result<FrameId> {
        if let Some(frame_id) = state.free_list.pop_front() {
            return Ok(frame_id);
        }

        let victim = state.replacer.evict().ok_or(StoreError::CacheFull)?;
        let frame = &self.inner.frames[victim.as_usize()];

        if let Some(old_key) = frame.page_key() {
            if frame.is_dirty() {
                if let Err(e) = self.write_back(old_key, frame) {
                    state.replacer.record_access(victim);
                    state.replacer.set_evictable(victim, true);
                    return Err(e);
                }
            }
            if state.page_table.get(&old_key) == Some(&victim) {
                state.page_table.remove(&old_key);
            }
            debug!(page = %old_key, frame = victim.as_u32(), "page evicted");
        }

        frame.reset();
        Ok(victim)
    }

    fn write_back(&self, key: PageKey, frame: &CacheEntry) -> Result<()> {
        let file = self.file(key.file_id)?;
        let data = frame.data.read();
        file.write(self.page_offset(key), &data)?;
        frame.set_dirty(false);
        Ok(())
    }

    /// Forgets a frame whose load failed.
    fn discard(&self, key: PageKey, frame: &CacheEntry) {
        let mut state = self.inner.state.lock();
        if state.page_table.get(&key) == Some(&frame.frame_id()) {
            state.page_table.remove(&key);
        }
        frame.set_page_key(None);
        if let Some(0) = frame.unpin() {
            frame.reset();
            state.replacer.remove(frame.frame_id());
            state.free_list.push_back(frame.frame_id());
        }
    }

    fn load(&self, key: PageKey) -> Result<Option<(Arc<CacheEntry>, Option<FreshFrameLock>)>> {
        let file = self.file(key.file_id)?;
        if key.page_index >= file.pages_count() {
            return Ok(None);
        }

        let (entry, fresh) = self.pin_page(key)?;
        match fresh {
            Some(mut lock) => {
                if let Err(e) = file.read(self.page_offset(key), &mut lock[..], false) {
                    drop(lock);
                    self.discard(key, &entry);
                    return Err(e);
                }
                debug!(page = %key, "page loaded from disk");
                Ok(Some((entry, Some(lock))))
            }
            None => Ok(Some((entry, None))),
        }
    }

    /// Pins every dirty page accepted by `filter`.
    fn pin_dirty<F>(&self, filter: F) -> Vec<(PageKey, Arc<CacheEntry>)>
    where
        F: Fn(&PageKey) -> bool,
    {
        let mut state = self.inner.state.lock();
        let mut pinned = Vec::new();
        let dirty: Vec<(PageKey, FrameId)> = state
            .page_table
            .iter()
            .filter(|(key, frame_id)| filter(key) && self.inner.frames[frame_id.as_usize()].is_dirty())
            .map(|(key, frame_id)| (*key, *frame_id))
            .collect();

        for (key, frame_id) in dirty {
            let frame = Arc::clone(&self.inner.frames[frame_id.as_usize()]);
            frame.pin();
            state.replacer.set_evictable(frame_id, false);
            pinned.push((key, frame));
        }
        pinned
    }

    fn write_entries(&self, file: &PagedFile, entries: Vec<(PageKey, Arc<CacheEntry>)>) -> Result<()> {
        let mut buffers = Vec::with_capacity(entries.len());
        for (key, entry) in &entries {
            let data = entry.data.read();
            entry.set_dirty(false);
            buffers.push((self.page_offset(*key), Bytes::copy_from_slice(&data)));
        }

        let result = if buffers.is_empty() {
            Ok(())
        } else {
            file.write_batch(buffers).and_then(|batch| batch.wait())
        };

        for (_, entry) in &entries {
            if result.is_err() {
                entry.set_dirty(true);
            }
            self.inner.release(entry.frame_id(), false);
        }
        result
    }

    /// Removes every resident page of a file at or past `from_page` from
    /// the cache, dirty or not.
    fn drop_pages(&self, file_id: FileId, from_page: u64) -> Result<()> {
        let mut state = self.inner.state.lock();
        let pages: Vec<(PageKey, FrameId)> = state
            .page_table
            .iter()
            .filter(|(key, _)| key.file_id == file_id && key.page_index >= from_page)
            .map(|(key, frame_id)| (*key, *frame_id))
            .collect();

        if let Some((key, _)) = pages
            .iter()
            .find(|(_, frame_id)| self.inner.frames[frame_id.as_usize()].usages() > 0)
        {
            return Err(StoreError::PageStillPinned(*key));
        }

        for (key, frame_id) in pages {
            state.page_table.remove(&key);
            state.replacer.remove(frame_id);
            self.inner.frames[frame_id.as_usize()].reset();
            state.free_list.push_back(frame_id);
        }
        Ok(())
    }

    fn open_ids(&self) -> Vec<FileId> {
        let mut ids: Vec<FileId> = self.files.read().open.keys().copied().collect();
        ids.sort();
        ids
    }

    fn register(&self, registry: &mut FileRegistry, name: &str, file: Arc<PagedFile>) -> FileId {
        let id = match registry.ids.get(name) {
            Some(id) => *id,
            None => {
                registry.next_id += 1;
                FileId::new(registry.next_id)
            }
        };
        registry.ids.insert(name.to_string(), id);
        registry.open.insert(id, file);
        id
    }

    fn new_paged_file(&self, name: &str) -> Result<PagedFile> {
        Ok(PagedFile::new(
            self.root.join(name),
            self.config.page_size,
            Arc::clone(&self.io),
        )?
        .with_max_in_flight_writes(self.config.max_in_flight_writes))
    }
}

impl PageCache for DiskCache {
    fn page_size(&self) -> usize {
        self.config.page_size
    }

    fn add_file(&self, name: &str) -> Result<FileId> {
        let mut registry = self.files.write();
        let is_open = registry
            .ids
            .get(name)
            .is_some_and(|id| registry.open.contains_key(id));
        if is_open || self.root.join(name).exists() {
            return Err(StoreError::FileAlreadyExists(name.to_string()));
        }

        let file = self.new_paged_file(name)?;
        file.create()?;
        let id = self.register(&mut registry, name, Arc::new(file));
        debug!(file = name, file_id = id.as_u32(), "file added to cache");
        Ok(id)
    }

    fn load_file(&self, name: &str) -> Result<FileId> {
        let mut registry = self.files.write();
        if let Some(id) = registry.ids.get(name).copied() {
            if registry.open.contains_key(&id) {
                return Ok(id);
            }
        }

        let file = self.new_paged_file(name)?;
        file.open()?;
        let id = self.register(&mut registry, name, Arc::new(file));
        debug!(file = name, file_id = id.as_u32(), "file loaded into cache");
        Ok(id)
    }

    fn exists(&self, name: &str) -> bool {
        self.file_id(name).is_some() || self.root.join(name).exists()
    }

    fn file_id(&self, name: &str) -> Option<FileId> {
        let registry = self.files.read();
        registry
            .ids
            .get(name)
            .copied()
            .filter(|id| registry.open.contains_key(id))
    }

    fn file_name(&self, file_id: FileId) -> Result<String> {
        Ok(self.file(file_id)?.name())
    }

    fn load_for_read(&self, key: PageKey) -> Result<Option<ReadPageGuard>> {
        let Some((entry, fresh)) = self.load(key)? else {
            return Ok(None);
        };
        // A freshly filled frame switches from its write lock to a read lock.
        drop(fresh);
        let callback = self.release_callback(entry.frame_id());
        Ok(Some(ReadPageGuard::new(key, entry, callback)))
    }

    fn load_for_write(&self, key: PageKey) -> Result<Option<WritePageGuard>> {
        let Some((entry, fresh)) = self.load(key)? else {
            return Ok(None);
        };
        let callback = self.release_callback(entry.frame_id());
        let guard = match fresh {
            Some(lock) => WritePageGuard::with_lock(key, entry, lock, callback),
            None => WritePageGuard::new(key, entry, callback),
        };
        Ok(Some(guard))
    }

    fn allocate_new_page(&self, file_id: FileId) -> Result<WritePageGuard> {
        let file = self.file(file_id)?;
        let page_size = self.config.page_size as u64;

        // The file only grows once a frame for the new page is secured.
        let (entry, lock, key) = {
            let mut state = self.inner.state.lock();
            let frame_id = self.take_frame(&mut state)?;
            let offset = match file.allocate_space(page_size) {
                Ok(offset) => offset,
                Err(e) => {
                    state.free_list.push_back(frame_id);
                    return Err(e);
                }
            };
            let key = PageKey::new(file_id, offset / page_size);
            let (entry, lock) = self.install(&mut state, frame_id, key);
            (entry, lock, key)
        };

        let callback = self.release_callback(entry.frame_id());
        let mut guard = WritePageGuard::with_lock(key, entry, lock, callback);
        guard.data_mut().fill(0);
        Ok(guard)
    }

    fn filled_up_to(&self, file_id: FileId) -> Result<u64> {
        Ok(self.file(file_id)?.pages_count())
    }

    fn flush_file(&self, file_id: FileId) -> Result<()> {
        let file = self.file(file_id)?;
        let entries = self.pin_dirty(|key| key.file_id == file_id);
        let pages = entries.len();
        self.write_entries(&file, entries)?;
        file.synch()?;
        debug!(file = %file.name(), pages, "file flushed");
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        for file_id in self.open_ids() {
            self.flush_file(file_id)?;
        }
        Ok(())
    }

    fn close_file(&self, file_id: FileId, flush: bool) -> Result<()> {
        if flush {
            self.flush_file(file_id)?;
        }
        self.drop_pages(file_id, 0)?;

        let file = self
            .files
            .write()
            .open
            .remove(&file_id)
            .ok_or(StoreError::UnknownFile(file_id))?;
        file.close()
    }

    fn delete_file(&self, file_id: FileId) -> Result<()> {
        self.drop_pages(file_id, 0)?;

        let file = {
            let mut registry = self.files.write();
            registry.ids.retain(|_, id| *id != file_id);
            registry
                .open
                .remove(&file_id)
                .ok_or(StoreError::UnknownFile(file_id))?
        };
        file.delete()
    }

    fn rename_file(&self, file_id: FileId, new_name: &str) -> Result<()> {
        let file = self.file(file_id)?;
        let new_path = self.root.join(new_name);
        if new_path.exists() {
            return Err(StoreError::FileAlreadyExists(new_name.to_string()));
        }
        let old_name = file.name();
        file.rename_to(&new_path)?;

        let mut registry = self.files.write();
        registry.ids.remove(&old_name);
        registry.ids.insert(new_name.to_string(), file_id);
        Ok(())
    }

    fn truncate_file(&self, file_id: FileId) -> Result<()> {
        self.shrink_file(file_id, 0)
    }

    fn shrink_file(&self, file_id: FileId, pages: u64) -> Result<()> {
        let file = self.file(file_id)?;
        self.drop_pages(file_id, pages)?;
        file.shrink(pages * self.config.page_size as u64)
    }

    fn used_memory(&self) -> usize {
        self.inner.state.lock().page_table.len() * self.config.page_size
    }

    fn close(&self) -> Result<()> {
        for file_id in self.open_ids() {
            self.close_file(file_id, true)?;
        }
        info!(root = %self.root.display(), "disk cache closed");
        Ok(())
    }

    fn delete(&self) -> Result<()> {
        for file_id in self.open_ids() {
            self.delete_file(file_id)?;
        }
        info!(root = %self.root.display(), "disk cache deleted");
        Ok(())
    }
}
