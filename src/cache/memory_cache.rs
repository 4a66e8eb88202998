use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::common::{validate_page_size, FileId, FrameId, PageKey, Result, StoreError};

use super::{CacheEntry, PageCache, ReadPageGuard, WritePageGuard};

struct MemoryFile {
    name: String,
    pages: Vec<Arc<CacheEntry>>,
}

#[derive(Default)]
struct MemoryFiles {
    files: HashMap<FileId, MemoryFile>,
    next_id: u32,
}

/// Page cache without backing files: every page lives in memory until its
/// file is truncated or deleted. Nothing is ever evicted and flushes are
/// no-ops.
pub struct MemoryCache {
    page_size: usize,
    state: RwLock<MemoryFiles>,
}

impl MemoryCache {
    pub fn new(page_size: usize) -> Result<Self> {
        validate_page_size(page_size)?;
        Ok(Self {
            page_size,
            state: RwLock::new(MemoryFiles::default()),
        })
    }

    fn entry(&self, key: PageKey) -> Result<Option<Arc<CacheEntry>>> {
        let state = self.state.read();
        let file = state
            .files
            .get(&key.file_id)
            .ok_or(StoreError::UnknownFile(key.file_id))?;
        let Some(entry) = file.pages.get(key.page_index as usize) else {
            return Ok(None);
        };
        entry.pin();
        Ok(Some(Arc::clone(entry)))
    }

    fn release_callback(entry: &Arc<CacheEntry>) -> Box<dyn FnOnce(PageKey, bool) + Send + Sync> {
        let entry = Arc::clone(entry);
        Box::new(move |_, _| {
            entry.unpin();
        })
    }

    fn check_unused(file: &MemoryFile) -> Result<()> {
        Self::check_unused_from(file, 0)
    }

    fn check_unused_from(file: &MemoryFile, from_page: usize) -> Result<()> {
        match file.pages.iter().skip(from_page).find(|p| p.usages() > 0) {
            Some(page) => Err(StoreError::PageStillPinned(
                page.page_key().unwrap_or(PageKey::new(FileId::new(0), 0)),
            )),
            None => Ok(()),
        }
    }
}

impl PageCache for MemoryCache {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn add_file(&self, name: &str) -> Result<FileId> {
        let mut state = self.state.write();
        if state.files.values().any(|f| f.name == name) {
            return Err(StoreError::FileAlreadyExists(name.to_string()));
        }
        state.next_id += 1;
        let id = FileId::new(state.next_id);
        state.files.insert(
            id,
            MemoryFile {
                name: name.to_string(),
                pages: Vec::new(),
            },
        );
        debug!(file = name, file_id = id.as_u32(), "memory file added");
        Ok(id)
    }

    fn load_file(&self, name: &str) -> Result<FileId> {
        self.file_id(name)
            .ok_or_else(|| StoreError::FileNotFound(name.to_string()))
    }

    fn exists(&self, name: &str) -> bool {
        self.file_id(name).is_some()
    }

    fn file_id(&self, name: &str) -> Option<FileId> {
        self.state
            .read()
            .files
            .iter()
            .find(|(_, f)| f.name == name)
            .map(|(id, _)| *id)
    }

    fn file_name(&self, file_id: FileId) -> Result<String> {
        self.state
            .read()
            .files
            .get(&file_id)
            .map(|f| f.name.clone())
            .ok_or(StoreError::UnknownFile(file_id))
    }

    fn load_for_read(&self, key: PageKey) -> Result<Option<ReadPageGuard>> {
        Ok(self.entry(key)?.map(|entry| {
            let callback = Self::release_callback(&entry);
            ReadPageGuard::new(key, entry, callback)
        }))
    }

    fn load_for_write(&self, key: PageKey) -> Result<Option<WritePageGuard>> {
        Ok(self.entry(key)?.map(|entry| {
            let callback = Self::release_callback(&entry);
            WritePageGuard::new(key, entry, callback)
        }))
    }

    fn allocate_new_page(&self, file_id: FileId) -> Result<WritePageGuard> {
        let entry = {
            let mut state = self.state.write();
            let file = state
                .files
                .get_mut(&file_id)
                .ok_or(StoreError::UnknownFile(file_id))?;
            let index = file.pages.len();
            let entry = Arc::new(CacheEntry::new(FrameId::new(index as u32), self.page_size));
            entry.set_page_key(Some(PageKey::new(file_id, index as u64)));
            entry.pin();
            file.pages.push(Arc::clone(&entry));
            entry
        };

        let key = PageKey::new(file_id, entry.frame_id().as_u32() as u64);
        let callback = Self::release_callback(&entry);
        Ok(WritePageGuard::new(key, entry, callback))
    }

    fn filled_up_to(&self, file_id: FileId) -> Result<u64> {
        self.state
            .read()
            .files
            .get(&file_id)
            .map(|f| f.pages.len() as u64)
            .ok_or(StoreError::UnknownFile(file_id))
    }

    fn flush_file(&self, file_id: FileId) -> Result<()> {
        if self.state.read().files.contains_key(&file_id) {
            Ok(())
        } else {
            Err(StoreError::UnknownFile(file_id))
        }
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    /// Content stays available: a memory file is only gone once deleted.
    fn close_file(&self, file_id: FileId, _flush: bool) -> Result<()> {
        self.flush_file(file_id)
    }

    fn delete_file(&self, file_id: FileId) -> Result<()> {
        let mut state = self.state.write();
        let file = state
            .files
            .get(&file_id)
            .ok_or(StoreError::UnknownFile(file_id))?;
        Self::check_unused(file)?;
        state.files.remove(&file_id);
        Ok(())
    }

    fn rename_file(&self, file_id: FileId, new_name: &str) -> Result<()> {
        let mut state = self.state.write();
        if state.files.values().any(|f| f.name == new_name) {
            return Err(StoreError::FileAlreadyExists(new_name.to_string()));
        }
        let file = state
            .files
            .get_mut(&file_id)
            .ok_or(StoreError::UnknownFile(file_id))?;
        file.name = new_name.to_string();
        Ok(())
    }

    fn truncate_file(&self, file_id: FileId) -> Result<()> {
        self.shrink_file(file_id, 0)
    }

    fn shrink_file(&self, file_id: FileId, pages: u64) -> Result<()> {
        let mut state = self.state.write();
        let file = state
            .files
            .get_mut(&file_id)
            .ok_or(StoreError::UnknownFile(file_id))?;
        let keep = pages as usize;
        Self::check_unused_from(file, keep)?;
        file.pages.truncate(keep);
        Ok(())
    }

    fn used_memory(&self) -> usize {
        self.state
            .read()
            .files
            .values()
            .map(|f| f.pages.len() * self.page_size)
            .sum()
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }

    fn delete(&self) -> Result<()> {
        let mut state = self.state.write();
        for file in state.files.values() {
            Self::check_unused(file)?;
        }
        state.files.clear();
        Ok(())
    }
}
