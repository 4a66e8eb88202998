use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{info, warn};

use crate::atomic::{AtomicOperationsManager, MemoryRedoLog, RedoLog};
use crate::cache::{DiskCache, MemoryCache, PageCache};
use crate::common::{CacheConfig, Result};
use crate::storage::disk::IoService;

/// PageStore owns one page cache together with everything it depends on,
/// and tears them down in order on `shutdown`.
pub struct PageStore {
    root: Option<PathBuf>,
    cache: Arc<dyn PageCache>,
    io: Option<Arc<IoService>>,
    redo_log: Arc<MemoryRedoLog>,
    operations: Arc<AtomicOperationsManager>,
    closed: AtomicBool,
}

impl PageStore {
    /// Opens a store whose files live under `dir`.
    pub fn init_disk<P: AsRef<Path>>(dir: P, config: CacheConfig) -> Result<Self> {
        config.validate()?;
        let root = dir.as_ref().to_path_buf();
        let io = Arc::new(IoService::new(config.io_threads)?);
        let cache: Arc<dyn PageCache> = Arc::new(DiskCache::new(&root, config, Arc::clone(&io))?);
        info!(root = %root.display(), "page store initialized on disk");
        Ok(Self::assemble(Some(root), cache, Some(io)))
    }

    /// Opens a store that keeps every page in memory.
    pub fn init_memory(config: CacheConfig) -> Result<Self> {
        let cache: Arc<dyn PageCache> = Arc::new(MemoryCache::new(config.page_size)?);
        info!(page_size = config.page_size, "page store initialized in memory");
        Ok(Self::assemble(None, cache, None))
    }

    fn assemble(root: Option<PathBuf>, cache: Arc<dyn PageCache>, io: Option<Arc<IoService>>) -> Self {
        let redo_log = Arc::new(MemoryRedoLog::new());
        let log: Arc<dyn RedoLog> = redo_log.clone();
        let operations = Arc::new(AtomicOperationsManager::new(Arc::clone(&cache), log));
        Self {
            root,
            cache,
            io,
            redo_log,
            operations,
            closed: AtomicBool::new(false),
        }
    }

    /// Directory of an on-disk store.
    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    pub fn cache(&self) -> &Arc<dyn PageCache> {
        &self.cache
    }

    pub fn atomic_operations(&self) -> Arc<AtomicOperationsManager> {
        Arc::clone(&self.operations)
    }

    pub fn redo_log(&self) -> &Arc<MemoryRedoLog> {
        &self.redo_log
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Flushes and closes the cache, then stops the I/O workers. Later
    /// calls do nothing.
    pub fn shutdown(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let result = self.cache.flush().and_then(|_| self.cache.close());
        if let Some(io) = &self.io {
            io.shutdown();
        }
        info!(on_disk = self.root.is_some(), "page store shut down");
        result
    }
}

impl Drop for PageStore {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!(error = %e, "page store shutdown failed on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::common::PageKey;

    #[test]
    fn test_memory_store_commits_through_cache() {
        let store = PageStore::init_memory(CacheConfig::default()).unwrap();
        let file_id = store.cache().add_file("data.pcl").unwrap();

        store
            .atomic_operations()
            .execute_in_atomic_operation(|op| {
                let page = op.allocate_page(file_id)?;
                op.write_page(PageKey::new(file_id, page), |edit| edit.set_u64(0, 42))?;
                Ok(())
            })
            .unwrap();

        let guard = store
            .cache()
            .load_for_read(PageKey::new(file_id, 0))
            .unwrap()
            .unwrap();
        assert_eq!(u64::from_le_bytes(guard.data()[..8].try_into().unwrap()), 42);
        drop(guard);
        assert_eq!(store.redo_log().len(), 1);
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = PageStore::init_disk(dir.path(), CacheConfig::default().with_capacity(16)).unwrap();
        store.cache().add_file("a.pcl").unwrap();

        store.shutdown().unwrap();
        assert!(store.is_closed());
        store.shutdown().unwrap();
        assert!(dir.path().join("a.pcl").exists());
    }
}
