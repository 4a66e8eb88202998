use std::collections::{BTreeMap, HashMap};
use std::ops::Range;
use std::sync::Arc;

use parking_lot::lock_api::ArcRwLockWriteGuard;
use parking_lot::{RawRwLock, RwLock};
use tracing::{debug, trace, warn};

use crate::cache::{PageCache, WritePageGuard};
use crate::common::{FileId, Lsn, OperationId, PageKey, Result, StoreError};
use crate::storage::page::{PageChangeSet, PageEdit, PageView};

use super::{PageReader, PageRedoRecord, RedoLog};

/// Lock a component (an index, a cluster) hands out to serialize its
/// structural mutations.
pub type ComponentLock = Arc<RwLock<()>>;

type HeldLock = ArcRwLockWriteGuard<RawRwLock, ()>;

struct PendingPage {
    changes: PageChangeSet,
    /// Appended inside this operation; not in the cache yet
    is_new: bool,
}

/// AtomicOperation collects page changes without touching the cache.
///
/// On commit every touched page is logged to the redo log, then all changes
/// are applied while the exclusive locks of all touched pages are held, so
/// the operation becomes visible as a whole. Pages appended by the
/// operation only exist virtually until commit. Dropping an operation that
/// was not committed rolls it back.
pub struct AtomicOperation {
    id: OperationId,
    cache: Arc<dyn PageCache>,
    redo_log: Arc<dyn RedoLog>,
    pages: BTreeMap<PageKey, PendingPage>,
    /// Pages appended per file
    appended: HashMap<FileId, u64>,
    component_locks: Vec<(ComponentLock, HeldLock)>,
    zero_page: Vec<u8>,
    finished: bool,
}

impl AtomicOperation {
    pub(crate) fn new(id: OperationId, cache: Arc<dyn PageCache>, redo_log: Arc<dyn RedoLog>) -> Self {
        let page_size = cache.page_size();
        Self {
            id,
            cache,
            redo_log,
            pages: BTreeMap::new(),
            appended: HashMap::new(),
            component_locks: Vec::new(),
            zero_page: vec![0u8; page_size],
            finished: false,
        }
    }

    pub fn id(&self) -> OperationId {
        self.id
    }

    pub fn cache(&self) -> &Arc<dyn PageCache> {
        &self.cache
    }

    /// Number of pages with pending changes
    pub fn touched_pages(&self) -> usize {
        self.pages.len()
    }

    /// Takes a component lock for the rest of the operation. Taking the
    /// same lock twice is a no-op.
    pub fn acquire_exclusive_lock(&mut self, lock: &ComponentLock) {
        if self
            .component_locks
            .iter()
            .any(|(held, _)| Arc::ptr_eq(held, lock))
        {
            return;
        }
        let guard = lock.write_arc();
        self.component_locks.push((Arc::clone(lock), guard));
    }

    /// Appends a page to the file and returns its index. The page reads as
    /// zeros until written.
    pub fn allocate_page(&mut self, file_id: FileId) -> Result<u64> {
        let index = self.filled_up_to(file_id)?;
        *self.appended.entry(file_id).or_insert(0) += 1;
        self.pages.insert(
            PageKey::new(file_id, index),
            PendingPage {
                changes: PageChangeSet::new(self.zero_page.len()),
                is_new: true,
            },
        );
        trace!(operation = self.id, file_id = file_id.as_u32(), page = index, "page appended");
        Ok(index)
    }

    /// Runs `f` on the page as this operation sees it.
    pub fn read_page<R, F>(&self, key: PageKey, f: F) -> Result<R>
    where
        F: FnOnce(PageView<'_>) -> R,
    {
        self.with_page(key, f)?.ok_or(StoreError::PageNotFound(key))
    }

    /// Runs `f` with edit access to a page. Changes are recorded, not applied.
    /// Fails with `ChangeOutOfRange` if `f` wrote past the page end.
    pub fn write_page<R, F>(&mut self, key: PageKey, f: F) -> Result<R>
    where
        F: FnOnce(&mut PageEdit<'_>) -> R,
    {
        if let Some(pending) = self.pages.get_mut(&key) {
            if pending.is_new {
                let mut edit = PageEdit::new(&self.zero_page, &mut pending.changes);
                let result = f(&mut edit);
                edit.take_error()?;
                return Ok(result);
            }
        }

        let page = self
            .cache
            .load_for_read(key)?
            .ok_or(StoreError::PageNotFound(key))?;
        let page_size = self.zero_page.len();
        let pending = self.pages.entry(key).or_insert_with(|| PendingPage {
            changes: PageChangeSet::new(page_size),
            is_new: false,
        });
        let mut edit = PageEdit::new(page.data(), &mut pending.changes);
        let result = f(&mut edit);
        edit.take_error()?;
        Ok(result)
    }

    /// Locks every touched page, writes the changes to the redo log and
    /// then applies them. Returns the LSNs of the logged records.
    ///
    /// If a page cannot be locked or the log write fails, pages appended so
    /// far are cut off again and nothing is logged or applied.
    pub fn commit(mut self) -> Result<Range<Lsn>> {
        self.finished = true;
        let start = self.redo_log.end_lsn();
        if self.pages.values().all(|p| p.changes.is_empty() && !p.is_new) {
            self.release_locks();
            return Ok(start..start);
        }

        let mut filled_before = Vec::with_capacity(self.appended.len());
        for file_id in self.appended.keys() {
            filled_before.push((*file_id, self.cache.filled_up_to(*file_id)?));
        }

        let outcome = self.lock_pages().and_then(|mut guards| {
            let lsns = self.redo_log.log_all(&self.redo_records())?;
            for (guard, pending) in &mut guards {
                pending.changes.apply_changes(guard.data_mut());
            }
            Ok((lsns, guards.len()))
        });

        match outcome {
            Ok((lsns, applied)) => {
                debug!(
                    operation = self.id,
                    pages = applied,
                    lsn_start = lsns.start,
                    lsn_end = lsns.end,
                    "atomic operation committed"
                );
                self.release_locks();
                Ok(lsns)
            }
            Err(e) => {
                self.undo_appends(&filled_before);
                debug!(operation = self.id, error = %e, "atomic operation failed to commit");
                self.release_locks();
                Err(e)
            }
        }
    }

    /// Write guards for every page with changes, in key order. Appended
    /// pages are allocated here.
    fn lock_pages(&self) -> Result<Vec<(WritePageGuard, &PendingPage)>> {
        let mut guards = Vec::with_capacity(self.pages.len());
        for (key, pending) in &self.pages {
            let guard = if pending.is_new {
                let guard = self.cache.allocate_new_page(key.file_id)?;
                if guard.page_index() != key.page_index {
                    return Err(StoreError::StructuralCorruption(format!(
                        "page {} was appended as {} while committing operation {}",
                        key,
                        guard.page_index(),
                        self.id
                    )));
                }
                guard
            } else {
                if pending.changes.is_empty() {
                    continue;
                }
                self.cache
                    .load_for_write(*key)?
                    .ok_or(StoreError::PageNotFound(*key))?
            };
            guards.push((guard, pending));
        }
        Ok(guards)
    }

    fn redo_records(&self) -> Vec<PageRedoRecord> {
        self.pages
            .iter()
            .filter(|(_, pending)| pending.is_new || !pending.changes.is_empty())
            .map(|(key, pending)| PageRedoRecord {
                operation_id: self.id,
                page: *key,
                new_page: pending.is_new,
                changes: pending.changes.clone(),
            })
            .collect()
    }

    /// Cuts files back to the page counts they had before the commit.
    fn undo_appends(&self, filled_before: &[(FileId, u64)]) {
        for (file_id, pages) in filled_before {
            let grown = match self.cache.filled_up_to(*file_id) {
                Ok(now) => now > *pages,
                Err(_) => false,
            };
            if !grown {
                continue;
            }
            if let Err(e) = self.cache.shrink_file(*file_id, *pages) {
                warn!(
                    operation = self.id,
                    file_id = file_id.as_u32(),
                    pages,
                    error = %e,
                    "could not cut pages appended by a failed commit"
                );
            }
        }
    }

    /// Discards every pending change.
    pub fn rollback(mut self) {
        self.discard();
    }

    fn discard(&mut self) {
        self.finished = true;
        if !self.pages.is_empty() {
            debug!(operation = self.id, pages = self.pages.len(), "atomic operation rolled back");
        }
        self.pages.clear();
        self.appended.clear();
        self.release_locks();
    }

    fn release_locks(&mut self) {
        self.component_locks.clear();
    }
}

impl PageReader for AtomicOperation {
    fn page_size(&self) -> usize {
        self.zero_page.len()
    }

    fn filled_up_to(&self, file_id: FileId) -> Result<u64> {
        let appended = self.appended.get(&file_id).copied().unwrap_or(0);
        Ok(self.cache.filled_up_to(file_id)? + appended)
    }

    fn with_page<R, F>(&self, key: PageKey, f: F) -> Result<Option<R>>
    where
        F: FnOnce(PageView<'_>) -> R,
    {
        let pending = self.pages.get(&key);
        if let Some(pending) = pending.filter(|p| p.is_new) {
            return Ok(Some(f(PageView::with_changes(
                &self.zero_page,
                Some(&pending.changes),
            ))));
        }

        let Some(page) = self.cache.load_for_read(key)? else {
            return Ok(None);
        };
        let changes = pending.map(|p| &p.changes);
        Ok(Some(f(PageView::with_changes(page.data(), changes))))
    }
}

impl Drop for AtomicOperation {
    fn drop(&mut self) {
        if !self.finished {
            self.discard();
        }
    }
}
