use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::cache::PageCache;
use crate::common::Result;

use super::{AtomicOperation, RedoLog};

/// Hands out atomic operations over one cache and redo log.
pub struct AtomicOperationsManager {
    cache: Arc<dyn PageCache>,
    redo_log: Arc<dyn RedoLog>,
    next_operation_id: AtomicU64,
}

impl AtomicOperationsManager {
    pub fn new(cache: Arc<dyn PageCache>, redo_log: Arc<dyn RedoLog>) -> Self {
        Self {
            cache,
            redo_log,
            next_operation_id: AtomicU64::new(1),
        }
    }

    pub fn cache(&self) -> &Arc<dyn PageCache> {
        &self.cache
    }

    pub fn redo_log(&self) -> &Arc<dyn RedoLog> {
        &self.redo_log
    }

    pub fn start_atomic_operation(&self) -> AtomicOperation {
        let id = self.next_operation_id.fetch_add(1, Ordering::Relaxed);
        AtomicOperation::new(id, Arc::clone(&self.cache), Arc::clone(&self.redo_log))
    }

    /// Runs `f` inside a fresh operation, committing it if `f` succeeds and
    /// rolling it back otherwise.
    pub fn calculate_in_atomic_operation<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut AtomicOperation) -> Result<R>,
    {
        let mut operation = self.start_atomic_operation();
        match f(&mut operation) {
            Ok(result) => {
                operation.commit()?;
                Ok(result)
            }
            Err(e) => {
                operation.rollback();
                Err(e)
            }
        }
    }

    /// Same as `calculate_in_atomic_operation` for work without a result.
    pub fn execute_in_atomic_operation<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut AtomicOperation) -> Result<()>,
    {
        self.calculate_in_atomic_operation(f)
    }
}
