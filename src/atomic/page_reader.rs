use crate::cache::PageCache;
use crate::common::{FileId, PageKey, Result};
use crate::storage::page::PageView;

/// Read access to pages, either straight from a cache or through an atomic
/// operation that overlays its own uncommitted changes.
pub trait PageReader {
    fn page_size(&self) -> usize;

    fn filled_up_to(&self, file_id: FileId) -> Result<u64>;

    /// Runs `f` on the page while its shared lock is held. `None` if the
    /// page does not exist.
    fn with_page<R, F>(&self, key: PageKey, f: F) -> Result<Option<R>>
    where
        F: FnOnce(PageView<'_>) -> R;
}

/// Reads committed pages from a cache.
pub struct CacheReader<'a> {
    cache: &'a dyn PageCache,
}

impl<'a> CacheReader<'a> {
    pub fn new(cache: &'a dyn PageCache) -> Self {
        Self { cache }
    }
}

impl PageReader for CacheReader<'_> {
    fn page_size(&self) -> usize {
        self.cache.page_size()
    }

    fn filled_up_to(&self, file_id: FileId) -> Result<u64> {
        self.cache.filled_up_to(file_id)
    }

    fn with_page<R, F>(&self, key: PageKey, f: F) -> Result<Option<R>>
    where
        F: FnOnce(PageView<'_>) -> R,
    {
        Ok(self
            .cache
            .load_for_read(key)?
            .map(|page| f(PageView::new(page.data()))))
    }
}
