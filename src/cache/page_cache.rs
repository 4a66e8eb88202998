use crate::common::{FileId, PageKey, Result};

use super::{ReadPageGuard, WritePageGuard};

/// Page cache over a set of named files.
///
/// Pages are addressed by `PageKey`. A loaded page stays resident for as
/// long as a guard on it is alive; guards hold the page lock (shared for
/// reads, exclusive for writes) and give the page back when dropped.
pub trait PageCache: Send + Sync {
    fn page_size(&self) -> usize;

    /// Creates a new, empty file.
    fn add_file(&self, name: &str) -> Result<FileId>;

    /// Opens an existing file, or returns its id if it is already open.
    fn load_file(&self, name: &str) -> Result<FileId>;

    fn exists(&self, name: &str) -> bool;

    fn file_id(&self, name: &str) -> Option<FileId>;

    fn file_name(&self, file_id: FileId) -> Result<String>;

    /// `None` if the page lies past the end of the file.
    fn load_for_read(&self, key: PageKey) -> Result<Option<ReadPageGuard>>;

    /// `None` if the page lies past the end of the file.
    fn load_for_write(&self, key: PageKey) -> Result<Option<WritePageGuard>>;

    /// Appends a zeroed page to the file and returns it locked for write.
    fn allocate_new_page(&self, file_id: FileId) -> Result<WritePageGuard>;

    /// Number of pages in the file.
    fn filled_up_to(&self, file_id: FileId) -> Result<u64>;

    /// Writes every dirty page of the file and makes it durable.
    fn flush_file(&self, file_id: FileId) -> Result<()>;

    fn flush(&self) -> Result<()>;

    fn close_file(&self, file_id: FileId, flush: bool) -> Result<()>;

    fn delete_file(&self, file_id: FileId) -> Result<()>;

    fn rename_file(&self, file_id: FileId, new_name: &str) -> Result<()>;

    /// Drops every page of the file.
    fn truncate_file(&self, file_id: FileId) -> Result<()>;

    /// Cuts the file back to its first `pages` pages. Fails with
    /// `PageStillPinned` if a dropped page is in use.
    fn shrink_file(&self, file_id: FileId, pages: u64) -> Result<()>;

    /// Bytes held by resident pages.
    fn used_memory(&self) -> usize;

    fn close(&self) -> Result<()>;

    /// Closes the cache and removes all of its files.
    fn delete(&self) -> Result<()>;
}
