mod cache_entry;
mod disk_cache;
mod lru_k_replacer;
mod memory_cache;
mod page_cache;
mod page_guard;

pub use cache_entry::*;
pub use disk_cache::*;
pub use lru_k_replacer::*;
pub use memory_cache::*;
pub use page_cache::*;
pub use page_guard::*;
