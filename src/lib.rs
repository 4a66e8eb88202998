//! pagestore - a page-oriented storage substrate
//!
//! The crate provides the pieces a storage engine is built from: files
//! addressed in fixed-size pages, a page cache, atomic multi-page updates,
//! a persistent extendible hash index and bounded pools of reusable
//! resources.
//!
//! # Architecture
//!
//! - **Storage** (`storage`): file I/O and page-level change tracking
//!   - `IoService`: worker threads executing batch writes
//!   - `PagedFile`: positional reads and writes behind a reserved header
//!   - `PageChangeSet`: records page edits as sparse byte ranges
//!
//! - **Cache** (`cache`): resident pages shared between threads
//!   - `DiskCache`: fixed frame count over paged files, LRU-K eviction
//!   - `MemoryCache`: pages kept in memory only
//!   - `ReadPageGuard`/`WritePageGuard`: RAII page locks
//!
//! - **Atomic operations** (`atomic`): page changes buffered per operation,
//!   logged to a `RedoLog` and applied on commit
//!
//! - **Index** (`index`): `HashIndex`, an extendible hash index with ordered
//!   scans over hash codes
//!
//! - **Pool** (`pool`): `ResourcePool`, its reentrant variant and a factory
//!   of partitioned pools
//!
//! - **Store** (`store`): `PageStore`, the owner that starts and shuts down
//!   the layers above
//!
//! # Example
//!
//! ```rust,no_run
//! use pagestore::common::CacheConfig;
//! use pagestore::index::{HashIndex, HashIndexSettings, Sha256HashFunction, StringSerializer, U64Serializer};
//! use pagestore::store::PageStore;
//!
//! let store = PageStore::init_disk("data", CacheConfig::default()).unwrap();
//! let settings = HashIndexSettings::new(U64Serializer, StringSerializer, Sha256HashFunction::new(U64Serializer));
//! let index = HashIndex::create("users.hix", store.atomic_operations(), settings).unwrap();
//!
//! index.put(&1, &"alice".to_string()).unwrap();
//! assert_eq!(index.get(&1).unwrap().as_deref(), Some("alice"));
//!
//! index.close().unwrap();
//! store.shutdown().unwrap();
//! ```

pub mod atomic;
pub mod cache;
pub mod common;
pub mod index;
pub mod pool;
pub mod storage;
pub mod store;

// Re-export commonly used types at the crate root
pub use common::{CacheConfig, FileId, PageKey, Result, StoreError};
pub use store::PageStore;
