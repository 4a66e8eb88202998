use super::error::{Result, StoreError};

/// Size of the reserved region at the start of every managed file.
/// Page 0 starts right after it.
pub const FILE_HEADER_SIZE: usize = 1024;

/// Default size of a page in bytes (4 KB)
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Smallest page size a store accepts
pub const MIN_PAGE_SIZE: usize = 1024;

/// Largest page size a store accepts
pub const MAX_PAGE_SIZE: usize = 64 * 1024;

/// Size of one change-set portion. Buffers larger than this are diffed
/// portion by portion.
pub const PORTION_BYTES: usize = 64 * 1024;

/// Default number of frames in the disk cache
pub const DEFAULT_CACHE_CAPACITY: usize = 1024;

/// Default K value for LRU-K replacement policy
pub const DEFAULT_LRUK_K: usize = 2;

/// Default number of I/O worker threads
pub const DEFAULT_IO_THREADS: usize = 2;

/// Default number of batch writes a single file keeps in flight
pub const DEFAULT_MAX_IN_FLIGHT_WRITES: usize = 64;

/// Number of hash bits a single directory node can resolve
pub const MAX_NODE_DEPTH: u8 = 8;

/// Number of pointer slots in a directory node
pub const NODE_SLOTS: usize = 1 << MAX_NODE_DEPTH;

/// Width of a hash code in bits
pub const HASH_CODE_BITS: u8 = 64;

/// Settings for a page cache and the files underneath it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Page size in bytes; a power of two in `[MIN_PAGE_SIZE, MAX_PAGE_SIZE]`
    pub page_size: usize,
    /// Number of resident pages the disk cache can hold
    pub capacity_pages: usize,
    /// K value of the LRU-K replacer
    pub lru_k: usize,
    /// Worker threads of the I/O service
    pub io_threads: usize,
    /// Per-file bound on outstanding batch writes
    pub max_in_flight_writes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            capacity_pages: DEFAULT_CACHE_CAPACITY,
            lru_k: DEFAULT_LRUK_K,
            io_threads: DEFAULT_IO_THREADS,
            max_in_flight_writes: DEFAULT_MAX_IN_FLIGHT_WRITES,
        }
    }
}

impl CacheConfig {
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_capacity(mut self, capacity_pages: usize) -> Self {
        self.capacity_pages = capacity_pages;
        self
    }

    pub fn validate(&self) -> Result<()> {
        validate_page_size(self.page_size)?;
        if self.capacity_pages == 0 {
            return Err(StoreError::InvalidConfig(
                "cache capacity must be at least one page".to_string(),
            ));
        }
        if self.lru_k == 0 {
            return Err(StoreError::InvalidConfig("lru_k must be positive".to_string()));
        }
        if self.io_threads == 0 || self.max_in_flight_writes == 0 {
            return Err(StoreError::InvalidConfig(
                "io_threads and max_in_flight_writes must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Admission limits of a resource pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourcePoolConfig {
    /// Upper bound on resources lent out at the same time
    pub max_resources: usize,
    /// Resources created eagerly when the pool is built with `with_min`
    pub min_resources: usize,
}

impl ResourcePoolConfig {
    pub fn new(max_resources: usize) -> Self {
        Self {
            max_resources,
            min_resources: 0,
        }
    }

    pub fn with_min(mut self, min_resources: usize) -> Self {
        self.min_resources = min_resources;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_resources == 0 {
            return Err(StoreError::InvalidConfig(
                "max_resources must be greater than zero".to_string(),
            ));
        }
        if self.min_resources > self.max_resources {
            return Err(StoreError::InvalidConfig(format!(
                "min_resources {} exceeds max_resources {}",
                self.min_resources, self.max_resources
            )));
        }
        Ok(())
    }
}

pub fn validate_page_size(page_size: usize) -> Result<()> {
    if !page_size.is_power_of_two() || !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) {
        return Err(StoreError::InvalidConfig(format!(
            "page size {} must be a power of two between {} and {}",
            page_size, MIN_PAGE_SIZE, MAX_PAGE_SIZE
        )));
    }
    Ok(())
}
