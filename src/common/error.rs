use thiserror::Error;

use super::types::{FileId, PageKey};

/// Storage error types
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("I/O error on file '{file}' at offset {offset}: {source}")]
    FileIo {
        file: String,
        offset: u64,
        #[source]
        source: std::io::Error,
    },

    #[error("Offset {offset} is outside of file '{file}' (logical size {size})")]
    OutOfRange { file: String, offset: u64, size: u64 },

    #[error("Unexpected end of file '{file}' while reading at offset {offset}")]
    UnexpectedEof { file: String, offset: u64 },

    #[error("File '{0}' is closed")]
    FileClosed(String),

    #[error("File '{0}' already exists")]
    FileAlreadyExists(String),

    #[error("File '{0}' does not exist")]
    FileNotFound(String),

    #[error("File {0} is not registered in the cache")]
    UnknownFile(FileId),

    #[error("Page {0} not found")]
    PageNotFound(PageKey),

    #[error("Page {0} is still in use")]
    PageStillPinned(PageKey),

    #[error("Page cache is full, no evictable pages available")]
    CacheFull,

    #[error("I/O service is shut down")]
    IoServiceShutdown,

    #[error("No more resources available in pool (max={max}) for key {key}, waited {waited_ms} ms")]
    ResourceTimeout {
        key: String,
        max: usize,
        waited_ms: u64,
    },

    #[error("Wait interrupted: {0}")]
    Interrupted(String),

    #[error("Change of {len} bytes at {position} is outside of a {size} byte page")]
    ChangeOutOfRange { position: usize, len: usize, size: usize },

    #[error("Change set corrupted: {0}")]
    ChangeSetCorrupted(String),

    #[error("Structural corruption: {0}")]
    StructuralCorruption(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Bucket for hash {hash:#018x} overflows at full hash depth")]
    BucketOverflow { hash: u64 },

    #[error("Entry of {size} bytes exceeds the bucket limit of {max} bytes")]
    EntryTooLarge { size: usize, max: usize },

    #[error("Null keys are not supported by index '{0}'")]
    NullKeyNotSupported(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl StoreError {
    pub(crate) fn file_io(file: &str, offset: u64, source: std::io::Error) -> Self {
        StoreError::FileIo {
            file: file.to_string(),
            offset,
            source,
        }
    }

    /// Timeouts and interruptions are outcomes of waiting, not failures of
    /// the resource itself.
    pub fn is_wait_failure(&self) -> bool {
        matches!(
            self,
            StoreError::ResourceTimeout { .. } | StoreError::Interrupted(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
