use std::fmt;

/// File identifier type - identifies a file registered with a page cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId(pub u32);

impl FileId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileId({})", self.0)
    }
}

/// Page address inside a cache: the owning file plus the page index in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageKey {
    pub file_id: FileId,
    pub page_index: u64,
}

impl PageKey {
    pub fn new(file_id: FileId, page_index: u64) -> Self {
        Self {
            file_id,
            page_index,
        }
    }
}

impl fmt::Display for PageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file_id.0, self.page_index)
    }
}

/// Frame identifier type - identifies a slot of the disk cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameId(pub u32);

impl FrameId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn as_usize(&self) -> usize {
        self.0 as usize
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FrameId({})", self.0)
    }
}

/// Timestamp type for LRU-K tracking
pub type Timestamp = u64;

/// LSN (Log Sequence Number) assigned by a redo log
pub type Lsn = u64;

/// Invalid LSN constant
pub const INVALID_LSN: Lsn = 0;

/// Identifier of an atomic operation
pub type OperationId = u64;
