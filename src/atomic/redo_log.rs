use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::Mutex;

use crate::common::{FileId, Lsn, OperationId, PageKey, Result, StoreError, INVALID_LSN};
use crate::storage::page::PageChangeSet;

/// Redo information for one page touched by an atomic operation: only the
/// bytes that changed, plus whether the page was appended by the operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRedoRecord {
    pub operation_id: OperationId,
    pub page: PageKey,
    pub new_page: bool,
    pub changes: PageChangeSet,
}

impl PageRedoRecord {
    const FIXED_SIZE: usize = 8 + 4 + 8 + 1 + 4;

    pub fn serialized_size(&self) -> usize {
        Self::FIXED_SIZE + self.changes.serialized_size()
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.serialized_size());
        buf.put_u64_le(self.operation_id);
        buf.put_u32_le(self.page.file_id.as_u32());
        buf.put_u64_le(self.page.page_index);
        buf.put_u8(self.new_page as u8);
        buf.put_u32_le(self.changes.total_size() as u32);
        self.changes.write_to(&mut buf);
        buf.freeze()
    }

    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        if buf.remaining() < Self::FIXED_SIZE {
            return Err(StoreError::ChangeSetCorrupted(format!(
                "redo record header needs {} bytes, {} left",
                Self::FIXED_SIZE,
                buf.remaining()
            )));
        }
        let operation_id = buf.get_u64_le();
        let file_id = FileId::new(buf.get_u32_le());
        let page_index = buf.get_u64_le();
        let new_page = buf.get_u8() != 0;
        let total_size = buf.get_u32_le() as usize;

        let mut changes = PageChangeSet::new(total_size);
        changes.read_from(buf)?;

        Ok(Self {
            operation_id,
            page: PageKey::new(file_id, page_index),
            new_page,
            changes,
        })
    }

    /// Reapplies the record onto the page's pre-image.
    pub fn replay(&self, buffer: &mut [u8]) {
        if self.new_page {
            buffer.fill(0);
        }
        self.changes.apply_changes(buffer);
    }
}

/// Sink for redo records. Records are logged before the pages they
/// describe are modified in the cache.
pub trait RedoLog: Send + Sync {
    fn log(&self, record: &PageRedoRecord) -> Result<Lsn>;

    /// Logs the records of one operation under consecutive LSNs.
    fn log_all(&self, records: &[PageRedoRecord]) -> Result<Range<Lsn>> {
        let start = self.end_lsn();
        let mut end = start;
        for record in records {
            end = self.log(record)? + 1;
        }
        Ok(start..end)
    }

    fn flush(&self) -> Result<()>;

    /// LSN the next record will get.
    fn end_lsn(&self) -> Lsn;
}

/// Redo log kept in memory, for memory-only stores and for tests.
pub struct MemoryRedoLog {
    records: Mutex<Vec<(Lsn, Bytes)>>,
    next_lsn: AtomicU64,
}

impl MemoryRedoLog {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            next_lsn: AtomicU64::new(INVALID_LSN + 1),
        }
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Decodes every record, oldest first.
    pub fn records(&self) -> Result<Vec<(Lsn, PageRedoRecord)>> {
        self.records
            .lock()
            .iter()
            .map(|(lsn, bytes)| {
                let mut cursor = bytes.clone();
                PageRedoRecord::decode(&mut cursor).map(|record| (*lsn, record))
            })
            .collect()
    }

    /// Drops records up to and including `lsn`.
    pub fn cut_till(&self, lsn: Lsn) {
        self.records.lock().retain(|(record_lsn, _)| *record_lsn > lsn);
    }
}

impl Default for MemoryRedoLog {
    fn default() -> Self {
        Self::new()
    }
}

impl RedoLog for MemoryRedoLog {
    fn log(&self, record: &PageRedoRecord) -> Result<Lsn> {
        let mut records = self.records.lock();
        let lsn = self.next_lsn.fetch_add(1, Ordering::AcqRel);
        records.push((lsn, record.encode()));
        Ok(lsn)
    }

    fn log_all(&self, batch: &[PageRedoRecord]) -> Result<Range<Lsn>> {
        let mut records = self.records.lock();
        let start = self.next_lsn.fetch_add(batch.len() as u64, Ordering::AcqRel);
        for (lsn, record) in (start..).zip(batch) {
            records.push((lsn, record.encode()));
        }
        Ok(start..start + batch.len() as u64)
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn end_lsn(&self) -> Lsn {
        self.next_lsn.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> PageRedoRecord {
        let mut changes = PageChangeSet::new(1024);
        changes.set_u64(16, 0xABCD).unwrap();
        changes.set_bytes(1000, &[1, 2, 3]).unwrap();
        PageRedoRecord {
            operation_id: 9,
            page: PageKey::new(FileId::new(2), 5),
            new_page: false,
            changes,
        }
    }

    #[test]
    fn test_redo_record_encoding() {
        let original = record();
        let bytes = original.encode();
        assert_eq!(bytes.len(), original.serialized_size());

        let decoded = PageRedoRecord::decode(&mut bytes.clone()).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_redo_record_replay() {
        let record = record();
        let mut page = vec![0xFFu8; 1024];
        record.replay(&mut page);
        assert_eq!(u64::from_le_bytes(page[16..24].try_into().unwrap()), 0xABCD);
        assert_eq!(&page[1000..1003], &[1, 2, 3]);
        assert_eq!(page[0], 0xFF);

        let fresh = PageRedoRecord {
            new_page: true,
            ..record
        };
        let mut page = vec![0xFFu8; 1024];
        fresh.replay(&mut page);
        assert_eq!(page[0], 0);
    }

    #[test]
    fn test_memory_redo_log_lsns() {
        let log = MemoryRedoLog::new();
        let first = log.log(&record()).unwrap();
        let second = log.log(&record()).unwrap();
        assert!(first > INVALID_LSN);
        assert_eq!(second, first + 1);
        assert_eq!(log.end_lsn(), second + 1);

        log.cut_till(first);
        let records = log.records().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].0, second);
    }

    #[test]
    fn test_log_all_assigns_consecutive_lsns() {
        let log = MemoryRedoLog::new();
        let first = log.log(&record()).unwrap();
        let batch = log.log_all(&[record(), record(), record()]).unwrap();
        assert_eq!(batch, first + 1..first + 4);
        assert_eq!(log.end_lsn(), batch.end);

        let lsns: Vec<Lsn> = log.records().unwrap().iter().map(|(lsn, _)| *lsn).collect();
        assert_eq!(lsns, vec![first, first + 1, first + 2, first + 3]);
    }

    #[test]
    fn test_decode_rejects_short_input() {
        let mut short: &[u8] = &[0u8; 10];
        assert!(PageRedoRecord::decode(&mut short).is_err());
    }
}
