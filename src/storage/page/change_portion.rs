use std::collections::BTreeMap;

use bytes::{Buf, BufMut};

use crate::common::{Result, StoreError};

/// Touched byte ranges of one portion of a change set.
///
/// Ranges are keyed by their start offset inside the portion. They never
/// overlap and never touch: a write that overlaps or is adjacent to existing
/// ranges is merged with them, the newest bytes winning.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangePortion {
    ranges: BTreeMap<usize, Vec<u8>>,
}

impl ChangePortion {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn range_count(&self) -> usize {
        self.ranges.len()
    }

    /// Number of recorded bytes
    pub fn changed_bytes(&self) -> usize {
        self.ranges.values().map(Vec::len).sum()
    }

    /// Records `data` at `offset`.
    pub fn set(&mut self, offset: usize, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let end = offset + data.len();

        // Ranges that overlap [offset, end) or touch it on either side.
        let merged: Vec<usize> = self
            .ranges
            .range(..=end)
            .rev()
            .take_while(|(start, bytes)| *start + bytes.len() >= offset)
            .map(|(start, _)| *start)
            .collect();

        if merged.is_empty() {
            self.ranges.insert(offset, data.to_vec());
            return;
        }

        let mut new_start = offset;
        let mut new_end = end;
        for start in &merged {
            let len = self.ranges[start].len();
            new_start = new_start.min(*start);
            new_end = new_end.max(start + len);
        }

        let mut buffer = vec![0u8; new_end - new_start];
        for start in merged {
            if let Some(bytes) = self.ranges.remove(&start) {
                let at = start - new_start;
                buffer[at..at + bytes.len()].copy_from_slice(&bytes);
            }
        }
        let at = offset - new_start;
        buffer[at..at + data.len()].copy_from_slice(data);
        self.ranges.insert(new_start, buffer);
    }

    /// Overlays recorded bytes onto `out`, which holds the original content
    /// of `[offset, offset + out.len())`.
    pub fn overlay(&self, offset: usize, out: &mut [u8]) {
        let end = offset + out.len();
        for (start, bytes) in self
            .ranges
            .range(..end)
            .rev()
            .take_while(|(start, bytes)| *start + bytes.len() > offset)
        {
            let from = (*start).max(offset);
            let to = (start + bytes.len()).min(end);
            out[from - offset..to - offset].copy_from_slice(&bytes[from - start..to - start]);
        }
    }

    /// Copies every recorded range into `portion`.
    pub fn apply(&self, portion: &mut [u8]) {
        for (start, bytes) in &self.ranges {
            portion[*start..*start + bytes.len()].copy_from_slice(bytes);
        }
    }

    pub fn serialized_size(&self) -> usize {
        4 + self.ranges.values().map(|b| 8 + b.len()).sum::<usize>()
    }

    pub fn write_to<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32_le(self.ranges.len() as u32);
        for (start, bytes) in &self.ranges {
            buf.put_u32_le(*start as u32);
            buf.put_u32_le(bytes.len() as u32);
            buf.put_slice(bytes);
        }
    }

    /// Decodes ranges into this portion; every range must fit in `limit` bytes.
    pub fn read_from<B: Buf>(&mut self, buf: &mut B, limit: usize) -> Result<()> {
        let count = read_u32(buf)?;
        for _ in 0..count {
            let start = read_u32(buf)? as usize;
            let len = read_u32(buf)? as usize;
            if start + len > limit {
                return Err(StoreError::ChangeSetCorrupted(format!(
                    "range {}..{} exceeds portion size {}",
                    start,
                    start + len,
                    limit
                )));
            }
            if buf.remaining() < len {
                return Err(StoreError::ChangeSetCorrupted(format!(
                    "range of {} bytes truncated, {} bytes left",
                    len,
                    buf.remaining()
                )));
            }
            let mut bytes = vec![0u8; len];
            buf.copy_to_slice(&mut bytes);
            self.set(start, &bytes);
        }
        Ok(())
    }
}

pub(crate) fn read_u32<B: Buf>(buf: &mut B) -> Result<u32> {
    if buf.remaining() < 4 {
        return Err(StoreError::ChangeSetCorrupted(
            "unexpected end of change set".to_string(),
        ));
    }
    Ok(buf.get_u32_le())
}
