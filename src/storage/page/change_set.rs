use bytes::{Buf, BufMut};

use super::change_portion::{read_u32, ChangePortion};
use crate::common::{Result, StoreError, PORTION_BYTES};

/// PageChangeSet records byte-level mutations against a buffer of known size
/// without touching the buffer. Reads merge the recorded bytes over the
/// caller's original buffer; `apply_changes` writes them in one pass.
///
/// The buffer is split into portions of `PORTION_BYTES`, each tracking its
/// own touched ranges. A write crossing a portion boundary is split in two.
///
/// All multi-byte values are little-endian.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageChangeSet {
    total_size: usize,
    portions: Vec<Option<ChangePortion>>,
}

impl PageChangeSet {
    pub fn new(total_size: usize) -> Self {
        let count = total_size.div_ceil(PORTION_BYTES);
        Self {
            total_size,
            portions: vec![None; count],
        }
    }

    pub fn total_size(&self) -> usize {
        self.total_size
    }

    pub fn is_empty(&self) -> bool {
        self.portions.iter().flatten().all(ChangePortion::is_empty)
    }

    /// Number of bytes currently recorded
    pub fn changed_bytes(&self) -> usize {
        self.portions.iter().flatten().map(ChangePortion::changed_bytes).sum()
    }

    pub fn clear(&mut self) {
        self.portions.iter_mut().for_each(|p| *p = None);
    }

    pub fn set_u8(&mut self, position: usize, value: u8) -> Result<()> {
        self.set_bytes(position, &[value])
    }

    pub fn set_u16(&mut self, position: usize, value: u16) -> Result<()> {
        self.set_bytes(position, &value.to_le_bytes())
    }

    pub fn set_u32(&mut self, position: usize, value: u32) -> Result<()> {
        self.set_bytes(position, &value.to_le_bytes())
    }

    pub fn set_u64(&mut self, position: usize, value: u64) -> Result<()> {
        self.set_bytes(position, &value.to_le_bytes())
    }

    pub fn set_i32(&mut self, position: usize, value: i32) -> Result<()> {
        self.set_bytes(position, &value.to_le_bytes())
    }

    pub fn set_i64(&mut self, position: usize, value: i64) -> Result<()> {
        self.set_bytes(position, &value.to_le_bytes())
    }

    fn check_range(&self, position: usize, len: usize) -> Result<()> {
        match position.checked_add(len) {
            Some(end) if end <= self.total_size => Ok(()),
            _ => Err(StoreError::ChangeOutOfRange {
                position,
                len,
                size: self.total_size,
            }),
        }
    }

    /// Records `data` at `position`. Nothing is recorded if the range does
    /// not fit in the buffer.
    pub fn set_bytes(&mut self, position: usize, data: &[u8]) -> Result<()> {
        self.check_range(position, data.len())?;

        let mut done = 0;
        while done < data.len() {
            let at = position + done;
            let index = at / PORTION_BYTES;
            let offset = at % PORTION_BYTES;
            let chunk = (PORTION_BYTES - offset).min(data.len() - done);

            self.portions[index]
                .get_or_insert_with(ChangePortion::new)
                .set(offset, &data[done..done + chunk]);
            done += chunk;
        }
        Ok(())
    }

    pub fn get_u8(&self, original: &[u8], position: usize) -> u8 {
        let mut out = [0u8; 1];
        self.read_into(original, position, &mut out);
        out[0]
    }

    pub fn get_u16(&self, original: &[u8], position: usize) -> u16 {
        let mut out = [0u8; 2];
        self.read_into(original, position, &mut out);
        u16::from_le_bytes(out)
    }

    pub fn get_u32(&self, original: &[u8], position: usize) -> u32 {
        let mut out = [0u8; 4];
        self.read_into(original, position, &mut out);
        u32::from_le_bytes(out)
    }

    pub fn get_u64(&self, original: &[u8], position: usize) -> u64 {
        let mut out = [0u8; 8];
        self.read_into(original, position, &mut out);
        u64::from_le_bytes(out)
    }

    pub fn get_i32(&self, original: &[u8], position: usize) -> i32 {
        let mut out = [0u8; 4];
        self.read_into(original, position, &mut out);
        i32::from_le_bytes(out)
    }

    pub fn get_i64(&self, original: &[u8], position: usize) -> i64 {
        let mut out = [0u8; 8];
        self.read_into(original, position, &mut out);
        i64::from_le_bytes(out)
    }

    pub fn get_bytes(&self, original: &[u8], position: usize, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        self.read_into(original, position, &mut out);
        out
    }

    /// Fills `out` with the logically current content of
    /// `[position, position + out.len())`.
    pub fn read_into(&self, original: &[u8], position: usize, out: &mut [u8]) {
        out.copy_from_slice(&original[position..position + out.len()]);

        let mut done = 0;
        while done < out.len() {
            let at = position + done;
            let index = at / PORTION_BYTES;
            let offset = at % PORTION_BYTES;
            let chunk = (PORTION_BYTES - offset).min(out.len() - done);

            if let Some(Some(portion)) = self.portions.get(index) {
                portion.overlay(offset, &mut out[done..done + chunk]);
            }
            done += chunk;
        }
    }

    /// Records a memmove of `len` bytes from `from` to `to`. The source is
    /// read as it currently stands, recorded changes included.
    pub fn move_data(&mut self, original: &[u8], from: usize, to: usize, len: usize) -> Result<()> {
        self.check_range(from, len)?;
        self.check_range(to, len)?;
        if len == 0 || from == to {
            return Ok(());
        }
        let data = self.get_bytes(original, from, len);
        self.set_bytes(to, &data)
    }

    /// Writes every recorded change into `buffer`.
    pub fn apply_changes(&self, buffer: &mut [u8]) {
        for (index, portion) in self.portions.iter().enumerate() {
            if let Some(portion) = portion {
                let start = index * PORTION_BYTES;
                let end = (start + PORTION_BYTES).min(buffer.len());
                portion.apply(&mut buffer[start..end]);
            }
        }
    }

    pub fn serialized_size(&self) -> usize {
        4 + self
            .portions
            .iter()
            .flatten()
            .filter(|p| !p.is_empty())
            .map(|p| 4 + p.serialized_size())
            .sum::<usize>()
    }

    /// Encodes the change set into `stream` at `offset` and returns the
    /// offset right after it.
    ///
    /// # Panics
    /// If `stream` has less than `serialized_size()` bytes after `offset`.
    pub fn to_stream(&self, stream: &mut [u8], offset: usize) -> usize {
        let size = self.serialized_size();
        let mut cursor = &mut stream[offset..offset + size];
        self.write_to(&mut cursor);
        offset + size
    }

    /// Decodes a change set written by `to_stream` into this recorder and
    /// returns the offset right after it.
    pub fn from_stream(&mut self, stream: &[u8], offset: usize) -> Result<usize> {
        let mut cursor = stream.get(offset..).ok_or_else(|| {
            StoreError::ChangeSetCorrupted(format!(
                "offset {} is past the end of a {} byte stream",
                offset,
                stream.len()
            ))
        })?;
        let before = cursor.len();
        self.read_from(&mut cursor)?;
        Ok(offset + before - cursor.len())
    }

    pub fn write_to<B: BufMut>(&self, buf: &mut B) {
        let touched: Vec<(usize, &ChangePortion)> = self
            .portions
            .iter()
            .enumerate()
            .filter_map(|(i, p)| p.as_ref().filter(|p| !p.is_empty()).map(|p| (i, p)))
            .collect();

        buf.put_u32_le(touched.len() as u32);
        for (index, portion) in touched {
            buf.put_u32_le(index as u32);
            portion.write_to(buf);
        }
    }

    pub fn read_from<B: Buf>(&mut self, buf: &mut B) -> Result<()> {
        let count = read_u32(buf)?;
        for _ in 0..count {
            let index = read_u32(buf)? as usize;
            if index >= self.portions.len() {
                return Err(StoreError::ChangeSetCorrupted(format!(
                    "portion {} is outside of a {} byte buffer",
                    index, self.total_size
                )));
            }
            let limit = (self.total_size - index * PORTION_BYTES).min(PORTION_BYTES);
            self.portions[index]
                .get_or_insert_with(ChangePortion::new)
                .read_from(buf, limit)?;
        }
        Ok(())
    }
}
