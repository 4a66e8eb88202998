use super::change_set::PageChangeSet;
use crate::common::{Result, StoreError};

/// Read access to one page: the resident bytes, optionally overlaid with
/// the uncommitted changes of an atomic operation.
#[derive(Clone, Copy)]
pub struct PageView<'a> {
    data: &'a [u8],
    changes: Option<&'a PageChangeSet>,
}

impl<'a> PageView<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            changes: None,
        }
    }

    pub fn with_changes(data: &'a [u8], changes: Option<&'a PageChangeSet>) -> Self {
        Self { data, changes }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn read_into(&self, position: usize, out: &mut [u8]) {
        match self.changes {
            Some(changes) => changes.read_into(self.data, position, out),
            None => out.copy_from_slice(&self.data[position..position + out.len()]),
        }
    }

    pub fn get_bytes(&self, position: usize, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        self.read_into(position, &mut out);
        out
    }

    pub fn get_u8(&self, position: usize) -> u8 {
        let mut out = [0u8; 1];
        self.read_into(position, &mut out);
        out[0]
    }

    pub fn get_u16(&self, position: usize) -> u16 {
        let mut out = [0u8; 2];
        self.read_into(position, &mut out);
        u16::from_le_bytes(out)
    }

    pub fn get_u32(&self, position: usize) -> u32 {
        let mut out = [0u8; 4];
        self.read_into(position, &mut out);
        u32::from_le_bytes(out)
    }

    pub fn get_u64(&self, position: usize) -> u64 {
        let mut out = [0u8; 8];
        self.read_into(position, &mut out);
        u64::from_le_bytes(out)
    }

    pub fn get_i64(&self, position: usize) -> i64 {
        let mut out = [0u8; 8];
        self.read_into(position, &mut out);
        i64::from_le_bytes(out)
    }
}

/// Write access to one page inside an atomic operation. Writes are
/// recorded in the change set; the resident bytes stay untouched.
///
/// A write outside of the page is dropped and remembered; `take_error`
/// hands out the first one.
pub struct PageEdit<'a> {
    data: &'a [u8],
    changes: &'a mut PageChangeSet,
    error: Option<StoreError>,
}

impl<'a> PageEdit<'a> {
    pub fn new(data: &'a [u8], changes: &'a mut PageChangeSet) -> Self {
        Self {
            data,
            changes,
            error: None,
        }
    }

    /// First failed write since the last call, as an error.
    pub fn take_error(&mut self) -> Result<()> {
        match self.error.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn record(&mut self, result: Result<()>) {
        if let Err(e) = result {
            self.error.get_or_insert(e);
        }
    }

    pub fn view(&self) -> PageView<'_> {
        PageView::with_changes(self.data, Some(&*self.changes))
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn get_bytes(&self, position: usize, len: usize) -> Vec<u8> {
        self.changes.get_bytes(self.data, position, len)
    }

    pub fn get_u8(&self, position: usize) -> u8 {
        self.changes.get_u8(self.data, position)
    }

    pub fn get_u16(&self, position: usize) -> u16 {
        self.changes.get_u16(self.data, position)
    }

    pub fn get_u32(&self, position: usize) -> u32 {
        self.changes.get_u32(self.data, position)
    }

    pub fn get_u64(&self, position: usize) -> u64 {
        self.changes.get_u64(self.data, position)
    }

    pub fn get_i64(&self, position: usize) -> i64 {
        self.changes.get_i64(self.data, position)
    }

    pub fn set_bytes(&mut self, position: usize, data: &[u8]) {
        let result = self.changes.set_bytes(position, data);
        self.record(result);
    }

    pub fn set_u8(&mut self, position: usize, value: u8) {
        let result = self.changes.set_u8(position, value);
        self.record(result);
    }

    pub fn set_u16(&mut self, position: usize, value: u16) {
        let result = self.changes.set_u16(position, value);
        self.record(result);
    }

    pub fn set_u32(&mut self, position: usize, value: u32) {
        let result = self.changes.set_u32(position, value);
        self.record(result);
    }

    pub fn set_u64(&mut self, position: usize, value: u64) {
        let result = self.changes.set_u64(position, value);
        self.record(result);
    }

    pub fn set_i64(&mut self, position: usize, value: i64) {
        let result = self.changes.set_i64(position, value);
        self.record(result);
    }

    pub fn move_data(&mut self, from: usize, to: usize, len: usize) {
        let result = self.changes.move_data(self.data, from, to, len);
        self.record(result);
    }

    /// Overwrites the whole page with zeros.
    pub fn clear(&mut self) {
        let zeros = vec![0u8; self.data.len()];
        let result = self.changes.set_bytes(0, &zeros);
        self.record(result);
    }
}
