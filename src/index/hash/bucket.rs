//! Bucket page layout.
//!
//! ```text
//! | depth u8 | size u32 | free pointer u32 | slot[0..size] u32 | free | entries |
//! ```
//!
//! Slots hold entry offsets sorted by (hash, key). Entries are packed from
//! the end of the page downwards as
//! `hash u64 | key len u32 | key | value len u32 | value`.

use std::cmp::Ordering;

use crate::common::Result;
use crate::storage::page::{PageEdit, PageView};

const DEPTH_OFFSET: usize = 0;
const SIZE_OFFSET: usize = 1;
const FREE_POINTER_OFFSET: usize = 5;
const BUCKET_HEADER_SIZE: usize = 9;
const SLOT_SIZE: usize = 4;
const ENTRY_OVERHEAD: usize = 8 + 4 + 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RawEntry {
    pub hash: u64,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl RawEntry {
    fn encoded_len(&self) -> usize {
        ENTRY_OVERHEAD + self.key.len() + self.value.len()
    }
}

/// Bytes an entry takes in a bucket, slot included.
pub(crate) fn entry_footprint(key_len: usize, value_len: usize) -> usize {
    ENTRY_OVERHEAD + key_len + value_len + SLOT_SIZE
}

/// Largest footprint accepted; four entries always fit one bucket.
pub(crate) fn max_entry_footprint(page_size: usize) -> usize {
    (page_size - BUCKET_HEADER_SIZE) / 4
}

/// Pages holding the two halves of a split bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BucketSplitResult {
    /// The split page, keeping entries whose split bit is 0
    pub updated_bucket: u64,
    pub new_bucket: u64,
}

pub(crate) enum Slot {
    Found(usize),
    Missing(usize),
}

pub(crate) fn init(page: &mut PageEdit<'_>, depth: u8) {
    page.set_u8(DEPTH_OFFSET, depth);
    page.set_u32(SIZE_OFFSET, 0);
    page.set_u32(FREE_POINTER_OFFSET, page.len() as u32);
}

pub(crate) fn depth(page: &PageView<'_>) -> u8 {
    page.get_u8(DEPTH_OFFSET)
}

pub(crate) fn size(page: &PageView<'_>) -> usize {
    page.get_u32(SIZE_OFFSET) as usize
}

fn free_pointer(page: &PageView<'_>) -> usize {
    page.get_u32(FREE_POINTER_OFFSET) as usize
}

pub(crate) fn free_space(page: &PageView<'_>) -> usize {
    free_pointer(page) - (BUCKET_HEADER_SIZE + size(page) * SLOT_SIZE)
}

fn position(page: &PageView<'_>, index: usize) -> usize {
    page.get_u32(BUCKET_HEADER_SIZE + index * SLOT_SIZE) as usize
}

pub(crate) fn hash_at(page: &PageView<'_>, index: usize) -> u64 {
    page.get_u64(position(page, index))
}

pub(crate) fn key_at(page: &PageView<'_>, index: usize) -> Vec<u8> {
    let pos = position(page, index);
    let key_len = page.get_u32(pos + 8) as usize;
    page.get_bytes(pos + 12, key_len)
}

pub(crate) fn value_at(page: &PageView<'_>, index: usize) -> Vec<u8> {
    let pos = position(page, index);
    let key_len = page.get_u32(pos + 8) as usize;
    let value_pos = pos + 12 + key_len;
    let value_len = page.get_u32(value_pos) as usize;
    page.get_bytes(value_pos + 4, value_len)
}

pub(crate) fn entry_at(page: &PageView<'_>, index: usize) -> RawEntry {
    RawEntry {
        hash: hash_at(page, index),
        key: key_at(page, index),
        value: value_at(page, index),
    }
}

pub(crate) fn entries(page: &PageView<'_>) -> Vec<RawEntry> {
    (0..size(page)).map(|i| entry_at(page, i)).collect()
}

/// Binary search over the slots. `cmp` orders a stored entry against the
/// probe.
pub(crate) fn search<F>(page: &PageView<'_>, mut cmp: F) -> Result<Slot>
where
    F: FnMut(u64, &[u8]) -> Result<Ordering>,
{
    let mut low = 0;
    let mut high = size(page);
    while low < high {
        let mid = low + (high - low) / 2;
        match cmp(hash_at(page, mid), &key_at(page, mid))? {
            Ordering::Less => low = mid + 1,
            Ordering::Greater => high = mid,
            Ordering::Equal => return Ok(Slot::Found(mid)),
        }
    }
    Ok(Slot::Missing(low))
}

/// Inserts at slot `index`. Returns false when the entry does not fit.
pub(crate) fn insert_at(page: &mut PageEdit<'_>, index: usize, entry: &RawEntry) -> bool {
    let size = page.get_u32(SIZE_OFFSET) as usize;
    let free = page.get_u32(FREE_POINTER_OFFSET) as usize;
    let len = entry.encoded_len();
    if free_space(&page.view()) < len + SLOT_SIZE {
        return false;
    }

    let pos = free - len;
    page.set_u64(pos, entry.hash);
    page.set_u32(pos + 8, entry.key.len() as u32);
    page.set_bytes(pos + 12, &entry.key);
    let value_pos = pos + 12 + entry.key.len();
    page.set_u32(value_pos, entry.value.len() as u32);
    page.set_bytes(value_pos + 4, &entry.value);

    let slot = BUCKET_HEADER_SIZE + index * SLOT_SIZE;
    page.move_data(slot, slot + SLOT_SIZE, (size - index) * SLOT_SIZE);
    page.set_u32(slot, pos as u32);
    page.set_u32(SIZE_OFFSET, (size + 1) as u32);
    page.set_u32(FREE_POINTER_OFFSET, pos as u32);
    true
}

/// Appends after the last slot; callers keep the order.
pub(crate) fn append(page: &mut PageEdit<'_>, entry: &RawEntry) -> bool {
    let size = page.get_u32(SIZE_OFFSET) as usize;
    insert_at(page, size, entry)
}

pub(crate) fn remove_at(page: &mut PageEdit<'_>, index: usize) {
    let size = page.get_u32(SIZE_OFFSET) as usize;
    let free = page.get_u32(FREE_POINTER_OFFSET) as usize;
    let slot = BUCKET_HEADER_SIZE + index * SLOT_SIZE;
    let pos = page.get_u32(slot) as usize;
    let key_len = page.get_u32(pos + 8) as usize;
    let value_len = page.get_u32(pos + 12 + key_len) as usize;
    let len = ENTRY_OVERHEAD + key_len + value_len;

    // close the gap: entries below `pos` shift up by `len`
    page.move_data(free, free + len, pos - free);
    for i in 0..size {
        let other = BUCKET_HEADER_SIZE + i * SLOT_SIZE;
        let other_pos = page.get_u32(other) as usize;
        if other_pos < pos {
            page.set_u32(other, (other_pos + len) as u32);
        }
    }

    page.move_data(slot + SLOT_SIZE, slot, (size - index - 1) * SLOT_SIZE);
    page.set_u32(SIZE_OFFSET, (size - 1) as u32);
    page.set_u32(FREE_POINTER_OFFSET, (free + len) as u32);
}

/// Replaces the value at `index`. Returns false when the new value does
/// not fit; the bucket is unchanged then.
pub(crate) fn update_value(page: &mut PageEdit<'_>, index: usize, value: &[u8]) -> bool {
    let slot = BUCKET_HEADER_SIZE + index * SLOT_SIZE;
    let pos = page.get_u32(slot) as usize;
    let key_len = page.get_u32(pos + 8) as usize;
    let value_pos = pos + 12 + key_len;
    let old_len = page.get_u32(value_pos) as usize;

    if old_len == value.len() {
        page.set_bytes(value_pos + 4, value);
        return true;
    }

    let free_space = free_space(&page.view());
    let old_entry_len = ENTRY_OVERHEAD + key_len + old_len;
    let entry = RawEntry {
        hash: page.get_u64(pos),
        key: page.get_bytes(pos + 12, key_len),
        value: value.to_vec(),
    };
    if entry.encoded_len() > free_space + old_entry_len {
        return false;
    }
    remove_at(page, index);
    insert_at(page, index, &entry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::PageChangeSet;

    fn entry(hash: u64, key: &str, value: &str) -> RawEntry {
        RawEntry {
            hash,
            key: key.as_bytes().to_vec(),
            value: value.as_bytes().to_vec(),
        }
    }

    fn find(page: &PageView<'_>, hash: u64, key: &str) -> Slot {
        search(page, |h, k| Ok(h.cmp(&hash).then_with(|| k.cmp(key.as_bytes())))).unwrap()
    }

    #[test]
    fn test_insert_keeps_slot_order() {
        let data = vec![0u8; 256];
        let mut changes = PageChangeSet::new(256);
        let mut page = PageEdit::new(&data, &mut changes);
        init(&mut page, 3);

        for (hash, key) in [(30, "c"), (10, "a"), (20, "b")] {
            let index = match find(&page.view(), hash, key) {
                Slot::Missing(i) => i,
                Slot::Found(_) => panic!("duplicate"),
            };
            assert!(insert_at(&mut page, index, &entry(hash, key, "v")));
        }

        let view = page.view();
        assert_eq!(depth(&view), 3);
        let hashes: Vec<u64> = entries(&view).iter().map(|e| e.hash).collect();
        assert_eq!(hashes, vec![10, 20, 30]);
        assert!(matches!(find(&view, 20, "b"), Slot::Found(1)));
    }

    #[test]
    fn test_remove_compacts_entries() {
        let data = vec![0u8; 256];
        let mut changes = PageChangeSet::new(256);
        let mut page = PageEdit::new(&data, &mut changes);
        init(&mut page, 1);
        let initial_free = free_space(&page.view());

        assert!(append(&mut page, &entry(1, "one", "first")));
        assert!(append(&mut page, &entry(2, "two", "second")));
        assert!(append(&mut page, &entry(3, "three", "third")));

        remove_at(&mut page, 1);
        let view = page.view();
        assert_eq!(size(&view), 2);
        assert_eq!(entry_at(&view, 0), entry(1, "one", "first"));
        assert_eq!(entry_at(&view, 1), entry(3, "three", "third"));

        remove_at(&mut page, 0);
        remove_at(&mut page, 0);
        assert_eq!(free_space(&page.view()), initial_free);
    }

    #[test]
    fn test_full_bucket_rejects_insert() {
        let data = vec![0u8; 64];
        let mut changes = PageChangeSet::new(64);
        let mut page = PageEdit::new(&data, &mut changes);
        init(&mut page, 1);

        assert!(append(&mut page, &entry(1, "key", "value-0001")));
        assert!(!append(&mut page, &entry(2, "key", "value-0002-too-long")));
        assert_eq!(size(&page.view()), 1);
    }

    #[test]
    fn test_update_value_resizes_entry() {
        let data = vec![0u8; 256];
        let mut changes = PageChangeSet::new(256);
        let mut page = PageEdit::new(&data, &mut changes);
        init(&mut page, 1);
        assert!(append(&mut page, &entry(1, "a", "short")));
        assert!(append(&mut page, &entry(2, "b", "other")));

        assert!(update_value(&mut page, 0, b"SHORT"));
        assert!(update_value(&mut page, 0, b"a much longer value"));
        let view = page.view();
        assert_eq!(value_at(&view, 0), b"a much longer value".to_vec());
        assert_eq!(entry_at(&view, 1), entry(2, "b", "other"));

        assert!(!update_value(&mut page, 1, &[7u8; 300]));
        assert_eq!(value_at(&page.view(), 1), b"other".to_vec());
    }
}
