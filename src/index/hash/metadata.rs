//! Page 0 of an index file: identity, entry count, directory bookkeeping
//! and the entry stored under the null key.

use crate::common::{FileId, PageKey, Result, StoreError};
use crate::storage::page::{PageEdit, PageView};

use super::serializer::KeyType;

pub(crate) const METADATA_PAGE: u64 = 0;

pub(crate) const INDEX_MAGIC: u64 = 0x5053_4849_4458_0001;
pub(crate) const INDEX_VERSION: u32 = 1;
pub(crate) const MAX_KEY_TYPES: usize = 16;

const MAGIC_OFFSET: usize = 0;
const VERSION_OFFSET: usize = 8;
const SIZE_OFFSET: usize = 12;
const ROOT_OFFSET: usize = 20;
const FREE_NODE_OFFSET: usize = 28;
const PAGES_COUNT_OFFSET: usize = 36;
const NULL_SUPPORTED_OFFSET: usize = 44;
const KEY_TYPE_COUNT_OFFSET: usize = 45;
const KEY_TYPES_OFFSET: usize = 46;
const NULL_PRESENT_OFFSET: usize = 64;
const NULL_VALUE_LEN_OFFSET: usize = 65;
const NULL_VALUE_OFFSET: usize = 69;

/// No node on the free list. Page 0 is never a node.
pub(crate) const NO_FREE_NODE: u64 = 0;

pub(crate) fn metadata_key(file_id: FileId) -> PageKey {
    PageKey::new(file_id, METADATA_PAGE)
}

/// Largest value the metadata page can hold for the null key.
pub(crate) fn max_null_value_size(page_size: usize) -> usize {
    page_size - NULL_VALUE_OFFSET
}

pub(crate) fn init(
    page: &mut PageEdit<'_>,
    root: u64,
    pages_count: u64,
    key_types: &[KeyType],
    null_key_supported: bool,
) {
    page.set_u64(MAGIC_OFFSET, INDEX_MAGIC);
    page.set_u32(VERSION_OFFSET, INDEX_VERSION);
    page.set_u64(SIZE_OFFSET, 0);
    page.set_u64(ROOT_OFFSET, root);
    page.set_u64(FREE_NODE_OFFSET, NO_FREE_NODE);
    page.set_u64(PAGES_COUNT_OFFSET, pages_count);
    page.set_u8(NULL_SUPPORTED_OFFSET, null_key_supported as u8);
    page.set_u8(KEY_TYPE_COUNT_OFFSET, key_types.len() as u8);
    for (i, key_type) in key_types.iter().enumerate() {
        page.set_u8(KEY_TYPES_OFFSET + i, key_type.id());
    }
    page.set_u8(NULL_PRESENT_OFFSET, 0);
}

/// Checks the identity fields of a metadata page.
pub(crate) fn validate(page: &PageView<'_>) -> Result<()> {
    let magic = page.get_u64(MAGIC_OFFSET);
    if magic != INDEX_MAGIC {
        return Err(StoreError::StructuralCorruption(format!(
            "bad index magic {:#x}",
            magic
        )));
    }
    let version = page.get_u32(VERSION_OFFSET);
    if version != INDEX_VERSION {
        return Err(StoreError::StructuralCorruption(format!(
            "unsupported index version {}",
            version
        )));
    }
    Ok(())
}

pub(crate) fn size(page: &PageView<'_>) -> u64 {
    page.get_u64(SIZE_OFFSET)
}

pub(crate) fn set_size(page: &mut PageEdit<'_>, size: u64) {
    page.set_u64(SIZE_OFFSET, size);
}

pub(crate) fn root(page: &PageView<'_>) -> u64 {
    page.get_u64(ROOT_OFFSET)
}

pub(crate) fn set_root(page: &mut PageEdit<'_>, root: u64) {
    page.set_u64(ROOT_OFFSET, root);
}

pub(crate) fn free_node_head(page: &PageView<'_>) -> u64 {
    page.get_u64(FREE_NODE_OFFSET)
}

pub(crate) fn set_free_node_head(page: &mut PageEdit<'_>, node: u64) {
    page.set_u64(FREE_NODE_OFFSET, node);
}

pub(crate) fn pages_count(page: &PageView<'_>) -> u64 {
    page.get_u64(PAGES_COUNT_OFFSET)
}

pub(crate) fn set_pages_count(page: &mut PageEdit<'_>, pages: u64) {
    page.set_u64(PAGES_COUNT_OFFSET, pages);
}

pub(crate) fn null_key_supported(page: &PageView<'_>) -> bool {
    page.get_u8(NULL_SUPPORTED_OFFSET) != 0
}

pub(crate) fn key_types(page: &PageView<'_>) -> Result<Vec<KeyType>> {
    let count = page.get_u8(KEY_TYPE_COUNT_OFFSET) as usize;
    if count > MAX_KEY_TYPES {
        return Err(StoreError::StructuralCorruption(format!(
            "index records {} key types",
            count
        )));
    }
    (0..count)
        .map(|i| {
            let id = page.get_u8(KEY_TYPES_OFFSET + i);
            KeyType::from_id(id).ok_or_else(|| {
                StoreError::StructuralCorruption(format!("unknown key type id {}", id))
            })
        })
        .collect()
}

pub(crate) fn null_value(page: &PageView<'_>) -> Option<Vec<u8>> {
    if page.get_u8(NULL_PRESENT_OFFSET) == 0 {
        return None;
    }
    let len = page.get_u32(NULL_VALUE_LEN_OFFSET) as usize;
    Some(page.get_bytes(NULL_VALUE_OFFSET, len))
}

pub(crate) fn set_null_value(page: &mut PageEdit<'_>, value: Option<&[u8]>) {
    match value {
        Some(value) => {
            page.set_u8(NULL_PRESENT_OFFSET, 1);
            page.set_u32(NULL_VALUE_LEN_OFFSET, value.len() as u32);
            page.set_bytes(NULL_VALUE_OFFSET, value);
        }
        None => {
            page.set_u8(NULL_PRESENT_OFFSET, 0);
            page.set_u32(NULL_VALUE_LEN_OFFSET, 0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::PageChangeSet;

    #[test]
    fn test_metadata_fields() {
        let data = vec![0u8; 4096];
        let mut changes = PageChangeSet::new(4096);
        let mut page = PageEdit::new(&data, &mut changes);
        init(&mut page, 1, 258, &[KeyType::Long, KeyType::String], true);
        set_null_value(&mut page, Some(b"nil"));

        let view = page.view();
        validate(&view).unwrap();
        assert_eq!(root(&view), 1);
        assert_eq!(pages_count(&view), 258);
        assert_eq!(free_node_head(&view), NO_FREE_NODE);
        assert!(null_key_supported(&view));
        assert_eq!(key_types(&view).unwrap(), vec![KeyType::Long, KeyType::String]);
        assert_eq!(null_value(&view), Some(b"nil".to_vec()));
    }

    #[test]
    fn test_zero_page_is_not_an_index() {
        let data = vec![0u8; 4096];
        assert!(matches!(
            validate(&PageView::new(&data)),
            Err(StoreError::StructuralCorruption(_))
        ));
    }
}
