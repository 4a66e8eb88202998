//! Directory nodes of the extendible hash index.
//!
//! Every node lives in its own page:
//!
//! ```text
//! | max left child depth u8 | max right child depth u8 | local depth u8 |
//! | deleted u8 | next free node u64 | pad | pointer[256] u64 |
//! ```
//!
//! A node of local depth `d` is split into `256 / 2^d` hash maps of `2^d`
//! slots each. A slot points either to a bucket page or to one hash map of
//! a child node.

use crate::atomic::{AtomicOperation, PageReader};
use crate::common::{FileId, PageKey, Result, StoreError, MAX_NODE_DEPTH, NODE_SLOTS};
use crate::storage::page::{PageEdit, PageView};

use super::metadata::{self, NO_FREE_NODE};

const MAX_LEFT_DEPTH_OFFSET: usize = 0;
const MAX_RIGHT_DEPTH_OFFSET: usize = 1;
const LOCAL_DEPTH_OFFSET: usize = 2;
const DELETED_OFFSET: usize = 3;
const NEXT_FREE_OFFSET: usize = 4;
const POINTERS_OFFSET: usize = 16;
const POINTER_SIZE: usize = 8;

/// Page bytes a directory node needs.
pub(crate) const NODE_PAGE_SIZE: usize = POINTERS_OFFSET + NODE_SLOTS * POINTER_SIZE;

const NODE_FLAG: u64 = 1 << 63;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DirectoryPointer {
    Bucket(u64),
    /// Hash map of a child node starting at slot `offset`
    Node { index: u64, offset: usize },
}

impl DirectoryPointer {
    fn encode(self) -> u64 {
        match self {
            DirectoryPointer::Bucket(page) => page,
            DirectoryPointer::Node { index, offset } => NODE_FLAG | (index << 8) | (offset as u64 & 0xFF),
        }
    }

    fn decode(raw: u64) -> Self {
        if raw & NODE_FLAG != 0 {
            DirectoryPointer::Node {
                index: (raw & !NODE_FLAG) >> 8,
                offset: (raw & 0xFF) as usize,
            }
        } else {
            DirectoryPointer::Bucket(raw)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DirectoryNode {
    pub max_left_child_depth: u8,
    pub max_right_child_depth: u8,
    pub local_depth: u8,
    pub pointers: Vec<DirectoryPointer>,
}

impl DirectoryNode {
    pub(crate) fn new(local_depth: u8, pointers: Vec<DirectoryPointer>) -> Self {
        debug_assert_eq!(pointers.len(), NODE_SLOTS);
        debug_assert!(local_depth >= 1 && local_depth <= MAX_NODE_DEPTH);
        Self {
            max_left_child_depth: 0,
            max_right_child_depth: 0,
            local_depth,
            pointers,
        }
    }
}

/// Route from the root to the slot holding a bucket pointer.
#[derive(Debug, Clone)]
pub(crate) struct BucketPath {
    pub parent: Option<Box<BucketPath>>,
    pub hash_map_offset: usize,
    pub item_index: usize,
    pub node_index: u64,
    pub node_local_depth: u8,
    /// Hash bits consumed once this node is passed
    pub node_global_depth: u8,
}

impl BucketPath {
    pub(crate) fn slot(&self) -> usize {
        self.hash_map_offset + self.item_index
    }
}

/// Slot of a hash map at the given depths.
pub(crate) fn hash_map_index(hash: u64, global_depth: u8, local_depth: u8) -> usize {
    let shifted = hash >> (64 - global_depth as u32);
    (shifted & ((1u64 << local_depth) - 1)) as usize
}

/// Pointers of a leaf node after its hash maps are doubled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct NodeSplitResult {
    pub new_depth: u8,
    /// Lower half of the hash maps
    pub left: Vec<DirectoryPointer>,
    /// Upper half of the hash maps
    pub right: Vec<DirectoryPointer>,
    pub all_left_hash_maps_equal: bool,
    pub all_right_hash_maps_equal: bool,
}

/// Doubles every hash map of `node` and splits the slot on `path` between
/// the two halves of a split bucket. `None` if the node has children.
pub(crate) fn split_hash_maps(
    node: &DirectoryNode,
    path: &BucketPath,
    updated_bucket: u64,
    new_bucket: u64,
) -> Option<NodeSplitResult> {
    let map_size = 1usize << node.local_depth;
    let map_count = NODE_SLOTS / map_size;
    let half_maps = map_count / 2;
    let new_map_size = map_size * 2;

    let mut halves = [
        vec![DirectoryPointer::Bucket(0); NODE_SLOTS],
        vec![DirectoryPointer::Bucket(0); NODE_SLOTS],
    ];
    for map in 0..map_count {
        let base = (map % half_maps) * new_map_size;
        for item in 0..map_size {
            let pointer = node.pointers[map * map_size + item];
            if let DirectoryPointer::Node { .. } = pointer {
                return None;
            }
            let half = &mut halves[map / half_maps];
            half[base + 2 * item] = pointer;
            half[base + 2 * item + 1] = pointer;
        }
    }

    let target_map = path.hash_map_offset / map_size;
    let base = (target_map % half_maps) * new_map_size + 2 * path.item_index;
    let target = &mut halves[target_map / half_maps];
    target[base] = DirectoryPointer::Bucket(updated_bucket);
    target[base + 1] = DirectoryPointer::Bucket(new_bucket);

    let uniform = |pointers: &[DirectoryPointer]| {
        pointers
            .chunks(new_map_size)
            .all(|map| map.iter().all(|p| *p == map[0]))
    };
    let [left, right] = halves;
    Some(NodeSplitResult {
        new_depth: node.local_depth + 1,
        all_left_hash_maps_equal: uniform(&left),
        all_right_hash_maps_equal: uniform(&right),
        left,
        right,
    })
}

fn write_node_page(page: &mut PageEdit<'_>, node: &DirectoryNode) {
    page.set_u8(MAX_LEFT_DEPTH_OFFSET, node.max_left_child_depth);
    page.set_u8(MAX_RIGHT_DEPTH_OFFSET, node.max_right_child_depth);
    page.set_u8(LOCAL_DEPTH_OFFSET, node.local_depth);
    page.set_u8(DELETED_OFFSET, 0);
    page.set_u64(NEXT_FREE_OFFSET, NO_FREE_NODE);
    for (slot, pointer) in node.pointers.iter().enumerate() {
        page.set_u64(POINTERS_OFFSET + slot * POINTER_SIZE, pointer.encode());
    }
}

fn read_node_page(page: &PageView<'_>) -> DirectoryNode {
    DirectoryNode {
        max_left_child_depth: page.get_u8(MAX_LEFT_DEPTH_OFFSET),
        max_right_child_depth: page.get_u8(MAX_RIGHT_DEPTH_OFFSET),
        local_depth: page.get_u8(LOCAL_DEPTH_OFFSET),
        pointers: (0..NODE_SLOTS)
            .map(|slot| DirectoryPointer::decode(page.get_u64(POINTERS_OFFSET + slot * POINTER_SIZE)))
            .collect(),
    }
}

/// Node and page bookkeeping of one index file.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Directory {
    file_id: FileId,
}

impl Directory {
    pub(crate) fn new(file_id: FileId) -> Self {
        Self { file_id }
    }

    pub(crate) fn file_id(&self) -> FileId {
        self.file_id
    }

    fn page(&self, index: u64) -> PageKey {
        PageKey::new(self.file_id, index)
    }

    fn read<P, R, F>(&self, reader: &P, index: u64, f: F) -> Result<R>
    where
        P: PageReader,
        F: FnOnce(PageView<'_>) -> R,
    {
        let key = self.page(index);
        reader
            .with_page(key, f)?
            .ok_or_else(|| StoreError::StructuralCorruption(format!("index page {} is missing", key)))
    }

    pub(crate) fn local_depth<P: PageReader>(&self, reader: &P, node: u64) -> Result<u8> {
        self.read(reader, node, |page| page.get_u8(LOCAL_DEPTH_OFFSET))
    }

    pub(crate) fn pointer<P: PageReader>(&self, reader: &P, node: u64, slot: usize) -> Result<DirectoryPointer> {
        self.read(reader, node, |page| {
            DirectoryPointer::decode(page.get_u64(POINTERS_OFFSET + slot * POINTER_SIZE))
        })
    }

    pub(crate) fn node<P: PageReader>(&self, reader: &P, node: u64) -> Result<DirectoryNode> {
        self.read(reader, node, |page| read_node_page(&page))
    }

    pub(crate) fn is_deleted<P: PageReader>(&self, reader: &P, node: u64) -> Result<bool> {
        self.read(reader, node, |page| page.get_u8(DELETED_OFFSET) != 0)
    }

    pub(crate) fn set_pointer(
        &self,
        op: &mut AtomicOperation,
        node: u64,
        slot: usize,
        pointer: DirectoryPointer,
    ) -> Result<()> {
        op.write_page(self.page(node), |page| {
            page.set_u64(POINTERS_OFFSET + slot * POINTER_SIZE, pointer.encode())
        })
    }

    pub(crate) fn set_max_left_child_depth(&self, op: &mut AtomicOperation, node: u64, depth: u8) -> Result<()> {
        op.write_page(self.page(node), |page| page.set_u8(MAX_LEFT_DEPTH_OFFSET, depth))
    }

    pub(crate) fn set_max_right_child_depth(&self, op: &mut AtomicOperation, node: u64, depth: u8) -> Result<()> {
        op.write_page(self.page(node), |page| page.set_u8(MAX_RIGHT_DEPTH_OFFSET, depth))
    }

    pub(crate) fn write_node(&self, op: &mut AtomicOperation, index: u64, node: &DirectoryNode) -> Result<()> {
        op.write_page(self.page(index), |page| write_node_page(page, node))
    }

    /// Appends a page and records the new page count in the metadata page.
    pub(crate) fn allocate_page(&self, op: &mut AtomicOperation) -> Result<u64> {
        let index = op.allocate_page(self.file_id)?;
        op.write_page(metadata::metadata_key(self.file_id), |page| {
            metadata::set_pages_count(page, index + 1)
        })?;
        Ok(index)
    }

    /// Stores a node, reusing the most recently deleted one if any.
    pub(crate) fn add_new_node(&self, op: &mut AtomicOperation, node: &DirectoryNode) -> Result<u64> {
        let meta = metadata::metadata_key(self.file_id);
        let head = self.read(&*op, metadata::METADATA_PAGE, |page| metadata::free_node_head(&page))?;
        let index = if head == NO_FREE_NODE {
            self.allocate_page(op)?
        } else {
            if !self.is_deleted(&*op, head)? {
                return Err(StoreError::StructuralCorruption(format!(
                    "node {} is on the free list of file {} but was not deleted",
                    head, self.file_id
                )));
            }
            let next = self.read(&*op, head, |page| page.get_u64(NEXT_FREE_OFFSET))?;
            op.write_page(meta, |page| metadata::set_free_node_head(page, next))?;
            head
        };
        self.write_node(op, index, node)?;
        Ok(index)
    }

    /// Puts a node on the free list. Its page keeps its place in the file.
    pub(crate) fn delete_node(&self, op: &mut AtomicOperation, node: u64) -> Result<()> {
        let meta = metadata::metadata_key(self.file_id);
        let head = self.read(&*op, metadata::METADATA_PAGE, |page| metadata::free_node_head(&page))?;
        op.write_page(self.page(node), |page| {
            page.set_u8(DELETED_OFFSET, 1);
            page.set_u64(NEXT_FREE_OFFSET, head);
        })?;
        op.write_page(meta, |page| metadata::set_free_node_head(page, node))
    }
}
