use std::cmp::Ordering;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, trace};

use crate::atomic::{AtomicOperation, AtomicOperationsManager, CacheReader, ComponentLock, PageReader};
use crate::common::{FileId, PageKey, Result, StoreError, HASH_CODE_BITS, MAX_NODE_DEPTH, NODE_SLOTS};
use crate::storage::page::PageView;

use super::bucket::{self, BucketSplitResult, RawEntry, Slot};
use super::directory::{
    hash_map_index, split_hash_maps, BucketPath, Directory, DirectoryNode, DirectoryPointer, NodeSplitResult,
    NODE_PAGE_SIZE,
};
use super::hash_function::HashFunction;
use super::key_comparator::{DefaultComparator, KeyComparator};
use super::metadata::{self, MAX_KEY_TYPES};
use super::serializer::{BinarySerializer, KeyType};

/// Decision of a `validated_put` validator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation<V> {
    /// Store this value
    Accept(V),
    /// Leave the index unchanged
    Ignore,
}

/// One scanned entry. Scans are ordered by `hash`, then by key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry<K, V> {
    pub key: K,
    pub value: V,
    pub hash: u64,
}

/// Key and value handling of one index, fixed when the index is created
/// or opened.
pub struct HashIndexSettings<K, V> {
    key_serializer: Box<dyn BinarySerializer<K>>,
    value_serializer: Box<dyn BinarySerializer<V>>,
    hash_function: Box<dyn HashFunction<K>>,
    comparator: Box<dyn KeyComparator<K>>,
    key_types: Vec<KeyType>,
    null_key_supported: bool,
}

impl<K: Ord + 'static, V> HashIndexSettings<K, V> {
    pub fn new<KS, VS, H>(key_serializer: KS, value_serializer: VS, hash_function: H) -> Self
    where
        KS: BinarySerializer<K> + 'static,
        VS: BinarySerializer<V> + 'static,
        H: HashFunction<K> + 'static,
    {
        Self {
            key_serializer: Box::new(key_serializer),
            value_serializer: Box::new(value_serializer),
            hash_function: Box::new(hash_function),
            comparator: Box::new(DefaultComparator),
            key_types: Vec::new(),
            null_key_supported: false,
        }
    }
}

impl<K, V> HashIndexSettings<K, V> {
    pub fn with_comparator<C: KeyComparator<K> + 'static>(mut self, comparator: C) -> Self {
        self.comparator = Box::new(comparator);
        self
    }

    pub fn with_key_types(mut self, key_types: Vec<KeyType>) -> Self {
        self.key_types = key_types;
        self
    }

    pub fn with_null_key_support(mut self, supported: bool) -> Self {
        self.null_key_supported = supported;
        self
    }
}

/// Bucket contents read in one go.
struct LoadedBucket {
    depth: u8,
    entries: Vec<RawEntry>,
}

/// HashIndex is a persistent extendible hash index stored in one file of
/// the page cache.
///
/// Structural changes run inside atomic operations and hold the index's
/// exclusive lock until the operation ends; reads hold the shared lock.
/// Entries are ordered by (hash code, key), which gives ordered scans over
/// the hash space.
pub struct HashIndex<K, V> {
    name: String,
    directory: Directory,
    root: u64,
    page_size: usize,
    manager: Arc<AtomicOperationsManager>,
    lock: ComponentLock,
    settings: HashIndexSettings<K, V>,
}

impl<K, V> HashIndex<K, V> {
    /// Creates the index file with a root node pointing at 256 empty
    /// buckets.
    pub fn create(
        name: &str,
        manager: Arc<AtomicOperationsManager>,
        settings: HashIndexSettings<K, V>,
    ) -> Result<Self> {
        let cache = Arc::clone(manager.cache());
        let page_size = cache.page_size();
        Self::check_settings(page_size, &settings)?;

        let file_id = cache.add_file(name)?;
        let directory = Directory::new(file_id);
        let lock: ComponentLock = Arc::new(RwLock::new(()));

        let root = manager.calculate_in_atomic_operation(|op| {
            op.acquire_exclusive_lock(&lock);
            let meta = op.allocate_page(file_id)?;
            op.write_page(metadata::metadata_key(file_id), |page| {
                metadata::init(page, 0, meta + 1, &settings.key_types, settings.null_key_supported)
            })?;

            let first_bucket = meta + 2;
            let pointers = (0..NODE_SLOTS as u64)
                .map(|i| DirectoryPointer::Bucket(first_bucket + i))
                .collect();
            let root = directory.add_new_node(op, &DirectoryNode::new(MAX_NODE_DEPTH, pointers))?;

            for i in 0..NODE_SLOTS as u64 {
                let page = directory.allocate_page(op)?;
                if page != first_bucket + i {
                    return Err(StoreError::StructuralCorruption(format!(
                        "bucket page {} allocated as {}",
                        first_bucket + i,
                        page
                    )));
                }
                op.write_page(PageKey::new(file_id, page), |edit| bucket::init(edit, MAX_NODE_DEPTH))?;
            }
            op.write_page(metadata::metadata_key(file_id), |page| metadata::set_root(page, root))?;
            Ok(root)
        })?;

        info!(index = name, file_id = file_id.as_u32(), "hash index created");
        Ok(Self {
            name: name.to_string(),
            directory,
            root,
            page_size,
            manager,
            lock,
            settings,
        })
    }

    /// Opens an existing index file and checks it against `settings`.
    pub fn open(
        name: &str,
        manager: Arc<AtomicOperationsManager>,
        settings: HashIndexSettings<K, V>,
    ) -> Result<Self> {
        let cache = Arc::clone(manager.cache());
        let page_size = cache.page_size();
        Self::check_settings(page_size, &settings)?;

        let file_id = cache.load_file(name)?;
        let reader = CacheReader::new(&*cache);
        let (root, pages_count, key_types, null_key_supported) = reader
            .with_page(metadata::metadata_key(file_id), |page| -> Result<_> {
                metadata::validate(&page)?;
                Ok((
                    metadata::root(&page),
                    metadata::pages_count(&page),
                    metadata::key_types(&page)?,
                    metadata::null_key_supported(&page),
                ))
            })?
            .ok_or_else(|| StoreError::StructuralCorruption(format!("index '{}' has no metadata page", name)))??;

        let physical = cache.filled_up_to(file_id)?;
        if physical > pages_count {
            return Err(StoreError::StructuralCorruption(format!(
                "index '{}' holds {} pages but records {}",
                name, physical, pages_count
            )));
        }
        if key_types != settings.key_types {
            return Err(StoreError::InvalidConfig(format!(
                "index '{}' was created with key types {:?}",
                name, key_types
            )));
        }
        if null_key_supported != settings.null_key_supported {
            return Err(StoreError::InvalidConfig(format!(
                "index '{}' was created with null key support {}",
                name, null_key_supported
            )));
        }

        info!(index = name, file_id = file_id.as_u32(), pages = pages_count, "hash index opened");
        Ok(Self {
            name: name.to_string(),
            directory: Directory::new(file_id),
            root,
            page_size,
            manager,
            lock: Arc::new(RwLock::new(())),
            settings,
        })
    }

    fn check_settings(page_size: usize, settings: &HashIndexSettings<K, V>) -> Result<()> {
        if page_size < NODE_PAGE_SIZE {
            return Err(StoreError::InvalidConfig(format!(
                "hash index needs pages of at least {} bytes, cache uses {}",
                NODE_PAGE_SIZE, page_size
            )));
        }
        if settings.key_types.len() > MAX_KEY_TYPES {
            return Err(StoreError::InvalidConfig(format!(
                "at most {} key types, got {}",
                MAX_KEY_TYPES,
                settings.key_types.len()
            )));
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn file_id(&self) -> FileId {
        self.directory.file_id()
    }

    pub fn is_null_key_supported(&self) -> bool {
        self.settings.null_key_supported
    }

    /// Entries stored, the null key included.
    pub fn size(&self) -> Result<u64> {
        let _shared = self.lock.read();
        self.read_metadata(&self.reader(), |page| metadata::size(&page))
    }

    pub fn get(&self, key: &K) -> Result<Option<V>> {
        let _shared = self.lock.read();
        self.get_with(&self.reader(), key)
    }

    /// Reads through `op`, seeing its uncommitted changes.
    pub fn get_in(&self, op: &AtomicOperation, key: &K) -> Result<Option<V>> {
        self.get_with(op, key)
    }

    pub fn put(&self, key: &K, value: &V) -> Result<()> {
        self.manager
            .execute_in_atomic_operation(|op| self.put_in(op, key, value))
    }

    pub fn put_in(&self, op: &mut AtomicOperation, key: &K, value: &V) -> Result<()> {
        op.acquire_exclusive_lock(&self.lock);
        let value = self.settings.value_serializer.to_bytes(value);
        self.put_bytes(op, key, value).map(|_| ())
    }

    /// Puts only if `validator` accepts. The validator sees the key, the
    /// stored value if any, and the proposed value. Returns whether the
    /// index was changed.
    pub fn validated_put<F>(&self, key: &K, value: V, validator: F) -> Result<bool>
    where
        F: FnOnce(&K, Option<&V>, V) -> Result<Validation<V>>,
    {
        self.manager
            .calculate_in_atomic_operation(|op| self.validated_put_in(op, key, value, validator))
    }

    pub fn validated_put_in<F>(&self, op: &mut AtomicOperation, key: &K, value: V, validator: F) -> Result<bool>
    where
        F: FnOnce(&K, Option<&V>, V) -> Result<Validation<V>>,
    {
        op.acquire_exclusive_lock(&self.lock);
        let current = self.get_with(&*op, key)?;
        match validator(key, current.as_ref(), value)? {
            Validation::Accept(accepted) => {
                let value = self.settings.value_serializer.to_bytes(&accepted);
                self.put_bytes(op, key, value)?;
                Ok(true)
            }
            Validation::Ignore => Ok(false),
        }
    }

    pub fn remove(&self, key: &K) -> Result<Option<V>> {
        self.manager
            .calculate_in_atomic_operation(|op| self.remove_in(op, key))
    }

    /// Removes the entry. Buckets are never merged.
    pub fn remove_in(&self, op: &mut AtomicOperation, key: &K) -> Result<Option<V>> {
        op.acquire_exclusive_lock(&self.lock);
        let hash = self.hash(key);
        let (_, page) = self.find_bucket(&*op, hash)?;
        let found = self.read_bucket(&*op, page, |view| self.locate(&view, hash, key))?;
        let Slot::Found(index) = found else {
            return Ok(None);
        };

        let bucket_key = self.page_key(page);
        let value = self.read_bucket(&*op, page, |view| Ok(bucket::value_at(&view, index)))?;
        op.write_page(bucket_key, |edit| bucket::remove_at(edit, index))?;
        self.change_size(op, -1)?;
        trace!(index = %self.name, hash = hash, "entry removed");
        self.settings.value_serializer.deserialize(&value).map(Some)
    }

    pub fn get_null(&self) -> Result<Option<V>> {
        self.check_null_key()?;
        let _shared = self.lock.read();
        let value = self.read_metadata(&self.reader(), |page| metadata::null_value(&page))?;
        value
            .map(|bytes| self.settings.value_serializer.deserialize(&bytes))
            .transpose()
    }

    pub fn put_null(&self, value: &V) -> Result<()> {
        self.check_null_key()?;
        let bytes = self.settings.value_serializer.to_bytes(value);
        let max = metadata::max_null_value_size(self.page_size);
        if bytes.len() > max {
            return Err(StoreError::EntryTooLarge {
                size: bytes.len(),
                max,
            });
        }
        self.manager.execute_in_atomic_operation(|op| {
            op.acquire_exclusive_lock(&self.lock);
            let existed = self.read_metadata(&*op, |page| metadata::null_value(&page).is_some())?;
            op.write_page(self.metadata_key(), |page| metadata::set_null_value(page, Some(&bytes)))?;
            if !existed {
                self.change_size(op, 1)?;
            }
            Ok(())
        })
    }

    pub fn remove_null(&self) -> Result<Option<V>> {
        self.check_null_key()?;
        let removed = self.manager.calculate_in_atomic_operation(|op| {
            op.acquire_exclusive_lock(&self.lock);
            let value = self.read_metadata(&*op, |page| metadata::null_value(&page))?;
            if value.is_some() {
                op.write_page(self.metadata_key(), |page| metadata::set_null_value(page, None))?;
                self.change_size(op, -1)?;
            }
            Ok(value)
        })?;
        removed
            .map(|bytes| self.settings.value_serializer.deserialize(&bytes))
            .transpose()
    }

    /// Entries ordered strictly after `key`. With no limit, returns the
    /// first non-empty batch; a bucket is one batch.
    pub fn higher_entries(&self, key: &K, limit: Option<usize>) -> Result<Vec<IndexEntry<K, V>>> {
        let _shared = self.lock.read();
        self.scan_forward(&self.reader(), self.hash(key), Some(key), false, limit)
    }

    /// Entries ordered at or after `key`.
    pub fn ceiling_entries(&self, key: &K, limit: Option<usize>) -> Result<Vec<IndexEntry<K, V>>> {
        let _shared = self.lock.read();
        self.scan_forward(&self.reader(), self.hash(key), Some(key), true, limit)
    }

    /// Entries ordered strictly before `key`, closest first.
    pub fn lower_entries(&self, key: &K, limit: Option<usize>) -> Result<Vec<IndexEntry<K, V>>> {
        let _shared = self.lock.read();
        self.scan_backward(&self.reader(), self.hash(key), Some(key), false, limit)
    }

    /// Entries ordered at or before `key`, closest first.
    pub fn floor_entries(&self, key: &K, limit: Option<usize>) -> Result<Vec<IndexEntry<K, V>>> {
        let _shared = self.lock.read();
        self.scan_backward(&self.reader(), self.hash(key), Some(key), true, limit)
    }

    pub fn first_entry(&self) -> Result<Option<IndexEntry<K, V>>> {
        let _shared = self.lock.read();
        let mut entries = self.scan_forward(&self.reader(), 0, None, true, Some(1))?;
        Ok(entries.pop())
    }

    pub fn last_entry(&self) -> Result<Option<IndexEntry<K, V>>> {
        let _shared = self.lock.read();
        let mut entries = self.scan_backward(&self.reader(), u64::MAX, None, true, Some(1))?;
        Ok(entries.pop())
    }

    pub fn flush(&self) -> Result<()> {
        let _shared = self.lock.read();
        self.manager.cache().flush_file(self.file_id())
    }

    pub fn close(self) -> Result<()> {
        let _exclusive = self.lock.write();
        self.manager.cache().close_file(self.file_id(), true)?;
        debug!(index = %self.name, "hash index closed");
        Ok(())
    }

    pub fn delete(self) -> Result<()> {
        let _exclusive = self.lock.write();
        self.manager.cache().delete_file(self.file_id())?;
        info!(index = %self.name, "hash index deleted");
        Ok(())
    }

    fn reader(&self) -> CacheReader<'_> {
        CacheReader::new(&**self.manager.cache())
    }

    fn hash(&self, key: &K) -> u64 {
        self.settings.hash_function.hash_code(key)
    }

    fn page_key(&self, page: u64) -> PageKey {
        PageKey::new(self.file_id(), page)
    }

    fn metadata_key(&self) -> PageKey {
        metadata::metadata_key(self.file_id())
    }

    fn check_null_key(&self) -> Result<()> {
        if self.settings.null_key_supported {
            Ok(())
        } else {
            Err(StoreError::NullKeyNotSupported(self.name.clone()))
        }
    }

    fn read_metadata<P, R, F>(&self, reader: &P, f: F) -> Result<R>
    where
        P: PageReader,
        F: FnOnce(PageView<'_>) -> R,
    {
        reader
            .with_page(self.metadata_key(), f)?
            .ok_or_else(|| StoreError::StructuralCorruption(format!("index '{}' has no metadata page", self.name)))
    }

    fn read_bucket<P, R, F>(&self, reader: &P, page: u64, f: F) -> Result<R>
    where
        P: PageReader,
        F: FnOnce(PageView<'_>) -> Result<R>,
    {
        let key = self.page_key(page);
        reader
            .with_page(key, f)?
            .ok_or_else(|| StoreError::StructuralCorruption(format!("bucket page {} is missing", key)))?
    }

    fn load_bucket<P: PageReader>(&self, reader: &P, page: u64) -> Result<LoadedBucket> {
        self.read_bucket(reader, page, |view| {
            Ok(LoadedBucket {
                depth: bucket::depth(&view),
                entries: bucket::entries(&view),
            })
        })
    }

    fn change_size(&self, op: &mut AtomicOperation, delta: i64) -> Result<()> {
        let size = self.read_metadata(&*op, |page| metadata::size(&page))?;
        let size = size.checked_add_signed(delta).ok_or_else(|| {
            StoreError::StructuralCorruption(format!("index '{}' size underflow", self.name))
        })?;
        op.write_page(self.metadata_key(), |page| metadata::set_size(page, size))
    }

    fn compare_stored(&self, stored_hash: u64, stored_key: &[u8], hash: u64, key: &K) -> Result<Ordering> {
        if stored_hash != hash {
            return Ok(stored_hash.cmp(&hash));
        }
        let stored = self.settings.key_serializer.deserialize(stored_key)?;
        Ok(self.settings.comparator.compare(&stored, key))
    }

    fn locate(&self, view: &PageView<'_>, hash: u64, key: &K) -> Result<Slot> {
        bucket::search(view, |stored_hash, stored_key| {
            self.compare_stored(stored_hash, stored_key, hash, key)
        })
    }

    fn position_in(&self, entries: &[RawEntry], hash: u64, key: &K) -> Result<Slot> {
        let mut low = 0;
        let mut high = entries.len();
        while low < high {
            let mid = low + (high - low) / 2;
            match self.compare_stored(entries[mid].hash, &entries[mid].key, hash, key)? {
                Ordering::Less => low = mid + 1,
                Ordering::Greater => high = mid,
                Ordering::Equal => return Ok(Slot::Found(mid)),
            }
        }
        Ok(Slot::Missing(low))
    }

    fn decode(&self, entry: &RawEntry) -> Result<IndexEntry<K, V>> {
        Ok(IndexEntry {
            key: self.settings.key_serializer.deserialize(&entry.key)?,
            value: self.settings.value_serializer.deserialize(&entry.value)?,
            hash: entry.hash,
        })
    }

    fn get_with<P: PageReader>(&self, reader: &P, key: &K) -> Result<Option<V>> {
        let hash = self.hash(key);
        let (_, page) = self.find_bucket(reader, hash)?;
        let value = self.read_bucket(reader, page, |view| {
            Ok(match self.locate(&view, hash, key)? {
                Slot::Found(index) => Some(bucket::value_at(&view, index)),
                Slot::Missing(_) => None,
            })
        })?;
        value
            .map(|bytes| self.settings.value_serializer.deserialize(&bytes))
            .transpose()
    }

    /// Walks the directory from the root to the slot holding the bucket
    /// for `hash`.
    fn find_bucket<P: PageReader>(&self, reader: &P, hash: u64) -> Result<(BucketPath, u64)> {
        let mut parent: Option<Box<BucketPath>> = None;
        let mut node = self.root;
        let mut offset = 0;
        let mut local_depth = self.directory.local_depth(reader, node)?;
        let mut global_depth = local_depth;

        loop {
            let item = hash_map_index(hash, global_depth, local_depth);
            let path = BucketPath {
                parent: parent.take(),
                hash_map_offset: offset,
                item_index: item,
                node_index: node,
                node_local_depth: local_depth,
                node_global_depth: global_depth,
            };
            match self.directory.pointer(reader, node, offset + item)? {
                DirectoryPointer::Bucket(page) => return Ok((path, page)),
                DirectoryPointer::Node { index, offset: child_offset } => {
                    node = index;
                    offset = child_offset;
                    local_depth = self.directory.local_depth(reader, node)?;
                    global_depth += local_depth;
                    if global_depth > HASH_CODE_BITS || local_depth == 0 {
                        return Err(StoreError::StructuralCorruption(format!(
                            "directory path for hash {:#018x} reaches depth {}",
                            hash, global_depth
                        )));
                    }
                    parent = Some(Box::new(path));
                }
            }
        }
    }

    fn put_bytes(&self, op: &mut AtomicOperation, key: &K, value: Vec<u8>) -> Result<bool> {
        let key_bytes = self.settings.key_serializer.to_bytes(key);
        let footprint = bucket::entry_footprint(key_bytes.len(), value.len());
        let max = bucket::max_entry_footprint(self.page_size);
        if footprint > max {
            return Err(StoreError::EntryTooLarge {
                size: footprint,
                max,
            });
        }

        let hash = self.hash(key);
        let entry = RawEntry {
            hash,
            key: key_bytes,
            value,
        };
        loop {
            let (path, page) = self.find_bucket(&*op, hash)?;
            let bucket_key = self.page_key(page);
            match self.read_bucket(&*op, page, |view| self.locate(&view, hash, key))? {
                Slot::Found(index) => {
                    if op.write_page(bucket_key, |edit| bucket::update_value(edit, index, &entry.value))? {
                        return Ok(false);
                    }
                }
                Slot::Missing(index) => {
                    if op.write_page(bucket_key, |edit| bucket::insert_at(edit, index, &entry))? {
                        self.change_size(op, 1)?;
                        return Ok(true);
                    }
                }
            }
            self.split_bucket(op, &path, page, hash)?;
        }
    }

    /// Splits a full bucket on its next hash bit and rewires the directory.
    fn split_bucket(&self, op: &mut AtomicOperation, path: &BucketPath, page: u64, hash: u64) -> Result<()> {
        let loaded = self.load_bucket(&*op, page)?;
        let depth = loaded.depth;
        if depth >= HASH_CODE_BITS {
            return Err(StoreError::BucketOverflow { hash });
        }
        if depth > path.node_global_depth {
            return Err(StoreError::StructuralCorruption(format!(
                "bucket {} has depth {} below directory depth {}",
                page, depth, path.node_global_depth
            )));
        }

        let split = self.rewrite_split_buckets(op, page, depth, loaded.entries)?;
        if depth < path.node_global_depth {
            self.update_after_bucket_split(op, path, depth, split.updated_bucket, split.new_bucket)
        } else if path.node_local_depth < MAX_NODE_DEPTH {
            self.split_node(op, path, split.updated_bucket, split.new_bucket)
        } else {
            self.add_level_node(op, path, split.updated_bucket, split.new_bucket)
        }
    }

    /// Moves the entries whose hash bit `depth` is set into a new bucket.
    fn rewrite_split_buckets(
        &self,
        op: &mut AtomicOperation,
        page: u64,
        depth: u8,
        entries: Vec<RawEntry>,
    ) -> Result<BucketSplitResult> {
        let shift = (HASH_CODE_BITS - 1 - depth) as u32;
        let (left, right): (Vec<RawEntry>, Vec<RawEntry>) =
            entries.into_iter().partition(|e| (e.hash >> shift) & 1 == 0);

        let new_depth = depth + 1;
        let new_page = self.directory.allocate_page(op)?;
        let rewritten = op.write_page(self.page_key(page), |edit| {
            edit.clear();
            bucket::init(edit, new_depth);
            left.iter().all(|e| bucket::append(edit, e))
        })?;
        let filled = op.write_page(self.page_key(new_page), |edit| {
            bucket::init(edit, new_depth);
            right.iter().all(|e| bucket::append(edit, e))
        })?;
        if !rewritten || !filled {
            return Err(StoreError::StructuralCorruption(format!(
                "entries of bucket {} do not fit after split",
                page
            )));
        }
        debug!(
            index = %self.name,
            bucket = page,
            new_bucket = new_page,
            depth = new_depth,
            left = left.len(),
            right = right.len(),
            "bucket split"
        );
        Ok(BucketSplitResult {
            updated_bucket: page,
            new_bucket: new_page,
        })
    }

    /// The split bucket is referenced by several slots: the upper half of
    /// them moves to the new bucket.
    fn update_after_bucket_split(
        &self,
        op: &mut AtomicOperation,
        path: &BucketPath,
        depth: u8,
        old_page: u64,
        new_page: u64,
    ) -> Result<()> {
        let mut level = path;
        while level.node_global_depth - level.node_local_depth > depth {
            level = level.parent.as_deref().ok_or_else(|| {
                StoreError::StructuralCorruption(format!("no directory level covers depth {}", depth))
            })?;
        }

        let range = 1usize << (level.node_global_depth - depth);
        let start = level.item_index & !(range - 1);
        for item in start + range / 2..start + range {
            let slot = level.hash_map_offset + item;
            match self.directory.pointer(&*op, level.node_index, slot)? {
                DirectoryPointer::Bucket(p) if p == old_page => {
                    self.directory
                        .set_pointer(op, level.node_index, slot, DirectoryPointer::Bucket(new_page))?;
                }
                DirectoryPointer::Bucket(_) => {}
                DirectoryPointer::Node { index, offset } => {
                    self.replace_bucket_pointer(op, index, offset, old_page, new_page)?;
                }
            }
        }
        Ok(())
    }

    fn replace_bucket_pointer(
        &self,
        op: &mut AtomicOperation,
        node: u64,
        offset: usize,
        old_page: u64,
        new_page: u64,
    ) -> Result<()> {
        let local_depth = self.directory.local_depth(&*op, node)?;
        for slot in offset..offset + (1usize << local_depth) {
            match self.directory.pointer(&*op, node, slot)? {
                DirectoryPointer::Bucket(p) if p == old_page => {
                    self.directory.set_pointer(op, node, slot, DirectoryPointer::Bucket(new_page))?;
                }
                DirectoryPointer::Bucket(_) => {}
                DirectoryPointer::Node { index, offset } => {
                    self.replace_bucket_pointer(op, index, offset, old_page, new_page)?;
                }
            }
        }
        Ok(())
    }

    /// Doubles the hash maps of the leaf node. The lower half of its maps
    /// stays in place, the upper half moves to a new node; a half whose
    /// maps each hold one bucket collapses into its parent.
    fn split_node(&self, op: &mut AtomicOperation, path: &BucketPath, old_page: u64, new_page: u64) -> Result<()> {
        let parent = path.parent.as_deref().ok_or_else(|| {
            StoreError::StructuralCorruption("root directory node below full depth".to_string())
        })?;
        if parent.node_local_depth != MAX_NODE_DEPTH {
            return Err(StoreError::StructuralCorruption(format!(
                "directory node {} has children at depth {}",
                parent.node_index, parent.node_local_depth
            )));
        }

        let node_index = path.node_index;
        let node = self.directory.node(&*op, node_index)?;
        let NodeSplitResult {
            new_depth,
            left,
            right,
            all_left_hash_maps_equal: left_uniform,
            all_right_hash_maps_equal: right_uniform,
        } = split_hash_maps(&node, path, old_page, new_page).ok_or_else(|| {
            StoreError::StructuralCorruption(format!(
                "directory node {} of depth {} has a child",
                node_index, node.local_depth
            ))
        })?;
        let map_count = NODE_SLOTS >> node.local_depth;
        let half_maps = map_count / 2;
        let new_map_size = 1usize << new_depth;

        let left_node = if left_uniform {
            self.directory.delete_node(op, node_index)?;
            None
        } else {
            let mut rewritten = DirectoryNode::new(new_depth, left.clone());
            rewritten.max_left_child_depth = node.max_left_child_depth;
            rewritten.max_right_child_depth = node.max_right_child_depth;
            self.directory.write_node(op, node_index, &rewritten)?;
            Some(node_index)
        };
        let right_node = if right_uniform {
            None
        } else {
            Some(self.directory.add_new_node(op, &DirectoryNode::new(new_depth, right.clone()))?)
        };

        let group = map_count;
        let start = parent.slot() & !(group - 1);
        for (i, slot) in (start..start + group).enumerate() {
            let (owner, pointers, map) = if i < half_maps {
                (left_node, &left, i)
            } else {
                (right_node, &right, i - half_maps)
            };
            let pointer = match owner {
                Some(index) => DirectoryPointer::Node {
                    index,
                    offset: map * new_map_size,
                },
                None => pointers[map * new_map_size],
            };
            self.directory.set_pointer(op, parent.node_index, slot, pointer)?;
        }

        let parent_node = self.directory.node(&*op, parent.node_index)?;
        if start < NODE_SLOTS / 2 {
            if parent_node.max_left_child_depth < new_depth {
                self.directory
                    .set_max_left_child_depth(op, parent.node_index, new_depth)?;
            }
        } else if parent_node.max_right_child_depth < new_depth {
            self.directory
                .set_max_right_child_depth(op, parent.node_index, new_depth)?;
        }

        debug!(
            index = %self.name,
            node = node_index,
            depth = new_depth,
            left_collapsed = left_uniform,
            right_collapsed = right_uniform,
            "directory node split"
        );
        Ok(())
    }

    /// The leaf node is at full depth: hang a new node below it that
    /// takes one more level of hash bits.
    fn add_level_node(&self, op: &mut AtomicOperation, path: &BucketPath, old_page: u64, new_page: u64) -> Result<()> {
        let node_index = path.node_index;
        let node = self.directory.node(&*op, node_index)?;
        let item = path.slot();
        let left_half = item < NODE_SLOTS / 2;

        let max_child_depth = if left_half {
            node.max_left_child_depth
        } else {
            node.max_right_child_depth
        };
        let remaining = HASH_CODE_BITS - path.node_global_depth;
        let child_depth = max_child_depth.max(1).min(remaining);
        let map_size = 1usize << child_depth;
        let map_count = NODE_SLOTS / map_size;
        let start = item & !(map_count - 1);

        let mut pointers = Vec::with_capacity(NODE_SLOTS);
        for slot in start..start + map_count {
            let pointer = node.pointers[slot];
            if let DirectoryPointer::Node { .. } = pointer {
                return Err(StoreError::StructuralCorruption(format!(
                    "slot {} of directory node {} already has a child",
                    slot, node_index
                )));
            }
            pointers.extend(std::iter::repeat(pointer).take(map_size));
        }
        let base = (item - start) * map_size;
        for pointer in &mut pointers[base + map_size / 2..base + map_size] {
            *pointer = DirectoryPointer::Bucket(new_page);
        }

        let child = self
            .directory
            .add_new_node(op, &DirectoryNode::new(child_depth, pointers))?;
        for (i, slot) in (start..start + map_count).enumerate() {
            self.directory.set_pointer(
                op,
                node_index,
                slot,
                DirectoryPointer::Node {
                    index: child,
                    offset: i * map_size,
                },
            )?;
        }

        if left_half {
            if node.max_left_child_depth < child_depth {
                self.directory.set_max_left_child_depth(op, node_index, child_depth)?;
            }
        } else if node.max_right_child_depth < child_depth {
            self.directory.set_max_right_child_depth(op, node_index, child_depth)?;
        }

        debug!(
            index = %self.name,
            parent = node_index,
            node = child,
            depth = child_depth,
            bucket = old_page,
            "directory level added"
        );
        Ok(())
    }

    /// Hash range covered by a bucket of `depth` holding `hash`.
    fn bucket_range(hash: u64, depth: u8) -> (u64, u64) {
        if depth == 0 {
            return (0, u64::MAX);
        }
        let span = (1u64 << (HASH_CODE_BITS - depth) as u32) - 1;
        let first = hash & !span;
        (first, first | span)
    }

    fn scan_forward<P: PageReader>(
        &self,
        reader: &P,
        hash: u64,
        key: Option<&K>,
        inclusive: bool,
        limit: Option<usize>,
    ) -> Result<Vec<IndexEntry<K, V>>> {
        let mut out = Vec::new();
        if limit == Some(0) {
            return Ok(out);
        }

        let mut bucket_hash = hash;
        let (_, page) = self.find_bucket(reader, bucket_hash)?;
        let mut loaded = self.load_bucket(reader, page)?;
        let mut start = match key {
            Some(key) => match self.position_in(&loaded.entries, hash, key)? {
                Slot::Found(i) if !inclusive => i + 1,
                Slot::Found(i) | Slot::Missing(i) => i,
            },
            None => 0,
        };

        loop {
            for entry in &loaded.entries[start..] {
                out.push(self.decode(entry)?);
                if limit.is_some_and(|n| out.len() >= n) {
                    return Ok(out);
                }
            }
            if limit.is_none() && !out.is_empty() {
                return Ok(out);
            }

            let (_, last) = Self::bucket_range(bucket_hash, loaded.depth);
            if last == u64::MAX {
                return Ok(out);
            }
            bucket_hash = last + 1;
            let (_, page) = self.find_bucket(reader, bucket_hash)?;
            loaded = self.load_bucket(reader, page)?;
            start = 0;
        }
    }

    fn scan_backward<P: PageReader>(
        &self,
        reader: &P,
        hash: u64,
        key: Option<&K>,
        inclusive: bool,
        limit: Option<usize>,
    ) -> Result<Vec<IndexEntry<K, V>>> {
        let mut out = Vec::new();
        if limit == Some(0) {
            return Ok(out);
        }

        let mut bucket_hash = hash;
        let (_, page) = self.find_bucket(reader, bucket_hash)?;
        let mut loaded = self.load_bucket(reader, page)?;
        let mut end = match key {
            Some(key) => match self.position_in(&loaded.entries, hash, key)? {
                Slot::Found(i) if inclusive => i + 1,
                Slot::Found(i) | Slot::Missing(i) => i,
            },
            None => loaded.entries.len(),
        };

        loop {
            for entry in loaded.entries[..end].iter().rev() {
                out.push(self.decode(entry)?);
                if limit.is_some_and(|n| out.len() >= n) {
                    return Ok(out);
                }
            }
            if limit.is_none() && !out.is_empty() {
                return Ok(out);
            }

            let (first, _) = Self::bucket_range(bucket_hash, loaded.depth);
            if first == 0 {
                return Ok(out);
            }
            bucket_hash = first - 1;
            let (_, page) = self.find_bucket(reader, bucket_hash)?;
            loaded = self.load_bucket(reader, page)?;
            end = loaded.entries.len();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atomic::MemoryRedoLog;
    use crate::cache::MemoryCache;
    use crate::index::hash::{FnHash, Sha256HashFunction, StringSerializer, U64Serializer};

    fn manager() -> Arc<AtomicOperationsManager> {
        let cache = Arc::new(MemoryCache::new(4096).unwrap());
        Arc::new(AtomicOperationsManager::new(cache, Arc::new(MemoryRedoLog::new())))
    }

    fn sha_settings() -> HashIndexSettings<u64, String> {
        HashIndexSettings::new(U64Serializer, StringSerializer, Sha256HashFunction::new(U64Serializer))
    }

    #[test]
    fn test_put_get_remove() {
        let index = HashIndex::create("basic.hix", manager(), sha_settings()).unwrap();
        for key in 0..100u64 {
            index.put(&key, &format!("value-{}", key)).unwrap();
        }
        assert_eq!(index.size().unwrap(), 100);
        assert_eq!(index.get(&42).unwrap(), Some("value-42".to_string()));
        assert_eq!(index.get(&1000).unwrap(), None);

        index.put(&42, &"replaced".to_string()).unwrap();
        assert_eq!(index.size().unwrap(), 100);
        assert_eq!(index.get(&42).unwrap(), Some("replaced".to_string()));

        assert_eq!(index.remove(&42).unwrap(), Some("replaced".to_string()));
        assert_eq!(index.remove(&42).unwrap(), None);
        assert_eq!(index.size().unwrap(), 99);
    }

    #[test]
    fn test_small_pages_are_rejected() {
        let cache = Arc::new(MemoryCache::new(1024).unwrap());
        let manager = Arc::new(AtomicOperationsManager::new(cache, Arc::new(MemoryRedoLog::new())));
        assert!(matches!(
            HashIndex::create("small.hix", manager, sha_settings()),
            Err(StoreError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_colliding_prefixes_grow_the_directory() {
        // every key shares the top 8 bits, so one root bucket takes them all
        let settings: HashIndexSettings<u64, String> =
            HashIndexSettings::new(U64Serializer, StringSerializer, FnHash(|key: &u64| key << 20));
        let index = HashIndex::create("deep.hix", manager(), settings).unwrap();

        let value = "x".repeat(200);
        for key in 0..400u64 {
            index.put(&key, &value).unwrap();
        }
        for key in 0..400u64 {
            assert_eq!(index.get(&key).unwrap().as_deref(), Some(value.as_str()), "key {}", key);
        }
        assert_eq!(index.size().unwrap(), 400);
    }

    #[test]
    fn test_bucket_range() {
        let hash = 0xABCD_0000_0000_1234u64;
        assert_eq!(
            HashIndex::<u64, String>::bucket_range(hash, 8),
            (0xAB00_0000_0000_0000, 0xABFF_FFFF_FFFF_FFFF)
        );
        assert_eq!(HashIndex::<u64, String>::bucket_range(hash, 64), (hash, hash));
    }
}
