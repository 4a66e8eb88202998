//! Integration tests for the disk and memory page caches

use std::sync::Arc;
use std::thread;

use pagestore::cache::{DiskCache, MemoryCache, PageCache};
use pagestore::common::{CacheConfig, PageKey, StoreError};
use pagestore::storage::disk::IoService;
use tempfile::TempDir;

const PAGE: usize = 1024;

fn disk_cache(dir: &TempDir, capacity: usize) -> DiskCache {
    let io = Arc::new(IoService::new(1).unwrap());
    let config = CacheConfig::default()
        .with_page_size(PAGE)
        .with_capacity(capacity);
    DiskCache::new(dir.path(), config, io).unwrap()
}

fn fill_page(cache: &dyn PageCache, key: PageKey, byte: u8) {
    let mut page = cache.load_for_write(key).unwrap().unwrap();
    page.data_mut().fill(byte);
}

fn first_byte(cache: &dyn PageCache, key: PageKey) -> u8 {
    let page = cache.load_for_read(key).unwrap().unwrap();
    page.data()[0]
}

#[test]
fn test_eviction_writes_dirty_pages_back() {
    let dir = TempDir::new().unwrap();
    let cache = disk_cache(&dir, 3);
    let file_id = cache.add_file("data.pcl").unwrap();

    for i in 0..10u8 {
        let mut page = cache.allocate_new_page(file_id).unwrap();
        page.data_mut().fill(i + 1);
    }
    assert_eq!(cache.filled_up_to(file_id).unwrap(), 10);
    assert!(cache.used_memory() <= 3 * PAGE);

    for i in 0..10u8 {
        let key = PageKey::new(file_id, i as u64);
        assert_eq!(first_byte(&cache, key), i + 1, "page {}", i);
    }
}

#[test]
fn test_pages_persist_across_cache_instances() {
    let dir = TempDir::new().unwrap();
    {
        let cache = disk_cache(&dir, 4);
        let file_id = cache.add_file("persist.pcl").unwrap();
        for i in 0..6u8 {
            let mut page = cache.allocate_new_page(file_id).unwrap();
            page.data_mut()[..4].copy_from_slice(&[i; 4]);
        }
        cache.close().unwrap();
    }

    let cache = disk_cache(&dir, 4);
    assert!(cache.exists("persist.pcl"));
    let file_id = cache.load_file("persist.pcl").unwrap();
    assert_eq!(cache.load_file("persist.pcl").unwrap(), file_id);
    assert_eq!(cache.filled_up_to(file_id).unwrap(), 6);
    for i in 0..6u8 {
        let page = cache.load_for_read(PageKey::new(file_id, i as u64)).unwrap().unwrap();
        assert_eq!(&page.data()[..4], &[i; 4]);
    }
}

#[test]
fn test_flush_then_truncate_and_delete() {
    let dir = TempDir::new().unwrap();
    let cache = disk_cache(&dir, 8);
    let file_id = cache.add_file("t.pcl").unwrap();
    for _ in 0..3 {
        drop(cache.allocate_new_page(file_id).unwrap());
    }
    fill_page(&cache, PageKey::new(file_id, 1), 9);
    cache.flush_file(file_id).unwrap();

    cache.truncate_file(file_id).unwrap();
    assert_eq!(cache.filled_up_to(file_id).unwrap(), 0);
    assert!(cache.load_for_read(PageKey::new(file_id, 0)).unwrap().is_none());

    cache.delete_file(file_id).unwrap();
    assert!(!cache.exists("t.pcl"));
    assert!(matches!(
        cache.filled_up_to(file_id),
        Err(StoreError::UnknownFile(_))
    ));
}

#[test]
fn test_rename_keeps_file_id() {
    let dir = TempDir::new().unwrap();
    let cache = disk_cache(&dir, 4);
    let file_id = cache.add_file("old.pcl").unwrap();
    drop(cache.allocate_new_page(file_id).unwrap());

    cache.rename_file(file_id, "new.pcl").unwrap();
    assert_eq!(cache.file_id("new.pcl"), Some(file_id));
    assert_eq!(cache.file_name(file_id).unwrap(), "new.pcl");
    assert!(cache.file_id("old.pcl").is_none());
    assert!(matches!(
        cache.add_file("new.pcl"),
        Err(StoreError::FileAlreadyExists(_))
    ));
}

#[test]
fn test_concurrent_readers_share_a_page() {
    let dir = TempDir::new().unwrap();
    let cache = Arc::new(disk_cache(&dir, 8));
    let file_id = cache.add_file("shared.pcl").unwrap();
    {
        let mut page = cache.allocate_new_page(file_id).unwrap();
        page.data_mut().fill(77);
    }

    let key = PageKey::new(file_id, 0);
    let first = cache.load_for_read(key).unwrap().unwrap();
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let cache = Arc::clone(&cache);
            thread::spawn(move || first_byte(&*cache, key))
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.join().unwrap(), 77);
    }
    assert_eq!(cache.pin_count(key), Some(1));
    drop(first);
    assert_eq!(cache.pin_count(key), Some(0));
}

#[test]
fn test_memory_cache_behaves_like_a_cache() {
    let cache = MemoryCache::new(PAGE).unwrap();
    let file_id = cache.add_file("mem.pcl").unwrap();
    assert!(cache.load_for_read(PageKey::new(file_id, 0)).unwrap().is_none());

    for i in 0..4u8 {
        let mut page = cache.allocate_new_page(file_id).unwrap();
        page.data_mut().fill(i);
    }
    cache.flush().unwrap();
    assert_eq!(cache.filled_up_to(file_id).unwrap(), 4);
    assert_eq!(first_byte(&cache, PageKey::new(file_id, 3)), 3);
    assert_eq!(cache.used_memory(), 4 * PAGE);
    assert_eq!(cache.load_file("mem.pcl").unwrap(), file_id);

    cache.delete_file(file_id).unwrap();
    assert!(!cache.exists("mem.pcl"));
}
