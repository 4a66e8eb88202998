//! Integration tests for atomic operations and redo records

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use pagestore::atomic::{AtomicOperationsManager, ComponentLock, MemoryRedoLog, PageReader, RedoLog};
use pagestore::cache::{DiskCache, MemoryCache, PageCache};
use pagestore::common::{CacheConfig, FileId, PageKey, StoreError};
use pagestore::storage::disk::IoService;
use parking_lot::RwLock;
use tempfile::TempDir;

const PAGE: usize = 4096;

fn setup() -> (Arc<MemoryCache>, Arc<MemoryRedoLog>, AtomicOperationsManager, FileId) {
    let cache = Arc::new(MemoryCache::new(PAGE).unwrap());
    let log = Arc::new(MemoryRedoLog::new());
    let redo: Arc<dyn RedoLog> = log.clone();
    let manager = AtomicOperationsManager::new(cache.clone(), redo);
    let file_id = cache.add_file("atomic.pcl").unwrap();
    (cache, log, manager, file_id)
}

fn committed_u64(cache: &MemoryCache, key: PageKey, position: usize) -> u64 {
    let page = cache.load_for_read(key).unwrap().unwrap();
    u64::from_le_bytes(page.data()[position..position + 8].try_into().unwrap())
}

#[test]
fn test_commit_makes_all_pages_visible() {
    let (cache, log, manager, file_id) = setup();

    let range = {
        let mut op = manager.start_atomic_operation();
        for i in 0..3u64 {
            let page = op.allocate_page(file_id).unwrap();
            assert_eq!(page, i);
            op.write_page(PageKey::new(file_id, page), |edit| edit.set_u64(0, 100 + i))
                .unwrap();
        }
        assert_eq!(op.filled_up_to(file_id).unwrap(), 3);
        assert_eq!(cache.filled_up_to(file_id).unwrap(), 0);
        assert_eq!(
            op.read_page(PageKey::new(file_id, 1), |view| view.get_u64(0)).unwrap(),
            101
        );
        op.commit().unwrap()
    };

    assert_eq!(range.end - range.start, 3);
    assert_eq!(log.len(), 3);
    assert_eq!(cache.filled_up_to(file_id).unwrap(), 3);
    for i in 0..3u64 {
        assert_eq!(committed_u64(&cache, PageKey::new(file_id, i), 0), 100 + i);
    }
}

#[test]
fn test_uncommitted_changes_stay_private() {
    let (cache, _log, manager, file_id) = setup();
    manager
        .execute_in_atomic_operation(|op| {
            let page = op.allocate_page(file_id)?;
            op.write_page(PageKey::new(file_id, page), |edit| edit.set_u64(8, 1))
        })
        .unwrap();

    let key = PageKey::new(file_id, 0);
    let mut op = manager.start_atomic_operation();
    op.write_page(key, |edit| edit.set_u64(8, 2)).unwrap();
    assert_eq!(op.read_page(key, |view| view.get_u64(8)).unwrap(), 2);
    assert_eq!(committed_u64(&cache, key, 8), 1);
    op.commit().unwrap();
    assert_eq!(committed_u64(&cache, key, 8), 2);
}

#[test]
fn test_failed_operation_is_rolled_back() {
    let (cache, log, manager, file_id) = setup();

    let result: pagestore::Result<()> = manager.execute_in_atomic_operation(|op| {
        let page = op.allocate_page(file_id)?;
        op.write_page(PageKey::new(file_id, page), |edit| edit.set_u64(0, 5))?;
        Err(StoreError::InvalidConfig("abort".to_string()))
    });
    assert!(result.is_err());
    assert_eq!(cache.filled_up_to(file_id).unwrap(), 0);
    assert!(log.is_empty());

    {
        let mut op = manager.start_atomic_operation();
        op.allocate_page(file_id).unwrap();
        // dropped without commit
    }
    assert_eq!(cache.filled_up_to(file_id).unwrap(), 0);
}

#[test]
fn test_missing_page_is_reported() {
    let (_cache, _log, manager, file_id) = setup();
    let mut op = manager.start_atomic_operation();
    let key = PageKey::new(file_id, 7);
    assert!(matches!(
        op.read_page(key, |view| view.get_u8(0)),
        Err(StoreError::PageNotFound(_))
    ));
    assert!(matches!(
        op.write_page(key, |edit| edit.set_u8(0, 1)),
        Err(StoreError::PageNotFound(_))
    ));
}

#[test]
fn test_write_past_page_end_fails_the_operation() {
    let (cache, log, manager, file_id) = setup();
    let result = manager.execute_in_atomic_operation(|op| {
        let page = op.allocate_page(file_id)?;
        op.write_page(PageKey::new(file_id, page), |edit| {
            edit.set_u64(0, 1);
            edit.set_bytes(PAGE - 4, &[9; 8]);
        })
    });

    assert!(matches!(
        result,
        Err(StoreError::ChangeOutOfRange { len: 8, size: PAGE, .. })
    ));
    assert_eq!(cache.filled_up_to(file_id).unwrap(), 0);
    assert!(log.is_empty());
}

#[test]
fn test_redo_records_replay_onto_pre_image() {
    let (cache, log, manager, file_id) = setup();
    manager
        .execute_in_atomic_operation(|op| {
            let page = op.allocate_page(file_id)?;
            op.write_page(PageKey::new(file_id, page), |edit| edit.set_bytes(10, b"base"))
        })
        .unwrap();

    let key = PageKey::new(file_id, 0);
    let pre_image = cache.load_for_read(key).unwrap().unwrap().data().to_vec();
    manager
        .execute_in_atomic_operation(|op| {
            op.write_page(key, |edit| {
                edit.set_bytes(10, b"next");
                edit.set_u64(200, 77);
                edit.move_data(10, 300, 4);
            })
        })
        .unwrap();

    let records = log.records().unwrap();
    assert_eq!(records.len(), 2);
    let (_, first) = &records[0];
    assert!(first.new_page);

    let (_, second) = &records[1];
    assert!(!second.new_page);
    assert_eq!(second.page, key);
    let mut replayed = pre_image;
    second.replay(&mut replayed);
    let committed = cache.load_for_read(key).unwrap().unwrap().data().to_vec();
    assert_eq!(replayed, committed);

    log.cut_till(records[0].0);
    assert_eq!(log.len(), 1);
}

#[test]
fn test_component_lock_serializes_operations() {
    let (_cache, _log, manager, _file_id) = setup();
    let manager = Arc::new(manager);
    let lock: ComponentLock = Arc::new(RwLock::new(()));
    let second_entered = Arc::new(AtomicBool::new(false));

    let mut first = manager.start_atomic_operation();
    first.acquire_exclusive_lock(&lock);
    first.acquire_exclusive_lock(&lock);

    let handle = {
        let manager = Arc::clone(&manager);
        let lock = Arc::clone(&lock);
        let entered = Arc::clone(&second_entered);
        thread::spawn(move || {
            let mut op = manager.start_atomic_operation();
            op.acquire_exclusive_lock(&lock);
            entered.store(true, Ordering::SeqCst);
            op.commit().unwrap();
        })
    };

    thread::sleep(Duration::from_millis(50));
    assert!(!second_entered.load(Ordering::SeqCst));
    first.commit().unwrap();
    handle.join().unwrap();
    assert!(second_entered.load(Ordering::SeqCst));
}

#[test]
fn test_commit_failure_leaves_no_trace() {
    let dir = TempDir::new().unwrap();
    let io = Arc::new(IoService::new(1).unwrap());
    let config = CacheConfig::default().with_page_size(PAGE).with_capacity(2);
    let cache = Arc::new(DiskCache::new(dir.path(), config, io).unwrap());
    let log = Arc::new(MemoryRedoLog::new());
    let redo: Arc<dyn RedoLog> = log.clone();
    let manager = AtomicOperationsManager::new(cache.clone(), redo);
    let file_id = cache.add_file("small.pcl").unwrap();

    // three appended pages need three frames at once
    let result = manager.execute_in_atomic_operation(|op| {
        for i in 0..3u64 {
            let page = op.allocate_page(file_id)?;
            op.write_page(PageKey::new(file_id, page), |edit| edit.set_u64(0, i + 1))?;
        }
        Ok(())
    });
    assert!(matches!(result, Err(StoreError::CacheFull)));
    assert_eq!(cache.filled_up_to(file_id).unwrap(), 0);
    assert!(log.is_empty());
    assert_eq!(cache.free_frame_count(), 2);

    let pages = manager
        .calculate_in_atomic_operation(|op| {
            let first = op.allocate_page(file_id)?;
            let second = op.allocate_page(file_id)?;
            op.write_page(PageKey::new(file_id, second), |edit| edit.set_u64(0, 9))?;
            Ok((first, second))
        })
        .unwrap();
    assert_eq!(pages, (0, 1));
    assert_eq!(cache.filled_up_to(file_id).unwrap(), 2);
    assert_eq!(log.len(), 2);
    let page = cache.load_for_read(PageKey::new(file_id, 1)).unwrap().unwrap();
    assert_eq!(page.data()[0], 9);
}

#[test]
fn test_missing_page_at_commit_discards_appends() {
    let (cache, log, manager, appended_file) = setup();
    let other_file = cache.add_file("other.pcl").unwrap();
    manager
        .execute_in_atomic_operation(|op| {
            let page = op.allocate_page(other_file)?;
            op.write_page(PageKey::new(other_file, page), |edit| edit.set_u8(0, 1))
        })
        .unwrap();
    let logged = log.len();

    let mut op = manager.start_atomic_operation();
    let page = op.allocate_page(appended_file).unwrap();
    op.write_page(PageKey::new(appended_file, page), |edit| edit.set_u8(0, 3))
        .unwrap();
    op.write_page(PageKey::new(other_file, 0), |edit| edit.set_u8(0, 2))
        .unwrap();
    // the page disappears before the operation commits
    cache.truncate_file(other_file).unwrap();

    assert!(matches!(op.commit(), Err(StoreError::PageNotFound(_))));
    assert_eq!(cache.filled_up_to(appended_file).unwrap(), 0);
    assert_eq!(log.len(), logged);
}
