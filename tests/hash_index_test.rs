//! Integration tests for the extendible hash index

use std::collections::{BTreeMap, HashSet};
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Arc;
use std::thread;

use pagestore::atomic::{AtomicOperationsManager, MemoryRedoLog};
use pagestore::cache::MemoryCache;
use pagestore::common::{CacheConfig, StoreError};
use pagestore::index::{
    FnHash, HashFunction, HashIndex, HashIndexSettings, IndexEntry, KeyType, Sha256HashFunction, StringSerializer,
    U64Serializer, Validation,
};
use pagestore::PageStore;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;

fn memory_manager() -> Arc<AtomicOperationsManager> {
    let cache = Arc::new(MemoryCache::new(4096).unwrap());
    Arc::new(AtomicOperationsManager::new(cache, Arc::new(MemoryRedoLog::new())))
}

fn sha_settings() -> HashIndexSettings<u64, String> {
    HashIndexSettings::new(U64Serializer, StringSerializer, Sha256HashFunction::new(U64Serializer))
}

/// Walks the whole index forward in default-size batches.
fn scan_all_forward(index: &HashIndex<u64, String>) -> Vec<IndexEntry<u64, String>> {
    let mut out = Vec::new();
    let Some(first) = index.first_entry().unwrap() else {
        return out;
    };
    let mut batch = index.ceiling_entries(&first.key, None).unwrap();
    while let Some(last) = batch.last().cloned() {
        out.append(&mut batch);
        batch = index.higher_entries(&last.key, None).unwrap();
    }
    out
}

fn scan_all_backward(index: &HashIndex<u64, String>) -> Vec<IndexEntry<u64, String>> {
    let mut out = Vec::new();
    let Some(last) = index.last_entry().unwrap() else {
        return out;
    };
    let mut batch = index.floor_entries(&last.key, None).unwrap();
    while let Some(closest) = batch.last().cloned() {
        out.append(&mut batch);
        batch = index.lower_entries(&closest.key, None).unwrap();
    }
    out
}

#[test]
fn test_hash_codes_compare_unsigned() {
    let hash = FnHash(|key: &u64| match key {
        1 => 0xFFFF_FFFF_0000_0001,
        2 => 0x0000_0000_0000_0002,
        other => *other,
    });
    assert_eq!(hash.hash_code(&1), 0xFFFF_FFFF_0000_0001);
    let settings = HashIndexSettings::new(U64Serializer, StringSerializer, hash);
    let index = HashIndex::create("order.hix", memory_manager(), settings).unwrap();
    index.put(&1, &"high".to_string()).unwrap();
    index.put(&2, &"low".to_string()).unwrap();

    assert_eq!(index.first_entry().unwrap().unwrap().key, 2);
    assert_eq!(index.last_entry().unwrap().unwrap().key, 1);

    let after_low = index.higher_entries(&2, None).unwrap();
    assert_eq!(after_low.len(), 1);
    assert_eq!(after_low[0].key, 1);
    assert_eq!(after_low[0].hash, 0xFFFF_FFFF_0000_0001);
    assert!(index.higher_entries(&1, None).unwrap().is_empty());
}

#[test]
fn test_bucket_splits_preserve_content() {
    // identity hash: every small key lands in the first root bucket
    let settings = HashIndexSettings::new(U64Serializer, StringSerializer, FnHash(|key: &u64| *key));
    let index = HashIndex::create("split.hix", memory_manager(), settings).unwrap();

    let mut expected = BTreeMap::new();
    for key in 0..300u64 {
        let value = format!("{:0>40}", key);
        index.put(&key, &value).unwrap();
        expected.insert(key, value);
    }
    for (key, value) in &expected {
        assert_eq!(index.get(key).unwrap().as_ref(), Some(value), "key {}", key);
    }

    let mut rng = StdRng::seed_from_u64(11);
    for _ in 0..700 {
        let key = rng.gen_range(0..5_000u64);
        let value = format!("{:x}", rng.gen::<u64>());
        index.put(&key, &value).unwrap();
        expected.insert(key, value);
    }

    assert_eq!(index.size().unwrap(), expected.len() as u64);
    for (key, value) in &expected {
        assert_eq!(index.get(key).unwrap().as_ref(), Some(value), "key {}", key);
    }
    let scanned: Vec<u64> = scan_all_forward(&index).into_iter().map(|e| e.key).collect();
    let keys: Vec<u64> = expected.keys().copied().collect();
    assert_eq!(scanned, keys);
}

#[test]
fn test_batched_iteration_visits_every_entry_in_order() {
    let index = HashIndex::create("scan.hix", memory_manager(), sha_settings()).unwrap();
    for key in 0..2_000u64 {
        index.put(&key, &format!("v{}", key)).unwrap();
    }

    let forward = scan_all_forward(&index);
    assert_eq!(forward.len(), 2_000);
    assert!(forward
        .windows(2)
        .all(|w| (w[0].hash, w[0].key) < (w[1].hash, w[1].key)));
    let unique: HashSet<u64> = forward.iter().map(|e| e.key).collect();
    assert_eq!(unique.len(), 2_000);
    for entry in &forward {
        assert_eq!(entry.value, format!("v{}", entry.key));
    }

    let mut backward = scan_all_backward(&index);
    backward.reverse();
    assert_eq!(backward, forward);
}

#[test]
fn test_limited_scans_cross_buckets() {
    let index = HashIndex::create("limit.hix", memory_manager(), sha_settings()).unwrap();
    for key in 0..500u64 {
        index.put(&key, &key.to_string()).unwrap();
    }
    let all = scan_all_forward(&index);

    let pivot = &all[100];
    let higher = index.higher_entries(&pivot.key, Some(50)).unwrap();
    assert_eq!(higher, all[101..151].to_vec());

    let ceiling = index.ceiling_entries(&pivot.key, Some(3)).unwrap();
    assert_eq!(ceiling, all[100..103].to_vec());

    let lower = index.lower_entries(&pivot.key, Some(40)).unwrap();
    let expected_lower: Vec<_> = all[60..100].iter().rev().cloned().collect();
    assert_eq!(lower, expected_lower);

    let floor = index.floor_entries(&pivot.key, Some(2)).unwrap();
    assert_eq!(floor, vec![all[100].clone(), all[99].clone()]);

    let tail = index.higher_entries(&all[495].key, Some(100)).unwrap();
    assert_eq!(tail.len(), 4);
    assert!(index.higher_entries(&pivot.key, Some(0)).unwrap().is_empty());
}

#[test]
fn test_remove_and_scan_skip_empty_buckets() {
    let index = HashIndex::create("remove.hix", memory_manager(), sha_settings()).unwrap();
    for key in 0..400u64 {
        index.put(&key, &key.to_string()).unwrap();
    }
    for key in (0..400u64).filter(|k| k % 4 != 0) {
        assert_eq!(index.remove(&key).unwrap(), Some(key.to_string()));
    }
    assert_eq!(index.size().unwrap(), 100);

    let remaining: HashSet<u64> = scan_all_forward(&index).into_iter().map(|e| e.key).collect();
    assert_eq!(remaining, (0..400u64).filter(|k| k % 4 == 0).collect());
    assert_eq!(index.get(&3).unwrap(), None);
}

#[test]
fn test_validated_put_sees_current_value() {
    let index = HashIndex::create("cas.hix", memory_manager(), sha_settings()).unwrap();

    let insert_if_absent = |_: &u64, current: Option<&String>, proposed: String| {
        Ok(match current {
            None => Validation::Accept(proposed),
            Some(_) => Validation::Ignore,
        })
    };
    assert!(index.validated_put(&7, "first".to_string(), insert_if_absent).unwrap());
    assert!(!index.validated_put(&7, "second".to_string(), insert_if_absent).unwrap());
    assert_eq!(index.get(&7).unwrap().as_deref(), Some("first"));

    let changed = index
        .validated_put(&7, "third".to_string(), |_, current, proposed| {
            assert_eq!(current.map(String::as_str), Some("first"));
            Ok(Validation::Accept(proposed))
        })
        .unwrap();
    assert!(changed);
    assert_eq!(index.get(&7).unwrap().as_deref(), Some("third"));

    let rejected = index.validated_put(&8, "x".to_string(), |_, _, _| {
        Err(StoreError::InvalidConfig("rejected".to_string()))
    });
    assert!(rejected.is_err());
    assert_eq!(index.get(&8).unwrap(), None);
    assert_eq!(index.size().unwrap(), 1);
}

#[test]
fn test_null_key_slot() {
    let settings = sha_settings().with_null_key_support(true);
    let index = HashIndex::create("null.hix", memory_manager(), settings).unwrap();
    assert!(index.is_null_key_supported());
    assert_eq!(index.get_null().unwrap(), None);

    index.put(&1, &"one".to_string()).unwrap();
    index.put_null(&"nothing".to_string()).unwrap();
    index.put_null(&"still nothing".to_string()).unwrap();
    assert_eq!(index.size().unwrap(), 2);
    assert_eq!(index.get_null().unwrap().as_deref(), Some("still nothing"));

    assert_eq!(index.remove_null().unwrap().as_deref(), Some("still nothing"));
    assert_eq!(index.remove_null().unwrap(), None);
    assert_eq!(index.size().unwrap(), 1);

    let plain = HashIndex::create("plain.hix", memory_manager(), sha_settings()).unwrap();
    assert!(matches!(
        plain.put_null(&"x".to_string()),
        Err(StoreError::NullKeyNotSupported(_))
    ));
}

#[test]
fn test_oversized_entries_are_rejected() {
    let index = HashIndex::create("big.hix", memory_manager(), sha_settings()).unwrap();
    let result = index.put(&1, &"x".repeat(3_000));
    assert!(matches!(result, Err(StoreError::EntryTooLarge { .. })));
    assert_eq!(index.size().unwrap(), 0);
    assert_eq!(index.get(&1).unwrap(), None);

    index.put(&1, &"x".repeat(900)).unwrap();
    assert_eq!(index.get(&1).unwrap().map(|v| v.len()), Some(900));
}

#[test]
fn test_concurrent_readers_and_writer() {
    let index = Arc::new(HashIndex::create("threads.hix", memory_manager(), sha_settings()).unwrap());
    for key in 0..200u64 {
        index.put(&key, &key.to_string()).unwrap();
    }

    let writer = {
        let index = Arc::clone(&index);
        thread::spawn(move || {
            for key in 200..600u64 {
                index.put(&key, &key.to_string()).unwrap();
            }
        })
    };
    let readers: Vec<_> = (0..3)
        .map(|_| {
            let index = Arc::clone(&index);
            thread::spawn(move || {
                for key in 0..200u64 {
                    assert_eq!(index.get(&key).unwrap(), Some(key.to_string()));
                }
            })
        })
        .collect();

    writer.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }
    assert_eq!(index.size().unwrap(), 600);
}

#[test]
fn test_reopen_from_disk() {
    let dir = TempDir::new().unwrap();
    let config = CacheConfig::default().with_capacity(512);
    let settings = || sha_settings().with_key_types(vec![KeyType::Long]).with_null_key_support(true);

    {
        let store = PageStore::init_disk(dir.path(), config.clone()).unwrap();
        let index = HashIndex::create("disk.hix", store.atomic_operations(), settings()).unwrap();
        for key in 0..1_500u64 {
            index.put(&key, &format!("value-{}", key)).unwrap();
        }
        index.put_null(&"null".to_string()).unwrap();
        index.close().unwrap();
        store.shutdown().unwrap();
    }

    let store = PageStore::init_disk(dir.path(), config.clone()).unwrap();
    let index = HashIndex::open("disk.hix", store.atomic_operations(), settings()).unwrap();
    assert_eq!(index.size().unwrap(), 1_501);
    for key in (0..1_500u64).step_by(7) {
        assert_eq!(index.get(&key).unwrap(), Some(format!("value-{}", key)));
    }
    assert_eq!(index.get_null().unwrap().as_deref(), Some("null"));
    assert_eq!(scan_all_forward(&index).len(), 1_500);

    index.put(&5_000, &"late".to_string()).unwrap();
    index.flush().unwrap();
    assert_eq!(index.get(&5_000).unwrap().as_deref(), Some("late"));
    index.close().unwrap();

    let mismatch = HashIndex::open(
        "disk.hix",
        store.atomic_operations(),
        sha_settings().with_key_types(vec![KeyType::String]).with_null_key_support(true),
    );
    assert!(matches!(mismatch, Err(StoreError::InvalidConfig(_))));
    store.shutdown().unwrap();
}

#[test]
fn test_open_rejects_unrecorded_pages() {
    let dir = TempDir::new().unwrap();
    let config = CacheConfig::default().with_capacity(512);
    {
        let store = PageStore::init_disk(dir.path(), config.clone()).unwrap();
        let index = HashIndex::create("grown.hix", store.atomic_operations(), sha_settings()).unwrap();
        index.put(&1, &"one".to_string()).unwrap();
        index.close().unwrap();
        store.shutdown().unwrap();
    }

    let mut raw = OpenOptions::new()
        .append(true)
        .open(dir.path().join("grown.hix"))
        .unwrap();
    raw.write_all(&vec![0u8; config.page_size]).unwrap();
    drop(raw);

    let store = PageStore::init_disk(dir.path(), config).unwrap();
    let result = HashIndex::open("grown.hix", store.atomic_operations(), sha_settings());
    assert!(matches!(result, Err(StoreError::StructuralCorruption(_))));
}

#[test]
fn test_delete_removes_the_file() {
    let manager = memory_manager();
    let index = HashIndex::create("gone.hix", Arc::clone(&manager), sha_settings()).unwrap();
    index.put(&1, &"one".to_string()).unwrap();
    assert!(manager.cache().exists("gone.hix"));
    index.delete().unwrap();
    assert!(!manager.cache().exists("gone.hix"));
}
