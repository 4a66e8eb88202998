use std::time::Duration;

use pagestore::common::{CacheConfig, ResourcePoolConfig};
use pagestore::index::{HashIndex, HashIndexSettings, Sha256HashFunction, StringSerializer, U64Serializer};
use pagestore::pool::{ResourceFactory, ResourcePool};
use pagestore::PageStore;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Hands out numbered connection ids.
struct Connections;

impl ResourceFactory<String, u32> for Connections {
    type Args = u32;

    fn create_new_resource(&self, _key: &String, args: &u32) -> pagestore::Result<u32> {
        Ok(*args)
    }

    fn reuse_resource(&self, _key: &String, _args: &u32, _candidate: &u32) -> bool {
        true
    }
}

fn main() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("pagestore=info")))
        .with(fmt::layer())
        .init();

    println!("pagestore - page-oriented storage substrate");
    println!("===========================================\n");

    let dir = std::env::temp_dir().join(format!("pagestore-demo-{}", std::process::id()));
    let store = PageStore::init_disk(&dir, CacheConfig::default()).expect("Failed to initialize store");
    println!("Store opened at {}", dir.display());

    let settings = HashIndexSettings::new(U64Serializer, StringSerializer, Sha256HashFunction::new(U64Serializer));
    let index = HashIndex::create("demo.hix", store.atomic_operations(), settings).expect("Failed to create index");

    for key in 0..1000u64 {
        index
            .put(&key, &format!("value-{}", key))
            .expect("Failed to insert entry");
    }
    println!("Inserted {} entries", index.size().expect("Failed to read size"));
    println!("  - key 42 -> {:?}", index.get(&42).expect("Failed to read entry"));

    if let Some(first) = index.first_entry().expect("Failed to scan") {
        let batch = index
            .higher_entries(&first.key, Some(5))
            .expect("Failed to scan");
        println!("\nFirst entries in hash order:");
        println!("  - {:#018x} {} -> {}", first.hash, first.key, first.value);
        for entry in batch {
            println!("  - {:#018x} {} -> {}", entry.hash, entry.key, entry.value);
        }
    }

    index.close().expect("Failed to close index");
    store.shutdown().expect("Failed to shut down store");

    let pool = ResourcePool::new(ResourcePoolConfig::new(2), Connections).expect("Failed to create pool");
    let key = "db".to_string();
    let a = pool
        .get_resource(&key, Duration::from_millis(50), &1)
        .expect("Failed to get resource");
    let _b = pool
        .get_resource(&key, Duration::from_millis(50), &2)
        .expect("Failed to get resource");
    match pool.get_resource(&key, Duration::from_millis(50), &3) {
        Ok(_) => println!("\nUnexpected third resource"),
        Err(e) => println!("\nPool exhausted as expected: {}", e),
    }
    pool.return_resource(a);
    println!(
        "Returned one resource, {} of {} available",
        pool.available_resources(),
        pool.max_resources()
    );

    std::fs::remove_dir_all(&dir).ok();
    println!("\nDemo completed successfully!");
}
