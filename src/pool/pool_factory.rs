use std::fmt::Debug;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::common::{Result, StoreError};

use super::{ResourceFactory, ResourcePool};

type PoolBuilder<P, K, V, F> = Box<dyn Fn(&P) -> Result<ResourcePool<K, V, F>> + Send + Sync>;

/// Pools keyed by partition (a database name, a storage path), created on
/// first use. At most `max_partitions` pools are alive; the least recently
/// used one is closed when another is needed.
pub struct ResourcePoolFactory<P: Hash + Eq, K, V, F> {
    pools: Mutex<LruCache<P, Arc<ResourcePool<K, V, F>>>>,
    builder: PoolBuilder<P, K, V, F>,
}

impl<P, K, V, F> ResourcePoolFactory<P, K, V, F>
where
    P: Hash + Eq + Clone + Debug,
    K: Debug,
    V: Clone + PartialEq + Send,
    F: ResourceFactory<K, V>,
{
    pub fn new<B>(max_partitions: usize, builder: B) -> Result<Self>
    where
        B: Fn(&P) -> Result<ResourcePool<K, V, F>> + Send + Sync + 'static,
    {
        let capacity = NonZeroUsize::new(max_partitions).ok_or_else(|| {
            StoreError::InvalidConfig("max_partitions must be greater than zero".to_string())
        })?;
        Ok(Self {
            pools: Mutex::new(LruCache::new(capacity)),
            builder: Box::new(builder),
        })
    }

    pub fn get(&self, partition: &P) -> Result<Arc<ResourcePool<K, V, F>>> {
        let mut pools = self.pools.lock();
        if let Some(pool) = pools.get(partition) {
            return Ok(Arc::clone(pool));
        }

        let pool = Arc::new((self.builder)(partition)?);
        debug!(partition = ?partition, "resource pool created");
        if let Some((evicted, old)) = pools.push(partition.clone(), Arc::clone(&pool)) {
            if evicted != *partition {
                warn!(partition = ?evicted, "resource pool evicted, closing it");
                old.close();
            }
        }
        Ok(pool)
    }

    /// Partitions with a live pool, most recently used first.
    pub fn pools(&self) -> Vec<P> {
        self.pools.lock().iter().map(|(p, _)| p.clone()).collect()
    }

    pub fn close(&self) {
        let mut pools = self.pools.lock();
        for (_, pool) in pools.iter() {
            pool.close();
        }
        pools.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::common::ResourcePoolConfig;

    struct Handles;

    impl ResourceFactory<u32, u32> for Handles {
        type Args = ();

        fn create_new_resource(&self, key: &u32, _args: &()) -> Result<u32> {
            Ok(*key)
        }

        fn reuse_resource(&self, _key: &u32, _args: &(), _candidate: &u32) -> bool {
            true
        }
    }

    #[test]
    fn test_pools_are_cached_per_partition() {
        let factory: ResourcePoolFactory<String, u32, u32, Handles> =
            ResourcePoolFactory::new(2, |_| ResourcePool::new(ResourcePoolConfig::new(1), Handles)).unwrap();

        let a = factory.get(&"a".to_string()).unwrap();
        let again = factory.get(&"a".to_string()).unwrap();
        assert!(Arc::ptr_eq(&a, &again));
        assert_eq!(factory.pools(), vec!["a".to_string()]);
    }

    #[test]
    fn test_evicted_pool_is_closed() {
        let factory: ResourcePoolFactory<String, u32, u32, Handles> =
            ResourcePoolFactory::new(1, |_| ResourcePool::new(ResourcePoolConfig::new(1), Handles)).unwrap();

        let first = factory.get(&"first".to_string()).unwrap();
        assert_eq!(first.available_resources(), 1);
        factory.get(&"second".to_string()).unwrap();

        assert_eq!(factory.pools(), vec!["second".to_string()]);
        assert_eq!(first.available_resources(), 0);
        assert!(first.get_resource(&7, Duration::from_millis(10), &()).is_err());
    }
}
