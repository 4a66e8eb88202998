use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::time::Duration;

use crate::common::{ResourcePoolConfig, Result};

use super::{ResourceFactory, ResourcePool};

/// Resources held by one logical caller (a transaction, a request), with
/// the number of times each key was taken.
pub struct PoolContext<K, V> {
    held: HashMap<K, (V, usize)>,
}

impl<K: Eq + Hash, V> PoolContext<K, V> {
    pub fn new() -> Self {
        Self {
            held: HashMap::new(),
        }
    }

    pub fn refcount(&self, key: &K) -> usize {
        self.held.get(key).map_or(0, |(_, count)| *count)
    }

    /// A key is in use while its reference count is positive.
    pub fn is_in_use(&self, key: &K) -> bool {
        self.refcount(key) > 0
    }

    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }
}

impl<K: Eq + Hash, V> Default for PoolContext<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

/// A pool where repeated acquisitions of a key within one `PoolContext`
/// share a single resource and a single admission permit.
pub struct ReentrantResourcePool<K, V, F> {
    pool: ResourcePool<K, V, F>,
}

impl<K, V, F> ReentrantResourcePool<K, V, F>
where
    K: Debug + Clone + Eq + Hash,
    V: Clone + PartialEq + Send,
    F: ResourceFactory<K, V>,
{
    pub fn new(config: ResourcePoolConfig, factory: F) -> Result<Self> {
        Ok(Self {
            pool: ResourcePool::new(config, factory)?,
        })
    }

    pub fn pool(&self) -> &ResourcePool<K, V, F> {
        &self.pool
    }

    pub fn get_resource(
        &self,
        ctx: &mut PoolContext<K, V>,
        key: &K,
        max_wait: Duration,
        args: &F::Args,
    ) -> Result<V> {
        if let Some((resource, count)) = ctx.held.get_mut(key) {
            *count += 1;
            return Ok(resource.clone());
        }
        let resource = self.pool.get_resource(key, max_wait, args)?;
        ctx.held.insert(key.clone(), (resource.clone(), 1));
        Ok(resource)
    }

    /// Drops one reference; the last one returns the resource to the pool.
    /// Returns false if `ctx` does not hold the resource.
    pub fn return_resource(&self, ctx: &mut PoolContext<K, V>, resource: &V) -> bool {
        let Some(key) = Self::key_of(ctx, resource) else {
            return false;
        };
        let Some((_, count)) = ctx.held.get_mut(&key) else {
            return false;
        };
        *count -= 1;
        if *count > 0 {
            return true;
        }
        match ctx.held.remove(&key) {
            Some((resource, _)) => self.pool.return_resource(resource),
            None => false,
        }
    }

    /// Evicts the resource from the pool regardless of its reference count.
    pub fn remove(&self, ctx: &mut PoolContext<K, V>, resource: &V) -> bool {
        if let Some(key) = Self::key_of(ctx, resource) {
            ctx.held.remove(&key);
        }
        self.pool.remove(resource)
    }

    /// Returns every resource `ctx` still holds.
    pub fn release_all(&self, ctx: &mut PoolContext<K, V>) {
        for (_, (resource, _)) in ctx.held.drain() {
            self.pool.return_resource(resource);
        }
    }

    pub fn close(&self) {
        self.pool.close();
    }

    fn key_of(ctx: &PoolContext<K, V>, resource: &V) -> Option<K> {
        ctx.held
            .iter()
            .find(|(_, (held, _))| held == resource)
            .map(|(key, _)| key.clone())
    }
}
