use std::collections::VecDeque;
use std::fmt::Debug;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::common::{ResourcePoolConfig, Result, Semaphore, StoreError};

/// Creates and vets the resources a pool lends out.
pub trait ResourceFactory<K, V>: Send + Sync {
    type Args;

    fn create_new_resource(&self, key: &K, args: &Self::Args) -> Result<V>;

    /// Whether an idle resource may be handed out for `key` and `args`.
    /// Rejected resources are dropped.
    fn reuse_resource(&self, key: &K, args: &Self::Args, candidate: &V) -> bool;
}

struct PoolState<V> {
    idle: VecDeque<V>,
    out: Vec<V>,
    closed: bool,
}

/// ResourcePool lends at most `max_resources` resources at a time.
///
/// Every checked-out resource holds one admission permit; callers that
/// find no permit wait up to their timeout. Idle resources are reused when
/// the factory accepts them, otherwise new ones are created.
///
/// A closed pool stays closed: callers wait until they time out, and
/// resources handed back are dropped without freeing their permit.
pub struct ResourcePool<K, V, F> {
    max_resources: usize,
    permits: Semaphore,
    factory: F,
    state: Mutex<PoolState<V>>,
    created: AtomicUsize,
    _key: PhantomData<fn(&K)>,
}

impl<K, V, F> ResourcePool<K, V, F>
where
    K: Debug,
    V: Clone + PartialEq + Send,
    F: ResourceFactory<K, V>,
{
    pub fn new(config: ResourcePoolConfig, factory: F) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            max_resources: config.max_resources,
            permits: Semaphore::new(config.max_resources),
            factory,
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                out: Vec::new(),
                closed: false,
            }),
            created: AtomicUsize::new(0),
            _key: PhantomData,
        })
    }

    /// Builds a pool with `config.min_resources` idle resources created up
    /// front for `key`.
    pub fn with_min(config: ResourcePoolConfig, factory: F, key: &K, args: &F::Args) -> Result<Self> {
        let pool = Self::new(config, factory)?;
        let mut idle = VecDeque::with_capacity(config.min_resources);
        for _ in 0..config.min_resources {
            idle.push_back(pool.factory.create_new_resource(key, args)?);
        }
        pool.created.fetch_add(idle.len(), Ordering::Relaxed);
        pool.state.lock().idle = idle;
        Ok(pool)
    }

    /// Takes a resource for `key`, waiting at most `max_wait` for a permit.
    pub fn get_resource(&self, key: &K, max_wait: Duration, args: &F::Args) -> Result<V> {
        let started = Instant::now();
        if !self.permits.acquire(Some(max_wait))? {
            return Err(StoreError::ResourceTimeout {
                key: format!("{:?}", key),
                max: self.max_resources,
                waited_ms: started.elapsed().as_millis() as u64,
            });
        }

        loop {
            let Some(candidate) = self.state.lock().idle.pop_front() else {
                break;
            };
            if self.factory.reuse_resource(key, args, &candidate) {
                self.state.lock().out.push(candidate.clone());
                return Ok(candidate);
            }
            warn!(key = ?key, "idle resource rejected for reuse, dropping it");
        }

        match self.factory.create_new_resource(key, args) {
            Ok(resource) => {
                self.created.fetch_add(1, Ordering::Relaxed);
                self.state.lock().out.push(resource.clone());
                debug!(key = ?key, out = self.resources_out_count(), "pool resource created");
                Ok(resource)
            }
            Err(e) => {
                let state = self.state.lock();
                if !state.closed {
                    self.permits.release(1);
                }
                Err(e)
            }
        }
    }

    /// Puts a checked-out resource back into the idle set, or drops it if
    /// the pool is closed. Returns false if the resource was not checked
    /// out from this pool.
    pub fn return_resource(&self, resource: V) -> bool {
        let mut state = self.state.lock();
        let Some(position) = state.out.iter().position(|r| *r == resource) else {
            return false;
        };
        state.out.swap_remove(position);
        if state.closed {
            debug!("resource returned to a closed pool, dropping it");
            return true;
        }
        state.idle.push_back(resource);
        // Released under the state lock so `close` cannot miss the permit.
        self.permits.release(1);
        true
    }

    /// Drops a resource whether it is idle or checked out. A checked-out
    /// resource gives its permit back unless the pool is closed.
    pub fn remove(&self, resource: &V) -> bool {
        let mut state = self.state.lock();
        if let Some(position) = state.out.iter().position(|r| r == resource) {
            state.out.swap_remove(position);
            if !state.closed {
                self.permits.release(1);
            }
            return true;
        }
        if let Some(position) = state.idle.iter().position(|r| r == resource) {
            state.idle.remove(position);
            return true;
        }
        false
    }

    /// Takes every free permit so later `get_resource` calls wait, and
    /// drops the idle resources. Permits of resources still checked out
    /// are never given back.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        let idle = std::mem::take(&mut state.idle);
        let drained = self.permits.drain_permits();
        drop(state);
        debug!(drained, idle = idle.len(), "resource pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Wakes every waiting `get_resource` with `StoreError::Interrupted`.
    pub fn interrupt_waiters(&self) {
        self.permits.interrupt_waiters();
    }

    pub fn available_resources(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn resources_out_count(&self) -> usize {
        self.state.lock().out.len()
    }

    pub fn created_instances(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }

    pub fn max_resources(&self) -> usize {
        self.max_resources
    }

    pub fn idle_resources(&self) -> Vec<V> {
        self.state.lock().idle.iter().cloned().collect()
    }
}
