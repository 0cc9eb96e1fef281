//! Sharded registry of tenant queues.
//!
//! Tenants hash to a shard; each shard holds its own mutex so admission for
//! one tenant never contends with dispatch for an unrelated one. No global
//! lock exists.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use parking_lot::Mutex;

use registry::TenantId;

use crate::queue::TenantQueue;

pub const SHARD_COUNT: usize = 16;

pub struct QueueMap {
    shards: Vec<Mutex<HashMap<TenantId, TenantQueue>>>,
}

impl Default for QueueMap {
    fn default() -> Self {
        Self::new()
    }
}

impl QueueMap {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn shard_of(&self, tenant_id: &TenantId) -> usize {
        let mut h = std::hash::DefaultHasher::new();
        tenant_id.hash(&mut h);
        (h.finish() as usize) % self.shards.len()
    }

    /// Run `f` with the tenant's shard locked.
    pub fn with_shard<R>(
        &self,
        tenant_id: &TenantId,
        f: impl FnOnce(&mut HashMap<TenantId, TenantQueue>) -> R,
    ) -> R {
        let mut shard = self.shards[self.shard_of(tenant_id)].lock();
        f(&mut shard)
    }

    /// Run `f` with shard `idx` locked.
    pub fn with_shard_index<R>(
        &self,
        idx: usize,
        f: impl FnOnce(&mut HashMap<TenantId, TenantQueue>) -> R,
    ) -> R {
        let mut shard = self.shards[idx].lock();
        f(&mut shard)
    }

    /// Evict queues that are empty and idle beyond `idle_ttl_ms`.
    pub fn evict_idle(&self, now_ms: u64, idle_ttl_ms: u64) -> usize {
        let mut evicted = 0;
        for shard in &self.shards {
            let mut shard = shard.lock();
            let before = shard.len();
            shard.retain(|_, q| !(q.is_empty() && q.idle_since(now_ms) >= idle_ttl_ms));
            evicted += before - shard.len();
        }
        evicted
    }
}
