//! Read-through tenant cache.
//!
//! Fronts the authoritative directory with a short positive TTL and a shorter
//! negative TTL so unknown-tenant stampedes never reach the database on every
//! request.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::directory::TenantDirectory;
use crate::error::RegistryError;
use crate::model::{Tenant, TenantId};

const SHARD_COUNT: usize = 16;

struct Slot {
    fetched_at_ms: u64,
    tenant: Option<Tenant>,
}

pub struct CachedTenantRegistry {
    directory: Arc<dyn TenantDirectory>,
    ttl_ms: u64,
    negative_ttl_ms: u64,
    shards: Vec<Mutex<HashMap<TenantId, Slot>>>,
}

impl CachedTenantRegistry {
    pub fn new(directory: Arc<dyn TenantDirectory>) -> Self {
        Self::with_ttls(directory, 60_000, 5_000)
    }

    pub fn with_ttls(directory: Arc<dyn TenantDirectory>, ttl_ms: u64, negative_ttl_ms: u64) -> Self {
        let shards = (0..SHARD_COUNT)
            .map(|_| Mutex::new(HashMap::new()))
            .collect();
        Self {
            directory,
            ttl_ms,
            negative_ttl_ms,
            shards,
        }
    }

    fn shard(&self, id: &TenantId) -> &Mutex<HashMap<TenantId, Slot>> {
        let mut h = std::hash::DefaultHasher::new();
        id.hash(&mut h);
        &self.shards[(h.finish() as usize) % SHARD_COUNT]
    }

    fn lookup_fresh(&self, id: TenantId, now_ms: u64) -> Option<Option<Tenant>> {
        let shard = self.shard(&id).lock();
        let slot = shard.get(&id)?;
        let ttl = if slot.tenant.is_some() {
            self.ttl_ms
        } else {
            self.negative_ttl_ms
        };
        if now_ms.saturating_sub(slot.fetched_at_ms) < ttl {
            Some(slot.tenant.clone())
        } else {
            None
        }
    }

    /// Resolve a tenant, hitting the directory only on a cold or stale slot.
    ///
    /// Directory errors propagate; callers decide whether their path fails
    /// open or closed.
    pub async fn get_tenant(
        &self,
        id: TenantId,
        now_ms: u64,
    ) -> Result<Option<Tenant>, RegistryError> {
        if let Some(hit) = self.lookup_fresh(id, now_ms) {
            return Ok(hit);
        }

        let fetched = self.directory.fetch_tenant(id).await?;
        if fetched.is_none() {
            debug!(tenant_id = %id, "negative-caching unknown tenant");
        }

        let mut shard = self.shard(&id).lock();
        shard.insert(
            id,
            Slot {
                fetched_at_ms: now_ms,
                tenant: fetched.clone(),
            },
        );

        Ok(fetched)
    }

    /// Residency lookup used by the dispatcher and the edge.
    pub async fn get_allowed_regions(
        &self,
        id: TenantId,
        now_ms: u64,
    ) -> Result<Option<std::collections::BTreeSet<String>>, RegistryError> {
        Ok(self
            .get_tenant(id, now_ms)
            .await?
            .map(|tenant| tenant.allowed_regions))
    }

    /// Drop a cached entry; used when a registry mutation event arrives.
    pub fn invalidate(&self, id: TenantId) {
        self.shard(&id).lock().remove(&id);
    }

}
