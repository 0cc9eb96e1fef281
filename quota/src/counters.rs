//! Per-tenant usage counters.
//!
//! The only primitive the engine needs is a conditional atomic increment;
//! any store that can do "add iff the sum stays under the limit" works.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use parking_lot::Mutex;
use sqlx::{AnyPool, Row};
use uuid::Uuid;

use corelib::models::Resource;

use crate::error::QuotaError;
use crate::period::Period;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CounterKey {
    pub tenant_id: Uuid,
    pub resource: Resource,
    pub period: Period,
    pub period_start_s: u64,
}

#[async_trait::async_trait]
pub trait CounterStore: Send + Sync {
    /// Conditional atomic increment: `consumed += amount` iff
    /// `consumed + amount <= limit`. `None` limit means unlimited.
    ///
    /// Returns the new consumed value on success, `None` when the increment
    /// would exceed the limit.
    async fn try_increment(
        &self,
        key: &CounterKey,
        amount: u64,
        limit: Option<u64>,
    ) -> Result<Option<u64>, QuotaError>;

    /// Return previously reserved usage, saturating at zero.
    async fn decrement(&self, key: &CounterKey, amount: u64) -> Result<(), QuotaError>;

    async fn get(&self, key: &CounterKey) -> Result<u64, QuotaError>;
}

// ---------------------------------------------------------------------------
// Memory
// ---------------------------------------------------------------------------

const SHARD_COUNT: usize = 16;

/// Sharded in-memory counter store. The shard mutex makes the
/// check-and-increment atomic, which is all S4-style concurrent admission
/// needs.
pub struct MemoryCounterStore {
    shards: Vec<Mutex<HashMap<CounterKey, u64>>>,
}

impl Default for MemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    fn shard(&self, key: &CounterKey) -> &Mutex<HashMap<CounterKey, u64>> {
        let mut h = std::hash::DefaultHasher::new();
        key.tenant_id.hash(&mut h);
        &self.shards[(h.finish() as usize) % SHARD_COUNT]
    }
}

#[async_trait::async_trait]
impl CounterStore for MemoryCounterStore {
    async fn try_increment(
        &self,
        key: &CounterKey,
        amount: u64,
        limit: Option<u64>,
    ) -> Result<Option<u64>, QuotaError> {
        let mut shard = self.shard(key).lock();
        let consumed = shard.entry(*key).or_insert(0);

        if let Some(limit) = limit {
            if consumed.saturating_add(amount) > limit {
                return Ok(None);
            }
        }
        *consumed += amount;
        Ok(Some(*consumed))
    }

    async fn decrement(&self, key: &CounterKey, amount: u64) -> Result<(), QuotaError> {
        let mut shard = self.shard(key).lock();
        if let Some(consumed) = shard.get_mut(key) {
            *consumed = consumed.saturating_sub(amount);
        }
        Ok(())
    }

    async fn get(&self, key: &CounterKey) -> Result<u64, QuotaError> {
        Ok(self.shard(key).lock().get(key).copied().unwrap_or(0))
    }
}

// ---------------------------------------------------------------------------
// Sqlite
// ---------------------------------------------------------------------------

/// sqlx-backed counter store. The conditional UPDATE carries the limit check,
/// so concurrent reserves race safely inside the database.
pub struct SqliteCounterStore {
    pool: AnyPool,
}

impl SqliteCounterStore {
    pub async fn new(pool: AnyPool) -> Result<Self, QuotaError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS quota_counters (
                tenant_id TEXT NOT NULL,
                resource TEXT NOT NULL,
                period TEXT NOT NULL,
                period_start INTEGER NOT NULL,
                consumed INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (tenant_id, resource, period, period_start)
            );
        "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    async fn ensure_row(&self, key: &CounterKey) -> Result<(), QuotaError> {
        sqlx::query(
            r#"
            INSERT INTO quota_counters (tenant_id, resource, period, period_start, consumed)
            VALUES ($1, $2, $3, $4, 0)
            ON CONFLICT (tenant_id, resource, period, period_start) DO NOTHING
            "#,
        )
        .bind(key.tenant_id.to_string())
        .bind(key.resource.as_str())
        .bind(key.period.as_str())
        .bind(key.period_start_s as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl CounterStore for SqliteCounterStore {
    async fn try_increment(
        &self,
        key: &CounterKey,
        amount: u64,
        limit: Option<u64>,
    ) -> Result<Option<u64>, QuotaError> {
        self.ensure_row(key).await?;

        let query = match limit {
            Some(_) => {
                r#"
                UPDATE quota_counters SET consumed = consumed + $1
                WHERE tenant_id = $2 AND resource = $3 AND period = $4 AND period_start = $5
                  AND consumed + $1 <= $6
                "#
            }
            None => {
                r#"
                UPDATE quota_counters SET consumed = consumed + $1
                WHERE tenant_id = $2 AND resource = $3 AND period = $4 AND period_start = $5
                "#
            }
        };

        let mut q = sqlx::query(query)
            .bind(amount as i64)
            .bind(key.tenant_id.to_string())
            .bind(key.resource.as_str())
            .bind(key.period.as_str())
            .bind(key.period_start_s as i64);
        if let Some(limit) = limit {
            q = q.bind(limit as i64);
        }

        let res = q.execute(&self.pool).await?;
        if res.rows_affected() == 0 {
            return Ok(None);
        }
        Ok(Some(self.get(key).await?))
    }

    async fn decrement(&self, key: &CounterKey, amount: u64) -> Result<(), QuotaError> {
        sqlx::query(
            r#"
            UPDATE quota_counters SET consumed = MAX(consumed - $1, 0)
            WHERE tenant_id = $2 AND resource = $3 AND period = $4 AND period_start = $5
            "#,
        )
        .bind(amount as i64)
        .bind(key.tenant_id.to_string())
        .bind(key.resource.as_str())
        .bind(key.period.as_str())
        .bind(key.period_start_s as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, key: &CounterKey) -> Result<u64, QuotaError> {
        let row = sqlx::query(
            r#"
            SELECT consumed FROM quota_counters
            WHERE tenant_id = $1 AND resource = $2 AND period = $3 AND period_start = $4
            "#,
        )
        .bind(key.tenant_id.to_string())
        .bind(key.resource.as_str())
        .bind(key.period.as_str())
        .bind(key.period_start_s as i64)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.get::<i64, _>("consumed") as u64).unwrap_or(0))
    }
}
