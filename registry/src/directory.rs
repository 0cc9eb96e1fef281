//! Authoritative tenant directory access.
//!
//! The request plane never writes tenants; it reads them through
//! [`crate::cache::CachedTenantRegistry`] which fronts one of these.

use std::collections::HashMap;

use parking_lot::Mutex;
use sqlx::{AnyPool, Row};
use tracing::{debug, instrument};

use crate::error::RegistryError;
use crate::model::{Tenant, TenantId};

#[async_trait::async_trait]
pub trait TenantDirectory: Send + Sync {
    async fn fetch_tenant(&self, id: TenantId) -> Result<Option<Tenant>, RegistryError>;
}

/// In-memory directory used by tests and embedded deployments.
#[derive(Default)]
pub struct MemoryTenantDirectory {
    tenants: Mutex<HashMap<TenantId, Tenant>>,
}

impl MemoryTenantDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, tenant: Tenant) {
        self.tenants.lock().insert(tenant.id, tenant);
    }

    pub fn remove(&self, id: TenantId) {
        self.tenants.lock().remove(&id);
    }
}

#[async_trait::async_trait]
impl TenantDirectory for MemoryTenantDirectory {
    async fn fetch_tenant(&self, id: TenantId) -> Result<Option<Tenant>, RegistryError> {
        Ok(self.tenants.lock().get(&id).cloned())
    }
}

/// How reads establish the tenant-isolation session variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionBinding {
    /// Execute `set_config('app.tenant_id', ...)` before any row read, so the
    /// database's row-level policies apply. A failed bind fails the read.
    SetConfig,
    /// No session variable; only valid for embedded single-node stores that
    /// have no row-level policies.
    Disabled,
}

/// sqlx-backed directory over the platform's `tenants` table.
pub struct SqlxTenantDirectory {
    pool: AnyPool,
    binding: SessionBinding,
}

impl SqlxTenantDirectory {
    pub fn new(pool: AnyPool) -> Self {
        Self {
            pool,
            binding: SessionBinding::SetConfig,
        }
    }

    /// Embedded/test constructor; skips the session variable.
    pub fn without_session_binding(pool: AnyPool) -> Self {
        Self {
            pool,
            binding: SessionBinding::Disabled,
        }
    }

    /// Create the tenants table when it does not exist yet.
    pub async fn ensure_schema(&self) -> Result<(), RegistryError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tenants (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                plan TEXT NOT NULL,
                status TEXT NOT NULL,
                weight_override INTEGER,
                data_region TEXT NOT NULL,
                allowed_regions TEXT NOT NULL,
                quota_overrides TEXT NOT NULL,
                fail_open INTEGER
            );
        "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Test/seed helper; production rows come from the control plane.
    pub async fn insert(&self, tenant: &Tenant) -> Result<(), RegistryError> {
        let regions = serde_json::to_string(&tenant.allowed_regions)
            .map_err(|e| RegistryError::InvalidRow(e.to_string()))?;
        let overrides: HashMap<String, u64> = tenant
            .quota_overrides
            .iter()
            .map(|(r, v)| (r.as_str().to_string(), *v))
            .collect();
        let overrides = serde_json::to_string(&overrides)
            .map_err(|e| RegistryError::InvalidRow(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO tenants
              (id, name, plan, status, weight_override, data_region,
               allowed_regions, quota_overrides, fail_open)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(tenant.id.to_string())
        .bind(&tenant.name)
        .bind(tenant.plan.to_string())
        .bind(tenant.status.to_string())
        .bind(tenant.weight_override.map(|w| w as i64))
        .bind(&tenant.data_region)
        .bind(regions)
        .bind(overrides)
        .bind(tenant.fail_open_override.map(i64::from))
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait::async_trait]
impl TenantDirectory for SqlxTenantDirectory {
    #[instrument(skip(self), target = "registry", fields(tenant_id = %id))]
    async fn fetch_tenant(&self, id: TenantId) -> Result<Option<Tenant>, RegistryError> {
        let mut conn = self.pool.acquire().await?;

        if self.binding == SessionBinding::SetConfig {
            sqlx::query("SELECT set_config('app.tenant_id', $1, true)")
                .bind(id.to_string())
                .execute(&mut *conn)
                .await
                .map_err(|e| RegistryError::TenantBind(e.to_string()))?;
        }

        let row = sqlx::query(
            r#"
            SELECT id, name, plan, status, weight_override, data_region,
                   allowed_regions, quota_overrides, fail_open
            FROM tenants WHERE id = $1
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&mut *conn)
        .await?;

        let Some(row) = row else {
            debug!("tenant not found");
            return Ok(None);
        };

        let plan: String = row.get("plan");
        let status: String = row.get("status");
        let regions: String = row.get("allowed_regions");
        let overrides: String = row.get("quota_overrides");

        let allowed_regions = serde_json::from_str(&regions)
            .map_err(|e| RegistryError::InvalidRow(format!("allowed_regions: {e}")))?;

        let raw_overrides: HashMap<String, u64> = serde_json::from_str(&overrides)
            .map_err(|e| RegistryError::InvalidRow(format!("quota_overrides: {e}")))?;
        let mut quota_overrides = HashMap::new();
        for (k, v) in raw_overrides {
            let resource = k
                .parse()
                .map_err(|e: String| RegistryError::InvalidRow(e))?;
            quota_overrides.insert(resource, v);
        }

        Ok(Some(Tenant {
            id,
            name: row.get("name"),
            plan: plan
                .parse()
                .map_err(|e: anyhow::Error| RegistryError::InvalidRow(e.to_string()))?,
            status: status
                .parse()
                .map_err(|e: anyhow::Error| RegistryError::InvalidRow(e.to_string()))?,
            weight_override: row.get::<Option<i64>, _>("weight_override").map(|w| w as u32),
            data_region: row.get("data_region"),
            allowed_regions,
            quota_overrides,
            fail_open_override: row.get::<Option<i64>, _>("fail_open").map(|v| v != 0),
        }))
    }
}
