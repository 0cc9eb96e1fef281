use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use corelib::models::Resource;

pub type TenantId = uuid::Uuid;

/// Pricing plan. The plan decides the default scheduling weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Plan {
    Free,
    Pro,
    Enterprise,
}

impl Plan {
    /// Default fair-share weight for the plan.
    pub fn weight(self) -> u32 {
        match self {
            Plan::Free => 1,
            Plan::Pro => 3,
            Plan::Enterprise => 10,
        }
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Plan::Free => "free",
            Plan::Pro => "pro",
            Plan::Enterprise => "enterprise",
        };
        f.write_str(s)
    }
}

impl FromStr for Plan {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "free" => Ok(Plan::Free),
            "pro" => Ok(Plan::Pro),
            "enterprise" => Ok(Plan::Enterprise),
            other => Err(anyhow::anyhow!("invalid plan value: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TenantStatus {
    Active,
    Suspended,
    Deleted,
}

impl fmt::Display for TenantStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TenantStatus::Active => "active",
            TenantStatus::Suspended => "suspended",
            TenantStatus::Deleted => "deleted",
        };
        f.write_str(s)
    }
}

impl FromStr for TenantStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(TenantStatus::Active),
            "suspended" => Ok(TenantStatus::Suspended),
            "deleted" => Ok(TenantStatus::Deleted),
            other => Err(anyhow::anyhow!("invalid tenant status value: {}", other)),
        }
    }
}

/// Tenant row as the request plane sees it.
///
/// Created out of band; the core only ever reads it (through the cache) and
/// reacts to registry events by invalidating.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: TenantId,
    pub name: String,
    pub plan: Plan,
    pub status: TenantStatus,

    /// Operator-set weight override; `None` means the plan default applies.
    pub weight_override: Option<u32>,

    // Residency
    pub data_region: String,
    pub allowed_regions: BTreeSet<String>,

    // Quota policy
    pub quota_overrides: HashMap<Resource, u64>,
    /// Overrides the priority-based fail-open/fail-closed default when the
    /// quota store is unavailable.
    pub fail_open_override: Option<bool>,
}

impl Tenant {
    pub fn weight(&self) -> u32 {
        self.weight_override.unwrap_or_else(|| self.plan.weight())
    }

    pub fn is_active(&self) -> bool {
        self.status == TenantStatus::Active
    }

    pub fn region_allowed(&self, region: &str) -> bool {
        self.allowed_regions.contains(region)
    }

    /// Per-tenant quota limit for a resource, if one is configured.
    pub fn quota_override(&self, resource: Resource) -> Option<u64> {
        self.quota_overrides.get(&resource).copied()
    }
}
