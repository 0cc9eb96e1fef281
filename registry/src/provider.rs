//! Region-aware provider resolution.
//!
//! The dispatcher asks for a backend of a given type in the tenant's data
//! region. Residency policy is absolute: a disallowed region is refused and an
//! allowed-but-empty region reports the providers as unavailable rather than
//! falling back to another region.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::Tenant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProviderType {
    Llm,
    Vector,
    Storage,
}

impl fmt::Display for ProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProviderType::Llm => "llm",
            ProviderType::Vector => "vector",
            ProviderType::Storage => "storage",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub region: String,
    pub provider_type: ProviderType,
    pub provider_name: String,
    pub endpoint: String,
    pub priority: u32,
    pub active: bool,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("region {region} is not allowed for tenant {tenant}")]
    RegionForbidden { tenant: String, region: String },

    #[error("no active {provider_type} provider in region {region}")]
    DownstreamUnavailable {
        provider_type: String,
        region: String,
    },
}

/// Static table of regional providers, loaded from configuration at startup.
#[derive(Default)]
pub struct ProviderTable {
    by_region: HashMap<String, HashMap<ProviderType, Vec<ProviderConfig>>>,
}

impl ProviderTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, config: ProviderConfig) {
        self.by_region
            .entry(config.region.clone())
            .or_default()
            .entry(config.provider_type)
            .or_default()
            .push(config);
    }

    /// Pick the highest-priority active provider of `provider_type` in the
    /// tenant's data region.
    pub fn resolve(
        &self,
        tenant: &Tenant,
        provider_type: ProviderType,
    ) -> Result<&ProviderConfig, ProviderError> {
        let region = tenant.data_region.as_str();

        if !tenant.region_allowed(region) {
            return Err(ProviderError::RegionForbidden {
                tenant: tenant.id.to_string(),
                region: region.to_string(),
            });
        }

        self.by_region
            .get(region)
            .and_then(|types| types.get(&provider_type))
            .and_then(|configs| {
                configs
                    .iter()
                    .filter(|c| c.active)
                    .min_by_key(|c| c.priority)
            })
            .ok_or_else(|| ProviderError::DownstreamUnavailable {
                provider_type: provider_type.to_string(),
                region: region.to_string(),
            })
    }
}
