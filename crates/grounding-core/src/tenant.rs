//! Per-tenant behaviour lookup and the read-only tenant registry seam.
//!
//! Tenant behaviour (system preamble, threshold override) is a plain
//! struct looked up by `tenant_id` once per request. Which sources a
//! tenant owns comes from the admin registry through [`TenantDirectory`];
//! the retrieval engine never writes to it.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use crate::models::Tenant;

/// Behaviour attached to one tenant.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TenantProfile {
    pub tenant_id: String,
    pub display_name: String,
    /// System preamble placed at the top of every prompt for this tenant.
    pub preamble: String,
    /// Overrides the global minimum similarity score.
    pub min_score: Option<f64>,
}

/// Lookup table from `tenant_id` to [`TenantProfile`].
///
/// Unknown tenants resolve to a default profile built from the fallback
/// preamble, so requests for a tenant with content but no explicit
/// configuration still work.
#[derive(Debug, Clone, Default)]
pub struct TenantTable {
    profiles: HashMap<String, TenantProfile>,
    default_preamble: String,
}

impl TenantTable {
    pub fn new(default_preamble: impl Into<String>) -> Self {
        Self {
            profiles: HashMap::new(),
            default_preamble: default_preamble.into(),
        }
    }

    pub fn insert(&mut self, profile: TenantProfile) {
        self.profiles.insert(profile.tenant_id.clone(), profile);
    }

    pub fn get(&self, tenant_id: &str) -> Option<&TenantProfile> {
        self.profiles.get(tenant_id)
    }

    /// Resolve the profile for a request.
    pub fn resolve(&self, tenant_id: &str) -> TenantProfile {
        self.profiles
            .get(tenant_id)
            .cloned()
            .unwrap_or_else(|| TenantProfile {
                tenant_id: tenant_id.to_string(),
                display_name: tenant_id.to_string(),
                preamble: self.default_preamble.clone(),
                min_score: None,
            })
    }

    /// Profiles sorted by tenant id.
    pub fn profiles(&self) -> Vec<&TenantProfile> {
        let mut out: Vec<&TenantProfile> = self.profiles.values().collect();
        out.sort_by(|a, b| a.tenant_id.cmp(&b.tenant_id));
        out
    }
}

/// Read-only view of the admin registry.
#[async_trait]
pub trait TenantDirectory: Send + Sync {
    /// The registry entry for a tenant, or `None` if the registry has no
    /// record of it.
    async fn tenant(&self, tenant_id: &str) -> Result<Option<Tenant>>;
}

/// A [`TenantDirectory`] backed by a fixed map, e.g. loaded from config.
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    tenants: HashMap<String, Tenant>,
}

impl StaticDirectory {
    pub fn new(tenants: impl IntoIterator<Item = Tenant>) -> Self {
        Self {
            tenants: tenants
                .into_iter()
                .map(|t| (t.tenant_id.clone(), t))
                .collect(),
        }
    }
}

#[async_trait]
impl TenantDirectory for StaticDirectory {
    async fn tenant(&self, tenant_id: &str) -> Result<Option<Tenant>> {
        Ok(self.tenants.get(tenant_id).cloned())
    }
}
