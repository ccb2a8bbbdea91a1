//! Tenant registry

use super::context::{IsolationLevel, Region, TenantContext, TenantId};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A configured tenant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantRecord {
    pub id: TenantId,
    pub region: Region,
    #[serde(default)]
    pub isolation_level: IsolationLevel,
}

/// Source of tenant contexts
pub trait TenantRegistry: Send + Sync {
    /// Resolve a tenant, `None` if unknown
    fn resolve(&self, tenant_id: &TenantId) -> Option<TenantContext>;

    /// All known tenants
    fn tenant_ids(&self) -> Vec<TenantId>;
}

/// Registry loaded from configuration
#[derive(Debug, Default)]
pub struct StaticTenantRegistry {
    tenants: HashMap<TenantId, TenantContext>,
}

impl StaticTenantRegistry {
    pub fn from_records(records: &[TenantRecord]) -> Result<Self> {
        let mut tenants = HashMap::new();
        for record in records {
            let context = TenantContext {
                tenant_id: record.id.clone(),
                data_residency_region: record.region.clone(),
                isolation_level: record.isolation_level,
            };
            if tenants.insert(record.id.clone(), context).is_some() {
                return Err(Error::Config(format!("Duplicate tenant: {}", record.id)));
            }
        }
        Ok(Self { tenants })
    }
}

impl TenantRegistry for StaticTenantRegistry {
    fn resolve(&self, tenant_id: &TenantId) -> Option<TenantContext> {
        self.tenants.get(tenant_id).cloned()
    }

    fn tenant_ids(&self) -> Vec<TenantId> {
        let mut ids: Vec<TenantId> = self.tenants.keys().cloned().collect();
        ids.sort();
        ids
    }
}
