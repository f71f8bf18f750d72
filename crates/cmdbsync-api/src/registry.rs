//! Per-tenant CMDB client registry.

use std::sync::Arc;

use cmdbsync_core::TenantId;
use dashmap::DashMap;
use tracing::debug;

use crate::client::{CmdbApi, TenantDirectory};
use crate::error::ApiResult;

/// Builds a client for a tenant on first use.
pub trait CmdbClientFactory: Send + Sync {
    fn create(&self, tenant: &TenantId) -> ApiResult<Arc<dyn CmdbApi>>;
}

/// Lazily built clients, one per tenant, plus the tenant directory.
/// Held by `Arc` and passed to every manager and watcher.
pub struct CmdbClientRegistry {
    clients: DashMap<TenantId, Arc<dyn CmdbApi>>,
    factory: Arc<dyn CmdbClientFactory>,
    directory: Arc<dyn TenantDirectory>,
}

impl CmdbClientRegistry {
    pub fn new(factory: Arc<dyn CmdbClientFactory>, directory: Arc<dyn TenantDirectory>) -> Self {
        Self {
            clients: DashMap::new(),
            factory,
            directory,
        }
    }

    pub fn client(&self, tenant: &TenantId) -> ApiResult<Arc<dyn CmdbApi>> {
        if let Some(client) = self.clients.get(tenant) {
            return Ok(client.clone());
        }
        let created = self.factory.create(tenant)?;
        // A racing caller may have inserted first; keep whichever landed.
        let client = self
            .clients
            .entry(tenant.clone())
            .or_insert(created)
            .clone();
        debug!(%tenant, "cmdb client created");
        Ok(client)
    }

    /// Replace the client for a tenant.
    pub fn insert(&self, tenant: TenantId, client: Arc<dyn CmdbApi>) {
        self.clients.insert(tenant, client);
    }

    pub fn directory(&self) -> &Arc<dyn TenantDirectory> {
        &self.directory
    }
}
