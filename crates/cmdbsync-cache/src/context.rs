//! Shared handles every manager is built from.

use std::sync::Arc;

use cmdbsync_api::{CmdbApi, CmdbClientRegistry};
use cmdbsync_core::{Namespace, TenantId};
use cmdbsync_relation::RelationMetricsBuilder;
use cmdbsync_state::SharedStore;

use crate::error::CacheResult;

pub const DEFAULT_CONCURRENT_LIMIT: usize = 10;
pub const DEFAULT_PAGE_SIZE: usize = 500;

#[derive(Clone)]
pub struct CacheContext {
    pub namespace: Namespace,
    pub store: SharedStore,
    pub registry: Arc<CmdbClientRegistry>,
    pub relations: Arc<RelationMetricsBuilder>,
    /// Businesses refreshed at once by `refresh_all`.
    pub concurrent_limit: usize,
    pub page_size: usize,
    /// The resource pool business, which host, module and set caches skip.
    pub resource_pool_biz: i64,
}

impl CacheContext {
    pub fn new(
        namespace: Namespace,
        store: SharedStore,
        registry: Arc<CmdbClientRegistry>,
        relations: Arc<RelationMetricsBuilder>,
    ) -> Self {
        Self {
            namespace,
            store,
            registry,
            relations,
            concurrent_limit: DEFAULT_CONCURRENT_LIMIT,
            page_size: DEFAULT_PAGE_SIZE,
            resource_pool_biz: 1,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn with_concurrent_limit(mut self, limit: usize) -> Self {
        self.concurrent_limit = limit.max(1);
        self
    }

    pub fn with_resource_pool_biz(mut self, biz_id: i64) -> Self {
        self.resource_pool_biz = biz_id;
        self
    }

    pub fn tenant(&self) -> &TenantId {
        self.namespace.tenant()
    }

    /// Fully-qualified cache key for a subkey such as `keys::HOST`.
    pub fn key(&self, subkey: &str) -> String {
        self.namespace.key(subkey)
    }

    pub fn cmdb(&self) -> CacheResult<Arc<dyn CmdbApi>> {
        Ok(self.registry.client(self.tenant())?)
    }
}
