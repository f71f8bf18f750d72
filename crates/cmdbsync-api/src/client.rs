//! The CMDB and tenant directory contracts.

use std::future::Future;

use async_trait::async_trait;
use cmdbsync_core::{ResourceKind, TenantId};

use crate::error::ApiResult;
use crate::types::{
    BizHostTopo, CloudArea, DynamicGroupRecord, InternalModuleSet, ObjectAttribute, Page, Paged,
    Record, ServiceInstanceDetail, Space, TopoInstance, WatchResponse,
};

/// CMDB calls used by the cache managers and the change watcher. One
/// instance serves one tenant.
#[async_trait]
pub trait CmdbApi: Send + Sync {
    async fn search_business(&self, page: Page) -> ApiResult<Paged<Record>>;

    async fn search_object_attribute(&self, obj_id: &str) -> ApiResult<Vec<ObjectAttribute>>;

    async fn list_biz_hosts_topo(&self, biz_id: i64, page: Page) -> ApiResult<Paged<BizHostTopo>>;

    async fn search_cloud_area(&self, page: Page) -> ApiResult<Paged<CloudArea>>;

    /// The business topology tree. Empty when the business has no topology.
    async fn search_biz_inst_topo(&self, biz_id: i64) -> ApiResult<Vec<TopoInstance>>;

    async fn get_biz_internal_module(&self, biz_id: i64) -> ApiResult<InternalModuleSet>;

    async fn search_module(&self, biz_id: i64, page: Page) -> ApiResult<Paged<Record>>;

    async fn search_set(&self, biz_id: i64, page: Page) -> ApiResult<Paged<Record>>;

    async fn list_service_instance_detail(
        &self,
        biz_id: i64,
        page: Page,
    ) -> ApiResult<Paged<ServiceInstanceDetail>>;

    async fn search_dynamic_group(
        &self,
        biz_id: i64,
        page: Page,
    ) -> ApiResult<Paged<DynamicGroupRecord>>;

    async fn execute_dynamic_group(
        &self,
        biz_id: i64,
        group_id: &str,
        fields: &[&str],
        page: Page,
    ) -> ApiResult<Paged<Record>>;

    async fn resource_watch(
        &self,
        kind: ResourceKind,
        cursor: Option<&str>,
        fields: &[&str],
    ) -> ApiResult<WatchResponse>;
}

/// Tenants and monitoring spaces known to the platform.
#[async_trait]
pub trait TenantDirectory: Send + Sync {
    async fn list_tenants(&self) -> ApiResult<Vec<TenantId>>;

    async fn list_spaces(&self) -> ApiResult<Vec<Space>>;
}

/// Directory for single-tenant deployments without a space service.
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    tenants: Vec<TenantId>,
    spaces: Vec<Space>,
}

impl StaticDirectory {
    pub fn new(tenants: Vec<TenantId>, spaces: Vec<Space>) -> Self {
        Self { tenants, spaces }
    }

    pub fn default_tenant() -> Self {
        Self::new(vec![TenantId::default_tenant()], Vec::new())
    }
}

#[async_trait]
impl TenantDirectory for StaticDirectory {
    async fn list_tenants(&self) -> ApiResult<Vec<TenantId>> {
        Ok(self.tenants.clone())
    }

    async fn list_spaces(&self) -> ApiResult<Vec<Space>> {
        Ok(self.spaces.clone())
    }
}

/// Page through a listing until the reported count is reached or the
/// server returns an empty page.
pub async fn fetch_all_pages<T, F, Fut>(page_size: usize, mut fetch: F) -> ApiResult<Vec<T>>
where
    F: FnMut(Page) -> Fut,
    Fut: Future<Output = ApiResult<Paged<T>>>,
{
    let limit = page_size.max(1);
    let mut out = Vec::new();
    let mut start = 0;
    loop {
        let page = fetch(Page { start, limit }).await?;
        let received = page.info.len();
        out.extend(page.info);
        if received == 0 || out.len() >= page.count {
            break;
        }
        start += limit;
    }
    Ok(out)
}
