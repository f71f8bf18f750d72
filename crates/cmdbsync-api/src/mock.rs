//! In-memory CMDB for tests.
//!
//! [`MockCmdb`] serves whatever its [`MockState`] holds and records the
//! calls it receives. Business ids listed in `failing_biz` make every
//! per-business call fail with a remote error.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use cmdbsync_core::{ResourceKind, TenantId};

use crate::client::{CmdbApi, StaticDirectory};
use crate::error::{ApiError, ApiResult};
use crate::registry::{CmdbClientFactory, CmdbClientRegistry};
use crate::types::{
    BizHostTopo, CloudArea, DynamicGroupRecord, InternalModuleSet, ObjectAttribute, Page, Paged,
    Record, ServiceInstanceDetail, TopoInstance, WatchResponse,
};

#[derive(Debug, Default)]
pub struct MockState {
    pub businesses: Vec<Record>,
    pub biz_attributes: Vec<ObjectAttribute>,
    pub hosts: BTreeMap<i64, Vec<BizHostTopo>>,
    pub cloud_areas: Vec<CloudArea>,
    pub topo: BTreeMap<i64, Vec<TopoInstance>>,
    pub internal_modules: BTreeMap<i64, InternalModuleSet>,
    pub modules: BTreeMap<i64, Vec<Record>>,
    pub sets: BTreeMap<i64, Vec<Record>>,
    pub service_instances: BTreeMap<i64, Vec<ServiceInstanceDetail>>,
    pub dynamic_groups: BTreeMap<i64, Vec<DynamicGroupRecord>>,
    /// Members returned by `execute_dynamic_group`, keyed by group id.
    pub dynamic_group_members: BTreeMap<String, Vec<Record>>,
    /// Responses handed out by `resource_watch`, per kind, in order.
    pub watch_responses: BTreeMap<ResourceKind, VecDeque<WatchResponse>>,
    /// Cursor argument of every `resource_watch` call.
    pub watch_calls: Vec<(ResourceKind, Option<String>)>,
    pub failing_biz: BTreeSet<i64>,
    /// `"{method}:{biz}"` for every per-business call.
    pub calls: Vec<String>,
}

#[derive(Debug, Default)]
pub struct MockCmdb {
    state: Mutex<MockState>,
}

impl MockCmdb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update<F: FnOnce(&mut MockState)>(&self, f: F) {
        f(&mut self.lock());
    }

    pub fn read<R, F: FnOnce(&MockState) -> R>(&self, f: F) -> R {
        f(&self.lock())
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn biz_call(&self, method: &str, biz_id: i64) -> ApiResult<MutexGuard<'_, MockState>> {
        let mut state = self.lock();
        state.calls.push(format!("{method}:{biz_id}"));
        if state.failing_biz.contains(&biz_id) {
            return Err(ApiError::Remote {
                code: 1,
                message: format!("{method} failed for biz {biz_id}"),
            });
        }
        Ok(state)
    }
}

fn paginate<T: Clone>(rows: &[T], page: Page) -> Paged<T> {
    let info = rows.iter().skip(page.start).take(page.limit).cloned().collect();
    Paged::new(rows.len(), info)
}

fn paginate_biz<T: Clone>(rows: &BTreeMap<i64, Vec<T>>, biz_id: i64, page: Page) -> Paged<T> {
    paginate(rows.get(&biz_id).map(Vec::as_slice).unwrap_or_default(), page)
}

#[async_trait]
impl CmdbApi for MockCmdb {
    async fn search_business(&self, page: Page) -> ApiResult<Paged<Record>> {
        Ok(paginate(&self.lock().businesses, page))
    }

    async fn search_object_attribute(&self, _obj_id: &str) -> ApiResult<Vec<ObjectAttribute>> {
        Ok(self.lock().biz_attributes.clone())
    }

    async fn list_biz_hosts_topo(&self, biz_id: i64, page: Page) -> ApiResult<Paged<BizHostTopo>> {
        let state = self.biz_call("list_biz_hosts_topo", biz_id)?;
        Ok(paginate_biz(&state.hosts, biz_id, page))
    }

    async fn search_cloud_area(&self, page: Page) -> ApiResult<Paged<CloudArea>> {
        Ok(paginate(&self.lock().cloud_areas, page))
    }

    async fn search_biz_inst_topo(&self, biz_id: i64) -> ApiResult<Vec<TopoInstance>> {
        let state = self.biz_call("search_biz_inst_topo", biz_id)?;
        Ok(state.topo.get(&biz_id).cloned().unwrap_or_default())
    }

    async fn get_biz_internal_module(&self, biz_id: i64) -> ApiResult<InternalModuleSet> {
        let state = self.biz_call("get_biz_internal_module", biz_id)?;
        Ok(state
            .internal_modules
            .get(&biz_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn search_module(&self, biz_id: i64, page: Page) -> ApiResult<Paged<Record>> {
        let state = self.biz_call("search_module", biz_id)?;
        Ok(paginate_biz(&state.modules, biz_id, page))
    }

    async fn search_set(&self, biz_id: i64, page: Page) -> ApiResult<Paged<Record>> {
        let state = self.biz_call("search_set", biz_id)?;
        Ok(paginate_biz(&state.sets, biz_id, page))
    }

    async fn list_service_instance_detail(
        &self,
        biz_id: i64,
        page: Page,
    ) -> ApiResult<Paged<ServiceInstanceDetail>> {
        let state = self.biz_call("list_service_instance_detail", biz_id)?;
        Ok(paginate_biz(&state.service_instances, biz_id, page))
    }

    async fn search_dynamic_group(
        &self,
        biz_id: i64,
        page: Page,
    ) -> ApiResult<Paged<DynamicGroupRecord>> {
        let state = self.biz_call("search_dynamic_group", biz_id)?;
        Ok(paginate_biz(&state.dynamic_groups, biz_id, page))
    }

    async fn execute_dynamic_group(
        &self,
        biz_id: i64,
        group_id: &str,
        _fields: &[&str],
        page: Page,
    ) -> ApiResult<Paged<Record>> {
        let state = self.biz_call("execute_dynamic_group", biz_id)?;
        let members = state
            .dynamic_group_members
            .get(group_id)
            .map(Vec::as_slice)
            .unwrap_or_default();
        Ok(paginate(members, page))
    }

    async fn resource_watch(
        &self,
        kind: ResourceKind,
        cursor: Option<&str>,
        _fields: &[&str],
    ) -> ApiResult<WatchResponse> {
        let mut state = self.lock();
        state.watch_calls.push((kind, cursor.map(str::to_string)));
        Ok(state
            .watch_responses
            .get_mut(&kind)
            .and_then(VecDeque::pop_front)
            .unwrap_or_default())
    }
}

/// Factory that only knows pre-registered clients.
#[derive(Debug, Default)]
pub struct MockFactory;

impl CmdbClientFactory for MockFactory {
    fn create(&self, tenant: &TenantId) -> ApiResult<Arc<dyn CmdbApi>> {
        Err(ApiError::Config(format!("no mock client for tenant {tenant}")))
    }
}

/// A registry serving `cmdb` for the default tenant and `directory` for
/// tenant and space listing.
pub fn mock_registry(cmdb: Arc<MockCmdb>, directory: StaticDirectory) -> Arc<CmdbClientRegistry> {
    let registry = CmdbClientRegistry::new(Arc::new(MockFactory), Arc::new(directory));
    registry.insert(TenantId::default_tenant(), cmdb);
    Arc::new(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::fetch_all_pages;
    use serde_json::json;

    fn record(value: serde_json::Value) -> Record {
        match value {
            serde_json::Value::Object(map) => map,
            _ => Record::new(),
        }
    }

    #[tokio::test]
    async fn registry_serves_inserted_client() {
        let cmdb = Arc::new(MockCmdb::new());
        cmdb.update(|s| {
            s.modules.insert(
                2,
                (0..5).map(|i| record(json!({ "bk_module_id": i }))).collect(),
            );
        });
        let registry = mock_registry(cmdb.clone(), StaticDirectory::default_tenant());
        let client = registry.client(&TenantId::default_tenant()).unwrap();
        let rows = fetch_all_pages(2, |page| client.search_module(2, page))
            .await
            .unwrap();
        assert_eq!(rows.len(), 5);
        assert_eq!(cmdb.read(|s| s.calls.len()), 3);

        assert!(registry.client(&TenantId::new("other")).is_err());
    }

    #[tokio::test]
    async fn failing_biz_errors() {
        let cmdb = MockCmdb::new();
        cmdb.update(|s| {
            s.failing_biz.insert(3);
        });
        assert!(cmdb.search_set(3, Page::first(10)).await.is_err());
        assert!(cmdb.search_set(2, Page::first(10)).await.is_ok());
    }
}
