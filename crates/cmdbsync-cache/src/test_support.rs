//! Shared fixtures for cache tests: an in-memory store, a mock CMDB and
//! the handles a [`CacheContext`] is built from.

use std::sync::Arc;

use cmdbsync_api::mock::{MockCmdb, mock_registry};
use cmdbsync_api::types::{BizHostTopo, TopoInstance};
use cmdbsync_api::{CmdbClientRegistry, Record, StaticDirectory};
use cmdbsync_core::{Namespace, TenantId};
use cmdbsync_relation::RelationMetricsBuilder;
use cmdbsync_state::{RedbStore, SharedStore};
use serde_json::{Value, json};

use crate::context::CacheContext;

pub const PREFIX: &str = "bkmonitorv3";

pub struct TestEnv {
    pub store: SharedStore,
    pub cmdb: Arc<MockCmdb>,
    pub registry: Arc<CmdbClientRegistry>,
    pub relations: Arc<RelationMetricsBuilder>,
}

impl TestEnv {
    pub fn new() -> Self {
        Self::with_directory(StaticDirectory::default_tenant())
    }

    pub fn with_directory(directory: StaticDirectory) -> Self {
        let store: SharedStore = Arc::new(RedbStore::open_in_memory().expect("in-memory store"));
        let cmdb = Arc::new(MockCmdb::new());
        let registry = mock_registry(cmdb.clone(), directory);
        Self {
            store,
            cmdb,
            registry,
            relations: Arc::new(RelationMetricsBuilder::new()),
        }
    }

    /// Register a separate mock CMDB for `tenant`.
    pub fn add_tenant(&self, tenant: &TenantId) -> Arc<MockCmdb> {
        let cmdb = Arc::new(MockCmdb::new());
        self.registry.insert(tenant.clone(), cmdb.clone());
        cmdb
    }

    pub fn namespace(&self) -> Namespace {
        Namespace::new(TenantId::default_tenant(), PREFIX)
    }

    pub fn ctx(&self) -> CacheContext {
        self.ctx_for(TenantId::default_tenant())
    }

    pub fn ctx_for(&self, tenant: TenantId) -> CacheContext {
        CacheContext::new(
            Namespace::new(tenant, PREFIX),
            self.store.clone(),
            self.registry.clone(),
            self.relations.clone(),
        )
        .with_page_size(2)
    }

    pub fn key(&self, subkey: &str) -> String {
        self.namespace().key(subkey)
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}

pub fn record(value: Value) -> Record {
    match value {
        Value::Object(map) => map,
        _ => Record::new(),
    }
}

pub fn host_row(host_id: i64, ip: &str, agent_id: &str, modules: &[(i64, i64)]) -> BizHostTopo {
    let mut sets: Vec<(i64, Vec<i64>)> = Vec::new();
    for &(set_id, module_id) in modules {
        match sets.iter_mut().find(|(s, _)| *s == set_id) {
            Some((_, ms)) => ms.push(module_id),
            None => sets.push((set_id, vec![module_id])),
        }
    }
    let topo: Vec<Value> = sets
        .into_iter()
        .map(|(set_id, ms)| {
            json!({
                "bk_set_id": set_id,
                "module": ms.into_iter().map(|m| json!({"bk_module_id": m})).collect::<Vec<_>>(),
            })
        })
        .collect();
    serde_json::from_value(json!({
        "host": {
            "bk_host_id": host_id,
            "bk_cloud_id": 0,
            "bk_host_innerip": ip,
            "bk_agent_id": agent_id,
            "bk_host_name": format!("host-{host_id}"),
        },
        "topo": topo,
    }))
    .expect("host row")
}

/// `biz -> set 3001 -> modules 2001, 2002` and `set 3002 -> module 2003`.
pub fn biz_topo(biz_id: i64) -> TopoInstance {
    serde_json::from_value(json!({
        "bk_inst_id": biz_id, "bk_inst_name": "Blueking", "bk_obj_id": "biz", "bk_obj_name": "Business",
        "child": [
            {
                "bk_inst_id": 3001, "bk_inst_name": "set-a", "bk_obj_id": "set", "bk_obj_name": "Set",
                "child": [
                    {"bk_inst_id": 2001, "bk_inst_name": "mod-a", "bk_obj_id": "module", "bk_obj_name": "Module"},
                    {"bk_inst_id": 2002, "bk_inst_name": "mod-b", "bk_obj_id": "module", "bk_obj_name": "Module"}
                ]
            },
            {
                "bk_inst_id": 3002, "bk_inst_name": "set-b", "bk_obj_id": "set", "bk_obj_name": "Set",
                "child": [
                    {"bk_inst_id": 2003, "bk_inst_name": "mod-c", "bk_obj_id": "module", "bk_obj_name": "Module"}
                ]
            }
        ]
    }))
    .expect("topo tree")
}

/// Hosts 1001 (modules 2001, 2002), 1002 (2001) and 1003 (2003) under
/// `biz_id`, each with an agent id equal to its host id.
pub fn seed_relation_fixture(cmdb: &MockCmdb, biz_id: i64) {
    cmdb.update(|s| {
        s.businesses.push(record(json!({"bk_biz_id": biz_id})));
        s.topo.insert(biz_id, vec![biz_topo(biz_id)]);
        s.hosts.insert(
            biz_id,
            vec![
                host_row(1001, "", "1001", &[(3001, 2001), (3001, 2002)]),
                host_row(1002, "", "1002", &[(3001, 2001)]),
                host_row(1003, "", "1003", &[(3002, 2003)]),
            ],
        );
    });
}
