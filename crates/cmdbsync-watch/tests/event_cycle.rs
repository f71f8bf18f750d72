//! End-to-end event cycles.
//!
//! Change feed responses go through the watcher into the store queues,
//! and the orchestrator applies them to caches populated by a prior full
//! refresh.

use cmdbsync_api::mock::MockCmdb;
use cmdbsync_api::types::WatchResponse;
use cmdbsync_cache::build_managers;
use cmdbsync_cache::entities::HostInfo;
use cmdbsync_cache::test_support::{TestEnv, biz_topo, host_row, record, seed_relation_fixture};
use cmdbsync_core::keys::{AGENT_ID, HOST, MODULE, SERVICE_TEMPLATE, TOPO};
use cmdbsync_core::{CacheType, ChangeEvent, ResourceKind};
use cmdbsync_state::KvStore;
use cmdbsync_watch::{ChangeWatcher, EventOrchestrator};
use serde_json::{Value, json};

const NOW: u64 = 1_700_000_000;

fn orchestrator(env: &TestEnv) -> EventOrchestrator {
    let managers = build_managers(&CacheType::ALL, &env.ctx());
    EventOrchestrator::new(env.namespace(), env.store.clone(), managers)
}

fn watcher(env: &TestEnv) -> ChangeWatcher {
    ChangeWatcher::new(env.namespace(), env.store.clone(), env.registry.clone())
}

fn change(cursor: &str, resource: &str, action: &str, detail: Value) -> ChangeEvent {
    serde_json::from_value(json!({
        "bk_cursor": cursor,
        "bk_resource": resource,
        "bk_event_type": action,
        "bk_detail": detail,
    }))
    .unwrap()
}

fn feed(cmdb: &MockCmdb, kind: ResourceKind, watched: bool, events: Vec<ChangeEvent>) {
    cmdb.update(|s| {
        s.watch_responses.entry(kind).or_default().push_back(WatchResponse {
            bk_watched: watched,
            bk_events: events,
        })
    });
}

/// Biz 2 from the shared fixture plus biz 3 with host 1101.
fn seed_two_businesses(env: &TestEnv) {
    seed_relation_fixture(&env.cmdb, 2);
    env.cmdb.update(|s| {
        s.businesses.push(record(json!({"bk_biz_id": 3})));
        s.topo.insert(3, vec![biz_topo(3)]);
        s.hosts.insert(3, vec![host_row(1101, "", "1101", &[(3001, 2001)])]);
    });
}

async fn cached_host(env: &TestEnv, field: &str) -> Option<HostInfo> {
    env.store
        .hget(&env.key(HOST), field)
        .await
        .unwrap()
        .map(|raw| serde_json::from_str(&raw).unwrap())
}

#[tokio::test]
async fn cursor_advances_to_last_event() {
    let env = TestEnv::new();
    let kind = ResourceKind::HostRelation;
    feed(
        &env.cmdb,
        kind,
        true,
        vec![
            change("123", "host_relation", "create", json!({"bk_host_id": 1, "bk_biz_id": 2})),
            change("124", "host_relation", "create", json!({"bk_host_id": 2, "bk_biz_id": 2})),
        ],
    );

    assert!(watcher(&env).watch_once(kind).await.unwrap());

    let ns = env.namespace();
    assert_eq!(env.store.get(&ns.cursor_key(kind)).await.unwrap().as_deref(), Some("124"));
    assert_eq!(env.store.llen(&ns.event_queue_key(kind)).await.unwrap(), 2);
}

#[tokio::test]
async fn unwatched_response_only_moves_cursor() {
    let env = TestEnv::new();
    let kind = ResourceKind::Host;
    feed(
        &env.cmdb,
        kind,
        false,
        vec![change("200", "host", "update", json!({"bk_host_id": 1}))],
    );

    assert!(!watcher(&env).watch_once(kind).await.unwrap());

    let ns = env.namespace();
    assert_eq!(env.store.get(&ns.cursor_key(kind)).await.unwrap().as_deref(), Some("200"));
    assert_eq!(env.store.llen(&ns.event_queue_key(kind)).await.unwrap(), 0);
}

#[tokio::test]
async fn first_cycle_refreshes_everything_and_keeps_events_queued() {
    let env = TestEnv::new();
    seed_two_businesses(&env);
    feed(
        &env.cmdb,
        ResourceKind::HostRelation,
        true,
        vec![change("1", "host_relation", "delete", json!({"bk_host_id": 1002, "bk_biz_id": 2}))],
    );
    watcher(&env).watch_once(ResourceKind::HostRelation).await.unwrap();

    let orch = orchestrator(&env);
    let report = orch.run_once(NOW).await;
    assert_eq!(report.refreshed.len(), CacheType::ALL.len());
    assert_eq!(report.events, 0);

    let queue = env.namespace().event_queue_key(ResourceKind::HostRelation);
    assert_eq!(env.store.llen(&queue).await.unwrap(), 1);
    assert!(cached_host(&env, "1101").await.is_some());

    let stamp = env.store.get(&orch.last_refresh_key(CacheType::HostTopo)).await.unwrap();
    assert_eq!(stamp, Some(NOW.to_string()));
}

#[tokio::test]
async fn partial_full_refresh_is_retried_next_cycle() {
    let env = TestEnv::new();
    seed_two_businesses(&env);
    env.cmdb.update(|s| {
        s.failing_biz.insert(3);
    });

    let orch = orchestrator(&env);
    let report = orch.run_once(NOW).await;
    assert!(!report.refreshed.contains(&CacheType::HostTopo));
    assert!(report.refreshed.contains(&CacheType::Business));
    let stamp_key = orch.last_refresh_key(CacheType::HostTopo);
    assert_eq!(env.store.get(&stamp_key).await.unwrap(), None);
    assert!(cached_host(&env, "1001").await.is_some());

    env.cmdb.update(|s| {
        s.failing_biz.clear();
    });
    let report = orch.run_once(NOW + 1).await;
    assert!(report.refreshed.contains(&CacheType::HostTopo));
    assert!(!report.refreshed.contains(&CacheType::Business));
    assert!(cached_host(&env, "1101").await.is_some());
    assert_eq!(env.store.get(&stamp_key).await.unwrap(), Some((NOW + 1).to_string()));
}

#[tokio::test]
async fn incremental_clean_is_scoped_to_dirty_businesses() {
    let env = TestEnv::new();
    seed_two_businesses(&env);
    let orch = orchestrator(&env);
    orch.run_once(NOW).await;

    // Both hosts leave the CMDB, but only host 1002 is reported.
    env.cmdb.update(|s| {
        s.hosts.get_mut(&2).unwrap().retain(|h| h.host.bk_host_id != 1002);
        s.hosts.insert(3, Vec::new());
        s.calls.clear();
    });
    feed(
        &env.cmdb,
        ResourceKind::HostRelation,
        true,
        vec![change("1", "host_relation", "delete", json!({"bk_host_id": 1002, "bk_biz_id": 2}))],
    );
    watcher(&env).watch_once(ResourceKind::HostRelation).await.unwrap();

    let report = orch.run_once(NOW + 1).await;
    assert!(report.refreshed.is_empty());
    assert_eq!(report.events, 1);
    assert_eq!(report.applied.get(&CacheType::HostTopo), Some(&0));

    assert!(cached_host(&env, "1002").await.is_none());
    assert_eq!(env.store.hget(&env.key(AGENT_ID), "1002").await.unwrap(), None);
    assert!(cached_host(&env, "1001").await.is_some());
    // Biz 3 was never dirty, so its stale host survives until the next full refresh.
    assert!(cached_host(&env, "1101").await.is_some());

    let calls = env.cmdb.read(|s| s.calls.clone());
    assert!(calls.contains(&"list_biz_hosts_topo:2".to_string()));
    assert!(!calls.iter().any(|c| c.ends_with(":3")));
}

#[tokio::test]
async fn failed_refresh_skips_dirty_deletes() {
    let env = TestEnv::new();
    seed_two_businesses(&env);
    let orch = orchestrator(&env);
    orch.run_once(NOW).await;

    // Host 1002 moves from biz 2 to biz 3, and biz 3 cannot be read.
    let moved = host_row(1002, "", "1002", &[(3001, 2001)]);
    env.cmdb.update(|s| {
        s.hosts.get_mut(&2).unwrap().retain(|h| h.host.bk_host_id != 1002);
        s.hosts.get_mut(&3).unwrap().push(moved);
        s.failing_biz.insert(3);
    });
    let moved_event =
        || change("1", "host_relation", "create", json!({"bk_host_id": 1002, "bk_biz_id": 3}));
    feed(&env.cmdb, ResourceKind::HostRelation, true, vec![moved_event()]);
    watcher(&env).watch_once(ResourceKind::HostRelation).await.unwrap();

    let report = orch.run_once(NOW + 1).await;
    assert_eq!(report.applied.get(&CacheType::HostTopo), Some(&1));
    let stale = cached_host(&env, "1002").await.unwrap();
    assert_eq!(stale.bk_biz_id, 2);

    env.cmdb.update(|s| {
        s.failing_biz.clear();
    });
    feed(&env.cmdb, ResourceKind::HostRelation, true, vec![moved_event()]);
    watcher(&env).watch_once(ResourceKind::HostRelation).await.unwrap();

    let report = orch.run_once(NOW + 2).await;
    assert_eq!(report.applied.get(&CacheType::HostTopo), Some(&0));
    let current = cached_host(&env, "1002").await.unwrap();
    assert_eq!(current.bk_biz_id, 3);
}

#[tokio::test]
async fn module_delete_prunes_template_index() {
    let env = TestEnv::new();
    env.cmdb.update(|s| {
        s.businesses = vec![record(json!({"bk_biz_id": 2}))];
        s.modules.insert(
            2,
            vec![
                record(json!({"bk_module_id": 2001, "bk_set_id": 3001, "bk_module_name": "web", "service_template_id": 9})),
                record(json!({"bk_module_id": 2002, "bk_set_id": 3001, "bk_module_name": "db", "service_template_id": 9})),
            ],
        );
    });
    let orch = orchestrator(&env);
    orch.run_once(NOW).await;
    assert_eq!(
        env.store.hget(&env.key(SERVICE_TEMPLATE), "9").await.unwrap().as_deref(),
        Some("[2001,2002]")
    );

    env.cmdb.update(|s| {
        s.modules.get_mut(&2).unwrap().truncate(1);
    });
    feed(
        &env.cmdb,
        ResourceKind::Module,
        true,
        vec![change(
            "5",
            "module",
            "delete",
            json!({"bk_module_id": 2002, "bk_biz_id": 2, "service_template_id": 9}),
        )],
    );
    watcher(&env).watch_once(ResourceKind::Module).await.unwrap();
    orch.run_once(NOW + 1).await;

    assert_eq!(env.store.hget(&env.key(MODULE), "2002").await.unwrap(), None);
    assert!(env.store.hget(&env.key(MODULE), "2001").await.unwrap().is_some());
    assert_eq!(
        env.store.hget(&env.key(SERVICE_TEMPLATE), "9").await.unwrap().as_deref(),
        Some("[2001]")
    );
}

#[tokio::test]
async fn mainline_events_upsert_and_delete_topology() {
    let env = TestEnv::new();
    seed_relation_fixture(&env.cmdb, 2);
    let orch = orchestrator(&env);
    orch.run_once(NOW).await;
    assert!(env.store.hget(&env.key(TOPO), "module|2003").await.unwrap().is_some());

    feed(
        &env.cmdb,
        ResourceKind::MainlineInstance,
        true,
        vec![
            change(
                "7",
                "mainline_instance",
                "create",
                json!({"bk_obj_id": "rack", "bk_inst_id": 7, "bk_obj_name": "Rack", "bk_inst_name": "r7"}),
            ),
            change(
                "8",
                "mainline_instance",
                "delete",
                json!({"bk_obj_id": "module", "bk_inst_id": 2003, "bk_obj_name": "Module", "bk_inst_name": "mod-c"}),
            ),
        ],
    );
    watcher(&env).watch_once(ResourceKind::MainlineInstance).await.unwrap();
    orch.run_once(NOW + 1).await;

    let rack = env.store.hget(&env.key(TOPO), "rack|7").await.unwrap().unwrap();
    let rack: Value = serde_json::from_str(&rack).unwrap();
    assert_eq!(rack["bk_inst_name"], "r7");
    assert_eq!(env.store.hget(&env.key(TOPO), "module|2003").await.unwrap(), None);
}
