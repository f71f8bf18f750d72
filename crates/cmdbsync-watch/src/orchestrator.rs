//! The event orchestrator: scheduled full refreshes plus incremental
//! application of queued change events.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use cmdbsync_api::TopoNode;
use cmdbsync_cache::entities::composite_key;
use cmdbsync_cache::{CacheManager, HostInfo, for_each_biz, refresh_all};
use cmdbsync_core::config::DEFAULT_REFRESH_INTERVAL_SECS;
use cmdbsync_core::keys::{HOST, TOPO};
use cmdbsync_core::{
    CacheType, EventAction, Namespace, ResourceChange, ResourceEvent, ResourceKind, TaskConfig, TenantId,
};
use cmdbsync_state::SharedStore;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::dirty::{CachePlan, DirtySets};
use crate::error::WatchResult;

/// Lifetime of the last-full-refresh timestamps.
pub const LAST_REFRESH_TTL: Duration = Duration::from_secs(24 * 3600);

/// What one [`EventOrchestrator::run_once`] cycle did.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct CycleReport {
    pub refreshed: BTreeSet<CacheType>,
    pub events: usize,
    /// Cache types that had incremental work, with their failed business
    /// refresh count.
    pub applied: BTreeMap<CacheType, usize>,
}

#[derive(Clone)]
pub struct EventOrchestrator {
    namespace: Namespace,
    store: SharedStore,
    managers: BTreeMap<CacheType, Arc<dyn CacheManager>>,
    intervals: BTreeMap<CacheType, Duration>,
    biz_concurrency: usize,
}

impl EventOrchestrator {
    pub fn new(
        namespace: Namespace,
        store: SharedStore,
        managers: BTreeMap<CacheType, Arc<dyn CacheManager>>,
    ) -> Self {
        Self {
            namespace,
            store,
            managers,
            intervals: BTreeMap::new(),
            biz_concurrency: cmdbsync_core::config::DEFAULT_BIZ_CONCURRENCY,
        }
    }

    /// Full refresh intervals and business concurrency from the task config.
    pub fn with_config(mut self, config: &TaskConfig) -> Self {
        for cache_type in CacheType::ALL {
            self.intervals
                .insert(cache_type, config.full_refresh_interval(cache_type));
        }
        self.biz_concurrency = config.biz_concurrency();
        self
    }

    pub fn with_interval(mut self, cache_type: CacheType, interval: Duration) -> Self {
        self.intervals.insert(cache_type, interval);
        self
    }

    pub fn with_biz_concurrency(mut self, limit: usize) -> Self {
        self.biz_concurrency = limit.max(1);
        self
    }

    pub fn tenant(&self) -> &TenantId {
        self.namespace.tenant()
    }

    fn interval(&self, cache_type: CacheType) -> Duration {
        self.intervals
            .get(&cache_type)
            .copied()
            .unwrap_or(Duration::from_secs(DEFAULT_REFRESH_INTERVAL_SECS))
    }

    // ── Full refresh gate ───────────────────────────────────────

    pub fn last_refresh_key(&self, cache_type: CacheType) -> String {
        self.namespace.last_refresh_key(cache_type)
    }

    /// Whether more than the interval has passed since the last recorded
    /// full refresh. A missing timestamp counts as never.
    pub async fn should_refresh_all(&self, cache_type: CacheType, now_secs: u64) -> bool {
        let last = match self.store.get(&self.last_refresh_key(cache_type)).await {
            Ok(value) => value.and_then(|v| v.trim().parse::<u64>().ok()).unwrap_or(0),
            Err(e) => {
                warn!(tenant = %self.tenant(), %cache_type, error = %e, "last refresh time unreadable");
                return false;
            }
        };
        now_secs.saturating_sub(last) > self.interval(cache_type).as_secs()
    }

    /// Run every due full refresh concurrently. Returns the cache types
    /// that refreshed successfully.
    pub async fn run_refresh_all(&self, now_secs: u64) -> BTreeSet<CacheType> {
        let mut tasks = JoinSet::new();
        for (&cache_type, manager) in &self.managers {
            let this = self.clone();
            let manager = manager.clone();
            tasks.spawn(async move {
                if !this.should_refresh_all(cache_type, now_secs).await {
                    return None;
                }
                if let Err(e) = refresh_all(manager).await {
                    error!(tenant = %this.tenant(), %cache_type, error = %e, "full refresh failed");
                    return None;
                }
                let key = this.last_refresh_key(cache_type);
                if let Err(e) = this
                    .store
                    .set(&key, &now_secs.to_string(), Some(LAST_REFRESH_TTL))
                    .await
                {
                    warn!(tenant = %this.tenant(), %cache_type, error = %e, "last refresh time not recorded");
                }
                Some(cache_type)
            });
        }

        let mut refreshed = BTreeSet::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Some(cache_type)) => {
                    refreshed.insert(cache_type);
                }
                Ok(None) => {}
                Err(e) => error!(error = %e, "full refresh task aborted"),
            }
        }
        refreshed
    }

    // ── Drain and classify ──────────────────────────────────────

    /// Pop every queued event of `kind`. Entries that do not decode are
    /// dropped.
    pub async fn drain_events(&self, kind: ResourceKind) -> WatchResult<Vec<ResourceEvent>> {
        let queue = self.namespace.event_queue_key(kind);
        let mut events = Vec::new();
        while let Some(raw) = self.store.lpop(&queue).await? {
            match ResourceEvent::decode_json(kind, &raw) {
                Ok(event) => events.push(event),
                Err(e) => debug!(%kind, error = %e, "undecodable change event dropped"),
            }
        }
        Ok(events)
    }

    /// Fold `events` into `dirty`.
    pub async fn classify(&self, kind: ResourceKind, events: &[ResourceEvent], dirty: &DirtySets) {
        let mut hosts = HostLookup::new(self.store.clone(), self.namespace.key(HOST));

        for event in events {
            let delete = event.is_delete();
            match &event.change {
                ResourceChange::Biz { .. } => {
                    dirty.mark_business();
                    if delete {
                        dirty.push_delete(event.clone());
                    }
                }
                ResourceChange::Set {
                    biz_id,
                    set_id,
                    set_template_id,
                } => {
                    dirty.mark_biz(CacheType::Set, *biz_id);
                    if delete {
                        dirty.clean_set_ids.insert(set_id.to_string());
                        if let Some(template) = set_template_id.filter(|t| *t > 0) {
                            dirty.clean_set_templates.insert(template.to_string());
                        }
                        dirty.push_delete(event.clone());
                    }
                }
                ResourceChange::Module {
                    biz_id,
                    module_id,
                    service_template_id,
                } => {
                    dirty.mark_biz(CacheType::Module, *biz_id);
                    if delete {
                        dirty.clean_module_ids.insert(module_id.to_string());
                        if let Some(template) = service_template_id.filter(|t| *t > 0) {
                            dirty.clean_service_templates.insert(template.to_string());
                        }
                        dirty.push_delete(event.clone());
                    }
                }
                ResourceChange::Host {
                    host_id,
                    inner_ip,
                    cloud_id,
                    agent_id,
                } => {
                    if let Some(key) = inner_ip.as_deref().and_then(|ip| composite_key(ip, *cloud_id)) {
                        dirty.clean_host_keys.insert(key);
                    }
                    if let Some(agent_id) = agent_id {
                        dirty.clean_agent_ids.insert(agent_id.clone());
                    }
                    if delete {
                        dirty.clean_host_keys.insert(host_id.to_string());
                        dirty.push_delete(event.clone());
                    }
                    if let Some(cached) = hosts.get(*host_id).await {
                        dirty.mark_biz(CacheType::HostTopo, cached.bk_biz_id);
                        dirty_cached_host(dirty, &cached);
                    }
                }
                ResourceChange::HostRelation { host_id, biz_id } => match hosts.get(*host_id).await {
                    None => {
                        dirty.mark_biz(CacheType::HostTopo, *biz_id);
                        dirty.clean_host_keys.insert(host_id.to_string());
                    }
                    Some(cached) => {
                        dirty_cached_host(dirty, &cached);
                        if delete || cached.bk_biz_id != *biz_id {
                            dirty.clean_host_keys.insert(host_id.to_string());
                            dirty.mark_biz(CacheType::HostTopo, cached.bk_biz_id);
                        }
                        dirty.mark_biz(CacheType::HostTopo, *biz_id);
                    }
                },
                ResourceChange::MainlineInstance {
                    obj_id,
                    inst_id,
                    obj_name,
                    inst_name,
                } => {
                    let node = TopoNode {
                        bk_inst_id: *inst_id,
                        bk_inst_name: inst_name.clone(),
                        bk_obj_id: obj_id.clone(),
                        bk_obj_name: obj_name.clone(),
                    };
                    if delete {
                        dirty.delete_topo(node.key());
                    } else {
                        dirty.upsert_topo(node);
                    }
                }
                ResourceChange::Process {
                    biz_id,
                    service_instance_id,
                } => {
                    if delete {
                        dirty
                            .clean_service_instance_ids
                            .insert(service_instance_id.to_string());
                        dirty.push_delete(event.clone());
                    } else {
                        dirty.mark_biz(CacheType::ServiceInstance, *biz_id);
                    }
                }
                ResourceChange::DynamicGroup { biz_id, group_id } => {
                    if delete {
                        dirty.clean_dynamic_group_ids.insert(group_id.clone());
                        dirty.push_delete(event.clone());
                    } else {
                        dirty.mark_biz(CacheType::DynamicGroup, *biz_id);
                    }
                }
            }
        }

        debug!(tenant = %self.tenant(), %kind, events = events.len(), "change events classified");
    }

    // ── Apply ───────────────────────────────────────────────────

    /// Apply `dirty` through the managers, one concurrent task per cache
    /// type. Returns the failed business refresh count per applied type.
    pub async fn apply(&self, dirty: &DirtySets) -> BTreeMap<CacheType, usize> {
        let mut tasks = JoinSet::new();
        for (&cache_type, manager) in &self.managers {
            let plan = dirty.plan(cache_type);
            if plan.is_empty() {
                continue;
            }
            let manager = manager.clone();
            let limit = self.biz_concurrency;
            tasks.spawn(async move { (cache_type, apply_plan(manager, plan, limit).await) });
        }

        let mut applied = BTreeMap::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((cache_type, failed)) => {
                    applied.insert(cache_type, failed);
                }
                Err(e) => error!(error = %e, "event apply task aborted"),
            }
        }
        applied
    }

    /// One cycle: due full refreshes, then drain, classify and apply the
    /// queued events of every other cache type.
    pub async fn run_once(&self, now_secs: u64) -> CycleReport {
        let refreshed = self.run_refresh_all(now_secs).await;

        let dirty = Arc::new(DirtySets::default());
        let mut tasks = JoinSet::new();
        for kind in ResourceKind::ALL {
            let cache_type = kind.cache_type();
            // Events of a just-refreshed cache stay queued for the next cycle.
            if !self.managers.contains_key(&cache_type) || refreshed.contains(&cache_type) {
                continue;
            }
            let this = self.clone();
            let dirty = dirty.clone();
            tasks.spawn(async move {
                let events = match this.drain_events(kind).await {
                    Ok(events) => events,
                    Err(e) => {
                        warn!(tenant = %this.tenant(), %kind, error = %e, "event queue drain failed");
                        return 0;
                    }
                };
                this.classify(kind, &events, &dirty).await;
                events.len()
            });
        }

        let mut events = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(count) => events += count,
                Err(e) => error!(error = %e, "event classify task aborted"),
            }
        }

        let applied = self.apply(&dirty).await;
        if events > 0 || !refreshed.is_empty() {
            info!(
                tenant = %self.tenant(),
                events,
                refreshed = refreshed.len(),
                applied = applied.len(),
                "event cycle finished"
            );
        }
        CycleReport {
            refreshed,
            events,
            applied,
        }
    }

    /// Tick [`EventOrchestrator::run_once`] every `interval` until shutdown.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(tenant = %self.tenant(), interval_secs = interval.as_secs(), "event orchestrator started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    self.run_once(epoch_secs()).await;
                }
                _ = shutdown.changed() => {
                    info!(tenant = %self.tenant(), "event orchestrator shutting down");
                    break;
                }
            }
        }
    }
}

fn dirty_cached_host(dirty: &DirtySets, cached: &HostInfo) {
    if let Some(key) = cached.composite_key() {
        dirty.clean_host_keys.insert(key);
    }
    if !cached.bk_agent_id.is_empty() {
        dirty.clean_agent_ids.insert(cached.bk_agent_id.clone());
    }
}

async fn apply_plan(manager: Arc<dyn CacheManager>, plan: CachePlan, biz_concurrency: usize) -> usize {
    let cache_type = manager.cache_type();
    let tenant = manager.tenant().clone();
    manager.reset();

    let failed = for_each_biz(plan.biz_ids, biz_concurrency, |biz_id| {
        let manager = manager.clone();
        async move { manager.refresh_by_biz(biz_id).await }
    })
    .await;

    if failed == 0 {
        for (index, fields) in plan.deletes {
            match manager.delete_untouched(index, fields).await {
                Ok(deleted) if !deleted.is_empty() => {
                    debug!(%tenant, %cache_type, index, deleted = deleted.len(), "dirty keys deleted");
                }
                Ok(_) => {}
                Err(e) => warn!(%tenant, %cache_type, index, error = %e, "dirty key delete failed"),
            }
        }
    } else if !plan.deletes.is_empty() {
        warn!(%tenant, %cache_type, failed, "business refresh failed, dirty key delete skipped");
    }

    if !plan.topo_upserts.is_empty() {
        let events: Vec<ResourceEvent> = plan.topo_upserts.into_iter().map(topo_upsert_event).collect();
        if let Err(e) = manager
            .update_by_events(ResourceKind::MainlineInstance, &events)
            .await
        {
            warn!(%tenant, error = %e, "topology upsert failed");
        }
    }
    if !plan.topo_deletes.is_empty()
        && let Err(e) = manager.delete_untouched(TOPO, plan.topo_deletes).await
    {
        warn!(%tenant, error = %e, "topology delete failed");
    }

    for (kind, events) in plan.delete_events {
        if let Err(e) = manager.clean_by_events(kind, &events).await {
            warn!(%tenant, %cache_type, %kind, error = %e, "event clean failed");
        }
    }

    if plan.refresh_all
        && let Err(e) = refresh_all(manager.clone()).await
    {
        error!(%tenant, %cache_type, error = %e, "event-triggered full refresh failed");
    }
    failed
}

fn topo_upsert_event(node: TopoNode) -> ResourceEvent {
    ResourceEvent {
        action: EventAction::Update,
        cursor: String::new(),
        change: ResourceChange::MainlineInstance {
            obj_id: node.bk_obj_id,
            inst_id: node.bk_inst_id,
            obj_name: node.bk_obj_name,
            inst_name: node.bk_inst_name,
        },
    }
}

/// Host cache reads, memoized for one classification pass.
struct HostLookup {
    store: SharedStore,
    key: String,
    memo: HashMap<i64, Option<HostInfo>>,
}

impl HostLookup {
    fn new(store: SharedStore, key: String) -> Self {
        Self {
            store,
            key,
            memo: HashMap::new(),
        }
    }

    async fn get(&mut self, host_id: i64) -> Option<HostInfo> {
        if let Some(cached) = self.memo.get(&host_id) {
            return cached.clone();
        }
        let host = match self.store.hget(&self.key, &host_id.to_string()).await {
            Ok(Some(raw)) => serde_json::from_str::<HostInfo>(&raw)
                .map_err(|e| warn!(host_id, error = %e, "cached host undecodable"))
                .ok(),
            Ok(None) => None,
            Err(e) => {
                warn!(host_id, error = %e, "host cache lookup failed");
                None
            }
        };
        self.memo.insert(host_id, host.clone());
        host
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use cmdbsync_cache::build_managers;
    use cmdbsync_cache::test_support::TestEnv;
    use cmdbsync_state::KvStore;

    fn orchestrator(env: &TestEnv) -> EventOrchestrator {
        let managers = build_managers(&CacheType::ALL, &env.ctx());
        EventOrchestrator::new(env.namespace(), env.store.clone(), managers)
    }

    #[tokio::test]
    async fn refresh_gate_boundary() {
        let env = TestEnv::new();
        let orch = orchestrator(&env).with_interval(CacheType::HostTopo, Duration::from_secs(61));
        let now = 1_700_000_000;
        env.store
            .set(&orch.last_refresh_key(CacheType::HostTopo), &(now - 60).to_string(), None)
            .await
            .unwrap();

        assert!(!orch.should_refresh_all(CacheType::HostTopo, now).await);
        assert!(!orch.should_refresh_all(CacheType::HostTopo, now + 1).await);
        assert!(orch.should_refresh_all(CacheType::HostTopo, now + 2).await);
    }

    #[tokio::test]
    async fn missing_timestamp_is_due() {
        let env = TestEnv::new();
        let orch = orchestrator(&env);
        assert!(orch.should_refresh_all(CacheType::Module, 1_000).await);
        assert_eq!(
            orch.last_refresh_key(CacheType::Module),
            "bkmonitorv3.cmdb_last_refresh_all_time.module"
        );
    }

    #[tokio::test]
    async fn host_delete_dirties_event_keys() {
        let env = TestEnv::new();
        let orch = orchestrator(&env);
        let event = ResourceEvent {
            action: EventAction::Delete,
            cursor: "1".into(),
            change: ResourceChange::Host {
                host_id: 1,
                inner_ip: Some("127.0.0.1".into()),
                cloud_id: 0,
                agent_id: Some("A1".into()),
            },
        };
        let dirty = DirtySets::default();
        orch.classify(ResourceKind::Host, &[event], &dirty).await;

        let mut hosts: Vec<String> = dirty.clean_host_keys.iter().map(|k| k.key().clone()).collect();
        hosts.sort();
        assert_eq!(hosts, vec!["1", "127.0.0.1|0"]);
        let agents: Vec<String> = dirty.clean_agent_ids.iter().map(|k| k.key().clone()).collect();
        assert_eq!(agents, vec!["A1"]);
        assert!(dirty.biz_ids(CacheType::HostTopo).is_empty());
        assert_eq!(dirty.plan(CacheType::HostTopo).delete_events.len(), 1);
    }

    #[tokio::test]
    async fn undecodable_events_are_dropped_while_draining() {
        let env = TestEnv::new();
        let orch = orchestrator(&env);
        let queue = env.namespace().event_queue_key(ResourceKind::Process);
        env.store
            .rpush(
                &queue,
                &[
                    "not json".to_string(),
                    r#"{"bk_cursor":"1","bk_event_type":"delete","bk_detail":{"bk_biz_id":"x","service_instance_id":3}}"#.to_string(),
                    r#"{"bk_cursor":"2","bk_event_type":"delete","bk_detail":{"bk_biz_id":2,"service_instance_id":3}}"#.to_string(),
                ],
            )
            .await
            .unwrap();

        let events = orch.drain_events(ResourceKind::Process).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].cursor, "2");
        assert_eq!(env.store.llen(&queue).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn templates_only_dirty_when_positive() {
        let env = TestEnv::new();
        let orch = orchestrator(&env);
        let module = |template| ResourceEvent {
            action: EventAction::Delete,
            cursor: String::new(),
            change: ResourceChange::Module {
                biz_id: 2,
                module_id: 2001,
                service_template_id: template,
            },
        };
        let dirty = DirtySets::default();
        orch.classify(ResourceKind::Module, &[module(Some(0)), module(Some(9)), module(None)], &dirty)
            .await;

        let plan = dirty.plan(CacheType::Module);
        assert_eq!(plan.biz_ids, vec![2]);
        assert_eq!(
            plan.deletes,
            vec![
                (cmdbsync_core::keys::MODULE, vec!["2001".to_string()]),
                (cmdbsync_core::keys::SERVICE_TEMPLATE, vec!["9".to_string()]),
            ]
        );
    }
}
