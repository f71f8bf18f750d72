//! Host and topology cache.
//!
//! One business refresh writes four tables in parallel: the topology node
//! table, hosts by composite key and id, agent ids, and the host relation
//! slot of the business. Inner ips are accumulated in memory across the
//! per-business pass and written once by `refresh_global`.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use cmdbsync_api::types::{BizHostTopo, CloudArea, TopoInstance};
use cmdbsync_api::{TopoNode, fetch_all_pages};
use cmdbsync_core::keys::{AGENT_ID, HOST, HOST_IP, TOPO};
use cmdbsync_core::{CacheType, ResourceChange, ResourceEvent, ResourceKind};
use cmdbsync_relation::{Labels, RelationInfo, RelationItem, RelationKind};
use cmdbsync_state::{BATCH_SIZE, CACHE_EXPIRY, HashCache};
use tracing::{debug, info, warn};

use crate::context::CacheContext;
use crate::entities::{HostInfo, composite_key, expand_labels};
use crate::error::{CacheError, CacheResult};
use crate::manager::CacheManager;

/// Cloud areas are few; one page of this size covers them.
const CLOUD_AREA_PAGE: usize = 1000;

/// Inner ip fields longer than this hold several addresses and get no
/// system node.
const MAX_SYSTEM_IP_LEN: usize = 50;

pub struct HostTopoManager {
    ctx: CacheContext,
    cache: HashCache,
    host_key: String,
    agent_key: String,
    host_ip_key: String,
    topo_key: String,
    /// inner ip -> composite keys, filled by the per-business pass.
    host_ips: Mutex<BTreeMap<String, BTreeSet<String>>>,
}

impl HostTopoManager {
    pub fn new(ctx: CacheContext) -> Self {
        let host_key = ctx.key(HOST);
        let agent_key = ctx.key(AGENT_ID);
        let host_ip_key = ctx.key(HOST_IP);
        let topo_key = ctx.key(TOPO);
        let cache = HashCache::new(
            ctx.store.clone(),
            [&host_key, &agent_key, &host_ip_key, &topo_key].map(|k| k.clone()),
        );
        Self {
            ctx,
            cache,
            host_key,
            agent_key,
            host_ip_key,
            topo_key,
            host_ips: Mutex::new(BTreeMap::new()),
        }
    }

    /// Hosts of one business with cloud names and topology links filled
    /// in, plus the topology tree they hang from.
    async fn load_biz(&self, biz_id: i64) -> CacheResult<(Vec<HostInfo>, Option<TopoInstance>)> {
        let cmdb = self.ctx.cmdb()?;
        let page_size = self.ctx.page_size;
        let (rows, clouds, tree) = tokio::try_join!(
            fetch_all_pages(page_size, |page| cmdb.list_biz_hosts_topo(biz_id, page)),
            fetch_all_pages(CLOUD_AREA_PAGE, |page| cmdb.search_cloud_area(page)),
            cmdb.search_biz_inst_topo(biz_id),
        )?;

        let root = match tree.into_iter().next() {
            Some(mut root) => {
                let internal = cmdb.get_biz_internal_module(biz_id).await?;
                if internal.bk_set_id != 0 || !internal.module.is_empty() {
                    root.child.push(internal.to_instance());
                }
                Some(root)
            }
            None => None,
        };

        let links = root.as_ref().map(TopoInstance::module_links).unwrap_or_default();
        let hosts = build_hosts(&rows, biz_id, &clouds, &links);
        Ok((hosts, root))
    }

    async fn write_topo(&self, root: Option<&TopoInstance>) -> CacheResult<()> {
        let Some(root) = root else {
            return Ok(());
        };
        let mut fields = Vec::new();
        let mut failed = None;
        root.traverse(&mut |inst| {
            let node = inst.node();
            match serde_json::to_string(&node) {
                Ok(value) => fields.push((node.key(), value)),
                Err(e) => failed = Some(e),
            }
        });
        if let Some(e) = failed {
            return Err(e.into());
        }
        self.cache.update_hash_map(&self.topo_key, fields).await?;
        Ok(())
    }

    async fn write_hosts(&self, hosts: &[HostInfo]) -> CacheResult<()> {
        let mut fields = Vec::with_capacity(hosts.len() * 2);
        for host in hosts {
            let value = serde_json::to_string(host)?;
            if let Some(key) = host.composite_key() {
                fields.push((key, value.clone()));
            }
            if host.bk_host_id > 0 {
                fields.push((host.id_key(), value));
            }
        }
        self.cache.update_hash_map(&self.host_key, fields).await?;
        Ok(())
    }

    async fn write_agents(&self, hosts: &[HostInfo]) -> CacheResult<()> {
        let fields = hosts
            .iter()
            .filter(|h| !h.bk_agent_id.is_empty())
            .map(|h| (h.bk_agent_id.clone(), h.id_key()))
            .collect();
        self.cache.update_hash_map(&self.agent_key, fields).await?;
        Ok(())
    }

    fn record_ips(&self, hosts: &[HostInfo]) {
        let mut ips = self.host_ips.lock().unwrap_or_else(PoisonError::into_inner);
        for host in hosts {
            if let Some(key) = host.composite_key() {
                ips.entry(host.bk_host_innerip.clone()).or_default().insert(key);
            }
        }
    }

    /// Cached hosts for the given fields, skipping misses and undecodable values.
    async fn cached_hosts(&self, fields: &[String]) -> CacheResult<Vec<(String, HostInfo)>> {
        let mut hosts = Vec::new();
        for chunk in fields.chunks(BATCH_SIZE) {
            let values = self.ctx.store.hmget(&self.host_key, chunk).await?;
            for (field, value) in chunk.iter().zip(values) {
                let Some(value) = value else { continue };
                match serde_json::from_str::<HostInfo>(&value) {
                    Ok(host) => hosts.push((field.clone(), host)),
                    Err(e) => debug!(%field, error = %e, "cached host undecodable"),
                }
            }
        }
        Ok(hosts)
    }

    async fn clean_hosts(&self, events: &[ResourceEvent]) -> CacheResult<()> {
        let mut host_keys = BTreeSet::new();
        let mut agent_ids = BTreeSet::new();
        let mut host_ids = BTreeSet::new();
        for event in events.iter().filter(|e| e.is_delete()) {
            let ResourceChange::Host {
                host_id,
                inner_ip,
                cloud_id,
                agent_id,
            } = &event.change
            else {
                continue;
            };
            host_keys.insert(host_id.to_string());
            host_ids.insert(*host_id);
            if let Some(key) = inner_ip.as_deref().and_then(|ip| composite_key(ip, *cloud_id)) {
                host_keys.insert(key);
            }
            if let Some(agent) = agent_id.as_deref().filter(|a| !a.is_empty()) {
                agent_ids.insert(agent.to_string());
            }
        }
        if host_keys.is_empty() {
            return Ok(());
        }

        // The cached snapshot may know an older ip or agent than the event.
        let lookup: Vec<String> = host_keys.iter().cloned().collect();
        let mut retracted = BTreeSet::new();
        for (field, host) in self.cached_hosts(&lookup).await? {
            // An ip may already belong to another host.
            if !host_ids.contains(&host.bk_host_id) {
                host_keys.remove(&field);
                continue;
            }
            if let Some(key) = host.composite_key() {
                host_keys.insert(key);
            }
            if !host.bk_agent_id.is_empty() {
                agent_ids.insert(host.bk_agent_id.clone());
            }
            if retracted.insert(host.bk_host_id) {
                self.ctx
                    .relations
                    .clear_resource_with_id(host.bk_biz_id, &RelationKind::Host, &host.id_key())
                    .await;
            }
        }
        for host_id in host_ids.difference(&retracted) {
            self.ctx
                .relations
                .clear_resource_everywhere(&RelationKind::Host, &host_id.to_string())
                .await;
        }

        let host_keys: Vec<String> = host_keys.into_iter().collect();
        let agent_ids: Vec<String> = agent_ids.into_iter().collect();
        self.cache.delete_fields(&self.host_key, &host_keys).await?;
        if !agent_ids.is_empty() {
            self.cache.delete_fields(&self.agent_key, &agent_ids).await?;
        }
        info!(hosts = host_keys.len(), agents = agent_ids.len(), "host cache cleaned by events");
        Ok(())
    }
}

fn build_hosts(
    rows: &[BizHostTopo],
    biz_id: i64,
    clouds: &[CloudArea],
    links: &BTreeMap<i64, Vec<TopoNode>>,
) -> Vec<HostInfo> {
    let cloud_names: BTreeMap<i64, &str> = clouds
        .iter()
        .map(|c| (c.bk_cloud_id, c.bk_cloud_name.as_str()))
        .collect();
    rows.iter()
        .map(|row| {
            let mut host = HostInfo::from_row(row, biz_id);
            host.bk_cloud_name = cloud_names
                .get(&host.bk_cloud_id)
                .map(|name| name.to_string())
                .unwrap_or_else(|| host.bk_cloud_id.to_string());
            for module_id in &host.bk_module_ids {
                if let Some(link) = links.get(module_id) {
                    host.topo_link.insert(format!("module|{module_id}"), link.clone());
                }
            }
            host
        })
        .collect()
}

fn topo_item(node: &TopoNode) -> RelationItem {
    RelationItem::new(RelationKind::from_topo_obj(&node.bk_obj_id), node.bk_inst_id.to_string())
}

/// Relation infos of a business's hosts.
///
/// Each host contributes the chain `[agent?, system?, module, set, ..., biz]`
/// once per topology link, filed under the host id. A host with neither an
/// agent nor a usable ip is represented by its host node. Host expand
/// labels become a separate info on the host node.
pub fn host_relation_infos(hosts: &[HostInfo]) -> Vec<RelationInfo> {
    let mut infos = Vec::with_capacity(hosts.len());
    for host in hosts {
        let host_id = host.id_key();
        let mut head = Vec::with_capacity(2);
        if !host.bk_agent_id.is_empty() {
            head.push(RelationItem::new(RelationKind::Agent, host.bk_agent_id.clone()));
        }
        let ip = &host.bk_host_innerip;
        if !ip.is_empty() && !ip.contains(',') && ip.len() < MAX_SYSTEM_IP_LEN {
            head.push(RelationItem::system(ip.clone(), host.bk_cloud_id));
        }
        if head.is_empty() {
            head.push(RelationItem::new(RelationKind::Host, host_id.clone()));
        }

        let rest = head.split_off(1);
        let mut info = RelationInfo::new(host_id.clone(), head.remove(0));
        if host.topo_link.is_empty() {
            if !rest.is_empty() {
                info = info.with_link(rest);
            }
        } else {
            for chain in host.topo_link.values() {
                let mut link = rest.clone();
                link.extend(chain.iter().map(topo_item));
                info = info.with_link(link);
            }
        }
        infos.push(info);

        if let Some(expand) = host.expands.get("host").filter(|e| !e.is_empty()) {
            let mut labels: Labels = expand_labels(expand);
            labels.insert("host_name".to_string(), host.bk_host_name.clone());
            let mut expands = BTreeMap::new();
            expands.insert("host".to_string(), labels);
            infos.push(
                RelationInfo::new(host_id.clone(), RelationItem::new(RelationKind::Host, host_id))
                    .with_expands(expands),
            );
        }
    }
    infos
}

fn mainline_nodes(events: &[ResourceEvent], deleted: bool) -> Vec<TopoNode> {
    events
        .iter()
        .filter(|e| e.is_delete() == deleted)
        .filter_map(|e| match &e.change {
            ResourceChange::MainlineInstance {
                obj_id,
                inst_id,
                obj_name,
                inst_name,
            } => Some(TopoNode {
                bk_inst_id: *inst_id,
                bk_inst_name: inst_name.clone(),
                bk_obj_id: obj_id.clone(),
                bk_obj_name: obj_name.clone(),
            }),
            _ => None,
        })
        .collect()
}

#[async_trait]
impl CacheManager for HostTopoManager {
    fn cache_type(&self) -> CacheType {
        CacheType::HostTopo
    }

    fn context(&self) -> &CacheContext {
        &self.ctx
    }

    fn cache(&self) -> &HashCache {
        &self.cache
    }

    async fn refresh_by_biz(&self, biz_id: i64) -> CacheResult<()> {
        if biz_id == self.ctx.resource_pool_biz {
            return Ok(());
        }
        let (hosts, root) = self.load_biz(biz_id).await?;
        self.record_ips(&hosts);

        let relations = async {
            let infos = host_relation_infos(&hosts);
            self.ctx
                .relations
                .build_infos_cache(biz_id, RelationKind::Host, infos)
                .await;
            Ok::<(), CacheError>(())
        };
        let (topo, host, agent, relation) = tokio::join!(
            self.write_topo(root.as_ref()),
            self.write_hosts(&hosts),
            self.write_agents(&hosts),
            relations,
        );
        topo.and(host).and(agent).and(relation)?;

        debug!(biz_id, hosts = hosts.len(), "host cache refreshed for business");
        Ok(())
    }

    async fn refresh_global(&self) -> CacheResult<()> {
        let fields = {
            let ips = self.host_ips.lock().unwrap_or_else(PoisonError::into_inner);
            ips.iter()
                .map(|(ip, keys)| Ok((ip.clone(), serde_json::to_string(keys)?)))
                .collect::<CacheResult<Vec<_>>>()?
        };
        let ips = fields.len();
        self.cache.update_hash_map(&self.host_ip_key, fields).await?;
        self.cache.expire_all(CACHE_EXPIRY).await?;
        info!(ips, "host ip index refreshed");
        Ok(())
    }

    fn reset(&self) {
        self.cache.reset_all();
        self.host_ips
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    async fn update_by_events(&self, kind: ResourceKind, events: &[ResourceEvent]) -> CacheResult<()> {
        if kind != ResourceKind::MainlineInstance {
            return Ok(());
        }
        let nodes = mainline_nodes(events, false);
        if nodes.is_empty() {
            return Ok(());
        }
        let fields = nodes
            .iter()
            .map(|node| Ok((node.key(), serde_json::to_string(node)?)))
            .collect::<CacheResult<Vec<_>>>()?;
        self.cache.update_hash_map(&self.topo_key, fields).await?;
        Ok(())
    }

    async fn clean_by_events(&self, kind: ResourceKind, events: &[ResourceEvent]) -> CacheResult<()> {
        match kind {
            ResourceKind::Host => self.clean_hosts(events).await,
            ResourceKind::MainlineInstance => {
                let keys: Vec<String> = mainline_nodes(events, true).iter().map(TopoNode::key).collect();
                if !keys.is_empty() {
                    self.cache.delete_fields(&self.topo_key, &keys).await?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn build_relation_metrics(&self) -> CacheResult<()> {
        let mut by_biz: BTreeMap<i64, Vec<HostInfo>> = BTreeMap::new();
        for (field, value) in self.cache.scan_all(&self.host_key, "*", BATCH_SIZE).await? {
            // Every host is stored under its id as well; only read those.
            if field.parse::<i64>().is_err() {
                continue;
            }
            match serde_json::from_str::<HostInfo>(&value) {
                Ok(host) => by_biz.entry(host.bk_biz_id).or_default().push(host),
                Err(e) => warn!(%field, error = %e, "cached host undecodable"),
            }
        }
        for (biz_id, hosts) in by_biz {
            self.ctx
                .relations
                .build_infos_cache(biz_id, RelationKind::Host, host_relation_infos(&hosts))
                .await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::refresh_all;
    use crate::test_support::{TestEnv, biz_topo, host_row, record, seed_relation_fixture};
    use cmdbsync_api::types::{InternalModule, InternalModuleSet};
    use cmdbsync_core::EventAction;
    use cmdbsync_state::KvStore;
    use serde_json::json;
    use std::sync::Arc;

    async fn sorted_keys(env: &TestEnv, subkey: &str) -> Vec<String> {
        let mut keys = env.store.hkeys(&env.key(subkey)).await.unwrap();
        keys.sort();
        keys
    }

    #[tokio::test]
    async fn refresh_writes_tables_and_relations() {
        let env = TestEnv::new();
        seed_relation_fixture(&env.cmdb, 2);
        let manager = HostTopoManager::new(env.ctx());
        manager.refresh_by_biz(2).await.unwrap();

        assert_eq!(sorted_keys(&env, HOST).await, vec!["1001", "1002", "1003"]);
        assert_eq!(sorted_keys(&env, AGENT_ID).await, vec!["1001", "1002", "1003"]);
        assert_eq!(
            env.store.hget(&env.key(AGENT_ID), "1002").await.unwrap().as_deref(),
            Some("1002")
        );
        let topo = sorted_keys(&env, TOPO).await;
        assert!(topo.contains(&"biz|2".to_string()));
        assert!(topo.contains(&"set|3001".to_string()));
        assert!(topo.contains(&"module|2003".to_string()));

        let raw = env.store.hget(&env.key(HOST), "1001").await.unwrap().unwrap();
        let host: HostInfo = serde_json::from_str(&raw).unwrap();
        assert_eq!(host.bk_biz_id, 2);
        assert_eq!(host.bk_cloud_name, "0");
        let chain: Vec<String> = host.topo_link["module|2001"].iter().map(TopoNode::key).collect();
        assert_eq!(chain, vec!["module|2001", "set|3001", "biz|2"]);

        assert_eq!(
            env.relations.sort_string().await,
            [
                r#"agent_with_module_relation{agent_id="1001",module_id="2001"} 1"#,
                r#"agent_with_module_relation{agent_id="1001",module_id="2002"} 1"#,
                r#"agent_with_module_relation{agent_id="1002",module_id="2001"} 1"#,
                r#"agent_with_module_relation{agent_id="1003",module_id="2003"} 1"#,
                r#"business_with_set_relation{biz_id="2",set_id="3001"} 1"#,
                r#"business_with_set_relation{biz_id="2",set_id="3002"} 1"#,
                r#"module_with_set_relation{module_id="2001",set_id="3001"} 1"#,
                r#"module_with_set_relation{module_id="2002",set_id="3001"} 1"#,
                r#"module_with_set_relation{module_id="2003",set_id="3002"} 1"#,
            ]
            .join("\n")
        );
    }

    #[tokio::test]
    async fn refresh_is_idempotent() {
        let env = TestEnv::new();
        seed_relation_fixture(&env.cmdb, 2);
        let manager = HostTopoManager::new(env.ctx());

        manager.refresh_by_biz(2).await.unwrap();
        let first = env.store.hget(&env.key(HOST), "1001").await.unwrap();
        let relations = env.relations.sort_string().await;
        manager.refresh_by_biz(2).await.unwrap();

        assert_eq!(env.store.hget(&env.key(HOST), "1001").await.unwrap(), first);
        assert_eq!(sorted_keys(&env, HOST).await, vec!["1001", "1002", "1003"]);
        assert_eq!(env.relations.sort_string().await, relations);
    }

    #[tokio::test]
    async fn resource_pool_is_skipped() {
        let env = TestEnv::new();
        seed_relation_fixture(&env.cmdb, 1);
        let manager = HostTopoManager::new(env.ctx());
        manager.refresh_by_biz(1).await.unwrap();

        assert!(env.cmdb.read(|s| s.calls.is_empty()));
        assert!(env.store.hkeys(&env.key(HOST)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn internal_modules_join_the_tree() {
        let env = TestEnv::new();
        env.cmdb.update(|s| {
            s.topo.insert(2, vec![biz_topo(2)]);
            s.internal_modules.insert(
                2,
                InternalModuleSet {
                    bk_set_id: 3999,
                    bk_set_name: "idle pool".into(),
                    module: vec![InternalModule {
                        bk_module_id: 2999,
                        bk_module_name: "idle".into(),
                    }],
                },
            );
            s.hosts.insert(2, vec![host_row(1005, "", "", &[(3999, 2999)])]);
        });
        let manager = HostTopoManager::new(env.ctx());
        manager.refresh_by_biz(2).await.unwrap();

        assert!(sorted_keys(&env, TOPO).await.contains(&"module|2999".to_string()));
        let out = env.relations.sort_string().await;
        assert!(out.contains(r#"host_with_module_relation{host_id="1005",module_id="2999"} 1"#));
        assert!(out.contains(r#"business_with_set_relation{biz_id="2",set_id="3999"} 1"#));
    }

    #[tokio::test]
    async fn full_refresh_writes_ip_index_and_drops_stale_hosts() {
        let env = TestEnv::new();
        env.cmdb.update(|s| {
            s.businesses = vec![record(json!({"bk_biz_id": 2}))];
            s.topo.insert(2, vec![biz_topo(2)]);
            s.hosts.insert(
                2,
                vec![
                    host_row(1001, "127.0.0.1", "a1", &[(3001, 2001)]),
                    host_row(1002, "127.0.0.2", "a2", &[(3001, 2001)]),
                ],
            );
        });
        let manager = Arc::new(HostTopoManager::new(env.ctx()));
        refresh_all(manager.clone()).await.unwrap();

        assert_eq!(
            sorted_keys(&env, HOST).await,
            vec!["1001", "1002", "127.0.0.1|0", "127.0.0.2|0"]
        );
        let ips = env.store.hget(&env.key(HOST_IP), "127.0.0.1").await.unwrap().unwrap();
        assert_eq!(ips, r#"["127.0.0.1|0"]"#);
        let out = env.relations.sort_string().await;
        assert!(out.contains(r#"agent_with_system_relation{agent_id="a1",bk_cloud_id="0",bk_target_ip="127.0.0.1"} 1"#));
        assert!(out.contains(r#"module_with_system_relation{bk_cloud_id="0",bk_target_ip="127.0.0.1",module_id="2001"} 1"#));

        env.cmdb.update(|s| {
            s.hosts.insert(2, vec![host_row(1001, "127.0.0.1", "a1", &[(3001, 2001)])]);
        });
        refresh_all(manager).await.unwrap();
        assert_eq!(sorted_keys(&env, HOST).await, vec!["1001", "127.0.0.1|0"]);
        assert_eq!(sorted_keys(&env, AGENT_ID).await, vec!["a1"]);
        assert_eq!(sorted_keys(&env, HOST_IP).await, vec!["127.0.0.1"]);
    }

    #[tokio::test]
    async fn failed_business_keeps_its_entries_through_full_refresh() {
        let env = TestEnv::new();
        env.cmdb.update(|s| {
            s.businesses = vec![record(json!({"bk_biz_id": 2})), record(json!({"bk_biz_id": 3}))];
            s.topo.insert(2, vec![biz_topo(2)]);
            s.topo.insert(3, vec![biz_topo(3)]);
            s.hosts.insert(2, vec![host_row(1001, "127.0.0.1", "a1", &[(3001, 2001)])]);
            s.hosts.insert(3, vec![host_row(1101, "127.0.0.3", "a3", &[(3001, 2001)])]);
        });
        let manager = Arc::new(HostTopoManager::new(env.ctx()));
        refresh_all(manager.clone()).await.unwrap();
        let populated = vec!["1001", "1101", "127.0.0.1|0", "127.0.0.3|0"];
        assert_eq!(sorted_keys(&env, HOST).await, populated);

        env.cmdb.update(|s| {
            s.failing_biz.insert(3);
        });
        let err = refresh_all(manager.clone()).await.unwrap_err();
        assert!(matches!(
            err,
            CacheError::PartialRefresh {
                failed: 1,
                total: 2,
                ..
            }
        ));
        assert_eq!(sorted_keys(&env, HOST).await, populated);
        assert_eq!(sorted_keys(&env, AGENT_ID).await, vec!["a1", "a3"]);
        assert_eq!(sorted_keys(&env, HOST_IP).await, vec!["127.0.0.1", "127.0.0.3"]);

        // Once business 3 answers again its departed host is reconciled away.
        env.cmdb.update(|s| {
            s.failing_biz.clear();
            s.hosts.insert(3, Vec::new());
        });
        refresh_all(manager).await.unwrap();
        assert_eq!(sorted_keys(&env, HOST).await, vec!["1001", "127.0.0.1|0"]);
        assert_eq!(sorted_keys(&env, HOST_IP).await, vec!["127.0.0.1"]);
    }

    #[tokio::test]
    async fn host_delete_events_clean_keys_and_relations() {
        let env = TestEnv::new();
        env.cmdb.update(|s| {
            s.topo.insert(2, vec![biz_topo(2)]);
            s.hosts.insert(
                2,
                vec![
                    host_row(1001, "127.0.0.1", "a1", &[(3001, 2001)]),
                    host_row(1002, "127.0.0.2", "a2", &[(3001, 2002)]),
                ],
            );
        });
        let manager = HostTopoManager::new(env.ctx());
        manager.refresh_by_biz(2).await.unwrap();

        // The event carries an ip the cache no longer agrees with.
        let event = ResourceEvent {
            action: EventAction::Delete,
            cursor: "9".into(),
            change: ResourceChange::Host {
                host_id: 1001,
                inner_ip: Some("10.0.0.9".into()),
                cloud_id: 0,
                agent_id: None,
            },
        };
        manager.clean_by_events(ResourceKind::Host, &[event]).await.unwrap();

        assert_eq!(sorted_keys(&env, HOST).await, vec!["1002", "127.0.0.2|0"]);
        assert_eq!(sorted_keys(&env, AGENT_ID).await, vec!["a2"]);
        let out = env.relations.string().await;
        assert!(!out.contains("a1"));
        assert!(out.contains("a2"));
    }

    #[tokio::test]
    async fn mainline_events_upsert_and_delete_nodes() {
        let env = TestEnv::new();
        let manager = HostTopoManager::new(env.ctx());
        let event = |action, inst_id| ResourceEvent {
            action,
            cursor: String::new(),
            change: ResourceChange::MainlineInstance {
                obj_id: "region".into(),
                inst_id,
                obj_name: "Region".into(),
                inst_name: format!("region-{inst_id}"),
            },
        };

        manager
            .update_by_events(
                ResourceKind::MainlineInstance,
                &[event(EventAction::Create, 7), event(EventAction::Update, 8)],
            )
            .await
            .unwrap();
        let raw = env.store.hget(&env.key(TOPO), "region|7").await.unwrap().unwrap();
        let node: TopoNode = serde_json::from_str(&raw).unwrap();
        assert_eq!(node.bk_inst_name, "region-7");

        manager
            .clean_by_events(ResourceKind::MainlineInstance, &[event(EventAction::Delete, 7)])
            .await
            .unwrap();
        assert_eq!(sorted_keys(&env, TOPO).await, vec!["region|8"]);
    }

    #[tokio::test]
    async fn relations_rebuild_from_cache() {
        let env = TestEnv::new();
        seed_relation_fixture(&env.cmdb, 2);
        let manager = HostTopoManager::new(env.ctx());
        manager.refresh_by_biz(2).await.unwrap();
        let expected = env.relations.sort_string().await;

        env.relations.clear_all().await;
        manager.build_relation_metrics().await.unwrap();
        assert_eq!(env.relations.sort_string().await, expected);
    }

    #[test]
    fn relation_chain_prefers_agent_then_system() {
        let mut host = HostInfo {
            bk_host_id: 7,
            bk_agent_id: "ag".into(),
            bk_host_innerip: "10.0.0.1,10.0.0.2".into(),
            ..HostInfo::default()
        };
        let infos = host_relation_infos(std::slice::from_ref(&host));
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].node.kind, RelationKind::Agent);
        assert!(infos[0].links.is_empty());

        host.bk_host_innerip = "10.0.0.1".into();
        let infos = host_relation_infos(std::slice::from_ref(&host));
        assert_eq!(infos[0].links, vec![vec![RelationItem::system("10.0.0.1", 0)]]);
        assert_eq!(infos[0].id, "7");
    }

    #[test]
    fn host_expands_get_their_own_info() {
        let mut expand = serde_json::Map::new();
        expand.insert("version".into(), json!("1.2"));
        let mut host = HostInfo {
            bk_host_id: 7,
            bk_host_name: "web".into(),
            ..HostInfo::default()
        };
        host.expands.insert("host".into(), expand);

        let infos = host_relation_infos(&[host]);
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[1].expands["host"]["version"], "1.2");
        assert_eq!(infos[1].expands["host"]["host_name"], "web");
    }
}
