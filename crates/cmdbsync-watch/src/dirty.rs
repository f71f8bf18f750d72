//! Dirty-set accumulation between draining the event queues and applying
//! them.
//!
//! Classification of different resource kinds runs concurrently and
//! writes into one shared [`DirtySets`]; applying reads it back one cache
//! type at a time as a [`CachePlan`].

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};

use cmdbsync_api::TopoNode;
use cmdbsync_core::keys::{
    AGENT_ID, DYNAMIC_GROUP, HOST, MODULE, SERVICE_INSTANCE, SERVICE_TEMPLATE, SET, SET_TEMPLATE,
};
use cmdbsync_core::{CacheType, ResourceEvent, ResourceKind};
use dashmap::{DashMap, DashSet};

#[derive(Debug, Default)]
pub struct DirtySets {
    /// Businesses to refresh, per cache type.
    pub refresh_biz: DashMap<CacheType, DashSet<i64>>,
    pub refresh_business: AtomicBool,

    pub clean_host_keys: DashSet<String>,
    pub clean_agent_ids: DashSet<String>,

    /// Topology nodes to upsert, by `"{obj}|{inst}"`.
    pub refresh_topo_nodes: DashMap<String, TopoNode>,
    pub clean_topo_nodes: DashSet<String>,

    pub clean_set_ids: DashSet<String>,
    pub clean_set_templates: DashSet<String>,
    pub clean_module_ids: DashSet<String>,
    pub clean_service_templates: DashSet<String>,
    pub clean_service_instance_ids: DashSet<String>,
    pub clean_dynamic_group_ids: DashSet<String>,

    /// Delete events replayed through `clean_by_events`, per kind.
    pub delete_events: DashMap<ResourceKind, Vec<ResourceEvent>>,
}

/// Everything one cache type has to do for a cycle.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct CachePlan {
    pub biz_ids: Vec<i64>,
    /// `(index subkey, fields)` deleted unless the refresh rewrote them.
    pub deletes: Vec<(&'static str, Vec<String>)>,
    pub topo_upserts: Vec<TopoNode>,
    pub topo_deletes: Vec<String>,
    pub delete_events: Vec<(ResourceKind, Vec<ResourceEvent>)>,
    pub refresh_all: bool,
}

impl CachePlan {
    pub fn is_empty(&self) -> bool {
        self.biz_ids.is_empty()
            && self.deletes.is_empty()
            && self.topo_upserts.is_empty()
            && self.topo_deletes.is_empty()
            && self.delete_events.is_empty()
            && !self.refresh_all
    }
}

impl DirtySets {
    pub fn mark_biz(&self, cache_type: CacheType, biz_id: i64) {
        self.refresh_biz.entry(cache_type).or_default().insert(biz_id);
    }

    pub fn mark_business(&self) {
        self.refresh_business.store(true, Ordering::Relaxed);
    }

    pub fn push_delete(&self, event: ResourceEvent) {
        self.delete_events
            .entry(event.change.kind())
            .or_default()
            .push(event);
    }

    /// Last write wins between an upsert and a delete of the same node.
    pub fn upsert_topo(&self, node: TopoNode) {
        let key = node.key();
        self.clean_topo_nodes.remove(&key);
        self.refresh_topo_nodes.insert(key, node);
    }

    pub fn delete_topo(&self, key: String) {
        self.refresh_topo_nodes.remove(&key);
        self.clean_topo_nodes.insert(key);
    }

    /// Businesses marked for `cache_type`, ascending.
    pub fn biz_ids(&self, cache_type: CacheType) -> Vec<i64> {
        self.refresh_biz
            .get(&cache_type)
            .map(|set| set.iter().map(|id| *id).collect::<BTreeSet<_>>())
            .unwrap_or_default()
            .into_iter()
            .collect()
    }

    pub fn plan(&self, cache_type: CacheType) -> CachePlan {
        let deletes: Vec<(&'static str, &DashSet<String>)> = match cache_type {
            CacheType::HostTopo => vec![(HOST, &self.clean_host_keys), (AGENT_ID, &self.clean_agent_ids)],
            CacheType::Module => vec![
                (MODULE, &self.clean_module_ids),
                (SERVICE_TEMPLATE, &self.clean_service_templates),
            ],
            CacheType::Set => vec![(SET, &self.clean_set_ids), (SET_TEMPLATE, &self.clean_set_templates)],
            CacheType::ServiceInstance => vec![(SERVICE_INSTANCE, &self.clean_service_instance_ids)],
            CacheType::DynamicGroup => vec![(DYNAMIC_GROUP, &self.clean_dynamic_group_ids)],
            CacheType::Business => Vec::new(),
        };

        let mut plan = CachePlan {
            biz_ids: self.biz_ids(cache_type),
            deletes: deletes
                .into_iter()
                .filter(|(_, set)| !set.is_empty())
                .map(|(index, set)| (index, sorted(set)))
                .collect(),
            refresh_all: cache_type == CacheType::Business
                && self.refresh_business.load(Ordering::Relaxed),
            ..CachePlan::default()
        };

        if cache_type == CacheType::HostTopo {
            let mut nodes: Vec<TopoNode> = self
                .refresh_topo_nodes
                .iter()
                .map(|entry| entry.value().clone())
                .collect();
            nodes.sort_by_key(TopoNode::key);
            plan.topo_upserts = nodes;
            plan.topo_deletes = sorted(&self.clean_topo_nodes);
        }

        for kind in cache_type.resource_kinds() {
            if let Some(events) = self.delete_events.get(&kind) {
                plan.delete_events.push((kind, events.value().clone()));
            }
        }
        plan
    }
}

fn sorted(set: &DashSet<String>) -> Vec<String> {
    let mut fields: Vec<String> = set.iter().map(|field| field.key().clone()).collect();
    fields.sort();
    fields
}

#[cfg(test)]
mod tests {
    use super::*;
    use cmdbsync_core::{EventAction, ResourceChange};

    fn node(obj: &str, inst: i64) -> TopoNode {
        TopoNode {
            bk_inst_id: inst,
            bk_inst_name: format!("{obj}-{inst}"),
            bk_obj_id: obj.into(),
            bk_obj_name: obj.into(),
        }
    }

    #[test]
    fn plans_only_carry_their_own_cache_type() {
        let dirty = DirtySets::default();
        dirty.mark_biz(CacheType::Module, 3);
        dirty.mark_biz(CacheType::Module, 2);
        dirty.mark_biz(CacheType::Module, 3);
        dirty.clean_module_ids.insert("2001".into());
        dirty.clean_set_ids.insert("3001".into());

        let module = dirty.plan(CacheType::Module);
        assert_eq!(module.biz_ids, vec![2, 3]);
        assert_eq!(module.deletes, vec![(MODULE, vec!["2001".to_string()])]);
        assert!(!module.refresh_all);

        let set = dirty.plan(CacheType::Set);
        assert!(set.biz_ids.is_empty());
        assert_eq!(set.deletes, vec![(SET, vec!["3001".to_string()])]);

        assert!(dirty.plan(CacheType::DynamicGroup).is_empty());
    }

    #[test]
    fn topo_upsert_and_delete_last_write_wins() {
        let dirty = DirtySets::default();
        dirty.upsert_topo(node("rack", 7));
        dirty.delete_topo("rack|7".into());
        dirty.delete_topo("rack|8".into());
        dirty.upsert_topo(node("rack", 8));

        let plan = dirty.plan(CacheType::HostTopo);
        assert_eq!(plan.topo_upserts, vec![node("rack", 8)]);
        assert_eq!(plan.topo_deletes, vec!["rack|7".to_string()]);
    }

    #[test]
    fn delete_events_follow_their_cache_type() {
        let dirty = DirtySets::default();
        dirty.push_delete(ResourceEvent {
            action: EventAction::Delete,
            cursor: String::new(),
            change: ResourceChange::Process {
                biz_id: 2,
                service_instance_id: 9,
            },
        });
        dirty.mark_business();

        let plan = dirty.plan(CacheType::ServiceInstance);
        assert_eq!(plan.delete_events.len(), 1);
        assert_eq!(plan.delete_events[0].0, ResourceKind::Process);
        assert!(dirty.plan(CacheType::HostTopo).delete_events.is_empty());
        assert!(dirty.plan(CacheType::Business).refresh_all);
    }
}
