//! RelationMetricsBuilder: per-business relation infos and their rendering.

use std::collections::BTreeMap;

use indexmap::{IndexMap, IndexSet};
use tokio::sync::RwLock;
use tracing::debug;

use crate::pool::NodePool;
use crate::render::{edge_line, info_line};
use crate::types::{RelationInfo, RelationKind};

type KindSlots = IndexMap<RelationKind, IndexMap<String, Vec<RelationInfo>>>;

/// Holds what each resource contributed to the graph, keyed by business,
/// resource kind and entity id. Rebuilding a (business, kind) slot
/// replaces everything that slot held before.
#[derive(Default)]
pub struct RelationMetricsBuilder {
    slots: RwLock<BTreeMap<i64, KindSlots>>,
    pool: NodePool,
}

impl RelationMetricsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the infos of `kind` for one business.
    pub async fn build_infos_cache(&self, biz_id: i64, kind: RelationKind, infos: Vec<RelationInfo>) {
        let mut by_entity: IndexMap<String, Vec<RelationInfo>> = IndexMap::new();
        for info in infos {
            by_entity.entry(info.id.clone()).or_default().push(info);
        }
        let count = by_entity.len();
        let mut slots = self.slots.write().await;
        slots.entry(biz_id).or_default().insert(kind.clone(), by_entity);
        debug!(biz_id, kind = %kind, entities = count, "relation infos rebuilt");
    }

    /// Retract one entity's contribution. Returns whether anything was held.
    pub async fn clear_resource_with_id(&self, biz_id: i64, kind: &RelationKind, id: &str) -> bool {
        let mut slots = self.slots.write().await;
        slots
            .get_mut(&biz_id)
            .and_then(|kinds| kinds.get_mut(kind))
            .and_then(|entities| entities.shift_remove(id))
            .is_some()
    }

    /// Retract an entity from whichever business holds it.
    pub async fn clear_resource_everywhere(&self, kind: &RelationKind, id: &str) -> usize {
        let mut slots = self.slots.write().await;
        let mut removed = 0;
        for entities in slots.values_mut().filter_map(|kinds| kinds.get_mut(kind)) {
            if entities.shift_remove(id).is_some() {
                removed += 1;
            }
        }
        removed
    }

    pub async fn clear_biz(&self, biz_id: i64) {
        self.slots.write().await.remove(&biz_id);
    }

    pub async fn clear_all(&self) {
        self.slots.write().await.clear();
    }

    /// Rendered lines in insertion order, without duplicates.
    pub async fn metrics(&self) -> Vec<String> {
        let slots = self.slots.read().await;
        let mut lines = IndexSet::new();
        for kinds in slots.values() {
            for entities in kinds.values() {
                for info in entities.values().flatten() {
                    self.render_info(info, &mut lines);
                }
            }
        }
        lines.into_iter().collect()
    }

    pub async fn string(&self) -> String {
        self.metrics().await.join("\n")
    }

    pub async fn sort_string(&self) -> String {
        let mut lines = self.metrics().await;
        lines.sort();
        lines.join("\n")
    }

    fn render_info(&self, info: &RelationInfo, lines: &mut IndexSet<String>) {
        for link in &info.links {
            let mut chain = self.pool.acquire();
            chain.push(info.node.clone());
            chain.extend(link.iter().cloned());
            for pair in chain.windows(2) {
                lines.insert(edge_line(&pair[0], &pair[1]));
            }
        }
        if let Some(expands) = info
            .expands
            .get(info.node.kind.name())
            .filter(|e| !e.is_empty())
        {
            lines.insert(info_line(&info.node, expands));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Labels, RelationItem};

    fn host_with_agent(host_id: &str, agent_id: &str, module: &str, set: &str, biz: &str) -> RelationInfo {
        RelationInfo::new(host_id, RelationItem::new(RelationKind::Agent, agent_id)).with_link(vec![
            RelationItem::new(RelationKind::Module, module),
            RelationItem::new(RelationKind::Set, set),
            RelationItem::new(RelationKind::Business, biz),
        ])
    }

    #[tokio::test]
    async fn agent_chain_renders_sorted() {
        let builder = RelationMetricsBuilder::new();
        builder
            .build_infos_cache(2, RelationKind::Host, vec![host_with_agent("1001", "1001", "2001", "3001", "2")])
            .await;

        let out = builder.sort_string().await;
        assert_eq!(
            out,
            [
                r#"agent_with_module_relation{agent_id="1001",module_id="2001"} 1"#,
                r#"business_with_set_relation{biz_id="2",set_id="3001"} 1"#,
                r#"module_with_set_relation{module_id="2001",set_id="3001"} 1"#,
            ]
            .join("\n")
        );
    }

    #[tokio::test]
    async fn rebuild_replaces_slot() {
        let builder = RelationMetricsBuilder::new();
        let info = |host: &str, ip: &str| {
            RelationInfo::new(host, RelationItem::new(RelationKind::Host, host))
                .with_link(vec![RelationItem::system(ip, 3)])
        };
        builder
            .build_infos_cache(2, RelationKind::Host, vec![info("1001", "127.0.0.1"), info("1002", "127.0.0.2")])
            .await;
        builder
            .build_infos_cache(2, RelationKind::Host, vec![info("1001", "127.0.0.4")])
            .await;
        builder
            .build_infos_cache(3, RelationKind::Host, vec![info("31001", "127.1.0.1")])
            .await;

        assert_eq!(
            builder.sort_string().await,
            [
                r#"host_with_system_relation{bk_cloud_id="3",bk_target_ip="127.0.0.4",host_id="1001"} 1"#,
                r#"host_with_system_relation{bk_cloud_id="3",bk_target_ip="127.1.0.1",host_id="31001"} 1"#,
            ]
            .join("\n")
        );
    }

    #[tokio::test]
    async fn clear_resource_retracts_entity() {
        let builder = RelationMetricsBuilder::new();
        builder
            .build_infos_cache(
                2,
                RelationKind::Host,
                vec![
                    host_with_agent("1001", "a1", "2001", "3001", "2"),
                    host_with_agent("1002", "a2", "2002", "3001", "2"),
                ],
            )
            .await;
        assert!(builder.clear_resource_with_id(2, &RelationKind::Host, "1001").await);
        assert!(!builder.clear_resource_with_id(2, &RelationKind::Host, "1001").await);

        let lines = builder.metrics().await;
        assert!(lines.iter().all(|l| !l.contains("a1")));
        // The shared set -> biz edge is still contributed by 1002.
        assert!(lines.contains(&r#"business_with_set_relation{biz_id="2",set_id="3001"} 1"#.to_string()));
        assert_eq!(lines.len(), 3);
    }

    #[tokio::test]
    async fn lines_are_deduplicated_in_insertion_order() {
        let builder = RelationMetricsBuilder::new();
        builder
            .build_infos_cache(
                2,
                RelationKind::Host,
                vec![
                    host_with_agent("1001", "a1", "2001", "3001", "2"),
                    host_with_agent("1002", "a2", "2001", "3001", "2"),
                ],
            )
            .await;
        let lines = builder.metrics().await;
        assert_eq!(lines[0], r#"agent_with_module_relation{agent_id="a1",module_id="2001"} 1"#);
        assert_eq!(lines[1], r#"module_with_set_relation{module_id="2001",set_id="3001"} 1"#);
        assert_eq!(lines.len(), 4);
        assert_eq!(builder.string().await, lines.join("\n"));
    }

    #[tokio::test]
    async fn expands_emit_info_line() {
        let builder = RelationMetricsBuilder::new();
        let mut expand = Labels::new();
        expand.insert("version".into(), "v\"1".into());
        let mut expands = BTreeMap::new();
        expands.insert("host".to_string(), expand);
        expands.insert("module".to_string(), Labels::new());
        let info = RelationInfo::new("1001", RelationItem::new(RelationKind::Host, "1001")).with_expands(expands);
        builder.build_infos_cache(2, RelationKind::Host, vec![info]).await;

        assert_eq!(
            builder.metrics().await,
            vec![r#"host_info_relation{host_id="1001",version="v\"1"} 1"#.to_string()]
        );
    }

    #[tokio::test]
    async fn clear_biz_and_all() {
        let builder = RelationMetricsBuilder::new();
        builder
            .build_infos_cache(2, RelationKind::Host, vec![host_with_agent("1", "a", "m", "s", "2")])
            .await;
        builder
            .build_infos_cache(3, RelationKind::Host, vec![host_with_agent("2", "b", "n", "t", "3")])
            .await;
        builder.clear_biz(2).await;
        assert!(builder.metrics().await.iter().all(|l| !l.contains("agent_id=\"a\"")));
        assert_eq!(builder.clear_resource_everywhere(&RelationKind::Host, "2").await, 1);
        builder.clear_all().await;
        assert!(builder.metrics().await.is_empty());
    }
}
