//! Dynamic group cache: each group with the ids of its current members.

use async_trait::async_trait;
use cmdbsync_api::types::DynamicGroupRecord;
use cmdbsync_api::{CmdbApi, fetch_all_pages};
use cmdbsync_core::events::coerce_int;
use cmdbsync_core::keys::DYNAMIC_GROUP;
use cmdbsync_core::{CacheType, ResourceChange, ResourceEvent, ResourceKind};
use cmdbsync_state::HashCache;
use tracing::{debug, info, warn};

use crate::context::CacheContext;
use crate::entities::DynamicGroupInfo;
use crate::error::CacheResult;
use crate::manager::CacheManager;

/// Member id field for a group's object type. Only host and set groups
/// are supported upstream.
pub fn member_field(obj_id: &str) -> Option<&'static str> {
    match obj_id {
        "host" => Some("bk_host_id"),
        "set" => Some("bk_set_id"),
        _ => None,
    }
}

pub struct DynamicGroupManager {
    ctx: CacheContext,
    cache: HashCache,
    key: String,
}

impl DynamicGroupManager {
    pub fn new(ctx: CacheContext) -> Self {
        let key = ctx.key(DYNAMIC_GROUP);
        let cache = HashCache::new(ctx.store.clone(), [key.clone()]);
        Self { ctx, cache, key }
    }

    async fn members(
        &self,
        cmdb: &dyn CmdbApi,
        biz_id: i64,
        group: &DynamicGroupRecord,
        field: &'static str,
    ) -> CacheResult<Vec<i64>> {
        let fields = [field];
        let rows = fetch_all_pages(self.ctx.page_size, |page| {
            cmdb.execute_dynamic_group(biz_id, &group.id, &fields, page)
        })
        .await?;
        Ok(rows
            .iter()
            .filter_map(|row| row.get(field).and_then(coerce_int))
            .collect())
    }
}

#[async_trait]
impl CacheManager for DynamicGroupManager {
    fn cache_type(&self) -> CacheType {
        CacheType::DynamicGroup
    }

    fn context(&self) -> &CacheContext {
        &self.ctx
    }

    fn cache(&self) -> &HashCache {
        &self.cache
    }

    async fn refresh_by_biz(&self, biz_id: i64) -> CacheResult<()> {
        let cmdb = self.ctx.cmdb()?;
        let groups = fetch_all_pages(self.ctx.page_size, |page| cmdb.search_dynamic_group(biz_id, page)).await?;

        let mut fields = Vec::with_capacity(groups.len());
        for group in &groups {
            let Some(field) = member_field(&group.bk_obj_id) else {
                warn!(biz_id, group_id = %group.id, obj_id = %group.bk_obj_id, "unsupported dynamic group type skipped");
                continue;
            };
            let info = DynamicGroupInfo {
                bk_biz_id: biz_id,
                bk_inst_ids: self.members(cmdb.as_ref(), biz_id, group, field).await?,
                bk_obj_id: group.bk_obj_id.clone(),
                name: group.name.clone(),
                id: group.id.clone(),
            };
            fields.push((group.id.clone(), serde_json::to_string(&info)?));
        }

        let count = fields.len();
        self.cache.update_hash_map(&self.key, fields).await?;
        debug!(biz_id, groups = count, "dynamic groups refreshed for business");
        Ok(())
    }

    async fn clean_by_events(&self, kind: ResourceKind, events: &[ResourceEvent]) -> CacheResult<()> {
        if kind != ResourceKind::DynamicGroup {
            return Ok(());
        }
        let ids: Vec<String> = events
            .iter()
            .filter(|e| e.is_delete())
            .filter_map(|e| match &e.change {
                ResourceChange::DynamicGroup { group_id, .. } => Some(group_id.clone()),
                _ => None,
            })
            .collect();
        if ids.is_empty() {
            return Ok(());
        }
        self.cache.delete_fields(&self.key, &ids).await?;
        info!(deleted = ids.len(), "dynamic groups cleaned by events");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::refresh_all;
    use crate::test_support::{TestEnv, record};
    use cmdbsync_core::EventAction;
    use cmdbsync_state::KvStore;
    use serde_json::json;
    use std::sync::Arc;

    fn group(id: &str, obj: &str) -> DynamicGroupRecord {
        DynamicGroupRecord {
            id: id.into(),
            bk_obj_id: obj.into(),
            name: format!("group {id}"),
        }
    }

    fn seed(env: &TestEnv) {
        env.cmdb.update(|s| {
            s.businesses = vec![record(json!({"bk_biz_id": 2}))];
            s.dynamic_groups.insert(
                2,
                vec![group("g-host", "host"), group("g-set", "set"), group("g-odd", "module")],
            );
            s.dynamic_group_members.insert(
                "g-host".into(),
                vec![record(json!({"bk_host_id": 1001})), record(json!({"bk_host_id": "1002"}))],
            );
            s.dynamic_group_members
                .insert("g-set".into(), vec![record(json!({"bk_set_id": 3001}))]);
        });
    }

    #[tokio::test]
    async fn groups_carry_member_ids() {
        let env = TestEnv::new();
        seed(&env);
        let manager = DynamicGroupManager::new(env.ctx());
        manager.refresh_by_biz(2).await.unwrap();

        let key = env.key(DYNAMIC_GROUP);
        let mut ids = env.store.hkeys(&key).await.unwrap();
        ids.sort();
        assert_eq!(ids, vec!["g-host", "g-set"]);

        let raw = env.store.hget(&key, "g-host").await.unwrap().unwrap();
        let info: DynamicGroupInfo = serde_json::from_str(&raw).unwrap();
        assert_eq!(info.bk_inst_ids, vec![1001, 1002]);
        assert_eq!(info.bk_obj_id, "host");
        assert_eq!(info.bk_biz_id, 2);
    }

    #[tokio::test]
    async fn delete_events_and_reconcile() {
        let env = TestEnv::new();
        seed(&env);
        let manager = Arc::new(DynamicGroupManager::new(env.ctx()));
        refresh_all(manager.clone()).await.unwrap();

        let event = ResourceEvent {
            action: EventAction::Delete,
            cursor: String::new(),
            change: ResourceChange::DynamicGroup {
                biz_id: 2,
                group_id: "g-set".into(),
            },
        };
        manager.clean_by_events(ResourceKind::DynamicGroup, &[event]).await.unwrap();
        assert_eq!(env.store.hkeys(&env.key(DYNAMIC_GROUP)).await.unwrap(), vec!["g-host"]);

        env.cmdb.update(|s| {
            s.dynamic_groups.insert(2, vec![group("g-set", "set")]);
        });
        refresh_all(manager).await.unwrap();
        assert_eq!(env.store.hkeys(&env.key(DYNAMIC_GROUP)).await.unwrap(), vec!["g-set"]);
    }

    #[test]
    fn member_fields() {
        assert_eq!(member_field("host"), Some("bk_host_id"));
        assert_eq!(member_field("set"), Some("bk_set_id"));
        assert_eq!(member_field("module"), None);
    }
}
