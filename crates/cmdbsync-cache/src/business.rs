//! Business cache: every tenant's businesses plus monitoring spaces, in
//! one canonical hash under the default tenant.

use async_trait::async_trait;
use cmdbsync_api::types::{ObjectAttribute, Space};
use cmdbsync_api::{Record, fetch_all_pages};
use cmdbsync_core::events::coerce_int;
use cmdbsync_core::keys::BUSINESS;
use cmdbsync_core::{CacheType, ResourceChange, ResourceEvent, ResourceKind, TenantId};
use cmdbsync_state::{CACHE_EXPIRY, HashCache};
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::context::CacheContext;
use crate::entities::split_user_fields;
use crate::error::{CacheError, CacheResult};
use crate::manager::CacheManager;

const USER_PROPERTY_TYPE: &str = "objuser";

pub struct BusinessCacheManager {
    ctx: CacheContext,
    cache: HashCache,
    key: String,
}

impl BusinessCacheManager {
    pub fn new(ctx: CacheContext) -> Self {
        let key = ctx.namespace.default_tenant().key(BUSINESS);
        let cache = HashCache::new(ctx.store.clone(), [key.clone()]);
        Self { ctx, cache, key }
    }

    fn ensure_default_tenant(&self) -> CacheResult<()> {
        if self.ctx.tenant().is_default() {
            Ok(())
        } else {
            Err(CacheError::TenantScope {
                cache_type: CacheType::Business.to_string(),
                tenant: self.ctx.tenant().to_string(),
            })
        }
    }

    /// One tenant's businesses with user fields split and the tenant injected.
    async fn tenant_businesses(&self, tenant: &TenantId) -> CacheResult<Vec<(String, String)>> {
        let cmdb = self.ctx.registry.client(tenant)?;
        let attributes = cmdb.search_object_attribute("biz").await?;
        let user_fields = user_fields(&attributes);
        let rows = fetch_all_pages(self.ctx.page_size, |page| cmdb.search_business(page)).await?;

        let mut fields = Vec::with_capacity(rows.len());
        for mut row in rows {
            let Some(biz_id) = row.get("bk_biz_id").and_then(coerce_int) else {
                continue;
            };
            split_user_fields(&mut row, user_fields.iter().map(String::as_str));
            row.insert("bk_tenant_id".to_string(), Value::from(tenant.as_str()));
            fields.push((biz_id.to_string(), serde_json::to_string(&row)?));
        }
        debug!(%tenant, count = fields.len(), "businesses fetched");
        Ok(fields)
    }
}

fn user_fields(attributes: &[ObjectAttribute]) -> Vec<String> {
    attributes
        .iter()
        .filter(|a| a.bk_property_type == USER_PROPERTY_TYPE)
        .map(|a| a.bk_property_id.clone())
        .collect()
}

/// A non-CMDB space as a business with a negative id.
pub fn space_business(space: &Space) -> (i64, Record) {
    let biz_id = -space.id;
    let tenant = if space.bk_tenant_id.is_empty() {
        TenantId::default_tenant().to_string()
    } else {
        space.bk_tenant_id.clone()
    };
    let value = json!({
        "bk_tenant_id": tenant,
        "bk_biz_id": biz_id,
        "bk_biz_name": format!("[{}]{}", space.space_id, space.space_name),
        "bk_biz_developer": [],
        "bk_biz_productor": [],
        "bk_biz_tester": [],
        "bk_biz_maintainer": [],
        "operator": [],
        "time_zone": space.time_zone,
        "language": "1",
        "life_cycle": "2",
        "space_uid": space.space_uid(),
    });
    let record = match value {
        Value::Object(map) => map,
        _ => Record::new(),
    };
    (biz_id, record)
}

#[async_trait]
impl CacheManager for BusinessCacheManager {
    fn cache_type(&self) -> CacheType {
        CacheType::Business
    }

    fn context(&self) -> &CacheContext {
        &self.ctx
    }

    fn cache(&self) -> &HashCache {
        &self.cache
    }

    fn use_biz(&self) -> bool {
        false
    }

    async fn refresh_by_biz(&self, _biz_id: i64) -> CacheResult<()> {
        Ok(())
    }

    async fn refresh_global(&self) -> CacheResult<()> {
        self.ensure_default_tenant()?;
        let directory = self.ctx.registry.directory().clone();

        let mut fields = Vec::new();
        for tenant in directory.list_tenants().await? {
            fields.extend(self.tenant_businesses(&tenant).await?);
        }

        let mut spaces = 0;
        for space in directory.list_spaces().await? {
            if space.is_cmdb_business() {
                continue;
            }
            let (biz_id, record) = space_business(&space);
            fields.push((biz_id.to_string(), serde_json::to_string(&record)?));
            spaces += 1;
        }

        let total = fields.len();
        self.cache.update_hash_map(&self.key, fields).await?;
        self.cache.expire(&[self.key.as_str()], CACHE_EXPIRY).await?;
        info!(total, spaces, "business cache refreshed");
        Ok(())
    }

    async fn update_by_events(&self, kind: ResourceKind, events: &[ResourceEvent]) -> CacheResult<()> {
        if kind != ResourceKind::Biz || events.is_empty() {
            return Ok(());
        }
        self.refresh_global().await
    }

    async fn clean_by_events(&self, kind: ResourceKind, events: &[ResourceEvent]) -> CacheResult<()> {
        if kind != ResourceKind::Biz {
            return Ok(());
        }
        let biz_ids: Vec<i64> = events
            .iter()
            .filter(|e| e.is_delete())
            .filter_map(|e| match e.change {
                ResourceChange::Biz { biz_id } => Some(biz_id),
                _ => None,
            })
            .collect();
        if biz_ids.is_empty() {
            return Ok(());
        }
        let fields: Vec<String> = biz_ids.iter().map(i64::to_string).collect();
        self.cache.delete_fields(&self.key, &fields).await?;
        // Whatever the other caches contributed for a deleted business goes too.
        for biz_id in biz_ids {
            self.ctx.relations.clear_biz(biz_id).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{TestEnv, record};
    use cmdbsync_api::StaticDirectory;
    use cmdbsync_core::EventAction;
    use cmdbsync_relation::{RelationInfo, RelationItem, RelationKind};
    use cmdbsync_state::KvStore;

    fn space(id: i64, kind: &str, space_id: &str, name: &str, tenant: &str) -> Space {
        Space {
            id,
            space_type_id: kind.into(),
            space_id: space_id.into(),
            space_name: name.into(),
            time_zone: "Asia/Shanghai".into(),
            bk_tenant_id: tenant.into(),
        }
    }

    #[tokio::test]
    async fn merges_tenants_and_spaces() {
        let other = TenantId::new("tenant-b");
        let directory = StaticDirectory::new(
            vec![TenantId::default_tenant(), other.clone()],
            vec![
                space(2, "bkcc", "2", "Blueking", "system"),
                space(100, "bkci", "test", "Test", "system"),
            ],
        );
        let env = TestEnv::with_directory(directory);
        env.cmdb.update(|s| {
            s.biz_attributes = vec![ObjectAttribute {
                bk_property_id: "bk_biz_maintainer".into(),
                bk_property_type: "objuser".into(),
            }];
            s.businesses = vec![
                record(json!({"bk_biz_id": 2, "bk_biz_name": "Blueking", "bk_biz_maintainer": "admin,ops"})),
                record(json!({"bk_biz_id": 3, "bk_biz_name": "Demo", "bk_biz_maintainer": ""})),
            ];
        });
        let other_cmdb = env.add_tenant(&other);
        other_cmdb.update(|s| {
            s.businesses = vec![record(json!({"bk_biz_id": 7, "bk_biz_name": "Other"}))];
        });

        let manager = BusinessCacheManager::new(env.ctx());
        manager.refresh_global().await.unwrap();

        let key = env.key(BUSINESS);
        let mut fields = env.store.hkeys(&key).await.unwrap();
        fields.sort();
        assert_eq!(fields, vec!["-100", "2", "3", "7"]);

        let space: Value = serde_json::from_str(&env.store.hget(&key, "-100").await.unwrap().unwrap()).unwrap();
        assert_eq!(space["bk_biz_name"], "[test]Test");
        assert_eq!(space["space_uid"], "bkci__test");
        assert_eq!(space["bk_biz_maintainer"], json!([]));

        let biz: Value = serde_json::from_str(&env.store.hget(&key, "2").await.unwrap().unwrap()).unwrap();
        assert_eq!(biz["bk_biz_maintainer"], json!(["admin", "ops"]));
        assert_eq!(biz["bk_tenant_id"], "system");
        let biz: Value = serde_json::from_str(&env.store.hget(&key, "7").await.unwrap().unwrap()).unwrap();
        assert_eq!(biz["bk_tenant_id"], "tenant-b");
    }

    #[tokio::test]
    async fn refuses_non_default_tenant() {
        let env = TestEnv::new();
        let manager = BusinessCacheManager::new(env.ctx_for(TenantId::new("tenant-b")));
        assert!(matches!(
            manager.refresh_global().await,
            Err(CacheError::TenantScope { .. })
        ));
    }

    #[tokio::test]
    async fn delete_events_remove_businesses() {
        let env = TestEnv::new();
        env.cmdb.update(|s| {
            s.businesses = vec![
                record(json!({"bk_biz_id": 2})),
                record(json!({"bk_biz_id": 3})),
            ];
        });
        let manager = BusinessCacheManager::new(env.ctx());
        manager.refresh_global().await.unwrap();

        let event = ResourceEvent {
            action: EventAction::Delete,
            cursor: "1".into(),
            change: ResourceChange::Biz { biz_id: 3 },
        };
        env.relations
            .build_infos_cache(
                3,
                RelationKind::Set,
                vec![RelationInfo::new("3001", RelationItem::new(RelationKind::Set, "3001"))
                    .with_link(vec![RelationItem::new(RelationKind::Business, "3")])],
            )
            .await;
        assert!(!env.relations.string().await.is_empty());

        manager.clean_by_events(ResourceKind::Biz, &[event]).await.unwrap();
        assert_eq!(env.store.hkeys(&env.key(BUSINESS)).await.unwrap(), vec!["2"]);
        assert_eq!(env.relations.string().await, "");
    }
}
