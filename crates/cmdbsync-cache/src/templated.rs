//! Module and set caches.
//!
//! Both keep the raw CMDB record under the entity id and a reverse index
//! from template id to member ids. They differ only in field names, so a
//! single manager serves both, configured by [`EntityLayout`].

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use cmdbsync_api::{Record, fetch_all_pages};
use cmdbsync_core::events::coerce_int;
use cmdbsync_core::keys::{MODULE, SERVICE_TEMPLATE, SET, SET_TEMPLATE};
use cmdbsync_core::{CacheType, IdList, ResourceChange, ResourceEvent, ResourceKind};
use cmdbsync_relation::{RelationInfo, RelationItem, RelationKind};
use cmdbsync_state::{BATCH_SIZE, HashCache};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::context::CacheContext;
use crate::entities::{parse_expands, split_user_fields};
use crate::error::CacheResult;
use crate::manager::CacheManager;

/// Field names and keys of one templated entity kind.
#[derive(Debug, Clone, Copy)]
pub struct EntityLayout {
    pub cache_type: CacheType,
    pub resource_kind: ResourceKind,
    pub entity_subkey: &'static str,
    pub template_subkey: &'static str,
    pub id_field: &'static str,
    pub template_field: &'static str,
    pub name_field: &'static str,
    /// Label carrying the entity name in its info line.
    pub name_label: &'static str,
    pub user_fields: &'static [&'static str],
}

pub const MODULE_LAYOUT: EntityLayout = EntityLayout {
    cache_type: CacheType::Module,
    resource_kind: ResourceKind::Module,
    entity_subkey: MODULE,
    template_subkey: SERVICE_TEMPLATE,
    id_field: "bk_module_id",
    template_field: "service_template_id",
    name_field: "bk_module_name",
    name_label: "module_name",
    user_fields: &["operator", "bk_bak_operator"],
};

pub const SET_LAYOUT: EntityLayout = EntityLayout {
    cache_type: CacheType::Set,
    resource_kind: ResourceKind::Set,
    entity_subkey: SET,
    template_subkey: SET_TEMPLATE,
    id_field: "bk_set_id",
    template_field: "set_template_id",
    name_field: "bk_set_name",
    name_label: "set_name",
    user_fields: &[],
};

const EXPAND_FIELD: &str = "version_meta";

pub struct TemplatedCacheManager {
    ctx: CacheContext,
    cache: HashCache,
    layout: EntityLayout,
    entity_key: String,
    template_key: String,
}

impl TemplatedCacheManager {
    pub fn new(ctx: CacheContext, layout: EntityLayout) -> Self {
        let entity_key = ctx.key(layout.entity_subkey);
        let template_key = ctx.key(layout.template_subkey);
        let cache = HashCache::new(ctx.store.clone(), [entity_key.clone(), template_key.clone()]);
        Self {
            ctx,
            cache,
            layout,
            entity_key,
            template_key,
        }
    }

    pub fn module(ctx: CacheContext) -> Self {
        Self::new(ctx, MODULE_LAYOUT)
    }

    pub fn set(ctx: CacheContext) -> Self {
        Self::new(ctx, SET_LAYOUT)
    }

    fn relation_kind(&self) -> RelationKind {
        RelationKind::from_topo_obj(self.layout.resource_kind.as_str())
    }

    async fn fetch(&self, biz_id: i64) -> CacheResult<Vec<Record>> {
        let cmdb = self.ctx.cmdb()?;
        let page_size = self.ctx.page_size;
        let rows = match self.layout.cache_type {
            CacheType::Set => fetch_all_pages(page_size, |page| cmdb.search_set(biz_id, page)).await?,
            _ => fetch_all_pages(page_size, |page| cmdb.search_module(biz_id, page)).await?,
        };
        Ok(rows)
    }

    fn entity_id(&self, record: &Record) -> Option<i64> {
        record.get(self.layout.id_field).and_then(coerce_int)
    }

    fn template_id(&self, record: &Record) -> Option<i64> {
        record
            .get(self.layout.template_field)
            .and_then(coerce_int)
            .filter(|id| *id > 0)
    }

    /// The entity's node linked up to its business: modules through their
    /// set, sets directly.
    fn relation_info(&self, record: &Record, id: i64, biz_id: i64) -> RelationInfo {
        let kind = self.relation_kind();
        let mut link = Vec::with_capacity(2);
        if self.layout.cache_type == CacheType::Module {
            if let Some(set_id) = record.get("bk_set_id").and_then(coerce_int) {
                link.push(RelationItem::new(RelationKind::Set, set_id.to_string()));
            }
        }
        link.push(RelationItem::new(RelationKind::Business, biz_id.to_string()));

        let mut expands = parse_expands(record.get(EXPAND_FIELD));
        if let Some(own) = expands.get_mut(kind.name()) {
            let name = match record.get(self.layout.name_field) {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => String::new(),
            };
            own.insert(self.layout.name_label.to_string(), name);
        }

        RelationInfo::new(id.to_string(), RelationItem::new(kind, id.to_string()))
            .with_link(link)
            .with_expands(expands)
    }

    fn relation_infos(&self, records: &[Record], biz_id: i64) -> Vec<RelationInfo> {
        records
            .iter()
            .filter_map(|r| self.entity_id(r).map(|id| self.relation_info(r, id, biz_id)))
            .collect()
    }

    async fn cached_records(&self, ids: &[String]) -> CacheResult<Vec<Record>> {
        let mut records = Vec::new();
        for chunk in ids.chunks(BATCH_SIZE) {
            for value in self.ctx.store.hmget(&self.entity_key, chunk).await?.into_iter().flatten() {
                match serde_json::from_str::<Record>(&value) {
                    Ok(record) => records.push(record),
                    Err(e) => debug!(error = %e, "cached record undecodable"),
                }
            }
        }
        Ok(records)
    }

    /// `(biz, id, template)` of every delete event of this layout's kind.
    fn deleted(&self, events: &[ResourceEvent]) -> Vec<(i64, i64, Option<i64>)> {
        events
            .iter()
            .filter(|e| e.is_delete())
            .filter_map(|e| match e.change {
                ResourceChange::Module {
                    biz_id,
                    module_id,
                    service_template_id,
                } if self.layout.cache_type == CacheType::Module => {
                    Some((biz_id, module_id, service_template_id))
                }
                ResourceChange::Set {
                    biz_id,
                    set_id,
                    set_template_id,
                } if self.layout.cache_type == CacheType::Set => Some((biz_id, set_id, set_template_id)),
                _ => None,
            })
            .collect()
    }

    /// Drop deleted members from their template entries, deleting entries
    /// that end up empty.
    async fn prune_templates(&self, templates: &BTreeSet<i64>, deleted: &BTreeSet<i64>) -> CacheResult<()> {
        let mut rewritten = Vec::new();
        let mut emptied = Vec::new();
        for template_id in templates {
            let field = template_id.to_string();
            let Some(stored) = self.ctx.store.hget(&self.template_key, &field).await? else {
                continue;
            };
            let Some(mut members) = IdList::parse(&stored) else {
                warn!(template_id, %stored, "template index entry unreadable");
                continue;
            };
            for id in deleted {
                members.remove(*id);
            }
            if members.is_empty() {
                emptied.push(field);
            } else {
                rewritten.push((field, members.to_store_string()));
            }
        }
        if !rewritten.is_empty() {
            self.cache.update_hash_map(&self.template_key, rewritten).await?;
        }
        if !emptied.is_empty() {
            self.cache.delete_fields(&self.template_key, &emptied).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl CacheManager for TemplatedCacheManager {
    fn cache_type(&self) -> CacheType {
        self.layout.cache_type
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
        let mut records = self.fetch(biz_id).await?;

        let mut entities = Vec::with_capacity(records.len());
        let mut templates: BTreeMap<i64, IdList> = BTreeMap::new();
        for record in &mut records {
            split_user_fields(record, self.layout.user_fields.iter().copied());
            record.insert("bk_biz_id".to_string(), Value::from(biz_id));
            let Some(id) = self.entity_id(record) else {
                continue;
            };
            entities.push((id.to_string(), serde_json::to_string(record)?));
            if let Some(template_id) = self.template_id(record) {
                templates.entry(template_id).or_default().push(id);
            }
        }

        self.cache.update_hash_map(&self.entity_key, entities).await?;
        let index = templates
            .into_iter()
            .map(|(template_id, ids)| (template_id.to_string(), ids.to_store_string()))
            .collect();
        self.cache.update_hash_map(&self.template_key, index).await?;

        self.ctx
            .relations
            .build_infos_cache(biz_id, self.relation_kind(), self.relation_infos(&records, biz_id))
            .await;
        debug!(biz_id, cache_type = %self.layout.cache_type, count = records.len(), "refreshed for business");
        Ok(())
    }

    async fn clean_by_events(&self, kind: ResourceKind, events: &[ResourceEvent]) -> CacheResult<()> {
        if kind != self.layout.resource_kind {
            return Ok(());
        }
        let deleted = self.deleted(events);
        if deleted.is_empty() {
            return Ok(());
        }

        let ids: Vec<String> = deleted.iter().map(|(_, id, _)| id.to_string()).collect();
        let deleted_ids: BTreeSet<i64> = deleted.iter().map(|(_, id, _)| *id).collect();
        let mut templates: BTreeSet<i64> = deleted.iter().filter_map(|(_, _, t)| t.filter(|t| *t > 0)).collect();
        // Events may omit the template; the cached record still knows it.
        for record in self.cached_records(&ids).await? {
            if let Some(template_id) = self.template_id(&record) {
                templates.insert(template_id);
            }
        }

        self.prune_templates(&templates, &deleted_ids).await?;

        let kind = self.relation_kind();
        for (biz_id, id, _) in &deleted {
            self.ctx
                .relations
                .clear_resource_with_id(*biz_id, &kind, &id.to_string())
                .await;
        }
        self.cache.delete_fields(&self.entity_key, &ids).await?;
        info!(
            cache_type = %self.layout.cache_type,
            deleted = ids.len(),
            templates = templates.len(),
            "cleaned by events"
        );
        Ok(())
    }

    async fn build_relation_metrics(&self) -> CacheResult<()> {
        let mut by_biz: BTreeMap<i64, Vec<Record>> = BTreeMap::new();
        for (field, value) in self.cache.scan_all(&self.entity_key, "*", BATCH_SIZE).await? {
            let record = match serde_json::from_str::<Record>(&value) {
                Ok(record) => record,
                Err(e) => {
                    warn!(%field, error = %e, "cached record undecodable");
                    continue;
                }
            };
            if let Some(biz_id) = record.get("bk_biz_id").and_then(coerce_int) {
                by_biz.entry(biz_id).or_default().push(record);
            }
        }
        for (biz_id, records) in by_biz {
            self.ctx
                .relations
                .build_infos_cache(biz_id, self.relation_kind(), self.relation_infos(&records, biz_id))
                .await;
        }
        Ok(())
    }
}
