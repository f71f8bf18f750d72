//! Service instance cache and the host to service instance index.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use cmdbsync_api::fetch_all_pages;
use cmdbsync_core::keys::{HOST, HOST_TO_SERVICE_INSTANCE, SERVICE_INSTANCE};
use cmdbsync_core::{CacheType, IdList, ResourceChange, ResourceEvent, ResourceKind};
use cmdbsync_state::HashCache;
use tracing::{debug, info, warn};

use crate::context::CacheContext;
use crate::entities::{HostInfo, ServiceInstanceInfo};
use crate::error::CacheResult;
use crate::manager::CacheManager;

/// Host ids per `hmget` against the host cache.
const HOST_LOOKUP_CHUNK: usize = 1000;

pub struct ServiceInstanceManager {
    ctx: CacheContext,
    cache: HashCache,
    instance_key: String,
    host_index_key: String,
    host_key: String,
}

impl ServiceInstanceManager {
    pub fn new(ctx: CacheContext) -> Self {
        let instance_key = ctx.key(SERVICE_INSTANCE);
        let host_index_key = ctx.key(HOST_TO_SERVICE_INSTANCE);
        let host_key = ctx.key(HOST);
        let cache = HashCache::new(ctx.store.clone(), [instance_key.clone(), host_index_key.clone()]);
        Self {
            ctx,
            cache,
            instance_key,
            host_index_key,
            host_key,
        }
    }

    /// Cached hosts by id. Missing or unreadable hosts are left out.
    async fn hosts(&self, host_ids: &BTreeSet<i64>) -> CacheResult<BTreeMap<i64, HostInfo>> {
        let fields: Vec<String> = host_ids.iter().map(i64::to_string).collect();
        let mut hosts = BTreeMap::new();
        for chunk in fields.chunks(HOST_LOOKUP_CHUNK) {
            for value in self.ctx.store.hmget(&self.host_key, chunk).await?.into_iter().flatten() {
                match serde_json::from_str::<HostInfo>(&value) {
                    Ok(host) => {
                        hosts.insert(host.bk_host_id, host);
                    }
                    Err(e) => warn!(error = %e, "cached host undecodable"),
                }
            }
        }
        Ok(hosts)
    }
}

#[async_trait]
impl CacheManager for ServiceInstanceManager {
    fn cache_type(&self) -> CacheType {
        CacheType::ServiceInstance
    }

    fn context(&self) -> &CacheContext {
        &self.ctx
    }

    fn cache(&self) -> &HashCache {
        &self.cache
    }

    async fn refresh_by_biz(&self, biz_id: i64) -> CacheResult<()> {
        let cmdb = self.ctx.cmdb()?;
        let details = fetch_all_pages(self.ctx.page_size, |page| {
            cmdb.list_service_instance_detail(biz_id, page)
        })
        .await?;

        let mut instances: Vec<ServiceInstanceInfo> = details
            .iter()
            .map(|detail| ServiceInstanceInfo::new(detail, biz_id))
            .collect();
        let host_ids: BTreeSet<i64> = instances.iter().map(|i| i.bk_host_id).collect();
        let hosts = self.hosts(&host_ids).await?;

        let mut by_host: BTreeMap<i64, IdList> = BTreeMap::new();
        let mut fields = Vec::with_capacity(instances.len());
        for instance in &mut instances {
            if let Some(host) = hosts.get(&instance.bk_host_id) {
                instance.enrich(host);
            }
            by_host.entry(instance.bk_host_id).or_default().push(instance.id);
            fields.push((instance.id.to_string(), serde_json::to_string(instance)?));
        }

        self.cache.update_hash_map(&self.instance_key, fields).await?;
        let index = by_host
            .into_iter()
            .map(|(host_id, ids)| (host_id.to_string(), ids.to_store_string()))
            .collect();
        self.cache.update_hash_map(&self.host_index_key, index).await?;

        debug!(
            biz_id,
            instances = instances.len(),
            enriched = hosts.len(),
            "service instances refreshed for business"
        );
        Ok(())
    }

    async fn clean_by_events(&self, kind: ResourceKind, events: &[ResourceEvent]) -> CacheResult<()> {
        if kind != ResourceKind::Process {
            return Ok(());
        }
        let ids: Vec<String> = events
            .iter()
            .filter(|e| e.is_delete())
            .filter_map(|e| match e.change {
                ResourceChange::Process {
                    service_instance_id, ..
                } => Some(service_instance_id.to_string()),
                _ => None,
            })
            .collect();
        if ids.is_empty() {
            return Ok(());
        }
        self.cache.delete_fields(&self.instance_key, &ids).await?;
        info!(deleted = ids.len(), "service instances cleaned by events");
        Ok(())
    }
}
