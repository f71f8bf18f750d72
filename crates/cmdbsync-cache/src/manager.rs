//! The `CacheManager` contract and the full-refresh driver.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use cmdbsync_api::fetch_all_pages;
use cmdbsync_core::events::coerce_int;
use cmdbsync_core::{CacheType, ResourceEvent, ResourceKind, TenantId};
use cmdbsync_state::{CACHE_EXPIRY, HashCache};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::context::CacheContext;
use crate::error::{CacheError, CacheResult};

/// One resource cache: what it fetches, which keys it owns, and how it
/// reacts to change events.
#[async_trait]
pub trait CacheManager: Send + Sync {
    fn cache_type(&self) -> CacheType;

    fn context(&self) -> &CacheContext;

    /// The touched-field cache over the keys this manager owns.
    fn cache(&self) -> &HashCache;

    fn tenant(&self) -> &TenantId {
        self.context().tenant()
    }

    /// Whether the cache is populated business by business.
    fn use_biz(&self) -> bool {
        true
    }

    fn concurrent_limit(&self) -> usize {
        self.context().concurrent_limit
    }

    async fn refresh_by_biz(&self, biz_id: i64) -> CacheResult<()>;

    /// Global-scope work after the per-business pass. By default this only
    /// extends the expiry of every owned key.
    async fn refresh_global(&self) -> CacheResult<()> {
        self.cache().expire_all(CACHE_EXPIRY).await?;
        Ok(())
    }

    async fn clean_by_biz(&self, _biz_id: i64) -> CacheResult<()> {
        Ok(())
    }

    /// Delete every field of every owned key that was not written since
    /// the last [`CacheManager::reset`].
    async fn clean_global(&self) -> CacheResult<()> {
        for key in self.cache().keys() {
            self.cache().delete_missing_fields(key).await?;
        }
        Ok(())
    }

    fn reset(&self) {
        self.cache().reset_all();
    }

    async fn update_by_events(&self, _kind: ResourceKind, _events: &[ResourceEvent]) -> CacheResult<()> {
        Ok(())
    }

    async fn clean_by_events(&self, _kind: ResourceKind, _events: &[ResourceEvent]) -> CacheResult<()> {
        Ok(())
    }

    /// Delete the given fields of the `index` subkey unless a refresh since
    /// the last reset wrote them again.
    async fn delete_untouched(&self, index: &str, fields: Vec<String>) -> CacheResult<Vec<String>> {
        let key = self.context().key(index);
        Ok(self.cache().delete_untouched(&key, fields).await?)
    }

    /// Rebuild this manager's relation contribution from what is cached.
    async fn build_relation_metrics(&self) -> CacheResult<()> {
        Ok(())
    }
}

/// Business ids visible to the context's tenant.
pub async fn list_biz_ids(ctx: &CacheContext) -> CacheResult<Vec<i64>> {
    let cmdb = ctx.cmdb()?;
    let rows = fetch_all_pages(ctx.page_size, |page| cmdb.search_business(page)).await?;
    Ok(rows
        .iter()
        .filter_map(|row| row.get("bk_biz_id").and_then(coerce_int))
        .collect())
}

/// Run `unit` for every business with at most `limit` in flight. Failures
/// and panics are logged and counted; siblings keep running.
pub async fn for_each_biz<F, Fut>(biz_ids: Vec<i64>, limit: usize, unit: F) -> usize
where
    F: Fn(i64) -> Fut,
    Fut: Future<Output = CacheResult<()>> + Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(limit.max(1)));
    let mut units = JoinSet::new();
    for biz_id in biz_ids {
        let Ok(permit) = semaphore.clone().acquire_owned().await else {
            break;
        };
        let work = unit(biz_id);
        units.spawn(async move {
            let _permit = permit;
            (biz_id, work.await)
        });
    }

    let mut failed = 0;
    while let Some(joined) = units.join_next().await {
        match joined {
            Ok((_, Ok(()))) => {}
            Ok((biz_id, Err(e))) => {
                warn!(biz_id, error = %e, "business refresh failed");
                failed += 1;
            }
            Err(e) => {
                error!(error = %e, "business refresh task aborted");
                failed += 1;
            }
        }
    }
    failed
}

/// Full refresh: reset, refresh and clean every business, then the
/// global pass and reconciliation.
///
/// A business that fails leaves its fields untouched, so the global pass
/// and reconciliation are skipped and the failure is returned.
pub async fn refresh_all(manager: Arc<dyn CacheManager>) -> CacheResult<()> {
    let started = Instant::now();
    let cache_type = manager.cache_type();
    let tenant = manager.tenant().clone();
    info!(%tenant, %cache_type, "refresh all started");

    manager.reset();

    if manager.use_biz() {
        let biz_ids = list_biz_ids(manager.context()).await?;
        let total = biz_ids.len();
        let failed = for_each_biz(biz_ids, manager.concurrent_limit(), |biz_id| {
            let manager = manager.clone();
            async move {
                manager.refresh_by_biz(biz_id).await?;
                manager.clean_by_biz(biz_id).await
            }
        })
        .await;
        if failed > 0 {
            warn!(%tenant, %cache_type, failed, total, "some businesses failed to refresh, skipping clean");
            return Err(CacheError::PartialRefresh {
                cache_type: cache_type.to_string(),
                failed,
                total,
            });
        }
    }

    manager.refresh_global().await?;
    manager.clean_global().await?;

    info!(
        %tenant,
        %cache_type,
        elapsed_secs = started.elapsed().as_secs_f64(),
        "refresh all finished"
    );
    Ok(())
}
