//! cmdbsync-cache: the resource cache managers.
//!
//! One [`CacheManager`] per [`CacheType`] mirrors a slice of the CMDB into
//! namespaced hash keys. Managers refresh business by business, track
//! which fields they wrote through a [`cmdbsync_state::HashCache`], and
//! delete the rest once a full refresh has finished. Change events are
//! applied on top through `update_by_events` / `clean_by_events`.

pub mod business;
pub mod context;
pub mod dynamic_group;
pub mod entities;
pub mod error;
pub mod host;
pub mod manager;
pub mod service_instance;
pub mod templated;

#[cfg(any(test, feature = "test-util"))]
pub mod test_support;

use std::collections::BTreeMap;
use std::sync::Arc;

use cmdbsync_core::CacheType;

pub use business::BusinessCacheManager;
pub use context::CacheContext;
pub use dynamic_group::DynamicGroupManager;
pub use entities::{DynamicGroupInfo, HostInfo, ServiceInstanceInfo};
pub use error::{CacheError, CacheResult};
pub use host::HostTopoManager;
pub use manager::{CacheManager, for_each_biz, list_biz_ids, refresh_all};
pub use service_instance::ServiceInstanceManager;
pub use templated::{EntityLayout, TemplatedCacheManager};

/// Manager for `cache_type` over `ctx`.
pub fn build_manager(cache_type: CacheType, ctx: CacheContext) -> Arc<dyn CacheManager> {
    match cache_type {
        CacheType::HostTopo => Arc::new(HostTopoManager::new(ctx)),
        CacheType::Business => Arc::new(BusinessCacheManager::new(ctx)),
        CacheType::Module => Arc::new(TemplatedCacheManager::module(ctx)),
        CacheType::Set => Arc::new(TemplatedCacheManager::set(ctx)),
        CacheType::ServiceInstance => Arc::new(ServiceInstanceManager::new(ctx)),
        CacheType::DynamicGroup => Arc::new(DynamicGroupManager::new(ctx)),
    }
}

/// Like [`build_manager`], from a configured cache type name.
pub fn build_manager_named(name: &str, ctx: CacheContext) -> CacheResult<Arc<dyn CacheManager>> {
    let cache_type = name
        .parse::<CacheType>()
        .map_err(|_| CacheError::UnknownCacheType(name.to_string()))?;
    Ok(build_manager(cache_type, ctx))
}

/// One manager per cache type, all sharing `ctx`.
pub fn build_managers(
    cache_types: &[CacheType],
    ctx: &CacheContext,
) -> BTreeMap<CacheType, Arc<dyn CacheManager>> {
    cache_types
        .iter()
        .map(|&cache_type| (cache_type, build_manager(cache_type, ctx.clone())))
        .collect()
}
