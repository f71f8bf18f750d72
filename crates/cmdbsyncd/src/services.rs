//! Shared handles assembled from the task configuration.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use cmdbsync_api::{CmdbClientRegistry, HttpClientFactory, HttpDirectory, StaticDirectory, TenantDirectory};
use cmdbsync_cache::{CacheContext, CacheManager, build_managers};
use cmdbsync_core::config::{StoreBackend, StoreConfig};
use cmdbsync_core::{CacheType, Namespace, ResourceKind, TaskConfig};
use cmdbsync_relation::{HttpPushSink, LogSink, MetricsSink, RelationMetricsBuilder};
use cmdbsync_state::{RedbStore, RedisStore, SharedStore};
use tracing::info;

pub struct Services {
    pub config: TaskConfig,
    pub namespace: Namespace,
    pub store: SharedStore,
    pub registry: Arc<CmdbClientRegistry>,
    pub relations: Arc<RelationMetricsBuilder>,
}

impl Services {
    pub async fn build(config: TaskConfig) -> anyhow::Result<Self> {
        let namespace = Namespace::new(config.tenant.clone(), config.prefix.clone());
        let store = open_store(&config.store).await?;
        let factory = HttpClientFactory::new(config.cmdb.clone()).context("building CMDB client factory")?;
        let registry = Arc::new(CmdbClientRegistry::new(Arc::new(factory), directory(&config)?));
        info!(tenant = %namespace.tenant(), namespace = namespace.as_str(), "services ready");
        Ok(Self {
            config,
            namespace,
            store,
            registry,
            relations: Arc::new(RelationMetricsBuilder::new()),
        })
    }

    pub fn context(&self) -> CacheContext {
        CacheContext::new(
            self.namespace.clone(),
            self.store.clone(),
            self.registry.clone(),
            self.relations.clone(),
        )
        .with_page_size(self.config.cmdb.page_size)
        .with_resource_pool_biz(self.config.resource_pool_biz())
    }

    pub fn managers(&self, cache_types: &[CacheType]) -> BTreeMap<CacheType, Arc<dyn CacheManager>> {
        build_managers(cache_types, &self.context())
    }

    /// Where rendered relation lines go: the configured push endpoint, or
    /// the log when there is none.
    pub fn metrics_sink(&self) -> anyhow::Result<Arc<dyn MetricsSink>> {
        Ok(match &self.config.relation.push_url {
            Some(url) => Arc::new(HttpPushSink::new(
                url.clone(),
                Duration::from_secs(self.config.cmdb.timeout_secs),
            )?),
            None => Arc::new(LogSink),
        })
    }
}

pub async fn open_store(config: &StoreConfig) -> anyhow::Result<SharedStore> {
    Ok(match config.backend {
        StoreBackend::Redis => {
            let url = config.url.as_deref().context("store.url is required for the redis backend")?;
            let store = RedisStore::connect(url).await.context("connecting to redis")?;
            info!("redis store connected");
            Arc::new(store)
        }
        StoreBackend::Redb => {
            let path = config.path.as_deref().context("store.path is required for the redb backend")?;
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
            let store = RedbStore::open(path).with_context(|| format!("opening {}", path.display()))?;
            info!(path = ?path, "redb store opened");
            Arc::new(store)
        }
    })
}

fn directory(config: &TaskConfig) -> anyhow::Result<Arc<dyn TenantDirectory>> {
    Ok(match &config.spaces {
        Some(spaces) => Arc::new(
            HttpDirectory::new(&spaces.endpoint, &config.cmdb).context("building tenant directory")?,
        ),
        None if config.tenant.is_default() => Arc::new(StaticDirectory::default_tenant()),
        None => Arc::new(StaticDirectory::new(vec![config.tenant.clone()], Vec::new())),
    })
}

/// Resource kinds whose change events feed `cache_types`.
pub fn watched_kinds(cache_types: &[CacheType]) -> Vec<ResourceKind> {
    ResourceKind::ALL
        .into_iter()
        .filter(|kind| cache_types.contains(&kind.cache_type()))
        .collect()
}
