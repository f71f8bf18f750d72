//! cmdbsync.toml task configuration.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};

use crate::types::{CacheType, TenantId};

pub const MIN_REFRESH_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 600;
pub const DEFAULT_BIZ_CONCURRENCY: usize = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    #[serde(default)]
    pub tenant: TenantId,
    #[serde(default = "default_prefix")]
    pub prefix: String,
    #[serde(default)]
    pub multi_tenant_mode: bool,
    pub store: StoreConfig,
    pub cmdb: CmdbConfig,
    #[serde(default)]
    pub spaces: Option<SpacesConfig>,
    #[serde(default)]
    pub watch: WatchConfig,
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub relation: RelationConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Redis,
    Redb,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub url: Option<String>,
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CmdbConfig {
    pub endpoint: String,
    pub app_code: String,
    #[serde(default)]
    pub app_secret: String,
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(default = "default_qps")]
    pub rate_limit_qps: f64,
    #[serde(default = "default_burst")]
    pub rate_limit_burst: u32,
    #[serde(default = "default_rate_limit_timeout")]
    pub rate_limit_timeout_secs: u64,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpacesConfig {
    pub endpoint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    /// Empty means every cache type.
    #[serde(default)]
    pub cache_types: Vec<String>,
    #[serde(default = "default_poll_idle")]
    pub poll_idle_secs: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            cache_types: Vec::new(),
            poll_idle_secs: default_poll_idle(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    #[serde(default = "default_handle_interval")]
    pub handle_interval_secs: u64,
    #[serde(default = "default_biz_concurrency")]
    pub biz_concurrency: usize,
    #[serde(default)]
    pub full_refresh_intervals: BTreeMap<String, u64>,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            handle_interval_secs: default_handle_interval(),
            biz_concurrency: default_biz_concurrency(),
            full_refresh_intervals: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationConfig {
    #[serde(default = "default_push_interval")]
    pub push_interval_secs: u64,
    pub push_url: Option<String>,
}

impl Default for RelationConfig {
    fn default() -> Self {
        Self {
            push_interval_secs: default_push_interval(),
            push_url: None,
        }
    }
}

fn default_prefix() -> String {
    "bkmonitorv3".to_string()
}
fn default_username() -> String {
    "admin".to_string()
}
fn default_qps() -> f64 {
    200.0
}
fn default_burst() -> u32 {
    200
}
fn default_rate_limit_timeout() -> u64 {
    10
}
fn default_page_size() -> usize {
    500
}
fn default_timeout() -> u64 {
    60
}
fn default_poll_idle() -> u64 {
    5
}
fn default_handle_interval() -> u64 {
    MIN_REFRESH_INTERVAL_SECS
}
fn default_biz_concurrency() -> usize {
    DEFAULT_BIZ_CONCURRENCY
}
fn default_push_interval() -> u64 {
    60
}

impl TaskConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("loading config {}", path.display()))
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: TaskConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.prefix.trim().is_empty() {
            bail!("prefix must not be empty");
        }
        match self.store.backend {
            StoreBackend::Redis if self.store.url.as_deref().is_none_or(str::is_empty) => {
                bail!("store.url is required for the redis backend")
            }
            StoreBackend::Redb if self.store.path.is_none() => {
                bail!("store.path is required for the redb backend")
            }
            _ => {}
        }
        for name in self
            .watch
            .cache_types
            .iter()
            .chain(self.events.full_refresh_intervals.keys())
        {
            name.parse::<CacheType>()?;
        }
        Ok(())
    }

    /// Cache types to run; empty config selects all six.
    pub fn cache_types(&self) -> anyhow::Result<Vec<CacheType>> {
        if self.watch.cache_types.is_empty() {
            return Ok(CacheType::ALL.to_vec());
        }
        let mut types = Vec::with_capacity(self.watch.cache_types.len());
        for name in &self.watch.cache_types {
            let t: CacheType = name.parse()?;
            if !types.contains(&t) {
                types.push(t);
            }
        }
        Ok(types)
    }

    /// Minimum time between full refreshes of `cache_type`.
    pub fn full_refresh_interval(&self, cache_type: CacheType) -> Duration {
        let secs = self
            .events
            .full_refresh_intervals
            .get(cache_type.as_str())
            .copied()
            .unwrap_or(DEFAULT_REFRESH_INTERVAL_SECS)
            .max(MIN_REFRESH_INTERVAL_SECS);
        Duration::from_secs(secs)
    }

    pub fn handle_interval(&self) -> Duration {
        Duration::from_secs(
            self.events
                .handle_interval_secs
                .max(MIN_REFRESH_INTERVAL_SECS),
        )
    }

    pub fn biz_concurrency(&self) -> usize {
        self.events.biz_concurrency.max(1)
    }

    /// Business id reserved for the host resource pool.
    pub fn resource_pool_biz(&self) -> i64 {
        if self.multi_tenant_mode { 2 } else { 1 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MINIMAL: &str = r#"
[store]
backend = "redb"
path = "/tmp/cmdbsync.redb"

[cmdb]
endpoint = "http://cmdb.local/api/"
app_code = "bk_monitorv3"
"#;

    #[test]
    fn defaults_applied() {
        let config = TaskConfig::parse(MINIMAL).unwrap();
        assert!(config.tenant.is_default());
        assert_eq!(config.prefix, "bkmonitorv3");
        assert_eq!(config.biz_concurrency(), 5);
        assert_eq!(config.resource_pool_biz(), 1);
        assert_eq!(config.cache_types().unwrap().len(), 6);
        assert_eq!(config.cmdb.page_size, 500);
    }

    #[test]
    fn full_refresh_interval_clamps() {
        let toml_str = format!(
            "{MINIMAL}\n[events]\nbiz_concurrency = 0\n[events.full_refresh_intervals]\nhost_topo = 1\nset = 900\n"
        );
        let config = TaskConfig::parse(&toml_str).unwrap();
        assert_eq!(
            config.full_refresh_interval(CacheType::HostTopo),
            Duration::from_secs(60)
        );
        assert_eq!(
            config.full_refresh_interval(CacheType::Set),
            Duration::from_secs(900)
        );
        assert_eq!(
            config.full_refresh_interval(CacheType::Module),
            Duration::from_secs(600)
        );
        assert_eq!(config.biz_concurrency(), 1);
    }

    #[test]
    fn unknown_cache_type_is_fatal() {
        let toml_str = format!("{MINIMAL}\n[watch]\ncache_types = [\"hosts\"]\n");
        let err = TaskConfig::parse(&toml_str).unwrap_err();
        assert!(err.to_string().contains("unknown cache type"));
    }

    #[test]
    fn redis_backend_requires_url() {
        let toml_str = r#"
[store]
backend = "redis"

[cmdb]
endpoint = "http://cmdb.local/api/"
app_code = "bk_monitorv3"
"#;
        assert!(TaskConfig::parse(toml_str).is_err());
    }

    #[test]
    fn from_file_reads_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "tenant = \"tenant-a\"\nmulti_tenant_mode = true\n{MINIMAL}").unwrap();
        let config = TaskConfig::from_file(file.path()).unwrap();
        assert_eq!(config.tenant.as_str(), "tenant-a");
        assert_eq!(config.resource_pool_biz(), 2);
    }
}
