//! Shared types used across cmdbsync crates.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Tenant whose cache keys are not prefixed, for compatibility with
/// consumers that predate multi-tenancy.
pub const DEFAULT_TENANT: &str = "system";

/// Isolation scope for cache keys and CMDB clients.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn default_tenant() -> Self {
        Self(DEFAULT_TENANT.to_string())
    }

    pub fn is_default(&self) -> bool {
        self.0 == DEFAULT_TENANT
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TenantId {
    fn default() -> Self {
        Self::default_tenant()
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TenantId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Error, PartialEq)]
#[error("unknown {what}: {value}")]
pub struct UnknownVariant {
    pub what: &'static str,
    pub value: String,
}

/// Resource kinds reported by the CMDB change feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Host,
    HostRelation,
    Biz,
    Set,
    Module,
    MainlineInstance,
    Process,
    DynamicGroup,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 8] = [
        ResourceKind::Host,
        ResourceKind::HostRelation,
        ResourceKind::Biz,
        ResourceKind::Set,
        ResourceKind::Module,
        ResourceKind::MainlineInstance,
        ResourceKind::Process,
        ResourceKind::DynamicGroup,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Host => "host",
            ResourceKind::HostRelation => "host_relation",
            ResourceKind::Biz => "biz",
            ResourceKind::Set => "set",
            ResourceKind::Module => "module",
            ResourceKind::MainlineInstance => "mainline_instance",
            ResourceKind::Process => "process",
            ResourceKind::DynamicGroup => "dynamic_group",
        }
    }

    /// The cache whose entries this kind's events invalidate.
    pub fn cache_type(&self) -> CacheType {
        match self {
            ResourceKind::Host | ResourceKind::HostRelation | ResourceKind::MainlineInstance => {
                CacheType::HostTopo
            }
            ResourceKind::Biz => CacheType::Business,
            ResourceKind::Set => CacheType::Set,
            ResourceKind::Module => CacheType::Module,
            ResourceKind::Process => CacheType::ServiceInstance,
            ResourceKind::DynamicGroup => CacheType::DynamicGroup,
        }
    }

    /// Detail fields requested from the change feed for this kind.
    pub fn watch_fields(&self) -> &'static [&'static str] {
        match self {
            ResourceKind::Host => &["bk_host_id", "bk_host_innerip", "bk_cloud_id", "bk_agent_id"],
            ResourceKind::HostRelation => &["bk_host_id", "bk_biz_id"],
            ResourceKind::Biz => &["bk_biz_id"],
            ResourceKind::Set => &["bk_biz_id", "bk_set_id", "set_template_id"],
            ResourceKind::Module => &["bk_module_id", "bk_biz_id", "service_template_id"],
            ResourceKind::MainlineInstance => {
                &["bk_obj_id", "bk_inst_id", "bk_obj_name", "bk_inst_name"]
            }
            ResourceKind::Process => &["bk_biz_id", "service_instance_id"],
            ResourceKind::DynamicGroup => &["bk_biz_id", "id"],
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ResourceKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| UnknownVariant {
                what: "resource kind",
                value: s.to_string(),
            })
    }
}

/// The six caches kept in the key-value store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheType {
    HostTopo,
    Business,
    Module,
    Set,
    ServiceInstance,
    DynamicGroup,
}

impl CacheType {
    pub const ALL: [CacheType; 6] = [
        CacheType::HostTopo,
        CacheType::Business,
        CacheType::Module,
        CacheType::Set,
        CacheType::ServiceInstance,
        CacheType::DynamicGroup,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CacheType::HostTopo => "host_topo",
            CacheType::Business => "business",
            CacheType::Module => "module",
            CacheType::Set => "set",
            CacheType::ServiceInstance => "service_instance",
            CacheType::DynamicGroup => "dynamic_group",
        }
    }

    /// Resource kinds whose events feed this cache.
    pub fn resource_kinds(&self) -> Vec<ResourceKind> {
        ResourceKind::ALL
            .into_iter()
            .filter(|kind| kind.cache_type() == *self)
            .collect()
    }
}

impl fmt::Display for CacheType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CacheType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CacheType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownVariant {
                what: "cache type",
                value: s.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_kind_parse_roundtrip() {
        for kind in ResourceKind::ALL {
            assert_eq!(kind.as_str().parse::<ResourceKind>().unwrap(), kind);
        }
        assert!("hosts".parse::<ResourceKind>().is_err());
    }

    #[test]
    fn host_side_kinds_feed_host_topo() {
        let kinds = CacheType::HostTopo.resource_kinds();
        assert_eq!(
            kinds,
            vec![
                ResourceKind::Host,
                ResourceKind::HostRelation,
                ResourceKind::MainlineInstance
            ]
        );
        assert_eq!(CacheType::Business.resource_kinds(), vec![ResourceKind::Biz]);
    }

    #[test]
    fn unknown_cache_type_is_rejected() {
        let err = "hosts".parse::<CacheType>().unwrap_err();
        assert_eq!(err.to_string(), "unknown cache type: hosts");
    }

    #[test]
    fn default_tenant_detection() {
        assert!(TenantId::default().is_default());
        assert!(!TenantId::new("tenant-a").is_default());
    }
}
