//! Cache key layout.
//!
//! Every persisted key is `{namespace}.{domain}.{subkey}` where the
//! namespace is the configured prefix, qualified by tenant unless the
//! tenant is the default one.

use crate::types::{CacheType, ResourceKind, TenantId};

pub const BUSINESS: &str = "cmdb.business";
pub const HOST: &str = "cmdb.host";
pub const AGENT_ID: &str = "cmdb.agent_id";
pub const HOST_IP: &str = "cmdb.host_ip";
pub const TOPO: &str = "cmdb.topo";
pub const MODULE: &str = "cmdb.module";
pub const SERVICE_TEMPLATE: &str = "cmdb.service_template";
pub const SET: &str = "cmdb.set";
pub const SET_TEMPLATE: &str = "cmdb.set_template";
pub const SERVICE_INSTANCE: &str = "cmdb.service_instance";
pub const HOST_TO_SERVICE_INSTANCE: &str = "cmdb.host_to_service_instance_id";
pub const DYNAMIC_GROUP: &str = "cmdb.dynamic_group";

/// Key namespace for one `(tenant, prefix)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace {
    tenant: TenantId,
    prefix: String,
    rendered: String,
}

impl Namespace {
    pub fn new(tenant: TenantId, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        let rendered = if tenant.is_default() {
            prefix.clone()
        } else {
            format!("{tenant}.{prefix}")
        };
        Self {
            tenant,
            prefix,
            rendered,
        }
    }

    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn as_str(&self) -> &str {
        &self.rendered
    }

    /// The same prefix under the default tenant.
    pub fn default_tenant(&self) -> Namespace {
        Namespace::new(TenantId::default_tenant(), self.prefix.clone())
    }

    /// Full key for a cache subkey such as [`HOST`].
    pub fn key(&self, subkey: &str) -> String {
        format!("{}.{subkey}", self.rendered)
    }

    pub fn cursor_key(&self, kind: ResourceKind) -> String {
        format!("{}.cmdb_resource_watch_cursor.{kind}", self.rendered)
    }

    pub fn event_queue_key(&self, kind: ResourceKind) -> String {
        format!("{}.cmdb_resource_watch_event.{kind}", self.rendered)
    }

    pub fn last_refresh_key(&self, cache_type: CacheType) -> String {
        format!("{}.cmdb_last_refresh_all_time.{cache_type}", self.rendered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_tenant_is_unprefixed() {
        let ns = Namespace::new(TenantId::default_tenant(), "bkmonitorv3");
        assert_eq!(ns.key(HOST), "bkmonitorv3.cmdb.host");
        assert_eq!(
            ns.cursor_key(ResourceKind::HostRelation),
            "bkmonitorv3.cmdb_resource_watch_cursor.host_relation"
        );
    }

    #[test]
    fn other_tenants_are_prefixed() {
        let ns = Namespace::new(TenantId::new("tenant-a"), "bkmonitorv3");
        assert_eq!(ns.key(AGENT_ID), "tenant-a.bkmonitorv3.cmdb.agent_id");
        assert_eq!(
            ns.last_refresh_key(CacheType::HostTopo),
            "tenant-a.bkmonitorv3.cmdb_last_refresh_all_time.host_topo"
        );
        assert_eq!(ns.default_tenant().key(BUSINESS), "bkmonitorv3.cmdb.business");
    }
}
