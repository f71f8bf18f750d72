//! Cached entity snapshots and the normalizations applied before writing.

use std::collections::BTreeMap;

use cmdbsync_api::TopoNode;
use cmdbsync_api::types::{BizHostTopo, ServiceInstanceDetail};
use cmdbsync_relation::Labels;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

/// Host snapshot stored under both `"{ip}|{cloud}"` and `"{host_id}"`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostInfo {
    pub bk_biz_id: i64,
    pub bk_agent_id: String,
    pub operator: Vec<String>,
    pub bk_bak_operator: Vec<String>,
    pub bk_cloud_id: i64,
    pub bk_comment: String,
    pub bk_host_id: i64,
    pub bk_host_innerip: String,
    pub bk_host_innerip_v6: String,
    pub bk_host_name: String,
    pub bk_host_outerip: String,
    pub bk_host_outerip_v6: String,
    pub bk_os_name: String,
    pub bk_os_type: String,
    pub bk_os_version: String,
    pub bk_os_bit: String,
    pub bk_province_name: String,
    pub bk_state: String,
    pub bk_state_name: String,
    pub bk_isp_name: String,
    pub bk_supplier_account: String,
    pub bk_mem: Option<i64>,
    pub bk_disk: Option<i64>,
    pub bk_cpu: Option<i64>,
    pub bk_cpu_module: String,
    pub service_template_id: String,
    pub srv_status: String,
    pub idc_unit_name: String,
    pub net_device_id: String,
    pub rack_id: String,
    pub bk_svr_device_cls_name: String,
    pub svr_device_class: String,
    pub docker_client_version: String,
    pub docker_server_version: String,

    pub ip: String,
    pub bk_set_ids: Vec<i64>,
    pub bk_module_ids: Vec<i64>,
    pub bk_cloud_name: String,
    pub display_name: String,
    /// `"module|{id}"` to the chain from that module up to the business.
    pub topo_link: BTreeMap<String, Vec<TopoNode>>,
    pub expands: BTreeMap<String, Map<String, Value>>,
}

impl HostInfo {
    pub fn from_row(row: &BizHostTopo, biz_id: i64) -> Self {
        let host = &row.host;
        let display_name = [&host.bk_host_innerip, &host.bk_host_name, &host.bk_host_innerip_v6]
            .into_iter()
            .find(|s| !s.is_empty())
            .cloned()
            .unwrap_or_default();
        let bk_state = if host.srv_status.is_empty() {
            host.bk_state.clone()
        } else {
            host.srv_status.clone()
        };
        let expands = if host.version_meta.is_empty() {
            BTreeMap::new()
        } else {
            serde_json::from_str(&host.version_meta).unwrap_or_else(|e| {
                warn!(host_id = host.bk_host_id, error = %e, "invalid version_meta ignored");
                BTreeMap::new()
            })
        };

        Self {
            bk_biz_id: biz_id,
            bk_agent_id: host.bk_agent_id.clone(),
            operator: split_users(&host.operator),
            bk_bak_operator: split_users(&host.bk_bak_operator),
            bk_cloud_id: host.bk_cloud_id,
            bk_comment: host.bk_comment.clone(),
            bk_host_id: host.bk_host_id,
            bk_host_innerip: host.bk_host_innerip.clone(),
            bk_host_innerip_v6: host.bk_host_innerip_v6.clone(),
            bk_host_name: host.bk_host_name.clone(),
            bk_host_outerip: host.bk_host_outerip.clone(),
            bk_host_outerip_v6: host.bk_host_outerip_v6.clone(),
            bk_os_name: host.bk_os_name.clone(),
            bk_os_type: host.bk_os_type.clone(),
            bk_os_version: host.bk_os_version.clone(),
            bk_os_bit: host.bk_os_bit.clone(),
            bk_province_name: host.bk_province_name.clone(),
            bk_state,
            bk_state_name: host.bk_state_name.clone(),
            bk_isp_name: host.bk_isp_name.clone(),
            bk_supplier_account: host.bk_supplier_account.clone(),
            bk_mem: host.bk_mem,
            bk_disk: host.bk_disk,
            bk_cpu: host.bk_cpu,
            bk_cpu_module: host.bk_cpu_module.clone(),
            service_template_id: host.service_template_id.clone(),
            srv_status: host.srv_status.clone(),
            idc_unit_name: host.idc_unit_name.clone(),
            net_device_id: host.net_device_id.clone(),
            rack_id: host.rack_id.clone(),
            bk_svr_device_cls_name: host.bk_svr_device_cls_name.clone(),
            svr_device_class: host.svr_device_class.clone(),
            docker_client_version: host.docker_client_version.clone(),
            docker_server_version: host.docker_server_version.clone(),

            ip: host.bk_host_innerip.clone(),
            bk_set_ids: row.topo.iter().map(|s| s.bk_set_id).collect(),
            bk_module_ids: row
                .topo
                .iter()
                .flat_map(|s| s.module.iter().map(|m| m.bk_module_id))
                .collect(),
            bk_cloud_name: String::new(),
            display_name,
            topo_link: BTreeMap::new(),
            expands,
        }
    }

    /// `"{ip}|{cloud}"`, when the host has an inner ip.
    pub fn composite_key(&self) -> Option<String> {
        composite_key(&self.bk_host_innerip, self.bk_cloud_id)
    }

    pub fn id_key(&self) -> String {
        self.bk_host_id.to_string()
    }
}

pub fn composite_key(ip: &str, cloud_id: i64) -> Option<String> {
    (!ip.is_empty()).then(|| format!("{ip}|{cloud_id}"))
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceInstanceInfo {
    pub bk_biz_id: i64,
    pub id: i64,
    pub service_instance_id: i64,
    pub name: String,
    pub bk_module_id: i64,
    pub bk_host_id: i64,
    pub service_template_id: i64,
    pub process_instances: Value,
    pub ip: String,
    pub bk_cloud_id: i64,
    pub topo_link: BTreeMap<String, Vec<TopoNode>>,
}

impl ServiceInstanceInfo {
    pub fn new(detail: &ServiceInstanceDetail, biz_id: i64) -> Self {
        Self {
            bk_biz_id: biz_id,
            id: detail.id,
            service_instance_id: detail.id,
            name: detail.name.clone(),
            bk_module_id: detail.bk_module_id,
            bk_host_id: detail.bk_host_id,
            service_template_id: detail.service_template_id,
            process_instances: detail.process_instances.clone(),
            ..Self::default()
        }
    }

    /// Copy the host's address and the topology link of this instance's module.
    pub fn enrich(&mut self, host: &HostInfo) {
        self.ip = host.bk_host_innerip.clone();
        self.bk_cloud_id = host.bk_cloud_id;
        let module_key = format!("module|{}", self.bk_module_id);
        if let Some(link) = host.topo_link.get(&module_key) {
            self.topo_link.insert(module_key, link.clone());
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DynamicGroupInfo {
    pub bk_biz_id: i64,
    pub bk_inst_ids: Vec<i64>,
    pub bk_obj_id: String,
    pub name: String,
    pub id: String,
}

// ── Normalization ───────────────────────────────────────────────

/// Comma-separated user list to an array. An empty string is an empty list.
pub fn split_users(raw: &str) -> Vec<String> {
    if raw.is_empty() {
        Vec::new()
    } else {
        raw.split(',').map(str::to_string).collect()
    }
}

/// Replace string-valued user-list fields of a record with arrays.
pub fn split_user_fields<'a>(record: &mut Map<String, Value>, fields: impl IntoIterator<Item = &'a str>) {
    for field in fields {
        let users = match record.get(field) {
            Some(Value::String(raw)) => split_users(raw),
            Some(Value::Array(_)) => continue,
            _ => Vec::new(),
        };
        record.insert(
            field.to_string(),
            Value::Array(users.into_iter().map(Value::String).collect()),
        );
    }
}

/// Flatten a parsed expand object into string labels.
pub fn expand_labels(values: &Map<String, Value>) -> Labels {
    values
        .iter()
        .map(|(k, v)| {
            let v = match v {
                Value::String(s) => s.clone(),
                Value::Null => String::new(),
                other => other.to_string(),
            };
            (k.clone(), v)
        })
        .collect()
}

/// Parse a `version_meta`-style JSON string of per-kind expand objects.
pub fn parse_expands(raw: Option<&Value>) -> BTreeMap<String, Labels> {
    let Some(Value::String(raw)) = raw else {
        return BTreeMap::new();
    };
    if raw.is_empty() {
        return BTreeMap::new();
    }
    match serde_json::from_str::<BTreeMap<String, Map<String, Value>>>(raw) {
        Ok(parsed) => parsed
            .iter()
            .map(|(kind, values)| (kind.clone(), expand_labels(values)))
            .collect(),
        Err(e) => {
            warn!(error = %e, "invalid expand metadata ignored");
            BTreeMap::new()
        }
    }
}
