//! Wire types for CMDB responses.
//!
//! CMDB is loose about scalar types: ids arrive as numbers or numeric
//! strings, and optional text fields arrive as `null`. The lenient
//! deserializers at the bottom of this file absorb both.

use std::collections::BTreeMap;

use cmdbsync_core::ChangeEvent;
use cmdbsync_core::events::coerce_int;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// A raw CMDB attribute map, kept as-is for module, set and business rows.
pub type Record = Map<String, Value>;

/// Host attributes requested from `list_biz_hosts_topo`.
pub const HOST_FIELDS: &[&str] = &[
    "bk_host_innerip",
    "bk_host_innerip_v6",
    "bk_cloud_id",
    "bk_host_id",
    "bk_agent_id",
    "bk_host_outerip",
    "bk_host_outerip_v6",
    "bk_host_name",
    "bk_os_name",
    "bk_os_type",
    "operator",
    "bk_bak_operator",
    "bk_state_name",
    "bk_isp_name",
    "bk_province_name",
    "bk_supplier_account",
    "bk_state",
    "service_template_id",
    "srv_status",
    "bk_comment",
    "idc_unit_name",
    "net_device_id",
    "rack_id",
    "bk_svr_device_cls_name",
    "svr_device_class",
    "docker_client_version",
    "docker_server_version",
    "bk_mem",
    "bk_disk",
    "bk_os_bit",
    "bk_os_version",
    "bk_cpu_module",
    "bk_cpu",
    "version_meta",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub start: usize,
    pub limit: usize,
}

impl Page {
    pub fn first(limit: usize) -> Self {
        Self { start: 0, limit }
    }
}

/// One page of a listing plus the total the server reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Paged<T> {
    #[serde(default, deserialize_with = "lenient_usize")]
    pub count: usize,
    #[serde(
        default = "Vec::new",
        deserialize_with = "null_as_empty_vec",
        bound(deserialize = "T: Deserialize<'de>")
    )]
    pub info: Vec<T>,
}

impl<T> Paged<T> {
    pub fn new(count: usize, info: Vec<T>) -> Self {
        Self { count, info }
    }
}

// ── Hosts ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostRecord {
    #[serde(deserialize_with = "lenient_i64")]
    pub bk_host_id: i64,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub bk_cloud_id: i64,
    #[serde(default, deserialize_with = "lenient_string")]
    pub bk_host_innerip: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub bk_host_innerip_v6: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub bk_host_outerip: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub bk_host_outerip_v6: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub bk_host_name: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub bk_agent_id: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub operator: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub bk_bak_operator: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub bk_comment: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub bk_os_name: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub bk_os_type: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub bk_os_version: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub bk_os_bit: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub bk_province_name: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub bk_state: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub bk_state_name: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub bk_isp_name: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub bk_supplier_account: String,
    #[serde(default, deserialize_with = "lenient_opt_i64")]
    pub bk_mem: Option<i64>,
    #[serde(default, deserialize_with = "lenient_opt_i64")]
    pub bk_disk: Option<i64>,
    #[serde(default, deserialize_with = "lenient_opt_i64")]
    pub bk_cpu: Option<i64>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub bk_cpu_module: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub service_template_id: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub srv_status: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub idc_unit_name: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub net_device_id: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub rack_id: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub bk_svr_device_cls_name: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub svr_device_class: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub docker_client_version: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub docker_server_version: String,
    /// JSON object of per-kind expand labels, e.g. `{"host": {"version": "1.0"}}`.
    #[serde(default, deserialize_with = "lenient_string")]
    pub version_meta: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostTopoModule {
    #[serde(deserialize_with = "lenient_i64")]
    pub bk_module_id: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostTopoSet {
    #[serde(deserialize_with = "lenient_i64")]
    pub bk_set_id: i64,
    #[serde(default = "Vec::new", deserialize_with = "null_as_empty_vec")]
    pub module: Vec<HostTopoModule>,
}

/// One row of `list_biz_hosts_topo`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BizHostTopo {
    pub host: HostRecord,
    #[serde(default = "Vec::new", deserialize_with = "null_as_empty_vec")]
    pub topo: Vec<HostTopoSet>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudArea {
    #[serde(deserialize_with = "lenient_i64")]
    pub bk_cloud_id: i64,
    #[serde(default, deserialize_with = "lenient_string")]
    pub bk_cloud_name: String,
}

// ── Topology ────────────────────────────────────────────────────

/// A flattened topology node, as stored in the topo table and in host
/// `topo_link` chains.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopoNode {
    pub bk_inst_id: i64,
    pub bk_inst_name: String,
    pub bk_obj_id: String,
    pub bk_obj_name: String,
}

impl TopoNode {
    /// Topo table field: `"{obj}|{inst}"`.
    pub fn key(&self) -> String {
        format!("{}|{}", self.bk_obj_id, self.bk_inst_id)
    }
}

/// A node of the `search_biz_inst_topo` tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopoInstance {
    #[serde(deserialize_with = "lenient_i64")]
    pub bk_inst_id: i64,
    #[serde(default, deserialize_with = "lenient_string")]
    pub bk_inst_name: String,
    pub bk_obj_id: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub bk_obj_name: String,
    #[serde(default = "Vec::new", deserialize_with = "null_as_empty_vec")]
    pub child: Vec<TopoInstance>,
}

impl TopoInstance {
    pub fn node(&self) -> TopoNode {
        TopoNode {
            bk_inst_id: self.bk_inst_id,
            bk_inst_name: self.bk_inst_name.clone(),
            bk_obj_id: self.bk_obj_id.clone(),
            bk_obj_name: self.bk_obj_name.clone(),
        }
    }

    /// Depth-first, parents before children.
    pub fn traverse<F: FnMut(&TopoInstance)>(&self, f: &mut F) {
        f(self);
        for child in &self.child {
            child.traverse(f);
        }
    }

    /// For every module in the tree, the chain from the module up to the root.
    pub fn module_links(&self) -> BTreeMap<i64, Vec<TopoNode>> {
        let mut links = BTreeMap::new();
        let mut path = Vec::new();
        self.collect_links(&mut path, &mut links);
        links
    }

    fn collect_links(&self, path: &mut Vec<TopoNode>, links: &mut BTreeMap<i64, Vec<TopoNode>>) {
        path.push(self.node());
        if self.bk_obj_id == "module" {
            links.insert(self.bk_inst_id, path.iter().rev().cloned().collect());
        }
        for child in &self.child {
            child.collect_links(path, links);
        }
        path.pop();
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InternalModule {
    #[serde(deserialize_with = "lenient_i64")]
    pub bk_module_id: i64,
    #[serde(default, deserialize_with = "lenient_string")]
    pub bk_module_name: String,
}

/// The idle/fault/recycle module set every business carries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InternalModuleSet {
    #[serde(deserialize_with = "lenient_i64")]
    pub bk_set_id: i64,
    #[serde(default, deserialize_with = "lenient_string")]
    pub bk_set_name: String,
    #[serde(default = "Vec::new", deserialize_with = "null_as_empty_vec")]
    pub module: Vec<InternalModule>,
}

impl InternalModuleSet {
    /// The set as a topology subtree, to be hung under the business root.
    pub fn to_instance(&self) -> TopoInstance {
        TopoInstance {
            bk_inst_id: self.bk_set_id,
            bk_inst_name: self.bk_set_name.clone(),
            bk_obj_id: "set".to_string(),
            bk_obj_name: "Set".to_string(),
            child: self
                .module
                .iter()
                .map(|m| TopoInstance {
                    bk_inst_id: m.bk_module_id,
                    bk_inst_name: m.bk_module_name.clone(),
                    bk_obj_id: "module".to_string(),
                    bk_obj_name: "Module".to_string(),
                    child: Vec::new(),
                })
                .collect(),
        }
    }
}

// ── Business, services, groups ──────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectAttribute {
    pub bk_property_id: String,
    #[serde(default)]
    pub bk_property_type: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceInstanceDetail {
    #[serde(deserialize_with = "lenient_i64")]
    pub id: i64,
    #[serde(default, deserialize_with = "lenient_string")]
    pub name: String,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub bk_module_id: i64,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub bk_host_id: i64,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub service_template_id: i64,
    #[serde(default)]
    pub process_instances: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DynamicGroupRecord {
    #[serde(deserialize_with = "lenient_string")]
    pub id: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub bk_obj_id: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub name: String,
}

// ── Change feed ─────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WatchResponse {
    #[serde(default)]
    pub bk_watched: bool,
    #[serde(default = "Vec::new", deserialize_with = "null_as_empty_vec")]
    pub bk_events: Vec<ChangeEvent>,
}

// ── Tenant directory ────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Space {
    #[serde(deserialize_with = "lenient_i64")]
    pub id: i64,
    pub space_type_id: String,
    pub space_id: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub space_name: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub time_zone: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub bk_tenant_id: String,
}

impl Space {
    pub fn space_uid(&self) -> String {
        format!("{}__{}", self.space_type_id, self.space_id)
    }

    /// Spaces of type `bkcc` are CMDB businesses already.
    pub fn is_cmdb_business(&self) -> bool {
        self.space_type_id == "bkcc"
    }
}

// ── Lenient deserializers ───────────────────────────────────────

fn lenient_i64<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
    Ok(lenient_opt_i64(d)?.unwrap_or_default())
}

fn lenient_opt_i64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<i64>, D::Error> {
    let value = Value::deserialize(d)?;
    Ok(coerce_int(&value))
}

fn lenient_usize<'de, D: Deserializer<'de>>(d: D) -> Result<usize, D::Error> {
    let value = Value::deserialize(d)?;
    Ok(coerce_int(&value)
        .and_then(|n| usize::try_from(n).ok())
        .unwrap_or_default())
}

fn lenient_string<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    Ok(match Value::deserialize(d)? {
        Value::Null => String::new(),
        Value::String(s) => s,
        other => other.to_string(),
    })
}

fn null_as_empty_vec<'de, D, T>(d: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(d)?.unwrap_or_default())
}
