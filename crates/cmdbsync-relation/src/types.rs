//! Relation nodes and per-entity relation infos.

use std::collections::BTreeMap;
use std::fmt;

/// Sorted label set of a node or metric line.
pub type Labels = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RelationKind {
    Agent,
    System,
    Host,
    Module,
    Set,
    Business,
    /// A custom mainline topology level, by object id.
    Custom(String),
}

impl RelationKind {
    pub fn name(&self) -> &str {
        match self {
            RelationKind::Agent => "agent",
            RelationKind::System => "system",
            RelationKind::Host => "host",
            RelationKind::Module => "module",
            RelationKind::Set => "set",
            RelationKind::Business => "business",
            RelationKind::Custom(name) => name,
        }
    }

    /// Label key carrying the node id. System nodes use `bk_target_ip`
    /// together with `bk_cloud_id`.
    pub fn id_label(&self) -> String {
        match self {
            RelationKind::Agent => "agent_id".to_string(),
            RelationKind::System => "bk_target_ip".to_string(),
            RelationKind::Host => "host_id".to_string(),
            RelationKind::Module => "module_id".to_string(),
            RelationKind::Set => "set_id".to_string(),
            RelationKind::Business => "biz_id".to_string(),
            RelationKind::Custom(name) => format!("{name}_id"),
        }
    }

    /// Map a CMDB topology object id onto a node kind.
    pub fn from_topo_obj(obj_id: &str) -> Self {
        match obj_id {
            "biz" => RelationKind::Business,
            "set" => RelationKind::Set,
            "module" => RelationKind::Module,
            other => RelationKind::Custom(other.to_string()),
        }
    }
}

impl fmt::Display for RelationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One node of a relation chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationItem {
    pub kind: RelationKind,
    pub labels: Labels,
}

impl RelationItem {
    pub fn new(kind: RelationKind, id: impl Into<String>) -> Self {
        let mut labels = Labels::new();
        labels.insert(kind.id_label(), id.into());
        Self { kind, labels }
    }

    pub fn system(ip: impl Into<String>, cloud_id: i64) -> Self {
        let mut labels = Labels::new();
        labels.insert("bk_target_ip".to_string(), ip.into());
        labels.insert("bk_cloud_id".to_string(), cloud_id.to_string());
        Self {
            kind: RelationKind::System,
            labels,
        }
    }
}

/// What one entity contributes to the graph: its own node, the chains
/// hanging off it, and extra info labels per node kind.
///
/// `id` names the entity the info belongs to, which is what
/// [`crate::RelationMetricsBuilder::clear_resource_with_id`] retracts. It
/// need not be the id of `node`: a host whose own node is its agent is
/// still filed under the host id.
#[derive(Debug, Clone, PartialEq)]
pub struct RelationInfo {
    pub id: String,
    pub node: RelationItem,
    pub links: Vec<Vec<RelationItem>>,
    pub expands: BTreeMap<String, Labels>,
}

impl RelationInfo {
    pub fn new(id: impl Into<String>, node: RelationItem) -> Self {
        Self {
            id: id.into(),
            node,
            links: Vec::new(),
            expands: BTreeMap::new(),
        }
    }

    pub fn with_link(mut self, link: Vec<RelationItem>) -> Self {
        self.links.push(link);
        self
    }

    pub fn with_expands(mut self, expands: BTreeMap<String, Labels>) -> Self {
        self.expands = expands;
        self
    }

    pub fn kind(&self) -> &RelationKind {
        &self.node.kind
    }
}
