//! Change feed events.
//!
//! [`ChangeEvent`] is the wire form queued by the watcher. [`ResourceEvent`]
//! is the typed form the orchestrator and cache managers consume, produced
//! by a single [`ResourceEvent::decode`] step.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::types::ResourceKind;

/// One entry of the CMDB resource watch feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    #[serde(default)]
    pub bk_cursor: String,
    #[serde(default)]
    pub bk_resource: String,
    #[serde(default)]
    pub bk_event_type: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub bk_detail: Map<String, Value>,
}

fn null_as_empty<'de, D>(d: D) -> Result<Map<String, Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Map<String, Value>>::deserialize(d)?.unwrap_or_default())
}

#[derive(Debug, Error, PartialEq)]
pub enum DecodeError {
    #[error("malformed event json: {0}")]
    Json(String),
    #[error("unknown event type: {0}")]
    UnknownAction(String),
    #[error("field {field} missing or not an integer")]
    Integer { field: &'static str },
    #[error("field {field} missing or empty")]
    Text { field: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventAction {
    Create,
    Update,
    Delete,
}

impl EventAction {
    pub fn parse(s: &str) -> Result<Self, DecodeError> {
        match s {
            "create" => Ok(EventAction::Create),
            "update" => Ok(EventAction::Update),
            "delete" => Ok(EventAction::Delete),
            other => Err(DecodeError::UnknownAction(other.to_string())),
        }
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, EventAction::Delete)
    }
}

/// Identifying data carried by an event, one variant per resource kind.
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceChange {
    Host {
        host_id: i64,
        inner_ip: Option<String>,
        cloud_id: i64,
        agent_id: Option<String>,
    },
    HostRelation {
        host_id: i64,
        biz_id: i64,
    },
    Biz {
        biz_id: i64,
    },
    Set {
        biz_id: i64,
        set_id: i64,
        set_template_id: Option<i64>,
    },
    Module {
        biz_id: i64,
        module_id: i64,
        service_template_id: Option<i64>,
    },
    MainlineInstance {
        obj_id: String,
        inst_id: i64,
        obj_name: String,
        inst_name: String,
    },
    Process {
        biz_id: i64,
        service_instance_id: i64,
    },
    DynamicGroup {
        biz_id: i64,
        group_id: String,
    },
}

impl ResourceChange {
    pub fn kind(&self) -> ResourceKind {
        match self {
            ResourceChange::Host { .. } => ResourceKind::Host,
            ResourceChange::HostRelation { .. } => ResourceKind::HostRelation,
            ResourceChange::Biz { .. } => ResourceKind::Biz,
            ResourceChange::Set { .. } => ResourceKind::Set,
            ResourceChange::Module { .. } => ResourceKind::Module,
            ResourceChange::MainlineInstance { .. } => ResourceKind::MainlineInstance,
            ResourceChange::Process { .. } => ResourceKind::Process,
            ResourceChange::DynamicGroup { .. } => ResourceKind::DynamicGroup,
        }
    }

    /// Business the change belongs to, when the event carries one.
    pub fn biz_id(&self) -> Option<i64> {
        match self {
            ResourceChange::HostRelation { biz_id, .. }
            | ResourceChange::Biz { biz_id }
            | ResourceChange::Set { biz_id, .. }
            | ResourceChange::Module { biz_id, .. }
            | ResourceChange::Process { biz_id, .. }
            | ResourceChange::DynamicGroup { biz_id, .. } => Some(*biz_id),
            ResourceChange::Host { .. } | ResourceChange::MainlineInstance { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResourceEvent {
    pub action: EventAction,
    pub cursor: String,
    pub change: ResourceChange,
}

impl ResourceEvent {
    pub fn is_delete(&self) -> bool {
        self.action.is_delete()
    }

    /// Decode a queued JSON entry for `kind`.
    pub fn decode_json(kind: ResourceKind, raw: &str) -> Result<Self, DecodeError> {
        let event: ChangeEvent =
            serde_json::from_str(raw).map_err(|e| DecodeError::Json(e.to_string()))?;
        Self::decode(kind, &event)
    }

    /// Decode a wire event. The kind comes from the queue the event was
    /// read from, not from `bk_resource`, which some feeds leave empty.
    pub fn decode(kind: ResourceKind, event: &ChangeEvent) -> Result<Self, DecodeError> {
        let action = EventAction::parse(&event.bk_event_type)?;
        let d = &event.bk_detail;
        let change = match kind {
            ResourceKind::Host => ResourceChange::Host {
                host_id: int(d, "bk_host_id")?,
                inner_ip: opt_text(d, "bk_host_innerip"),
                cloud_id: opt_int(d, "bk_cloud_id").unwrap_or(0),
                agent_id: opt_text(d, "bk_agent_id"),
            },
            ResourceKind::HostRelation => ResourceChange::HostRelation {
                host_id: int(d, "bk_host_id")?,
                biz_id: int(d, "bk_biz_id")?,
            },
            ResourceKind::Biz => ResourceChange::Biz {
                biz_id: int(d, "bk_biz_id")?,
            },
            ResourceKind::Set => ResourceChange::Set {
                biz_id: int(d, "bk_biz_id")?,
                set_id: int(d, "bk_set_id")?,
                set_template_id: opt_int(d, "set_template_id"),
            },
            ResourceKind::Module => ResourceChange::Module {
                biz_id: int(d, "bk_biz_id")?,
                module_id: int(d, "bk_module_id")?,
                service_template_id: opt_int(d, "service_template_id"),
            },
            ResourceKind::MainlineInstance => ResourceChange::MainlineInstance {
                obj_id: text(d, "bk_obj_id")?,
                inst_id: int(d, "bk_inst_id")?,
                obj_name: opt_text(d, "bk_obj_name").unwrap_or_default(),
                inst_name: opt_text(d, "bk_inst_name").unwrap_or_default(),
            },
            ResourceKind::Process => ResourceChange::Process {
                biz_id: int(d, "bk_biz_id")?,
                service_instance_id: int(d, "service_instance_id")?,
            },
            ResourceKind::DynamicGroup => ResourceChange::DynamicGroup {
                biz_id: int(d, "bk_biz_id")?,
                group_id: text_or_number(d, "id")?,
            },
        };
        Ok(ResourceEvent {
            action,
            cursor: event.bk_cursor.clone(),
            change,
        })
    }
}

// ── Field coercion ──────────────────────────────────────────────

/// Numbers or numeric strings. Floats with no fractional part are accepted.
pub fn coerce_int(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn opt_int(d: &Map<String, Value>, field: &'static str) -> Option<i64> {
    d.get(field).and_then(coerce_int)
}

fn int(d: &Map<String, Value>, field: &'static str) -> Result<i64, DecodeError> {
    opt_int(d, field).ok_or(DecodeError::Integer { field })
}

fn opt_text(d: &Map<String, Value>, field: &'static str) -> Option<String> {
    match d.get(field) {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

fn text(d: &Map<String, Value>, field: &'static str) -> Result<String, DecodeError> {
    opt_text(d, field).ok_or(DecodeError::Text { field })
}

fn text_or_number(d: &Map<String, Value>, field: &'static str) -> Result<String, DecodeError> {
    match d.get(field) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        _ => Err(DecodeError::Text { field }),
    }
}
