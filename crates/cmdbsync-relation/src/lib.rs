//! cmdbsync-relation: the host/topology relation graph.
//!
//! Cache managers hand [`RelationInfo`]s to the [`RelationMetricsBuilder`]
//! as they refresh a business. The builder renders every adjacent pair of
//! a chain as one flat metric line:
//!
//! ```text
//! agent ── module ── set ── business
//!   agent_with_module_relation{agent_id="..",module_id=".."} 1
//!   module_with_set_relation{module_id="..",set_id=".."} 1
//!   business_with_set_relation{biz_id="..",set_id=".."} 1
//! ```
//!
//! [`RelationPusher`] ships the rendered lines to a [`MetricsSink`] on an
//! interval.

pub mod builder;
pub mod pool;
pub mod pusher;
pub mod render;
pub mod types;

pub use builder::RelationMetricsBuilder;
pub use pool::NodePool;
pub use pusher::{HttpPushSink, LogSink, MetricsSink, RelationPusher};
pub use types::{Labels, RelationInfo, RelationItem, RelationKind};
