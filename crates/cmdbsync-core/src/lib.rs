//! cmdbsync-core: shared vocabulary for the CMDB cache synchronizer.
//!
//! Everything other crates agree on lives here: tenants and cache key
//! namespacing, the resource kinds the change feed reports, the cache
//! types the managers own, typed change events, and the TOML task
//! configuration consumed by the daemon.

pub mod config;
pub mod events;
pub mod ids;
pub mod keys;
pub mod types;

pub use config::TaskConfig;
pub use events::{ChangeEvent, DecodeError, EventAction, ResourceChange, ResourceEvent};
pub use ids::IdList;
pub use keys::Namespace;
pub use types::*;
