//! cmdbsync-watch: incremental synchronization.
//!
//! A [`ChangeWatcher`] per resource kind polls the CMDB change feed and
//! appends raw events to a per-kind queue in the store. The
//! [`EventOrchestrator`] periodically drains those queues, folds the
//! events into [`DirtySets`] and applies them through the cache managers,
//! alongside the scheduled full refreshes.

pub mod dirty;
pub mod error;
pub mod orchestrator;
pub mod watcher;

pub use dirty::{CachePlan, DirtySets};
pub use error::{WatchError, WatchResult};
pub use orchestrator::{CycleReport, EventOrchestrator};
pub use watcher::{ChangeWatcher, CURSOR_TTL, POLL_IDLE};
