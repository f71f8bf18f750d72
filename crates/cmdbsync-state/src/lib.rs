//! cmdbsync-state: key-value storage for the CMDB cache.
//!
//! # Architecture
//!
//! Everything above this crate talks to a [`KvStore`]: a small, Redis-shaped
//! command set (hashes, strings, lists, expiry). Two backends implement it:
//!
//! - [`RedisStore`], the production backend shared with cache consumers.
//! - [`RedbStore`], an embedded redb database for single-node runs and tests.
//!
//! [`HashCache`] sits on top of a store and owns the touched-field
//! bookkeeping that lets a full refresh delete exactly what it did not
//! rewrite.

pub mod error;
pub mod hash_cache;
pub mod redb_store;
pub mod redis_store;
pub mod store;
pub mod tables;

pub use error::{StateError, StateResult};
pub use hash_cache::{BATCH_SIZE, CACHE_EXPIRY, HashCache};
pub use redb_store::RedbStore;
pub use redis_store::RedisStore;
pub use store::{GlobPattern, KvStore, SharedStore, scan_all};
