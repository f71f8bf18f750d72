//! The key-value contract the cache is written against.
//!
//! The command set is the subset of Redis the synchronizer needs: hashes
//! for cache tables, plain strings for cursors and timestamps, and lists
//! for queued change events.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;

use crate::error::{StateError, StateResult};

/// Shared handle used by every manager, watcher and orchestrator.
pub type SharedStore = Arc<dyn KvStore>;

#[async_trait]
pub trait KvStore: Send + Sync {
    /// Write many fields of one hash in a single round trip.
    async fn hset_many(&self, key: &str, fields: &[(String, String)]) -> StateResult<()>;

    async fn hget(&self, key: &str, field: &str) -> StateResult<Option<String>>;

    /// Values in the same order as `fields`; `None` where a field is absent.
    async fn hmget(&self, key: &str, fields: &[String]) -> StateResult<Vec<Option<String>>>;

    async fn hkeys(&self, key: &str) -> StateResult<Vec<String>>;

    /// Delete fields, returning how many existed.
    async fn hdel(&self, key: &str, fields: &[String]) -> StateResult<usize>;

    /// One step of a cursor scan over a hash. A returned cursor of 0 ends
    /// the scan. `count` is a hint.
    async fn hscan(
        &self,
        key: &str,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> StateResult<(u64, Vec<(String, String)>)>;

    async fn del(&self, key: &str) -> StateResult<()>;

    async fn expire(&self, key: &str, ttl: Duration) -> StateResult<()>;

    async fn get(&self, key: &str) -> StateResult<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StateResult<()>;

    async fn rpush(&self, key: &str, values: &[String]) -> StateResult<()>;

    async fn lpop(&self, key: &str) -> StateResult<Option<String>>;

    async fn llen(&self, key: &str) -> StateResult<usize>;
}

/// Walk a hash to completion with repeated `hscan` calls.
pub async fn scan_all(
    store: &dyn KvStore,
    key: &str,
    pattern: &str,
    batch: usize,
) -> StateResult<Vec<(String, String)>> {
    let mut cursor = 0u64;
    let mut out = Vec::new();
    loop {
        let (next, entries) = store.hscan(key, cursor, pattern, batch).await?;
        out.extend(entries);
        if next == 0 {
            break;
        }
        cursor = next;
    }
    Ok(out)
}

/// Redis-style glob matcher supporting `*` and `?`.
#[derive(Debug, Clone)]
pub struct GlobPattern {
    regex: Option<Regex>,
}

impl GlobPattern {
    pub fn new(pattern: &str) -> StateResult<Self> {
        if pattern == "*" {
            return Ok(Self { regex: None });
        }
        let mut expr = String::with_capacity(pattern.len() + 8);
        expr.push('^');
        let mut literal = String::new();
        for c in pattern.chars() {
            match c {
                '*' | '?' => {
                    expr.push_str(&regex::escape(&literal));
                    literal.clear();
                    expr.push_str(if c == '*' { ".*" } else { "." });
                }
                _ => literal.push(c),
            }
        }
        expr.push_str(&regex::escape(&literal));
        expr.push('$');
        let regex = Regex::new(&expr).map_err(|e| StateError::Pattern(e.to_string()))?;
        Ok(Self { regex: Some(regex) })
    }

    pub fn matches(&self, candidate: &str) -> bool {
        self.regex.as_ref().is_none_or(|r| r.is_match(candidate))
    }
}
