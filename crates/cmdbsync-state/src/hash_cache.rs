//! HashCache: batched hash writes with per-key touched-field tracking.
//!
//! A refresh cycle resets the touched sets, writes everything it fetched
//! through [`HashCache::update_hash_map`], and then calls
//! [`HashCache::delete_missing_fields`] so that every stored field the
//! cycle did not write is removed. Only fields from a batch the store
//! accepted are marked touched.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::store::{SharedStore, scan_all};

/// Fields per store round trip.
pub const BATCH_SIZE: usize = 500;

/// Expiry applied to every key a global refresh writes.
pub const CACHE_EXPIRY: Duration = Duration::from_secs(7 * 24 * 3600);

pub struct HashCache {
    store: SharedStore,
    touched: BTreeMap<String, Mutex<HashSet<String>>>,
}

impl HashCache {
    /// A cache managing the given fully-qualified keys.
    pub fn new(store: SharedStore, keys: impl IntoIterator<Item = String>) -> Self {
        let touched = keys
            .into_iter()
            .map(|k| (k, Mutex::new(HashSet::new())))
            .collect();
        Self { store, touched }
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.touched.keys().map(String::as_str)
    }

    fn touched_set(&self, key: &str) -> StateResult<MutexGuard<'_, HashSet<String>>> {
        let set = self
            .touched
            .get(key)
            .ok_or_else(|| StateError::UnmanagedKey(key.to_string()))?;
        Ok(set.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Write fields in batches, marking each accepted batch as touched.
    pub async fn update_hash_map(&self, key: &str, fields: Vec<(String, String)>) -> StateResult<()> {
        // Fail before any write if the key is unknown.
        drop(self.touched_set(key)?);
        for batch in fields.chunks(BATCH_SIZE) {
            self.store.hset_many(key, batch).await?;
            let mut touched = self.touched_set(key)?;
            touched.extend(batch.iter().map(|(field, _)| field.clone()));
        }
        Ok(())
    }

    /// Delete stored fields that were not touched this cycle. An empty
    /// touched set removes the whole key. Returns the number of fields
    /// deleted, or `None` when the whole key was dropped.
    pub async fn delete_missing_fields(&self, key: &str) -> StateResult<Option<usize>> {
        let touched = self.touched_snapshot(key)?;
        if touched.is_empty() {
            self.store.del(key).await?;
            debug!(%key, "no fields touched, key dropped");
            return Ok(None);
        }
        let stale: Vec<String> = self
            .store
            .hkeys(key)
            .await?
            .into_iter()
            .filter(|field| !touched.contains(field))
            .collect();
        for batch in stale.chunks(BATCH_SIZE) {
            self.store.hdel(key, batch).await?;
        }
        if !stale.is_empty() {
            debug!(%key, deleted = stale.len(), "stale fields removed");
        }
        Ok(Some(stale.len()))
    }

    pub fn reset_all(&self) {
        for set in self.touched.values() {
            set.lock().unwrap_or_else(PoisonError::into_inner).clear();
        }
    }

    /// Explicit field delete. Deleted fields are no longer considered touched.
    pub async fn delete_fields(&self, key: &str, fields: &[String]) -> StateResult<()> {
        drop(self.touched_set(key)?);
        for batch in fields.chunks(BATCH_SIZE) {
            self.store.hdel(key, batch).await?;
        }
        let mut touched = self.touched_set(key)?;
        for field in fields {
            touched.remove(field);
        }
        Ok(())
    }

    /// Delete the candidates that were not written since the last reset.
    /// Returns the fields that were deleted.
    pub async fn delete_untouched<I>(&self, key: &str, candidates: I) -> StateResult<Vec<String>>
    where
        I: IntoIterator<Item = String>,
    {
        let doomed: Vec<String> = {
            let touched = self.touched_set(key)?;
            let mut seen = HashSet::new();
            candidates
                .into_iter()
                .filter(|c| !touched.contains(c) && seen.insert(c.clone()))
                .collect()
        };
        for batch in doomed.chunks(BATCH_SIZE) {
            self.store.hdel(key, batch).await?;
        }
        Ok(doomed)
    }

    /// Every field/value pair of `key` matching `pattern`.
    pub async fn scan_all(
        &self,
        key: &str,
        pattern: &str,
        batch: usize,
    ) -> StateResult<Vec<(String, String)>> {
        scan_all(self.store.as_ref(), key, pattern, batch).await
    }

    pub async fn expire(&self, keys: &[&str], ttl: Duration) -> StateResult<()> {
        for key in keys {
            self.store.expire(key, ttl).await?;
        }
        Ok(())
    }

    /// Expire every managed key.
    pub async fn expire_all(&self, ttl: Duration) -> StateResult<()> {
        let keys: Vec<&str> = self.keys().collect();
        self.expire(&keys, ttl).await
    }

    pub fn touched_snapshot(&self, key: &str) -> StateResult<HashSet<String>> {
        Ok(self.touched_set(key)?.clone())
    }
}
