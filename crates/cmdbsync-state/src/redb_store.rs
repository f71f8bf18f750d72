//! RedbStore: embedded [`KvStore`] backed by redb.
//!
//! Used for single-node deployments and as the store in every test. Hash
//! and list members are laid out by [`crate::tables`]; expiry is lazy and
//! applied when a key is next read or written.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use redb::{Database, ReadTransaction, ReadableDatabase, ReadableTable, WriteTransaction};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::store::{GlobPattern, KvStore};
use crate::tables::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe embedded store.
#[derive(Clone)]
pub struct RedbStore {
    db: Arc<Database>,
}

impl RedbStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "redb store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory redb store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(HASH_FIELDS).map_err(map_err!(Table))?;
        txn.open_table(STRINGS).map_err(map_err!(Table))?;
        txn.open_table(LISTS).map_err(map_err!(Table))?;
        txn.open_table(EXPIRY).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Read transaction, or `None` when `key` has expired.
    fn read_live(&self, key: &str) -> StateResult<Option<ReadTransaction>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let expired = {
            let expiry = txn.open_table(EXPIRY).map_err(map_err!(Table))?;
            match expiry.get(key).map_err(map_err!(Read))? {
                Some(deadline) => deadline.value() <= epoch_secs(),
                None => false,
            }
        };
        Ok((!expired).then_some(txn))
    }

    /// Write transaction with `key` purged first if it has expired.
    fn write_live(&self, key: &str) -> StateResult<WriteTransaction> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let expired = {
            let expiry = txn.open_table(EXPIRY).map_err(map_err!(Table))?;
            match expiry.get(key).map_err(map_err!(Read))? {
                Some(deadline) => deadline.value() <= epoch_secs(),
                None => false,
            }
        };
        if expired {
            remove_key(&txn, key)?;
        }
        Ok(txn)
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

// ── Table helpers ──────────────────────────────────────────────────

fn member_keys<T>(table: &T, key: &str) -> StateResult<Vec<String>>
where
    T: ReadableTable<&'static str, &'static str>,
{
    let (start, end) = member_range(key);
    let mut out = Vec::new();
    for entry in table
        .range(start.as_str()..end.as_str())
        .map_err(map_err!(Read))?
    {
        let (k, _) = entry.map_err(map_err!(Read))?;
        out.push(k.value().to_string());
    }
    Ok(out)
}

fn has_members<T>(table: &T, key: &str) -> StateResult<bool>
where
    T: ReadableTable<&'static str, &'static str>,
{
    let (start, end) = member_range(key);
    let mut range = table
        .range(start.as_str()..end.as_str())
        .map_err(map_err!(Read))?;
    Ok(range.next().is_some())
}

fn key_exists(txn: &WriteTransaction, key: &str) -> StateResult<bool> {
    let strings = txn.open_table(STRINGS).map_err(map_err!(Table))?;
    if strings.get(key).map_err(map_err!(Read))?.is_some() {
        return Ok(true);
    }
    let hashes = txn.open_table(HASH_FIELDS).map_err(map_err!(Table))?;
    if has_members(&hashes, key)? {
        return Ok(true);
    }
    let lists = txn.open_table(LISTS).map_err(map_err!(Table))?;
    has_members(&lists, key)
}

fn remove_key(txn: &WriteTransaction, key: &str) -> StateResult<bool> {
    let mut removed = false;
    {
        let mut strings = txn.open_table(STRINGS).map_err(map_err!(Table))?;
        removed |= strings.remove(key).map_err(map_err!(Write))?.is_some();
    }
    for def in [HASH_FIELDS, LISTS] {
        let mut table = txn.open_table(def).map_err(map_err!(Table))?;
        let members = member_keys(&table, key)?;
        removed |= !members.is_empty();
        for member in &members {
            table.remove(member.as_str()).map_err(map_err!(Write))?;
        }
    }
    let mut expiry = txn.open_table(EXPIRY).map_err(map_err!(Table))?;
    expiry.remove(key).map_err(map_err!(Write))?;
    Ok(removed)
}

/// Drop the expiry of a key whose last member was just removed.
fn forget_if_empty(txn: &WriteTransaction, key: &str) -> StateResult<()> {
    if !key_exists(txn, key)? {
        let mut expiry = txn.open_table(EXPIRY).map_err(map_err!(Table))?;
        expiry.remove(key).map_err(map_err!(Write))?;
    }
    Ok(())
}

fn list_seq(key: &str, stored: &str) -> u64 {
    member_name(key, stored).parse().unwrap_or(0)
}

#[async_trait]
impl KvStore for RedbStore {
    async fn hset_many(&self, key: &str, fields: &[(String, String)]) -> StateResult<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let txn = self.write_live(key)?;
        {
            let mut table = txn.open_table(HASH_FIELDS).map_err(map_err!(Table))?;
            for (field, value) in fields {
                table
                    .insert(member_key(key, field).as_str(), value.as_str())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> StateResult<Option<String>> {
        let Some(txn) = self.read_live(key)? else {
            return Ok(None);
        };
        let table = txn.open_table(HASH_FIELDS).map_err(map_err!(Table))?;
        let value = table
            .get(member_key(key, field).as_str())
            .map_err(map_err!(Read))?
            .map(|guard| guard.value().to_string());
        Ok(value)
    }

    async fn hmget(&self, key: &str, fields: &[String]) -> StateResult<Vec<Option<String>>> {
        let Some(txn) = self.read_live(key)? else {
            return Ok(vec![None; fields.len()]);
        };
        let table = txn.open_table(HASH_FIELDS).map_err(map_err!(Table))?;
        let mut values = Vec::with_capacity(fields.len());
        for field in fields {
            let value = table
                .get(member_key(key, field).as_str())
                .map_err(map_err!(Read))?
                .map(|guard| guard.value().to_string());
            values.push(value);
        }
        Ok(values)
    }

    async fn hkeys(&self, key: &str) -> StateResult<Vec<String>> {
        let Some(txn) = self.read_live(key)? else {
            return Ok(Vec::new());
        };
        let table = txn.open_table(HASH_FIELDS).map_err(map_err!(Table))?;
        Ok(member_keys(&table, key)?
            .iter()
            .map(|stored| member_name(key, stored).to_string())
            .collect())
    }

    async fn hdel(&self, key: &str, fields: &[String]) -> StateResult<usize> {
        if fields.is_empty() {
            return Ok(0);
        }
        let txn = self.write_live(key)?;
        let mut removed = 0;
        {
            let mut table = txn.open_table(HASH_FIELDS).map_err(map_err!(Table))?;
            for field in fields {
                if table
                    .remove(member_key(key, field).as_str())
                    .map_err(map_err!(Write))?
                    .is_some()
                {
                    removed += 1;
                }
            }
        }
        forget_if_empty(&txn, key)?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(removed)
    }

    async fn hscan(
        &self,
        key: &str,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> StateResult<(u64, Vec<(String, String)>)> {
        let glob = GlobPattern::new(pattern)?;
        let Some(txn) = self.read_live(key)? else {
            return Ok((0, Vec::new()));
        };
        let table = txn.open_table(HASH_FIELDS).map_err(map_err!(Table))?;
        let (start, end) = member_range(key);
        let mut iter = table
            .range(start.as_str()..end.as_str())
            .map_err(map_err!(Read))?
            .skip(cursor as usize);

        // The cursor is the number of fields already visited.
        let mut visited = 0u64;
        let mut out = Vec::new();
        while visited < count.max(1) as u64 {
            let Some(entry) = iter.next() else {
                return Ok((0, out));
            };
            let (k, v) = entry.map_err(map_err!(Read))?;
            visited += 1;
            let field = member_name(key, k.value());
            if glob.matches(field) {
                out.push((field.to_string(), v.value().to_string()));
            }
        }
        let next = if iter.next().is_some() {
            cursor + visited
        } else {
            0
        };
        Ok((next, out))
    }

    async fn del(&self, key: &str) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let removed = remove_key(&txn, key)?;
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, removed, "key deleted");
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StateResult<()> {
        let txn = self.write_live(key)?;
        if key_exists(&txn, key)? {
            let mut expiry = txn.open_table(EXPIRY).map_err(map_err!(Table))?;
            expiry
                .insert(key, epoch_secs() + ttl.as_secs())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> StateResult<Option<String>> {
        let Some(txn) = self.read_live(key)? else {
            return Ok(None);
        };
        let table = txn.open_table(STRINGS).map_err(map_err!(Table))?;
        let value = table
            .get(key)
            .map_err(map_err!(Read))?
            .map(|guard| guard.value().to_string());
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StateResult<()> {
        let txn = self.write_live(key)?;
        {
            let mut strings = txn.open_table(STRINGS).map_err(map_err!(Table))?;
            strings.insert(key, value).map_err(map_err!(Write))?;
            let mut expiry = txn.open_table(EXPIRY).map_err(map_err!(Table))?;
            match ttl {
                Some(ttl) => {
                    expiry
                        .insert(key, epoch_secs() + ttl.as_secs())
                        .map_err(map_err!(Write))?;
                }
                None => {
                    expiry.remove(key).map_err(map_err!(Write))?;
                }
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    async fn rpush(&self, key: &str, values: &[String]) -> StateResult<()> {
        if values.is_empty() {
            return Ok(());
        }
        let txn = self.write_live(key)?;
        {
            let mut table = txn.open_table(LISTS).map_err(map_err!(Table))?;
            let (start, end) = member_range(key);
            let last = table
                .range(start.as_str()..end.as_str())
                .map_err(map_err!(Read))?
                .next_back()
                .transpose()
                .map_err(map_err!(Read))?
                .map(|(k, _)| list_seq(key, k.value()));
            let mut seq = last.map_or(0, |s| s + 1);
            for value in values {
                let member = member_key(key, &format!("{seq:020}"));
                table
                    .insert(member.as_str(), value.as_str())
                    .map_err(map_err!(Write))?;
                seq += 1;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    async fn lpop(&self, key: &str) -> StateResult<Option<String>> {
        let txn = self.write_live(key)?;
        let popped = {
            let mut table = txn.open_table(LISTS).map_err(map_err!(Table))?;
            let (start, end) = member_range(key);
            let head = table
                .range(start.as_str()..end.as_str())
                .map_err(map_err!(Read))?
                .next()
                .transpose()
                .map_err(map_err!(Read))?
                .map(|(k, v)| (k.value().to_string(), v.value().to_string()));
            match head {
                Some((member, value)) => {
                    table.remove(member.as_str()).map_err(map_err!(Write))?;
                    Some(value)
                }
                None => None,
            }
        };
        if popped.is_some() {
            forget_if_empty(&txn, key)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(popped)
    }

    async fn llen(&self, key: &str) -> StateResult<usize> {
        let Some(txn) = self.read_live(key)? else {
            return Ok(0);
        };
        let table = txn.open_table(LISTS).map_err(map_err!(Table))?;
        Ok(member_keys(&table, key)?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::scan_all;

    fn fields(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn hash_roundtrip() {
        let store = RedbStore::open_in_memory().unwrap();
        store
            .hset_many("ns.cmdb.host", &fields(&[("1", "a"), ("2", "b")]))
            .await
            .unwrap();
        store
            .hset_many("ns.cmdb.host_ip", &fields(&[("1", "other")]))
            .await
            .unwrap();

        assert_eq!(
            store.hget("ns.cmdb.host", "1").await.unwrap().as_deref(),
            Some("a")
        );
        assert_eq!(
            store.hkeys("ns.cmdb.host").await.unwrap(),
            vec!["1".to_string(), "2".to_string()]
        );
        assert_eq!(
            store
                .hmget("ns.cmdb.host", &["2".into(), "9".into()])
                .await
                .unwrap(),
            vec![Some("b".to_string()), None]
        );

        let removed = store
            .hdel("ns.cmdb.host", &["1".into(), "9".into()])
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.hkeys("ns.cmdb.host_ip").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn hscan_pages_through_matches() {
        let store = RedbStore::open_in_memory().unwrap();
        let entries: Vec<(String, String)> = (0..25)
            .map(|i| (format!("10.0.0.{i}|0"), format!("{i}")))
            .chain((0..5).map(|i| (format!("{i}"), "id".to_string())))
            .collect();
        store.hset_many("ns.cmdb.host", &entries).await.unwrap();

        let (cursor, first) = store.hscan("ns.cmdb.host", 0, "*", 10).await.unwrap();
        assert_eq!(first.len(), 10);
        assert_eq!(cursor, 10);

        let composite = scan_all(&store, "ns.cmdb.host", "*|*", 7).await.unwrap();
        assert_eq!(composite.len(), 25);
        let everything = scan_all(&store, "ns.cmdb.host", "*", 100).await.unwrap();
        assert_eq!(everything.len(), 30);
    }

    #[tokio::test]
    async fn list_is_fifo() {
        let store = RedbStore::open_in_memory().unwrap();
        store
            .rpush("q", &["a".into(), "b".into()])
            .await
            .unwrap();
        store.rpush("q", &["c".into()]).await.unwrap();
        assert_eq!(store.llen("q").await.unwrap(), 3);
        assert_eq!(store.lpop("q").await.unwrap().as_deref(), Some("a"));
        assert_eq!(store.lpop("q").await.unwrap().as_deref(), Some("b"));
        assert_eq!(store.lpop("q").await.unwrap().as_deref(), Some("c"));
        assert_eq!(store.lpop("q").await.unwrap(), None);
    }

    #[tokio::test]
    async fn zero_ttl_expires_immediately() {
        let store = RedbStore::open_in_memory().unwrap();
        store
            .set("cursor", "123", Some(Duration::from_secs(3600)))
            .await
            .unwrap();
        assert_eq!(store.get("cursor").await.unwrap().as_deref(), Some("123"));

        store
            .hset_many("h", &fields(&[("1", "x")]))
            .await
            .unwrap();
        store.expire("h", Duration::ZERO).await.unwrap();
        assert!(store.hkeys("h").await.unwrap().is_empty());

        // A write after expiry starts from an empty key.
        store.hset_many("h", &fields(&[("2", "y")])).await.unwrap();
        assert_eq!(store.hkeys("h").await.unwrap(), vec!["2".to_string()]);
    }

    #[tokio::test]
    async fn del_removes_every_type() {
        let store = RedbStore::open_in_memory().unwrap();
        store.hset_many("k", &fields(&[("f", "v")])).await.unwrap();
        store.del("k").await.unwrap();
        assert!(store.hkeys("k").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn persistent_store_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.redb");
        {
            let store = RedbStore::open(&path).unwrap();
            store.set("k", "v", None).await.unwrap();
        }
        let store = RedbStore::open(&path).unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
    }
}
