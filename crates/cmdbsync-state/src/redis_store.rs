//! RedisStore: [`KvStore`] over a multiplexed Redis connection.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::store::KvStore;

macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("conn", &"<ConnectionManager>")
            .finish()
    }
}

impl RedisStore {
    pub async fn connect(url: &str) -> StateResult<Self> {
        let client = redis::Client::open(url).map_err(map_err!(Open))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(map_err!(Open))?;
        debug!("redis store connected");
        Ok(Self { conn })
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn hset_many(&self, key: &str, fields: &[(String, String)]) -> StateResult<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let _: () = self
            .conn
            .clone()
            .hset_multiple(key, fields)
            .await
            .map_err(map_err!(Redis))?;
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> StateResult<Option<String>> {
        let value: Option<String> = self
            .conn
            .clone()
            .hget(key, field)
            .await
            .map_err(map_err!(Redis))?;
        Ok(value)
    }

    async fn hmget(&self, key: &str, fields: &[String]) -> StateResult<Vec<Option<String>>> {
        if fields.is_empty() {
            return Ok(Vec::new());
        }
        let values: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(key)
            .arg(fields)
            .query_async(&mut self.conn.clone())
            .await
            .map_err(map_err!(Redis))?;
        Ok(values)
    }

    async fn hkeys(&self, key: &str) -> StateResult<Vec<String>> {
        let keys: Vec<String> = self
            .conn
            .clone()
            .hkeys(key)
            .await
            .map_err(map_err!(Redis))?;
        Ok(keys)
    }

    async fn hdel(&self, key: &str, fields: &[String]) -> StateResult<usize> {
        if fields.is_empty() {
            return Ok(0);
        }
        let removed: usize = self
            .conn
            .clone()
            .hdel(key, fields)
            .await
            .map_err(map_err!(Redis))?;
        Ok(removed)
    }

    async fn hscan(
        &self,
        key: &str,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> StateResult<(u64, Vec<(String, String)>)> {
        let (next, flat): (u64, Vec<String>) = redis::cmd("HSCAN")
            .arg(key)
            .arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(count)
            .query_async(&mut self.conn.clone())
            .await
            .map_err(map_err!(Redis))?;
        let mut entries = Vec::with_capacity(flat.len() / 2);
        let mut iter = flat.into_iter();
        while let (Some(field), Some(value)) = (iter.next(), iter.next()) {
            entries.push((field, value));
        }
        Ok((next, entries))
    }

    async fn del(&self, key: &str) -> StateResult<()> {
        let _: () = self
            .conn
            .clone()
            .del(key)
            .await
            .map_err(map_err!(Redis))?;
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StateResult<()> {
        let _: () = redis::cmd("EXPIRE")
            .arg(key)
            .arg(ttl.as_secs())
            .query_async(&mut self.conn.clone())
            .await
            .map_err(map_err!(Redis))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> StateResult<Option<String>> {
        let value: Option<String> = self
            .conn
            .clone()
            .get(key)
            .await
            .map_err(map_err!(Redis))?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StateResult<()> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("EX").arg(ttl.as_secs().max(1));
        }
        let _: () = cmd
            .query_async(&mut self.conn.clone())
            .await
            .map_err(map_err!(Redis))?;
        Ok(())
    }

    async fn rpush(&self, key: &str, values: &[String]) -> StateResult<()> {
        if values.is_empty() {
            return Ok(());
        }
        let _: () = self
            .conn
            .clone()
            .rpush(key, values)
            .await
            .map_err(map_err!(Redis))?;
        Ok(())
    }

    async fn lpop(&self, key: &str) -> StateResult<Option<String>> {
        let value: Option<String> = self
            .conn
            .clone()
            .lpop(key, None)
            .await
            .map_err(map_err!(Redis))?;
        Ok(value)
    }

    async fn llen(&self, key: &str) -> StateResult<usize> {
        let len: usize = self
            .conn
            .clone()
            .llen(key)
            .await
            .map_err(map_err!(Redis))?;
        Ok(len)
    }
}
