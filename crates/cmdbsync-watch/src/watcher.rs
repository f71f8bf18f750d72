//! Change feed polling: cursor bookkeeping and the per-kind event queue.

use std::sync::Arc;
use std::time::Duration;

use cmdbsync_api::CmdbClientRegistry;
use cmdbsync_core::{Namespace, ResourceKind, TenantId};
use cmdbsync_state::SharedStore;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::WatchResult;

/// Cursors older than this are no longer accepted by the change feed.
pub const CURSOR_TTL: Duration = Duration::from_secs(3600);

/// Minimum spacing between polls that returned nothing.
pub const POLL_IDLE: Duration = Duration::from_secs(5);

pub struct ChangeWatcher {
    namespace: Namespace,
    store: SharedStore,
    registry: Arc<CmdbClientRegistry>,
    poll_idle: Duration,
}

impl ChangeWatcher {
    pub fn new(namespace: Namespace, store: SharedStore, registry: Arc<CmdbClientRegistry>) -> Self {
        Self {
            namespace,
            store,
            registry,
            poll_idle: POLL_IDLE,
        }
    }

    pub fn with_poll_idle(mut self, poll_idle: Duration) -> Self {
        self.poll_idle = poll_idle;
        self
    }

    pub fn tenant(&self) -> &TenantId {
        self.namespace.tenant()
    }

    /// Poll the feed once for `kind`. Returns whether events were queued.
    ///
    /// An unwatched response (the stored cursor is unknown or expired
    /// upstream) only moves the cursor forward; its events are not queued.
    pub async fn watch_once(&self, kind: ResourceKind) -> WatchResult<bool> {
        let cursor_key = self.namespace.cursor_key(kind);
        let cursor = self.store.get(&cursor_key).await?.filter(|c| !c.is_empty());

        let cmdb = self.registry.client(self.tenant())?;
        let response = cmdb
            .resource_watch(kind, cursor.as_deref(), kind.watch_fields())
            .await?;

        let last_cursor = response
            .bk_events
            .last()
            .map(|e| e.bk_cursor.clone())
            .filter(|c| !c.is_empty());

        if !response.bk_watched {
            if let Some(last) = last_cursor
                && cursor.as_deref() != Some(last.as_str())
            {
                self.store.set(&cursor_key, &last, Some(CURSOR_TTL)).await?;
                debug!(tenant = %self.tenant(), %kind, cursor = %last, "cursor moved without events");
            }
            return Ok(false);
        }

        if response.bk_events.is_empty() {
            return Ok(false);
        }

        let queued = response
            .bk_events
            .iter()
            .map(serde_json::to_string)
            .collect::<Result<Vec<_>, _>>()?;
        self.store
            .rpush(&self.namespace.event_queue_key(kind), &queued)
            .await?;
        if let Some(last) = last_cursor {
            self.store.set(&cursor_key, &last, Some(CURSOR_TTL)).await?;
        }

        debug!(tenant = %self.tenant(), %kind, events = queued.len(), "change events queued");
        Ok(true)
    }

    /// Poll `kind` until shutdown. A poll that queued events is followed
    /// immediately by the next one; otherwise polls are at least
    /// `poll_idle` apart.
    pub async fn run(&self, kind: ResourceKind, mut shutdown: watch::Receiver<bool>) {
        info!(tenant = %self.tenant(), %kind, "change watcher started");

        let mut idle_poll_started: Option<Instant> = None;
        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Some(started) = idle_poll_started {
                let elapsed = started.elapsed();
                if elapsed < self.poll_idle {
                    tokio::select! {
                        _ = tokio::time::sleep(self.poll_idle - elapsed) => {}
                        _ = shutdown.changed() => break,
                    }
                }
            }

            let started = Instant::now();
            let queued = match self.watch_once(kind).await {
                Ok(queued) => queued,
                Err(e) => {
                    warn!(tenant = %self.tenant(), %kind, error = %e, "change watch failed");
                    false
                }
            };
            idle_poll_started = (!queued).then_some(started);
        }

        info!(tenant = %self.tenant(), %kind, "change watcher shutting down");
    }

    /// One [`ChangeWatcher::run`] task per kind, joined on shutdown.
    pub async fn run_all(self: Arc<Self>, kinds: Vec<ResourceKind>, shutdown: watch::Receiver<bool>) {
        let mut tasks = JoinSet::new();
        for kind in kinds {
            let watcher = self.clone();
            let shutdown = shutdown.clone();
            tasks.spawn(async move { watcher.run(kind, shutdown).await });
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "change watcher task aborted");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cmdbsync_api::StaticDirectory;
    use cmdbsync_api::mock::{MockCmdb, mock_registry};
    use cmdbsync_api::types::WatchResponse;
    use cmdbsync_core::ChangeEvent;
    use cmdbsync_state::{KvStore, RedbStore};
    use serde_json::json;

    fn setup() -> (ChangeWatcher, Arc<MockCmdb>, SharedStore) {
        let store: SharedStore = Arc::new(RedbStore::open_in_memory().unwrap());
        let cmdb = Arc::new(MockCmdb::new());
        let registry = mock_registry(cmdb.clone(), StaticDirectory::default_tenant());
        let namespace = Namespace::new(TenantId::default_tenant(), "bkmonitorv3");
        (ChangeWatcher::new(namespace, store.clone(), registry), cmdb, store)
    }

    fn event(cursor: &str, biz_id: i64) -> ChangeEvent {
        serde_json::from_value(json!({
            "bk_cursor": cursor,
            "bk_resource": "host_relation",
            "bk_event_type": "update",
            "bk_detail": {"bk_host_id": 1, "bk_biz_id": biz_id},
        }))
        .unwrap()
    }

    fn respond(cmdb: &MockCmdb, kind: ResourceKind, watched: bool, events: Vec<ChangeEvent>) {
        cmdb.update(|s| {
            s.watch_responses.entry(kind).or_default().push_back(WatchResponse {
                bk_watched: watched,
                bk_events: events,
            })
        });
    }

    #[tokio::test]
    async fn empty_feed_queues_nothing() {
        let (watcher, _cmdb, store) = setup();
        assert!(!watcher.watch_once(ResourceKind::Host).await.unwrap());
        let queue = watcher.namespace.event_queue_key(ResourceKind::Host);
        assert_eq!(store.llen(&queue).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn stored_cursor_is_sent_on_next_poll() {
        let (watcher, cmdb, _store) = setup();
        let kind = ResourceKind::HostRelation;
        respond(&cmdb, kind, true, vec![event("123", 2)]);
        watcher.watch_once(kind).await.unwrap();
        watcher.watch_once(kind).await.unwrap();

        let calls = cmdb.read(|s| s.watch_calls.clone());
        assert_eq!(calls, vec![(kind, None), (kind, Some("123".to_string()))]);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let (watcher, _cmdb, _store) = setup();
        let watcher = Arc::new(watcher.with_poll_idle(Duration::from_millis(10)));
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(watcher.run_all(vec![ResourceKind::Host, ResourceKind::Biz], rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn idle_polls_are_spaced_and_busy_polls_are_not() {
        let (watcher, cmdb, store) = setup();
        let kind = ResourceKind::HostRelation;
        respond(&cmdb, kind, true, vec![event("7", 2)]);
        let watcher = Arc::new(watcher.with_poll_idle(Duration::from_secs(10)));
        let polls = || cmdb.read(|s| s.watch_calls.len());

        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn({
            let watcher = watcher.clone();
            async move { watcher.run(kind, rx).await }
        });

        // The poll that queued an event is followed straight away by an
        // empty one, which then holds the next poll back.
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(polls(), 2);
        tokio::time::sleep(Duration::from_secs(8)).await;
        assert_eq!(polls(), 2);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(polls(), 3);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(polls(), 4);

        let calls = cmdb.read(|s| s.watch_calls.clone());
        assert_eq!(calls[0], (kind, None));
        assert_eq!(calls[1], (kind, Some("7".to_string())));
        let queue = watcher.namespace.event_queue_key(kind);
        assert_eq!(store.llen(&queue).await.unwrap(), 1);

        tx.send(true).unwrap();
        task.await.unwrap();
    }
}
