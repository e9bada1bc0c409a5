use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::sync::{broadcast, oneshot};

use crate::config::Config;
use crate::fixtures::{self, RecordingSink};
use crate::sink::SinkRef;
use crate::store::{
    EventKind, KeyValue, LeaseId, Op, Revision, SledStore, Store, StoreError, StoreRef, StoreResult, Txn, TxnResponse, WatchStream,
};
use crate::watchers::{resync, KeySpaceWatcher};

/// A store whose first watch silently drops every event, then fails as lagged once tripped.
struct LaggingStore {
    inner: SledStore,
    trip: Mutex<Option<oneshot::Receiver<()>>>,
}

#[async_trait]
impl Store for LaggingStore {
    async fn get(&self, prefix: &str) -> StoreResult<(Vec<KeyValue>, Revision)> {
        self.inner.get(prefix).await
    }

    async fn watch(&self, prefix: &str, from_revision: Revision) -> StoreResult<WatchStream> {
        let trip = self.trip.lock().map_err(|_| StoreError::Unavailable("poisoned".into()))?.take();
        match trip {
            Some(trip) => Ok(stream::once(async move {
                let _ = trip.await;
                Err(StoreError::Lagged(1))
            })
            .boxed()),
            None => self.inner.watch(prefix, from_revision).await,
        }
    }

    async fn txn(&self, txn: Txn) -> StoreResult<TxnResponse> {
        self.inner.txn(txn).await
    }

    async fn grant_lease(&self, ttl: Duration) -> StoreResult<LeaseId> {
        self.inner.grant_lease(ttl).await
    }

    async fn keep_alive(&self, lease: LeaseId) -> StoreResult<()> {
        self.inner.keep_alive(lease).await
    }

    async fn revoke_lease(&self, lease: LeaseId) -> StoreResult<()> {
        self.inner.revoke_lease(lease).await
    }

    fn max_txn_ops(&self) -> usize {
        self.inner.max_txn_ops()
    }
}

#[tokio::test]
async fn resync_returns_snapshot_and_subsequent_events() -> Result<()> {
    let (config, _tmpdir) = Config::new_test()?;
    let store = SledStore::new(config.clone()).await?;
    let layout = config.layout.clone();
    fixtures::put_item(&store, &layout, "foo", 1).await?;
    store.txn(Txn::new().then(Op::put("/elsewhere/key", b"1".to_vec()))).await?;

    let (tree, mut stream) = resync(&store, &layout).await?;
    fixtures::put_item(&store, &layout, "bar", 1).await?;

    assert_eq!(tree.revision(), 2, "expected snapshot at revision 2 got {}", tree.revision());
    assert!(tree.get(&layout.item_key("foo")).is_some(), "expected foo in snapshot");
    let event = tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .context("timeout waiting for watch event")?
        .context("watch stream unexpectedly closed")??;
    assert_eq!(event.kind, EventKind::Put, "expected put event got {:?}", event);
    assert_eq!(event.kv.key, layout.item_key("bar"), "expected event for bar got {}", event.kv.key);
    assert_eq!(event.revision, 3, "expected event at revision 3 got {}", event.revision);

    Ok(())
}

#[tokio::test]
async fn watcher_mirrors_keyspace_changes() -> Result<()> {
    let (config, _tmpdir) = Config::new_test()?;
    let store: StoreRef = Arc::new(SledStore::new(config.clone()).await?);
    let layout = config.layout.clone();
    let sink = Arc::new(RecordingSink::default());
    let (shutdown_tx, _) = broadcast::channel(1);
    fixtures::put_item(store.as_ref(), &layout, "foo", 1).await?;

    let sink_ref: SinkRef = sink.clone();
    let (watcher, mut trees) = KeySpaceWatcher::new(store.clone(), layout.clone(), sink_ref, shutdown_tx.subscribe());
    let handle = watcher.spawn();

    let tree = fixtures::wait_for_revision(&mut trees, 1).await?;
    assert!(tree.get(&layout.item_key("foo")).is_some(), "expected foo to be mirrored");

    fixtures::register_member(store.as_ref(), &layout, "m1", "default", 10).await?;
    let res = store.txn(Txn::new().then(Op::delete(layout.item_key("foo")))).await?;
    let tree = fixtures::wait_for_revision(&mut trees, res.revision).await?;
    assert!(tree.get(&layout.item_key("foo")).is_none(), "expected foo to be removed from the mirror");
    assert!(tree.get(&layout.member_key("m1")).is_some(), "expected m1 to be mirrored");
    assert_eq!(RecordingSink::get(&sink.watch_errors), 0, "expected no watch errors");

    let _ = shutdown_tx.send(());
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .context("timeout joining keyspace watcher")???;

    Ok(())
}

#[tokio::test]
async fn watcher_resyncs_from_fresh_snapshot_after_lagging() -> Result<()> {
    let (config, _tmpdir) = Config::new_test()?;
    let (trip_tx, trip_rx) = oneshot::channel();
    let store: StoreRef = Arc::new(LaggingStore {
        inner: SledStore::new(config.clone()).await?,
        trip: Mutex::new(Some(trip_rx)),
    });
    let layout = config.layout.clone();
    let sink = Arc::new(RecordingSink::default());
    let (shutdown_tx, _) = broadcast::channel(1);
    fixtures::put_item(store.as_ref(), &layout, "foo", 1).await?;

    let sink_ref: SinkRef = sink.clone();
    let (watcher, mut trees) = KeySpaceWatcher::new(store.clone(), layout.clone(), sink_ref, shutdown_tx.subscribe());
    let handle = watcher.spawn();
    fixtures::wait_for_revision(&mut trees, 1).await?;

    // The first watch never delivers this change.
    let missed = fixtures::put_item(store.as_ref(), &layout, "bar", 1).await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let stale = trees.borrow().clone();
    assert_eq!(stale.revision(), 1, "expected the mirror to miss revision {} got {}", missed, stale.revision());
    assert!(stale.get(&layout.item_key("bar")).is_none(), "expected bar to be missing before the resync");

    let _ = trip_tx.send(());
    let tree = fixtures::wait_for_revision(&mut trees, missed).await?;
    assert!(tree.get(&layout.item_key("bar")).is_some(), "expected bar to be recovered by the resync");
    assert!(tree.get(&layout.item_key("foo")).is_some(), "expected foo to survive the resync");
    assert_eq!(RecordingSink::get(&sink.watch_errors), 1, "expected a single watch error");

    let res = fixtures::register_member(store.as_ref(), &layout, "m1", "default", 10).await?;
    let tree = fixtures::wait_for_revision(&mut trees, res).await?;
    assert!(tree.get(&layout.member_key("m1")).is_some(), "expected changes after the resync to be mirrored");

    let _ = shutdown_tx.send(());
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .context("timeout joining keyspace watcher")???;

    Ok(())
}
