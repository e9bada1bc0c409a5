use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::future::FutureExt;
use futures::stream::StreamExt;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;

use shardkeeper_core::keyspace::Layout;

use crate::error::AppError;
use crate::sink::SinkRef;
use crate::store::{translate_error, Event, Store, StoreRef, StoreResult, WatchStream};
use crate::tree::Tree;

/// The delay before the keyspace is resynchronized following a failure.
const RESYNC_DELAY: Duration = Duration::from_millis(250);

/// A `watch::Sender` of keyspace trees.
pub type TreeTx = watch::Sender<Arc<Tree>>;
/// A `watch::Receiver` of keyspace trees.
pub type TreeRx = watch::Receiver<Arc<Tree>>;

/// A task which mirrors the keyspace of an allocation domain, publishing an immutable tree
/// after every batch of watch events.
pub struct KeySpaceWatcher {
    store: StoreRef,
    layout: Layout,
    sink: SinkRef,
    /// A channel used for triggering graceful shutdown.
    shutdown: BroadcastStream<()>,

    /// Tree publication channel.
    trees: TreeTx,
}

impl KeySpaceWatcher {
    /// Create a new instance.
    pub fn new(store: StoreRef, layout: Layout, sink: SinkRef, shutdown: broadcast::Receiver<()>) -> (Self, TreeRx) {
        let (trees, rx) = watch::channel(Arc::new(Tree::new(layout.clone())));
        (
            Self {
                store,
                layout,
                sink,
                shutdown: BroadcastStream::new(shutdown),
                trees,
            },
            rx,
        )
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        tracing::info!(root = self.layout.root(), "keyspace watcher initialized");
        loop {
            let res = tokio::select! {
                res = resync(self.store.as_ref(), &self.layout) => res,
                _ = self.shutdown.next() => break,
            };
            let res = match res {
                Ok((mut tree, mut stream)) => {
                    tracing::debug!(revision = tree.revision(), "keyspace resynchronized");
                    self.publish(&tree);
                    self.follow(&mut tree, &mut stream).await
                }
                Err(err) => Err(err),
            };
            match res {
                Ok(()) => break,
                Err(err) => {
                    tracing::error!(error = ?err, "error watching keyspace, will resync");
                    self.sink.watch_error();
                    if self.backoff().await {
                        break;
                    }
                }
            }
        }

        tracing::debug!("keyspace watcher stopped");
        Ok(())
    }

    /// Apply events from the given stream to the given tree until shutdown.
    ///
    /// All immediately available events are applied as a single batch before the tree is
    /// published. Any error requires a resync.
    async fn follow(&mut self, tree: &mut Tree, stream: &mut WatchStream) -> Result<()> {
        loop {
            tokio::select! {
                next = stream.next() => {
                    let res = next.ok_or_else(|| AppError::ResyncRequired("watch stream closed".into()))?;
                    apply(tree, res)?;
                    while let Some(Some(res)) = stream.next().now_or_never() {
                        apply(tree, res)?;
                    }
                    self.publish(tree);
                }
                _ = self.shutdown.next() => return Ok(()),
            }
        }
    }

    /// Wait out the resync delay, returning true if shutdown was requested meanwhile.
    async fn backoff(&mut self) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(RESYNC_DELAY) => false,
            _ = self.shutdown.next() => true,
        }
    }

    fn publish(&self, tree: &Tree) {
        let _ = self.trees.send(Arc::new(tree.clone()));
    }
}

/// Build a tree from a fresh snapshot of the given layout, along with a watch stream picking up
/// immediately after the snapshot revision.
pub async fn resync(store: &dyn Store, layout: &Layout) -> Result<(Tree, WatchStream)> {
    let prefix = layout.root_prefix();
    let (kvs, revision) = store
        .get(&prefix)
        .await
        .map_err(translate_error)
        .context("error listing keyspace")?;
    let tree = Tree::from_snapshot(layout.clone(), kvs, revision).context("error building keyspace tree")?;
    let stream = store
        .watch(&prefix, revision + 1)
        .await
        .map_err(translate_error)
        .context("error watching keyspace")?;
    Ok((tree, stream))
}

fn apply(tree: &mut Tree, res: StoreResult<Event>) -> Result<()> {
    let event = res.map_err(translate_error)?;
    tree.apply_patch(&event)
        .map_err(|err| AppError::ResyncRequired(err.to_string()))?;
    Ok(())
}
