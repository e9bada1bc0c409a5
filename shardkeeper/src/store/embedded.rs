//! An embedded, single node store built on sled.
//!
//! All data lives in a single sled tree, partitioned by one-byte key prefixes:
//!
//! - `k{key}`: the current `KeyValue` of a key.
//! - `e{revision}`: every event committed at the given revision, retained for watch replay.
//! - `r`: the current store revision.
//! - `c`: the most recent revision whose events have been compacted away.
//!
//! Each commit is written as a single sled batch while holding the writer lock, and is then
//! broadcast to live watchers. Leases are held in memory only, so keys bound to leases of a
//! previous process are deleted when the store is opened.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use rand::Rng;
use sled::{Batch, Config as SledConfig, Db, Tree};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;

use super::{Event, EventKind, KeyValue, LeaseId, Op, Revision, Store, StoreError, StoreResult, Txn, TxnResponse, WatchStream};
use crate::config::Config;
use crate::error::{ShutdownError, ShutdownResult, ERR_DB_FLUSH, ERR_ITER_FAILURE};
use crate::utils;

/// The default path to use for data storage.
pub const DEFAULT_DATA_PATH: &str = "/usr/local/shardkeeper/data";
/// The DB tree holding all store data.
const TREE_KEYSPACE: &str = "keyspace";
/// The key prefix of current key values.
const PREFIX_KV: &[u8; 1] = b"k";
/// The key prefix of per-revision event records.
const PREFIX_EVENTS: &[u8; 1] = b"e";
/// The key of the current store revision.
const KEY_REVISION: &[u8] = b"r";
/// The key of the compacted revision.
const KEY_COMPACTED: &[u8] = b"c";
/// The number of commits buffered for live watchers before they lag.
const EVENTS_CHANNEL_CAPACITY: usize = 4096;
/// The interval at which expired leases are revoked.
const LEASE_REAP_INTERVAL: Duration = Duration::from_millis(250);

/// The default path to use for data storage.
pub fn default_data_path() -> String {
    DEFAULT_DATA_PATH.to_string()
}

/// A single event as recorded on disk.
#[derive(Clone, PartialEq, prost::Message)]
struct EventEntry {
    #[prost(bool, tag = "1")]
    delete: bool,
    #[prost(message, optional, tag = "2")]
    kv: Option<KeyValue>,
}

/// All events committed at a single revision.
#[derive(Clone, PartialEq, prost::Message)]
struct RevisionRecord {
    #[prost(message, repeated, tag = "1")]
    events: Vec<EventEntry>,
}

impl RevisionRecord {
    fn into_events(self, revision: Revision) -> impl Iterator<Item = Event> {
        self.events.into_iter().filter_map(move |entry| {
            let kind = if entry.delete { EventKind::Delete } else { EventKind::Put };
            entry.kv.map(|kv| Event { kind, kv, revision })
        })
    }
}

/// An embedded implementation of the consistent store.
#[derive(Clone)]
pub struct SledStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    /// The underlying DB handle.
    db: Db,
    /// The tree holding all store data.
    tree: Tree,
    /// Writer state, serializing all commits.
    state: Mutex<WriteState>,
    /// A channel of committed event batches.
    events: broadcast::Sender<Arc<Vec<Event>>>,
    max_txn_ops: usize,
    history_limit: u64,
}

struct WriteState {
    revision: Revision,
    compacted: Revision,
    leases: HashMap<LeaseId, Lease>,
}

struct Lease {
    ttl: Duration,
    deadline: Instant,
}

impl SledStore {
    /// Open the store for usage.
    pub async fn new(config: Arc<Config>) -> Result<Self> {
        // Determine the database path, and ensure it exists.
        let dbpath = PathBuf::from(&config.storage_data_path).join(config.pod_name.as_str());
        tokio::fs::create_dir_all(&dbpath)
            .await
            .context("error creating dir for shardkeeper store")?;

        let (max_txn_ops, history_limit) = (config.max_txn_ops, config.history_limit.max(1));
        Self::spawn_blocking(move || -> Result<Self> {
            let db = SledConfig::new().path(dbpath).mode(sled::Mode::HighThroughput).open()?;
            let tree = db.open_tree(TREE_KEYSPACE)?;
            let revision = tree.get(KEY_REVISION)?.map(|val| utils::decode_u64(&val)).transpose()?.unwrap_or(0);
            let compacted = tree.get(KEY_COMPACTED)?.map(|val| utils::decode_u64(&val)).transpose()?.unwrap_or(0);
            let (events, _) = broadcast::channel(EVENTS_CHANNEL_CAPACITY);
            let inner = StoreInner {
                db,
                tree,
                state: Mutex::new(WriteState {
                    revision,
                    compacted,
                    leases: HashMap::new(),
                }),
                events,
                max_txn_ops,
                history_limit,
            };

            let purged = {
                let mut state = inner.lock()?;
                inner.delete_leased_keys(&mut state, |_| true)?
            };
            if purged > 0 {
                tracing::info!(purged, "deleted keys bound to leases of a previous process");
            }
            tracing::debug!(revision, compacted, "store opened");
            Ok(Self { inner: Arc::new(inner) })
        })
        .await?
    }

    /// Spawn a blocking database-related function, returning a ShutdownError if anything goes
    /// wrong related to spawning & joining.
    #[tracing::instrument(level = "trace", skip(f), err)]
    pub async fn spawn_blocking<F, R>(f: F) -> ShutdownResult<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|err| ShutdownError::from(anyhow::Error::from(err)))
    }

    /// Run the given function against the store internals on the blocking thread pool.
    async fn blocking<F, R>(&self, f: F) -> StoreResult<R>
    where
        F: FnOnce(&StoreInner) -> StoreResult<R> + Send + 'static,
        R: Send + 'static,
    {
        let inner = self.inner.clone();
        Self::spawn_blocking(move || f(&inner)).await.map_err(|err| StoreError::Internal(err.0))?
    }

    /// Spawn a task which revokes expired leases until shutdown.
    pub fn spawn_lease_reaper(&self, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<Result<()>> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(LEASE_REAP_INTERVAL);
            loop {
                tokio::select! {
                    _ = interval.tick() => match store.blocking(|inner| inner.expire_leases()).await {
                        Ok(0) => (),
                        Ok(expired) => tracing::debug!(expired, "revoked expired leases"),
                        Err(err) => tracing::error!(error = ?err, "error revoking expired leases"),
                    },
                    _ = shutdown.recv() => break,
                }
            }
            Ok(())
        })
    }
}

#[async_trait]
impl Store for SledStore {
    async fn get(&self, prefix: &str) -> StoreResult<(Vec<KeyValue>, Revision)> {
        let prefix = prefix.to_string();
        self.blocking(move |inner| inner.range(&prefix)).await
    }

    async fn get_key(&self, key: &str) -> StoreResult<Option<KeyValue>> {
        let key = key.to_string();
        self.blocking(move |inner| inner.read_kv(&key)).await
    }

    async fn watch(&self, prefix: &str, from_revision: Revision) -> StoreResult<WatchStream> {
        let owned = prefix.to_string();
        let (replayed, rx, head) = self.blocking(move |inner| inner.begin_watch(&owned, from_revision)).await?;

        let prefix = prefix.to_string();
        let live = BroadcastStream::new(rx).flat_map(move |res| {
            let events: Vec<StoreResult<Event>> = match res {
                Ok(batch) => batch
                    .iter()
                    .filter(|event| event.revision > head && event.kv.key.starts_with(prefix.as_str()))
                    .cloned()
                    .map(Ok)
                    .collect(),
                Err(BroadcastStreamRecvError::Lagged(count)) => vec![Err(StoreError::Lagged(count))],
            };
            stream::iter(events)
        });
        Ok(stream::iter(replayed.into_iter().map(Ok)).chain(live).boxed())
    }

    async fn txn(&self, txn: Txn) -> StoreResult<TxnResponse> {
        self.blocking(move |inner| inner.txn(txn)).await
    }

    async fn grant_lease(&self, ttl: Duration) -> StoreResult<LeaseId> {
        self.blocking(move |inner| inner.grant_lease(ttl)).await
    }

    async fn keep_alive(&self, lease: LeaseId) -> StoreResult<()> {
        self.blocking(move |inner| inner.keep_alive(lease)).await
    }

    async fn revoke_lease(&self, lease: LeaseId) -> StoreResult<()> {
        self.blocking(move |inner| inner.revoke_lease(lease)).await
    }

    fn max_txn_ops(&self) -> usize {
        self.inner.max_txn_ops
    }
}

impl StoreInner {
    fn lock(&self) -> StoreResult<MutexGuard<'_, WriteState>> {
        self.state.lock().map_err(|_| StoreError::Internal(anyhow!("store writer lock poisoned")))
    }

    fn read_kv(&self, key: &str) -> StoreResult<Option<KeyValue>> {
        match self.tree.get(kv_key(key)).map_err(sled_error)? {
            Some(val) => Ok(Some(utils::decode_model(&val)?)),
            None => Ok(None),
        }
    }

    fn range(&self, prefix: &str) -> StoreResult<(Vec<KeyValue>, Revision)> {
        // Holding the lock keeps the listing consistent with the returned revision.
        let state = self.lock()?;
        let mut kvs = vec![];
        for entry in self.tree.scan_prefix(kv_key(prefix)) {
            let (_, val) = entry.context(ERR_ITER_FAILURE)?;
            kvs.push(utils::decode_model(&val)?);
        }
        Ok((kvs, state.revision))
    }

    #[allow(clippy::type_complexity)]
    fn begin_watch(&self, prefix: &str, from_revision: Revision) -> StoreResult<(Vec<Event>, broadcast::Receiver<Arc<Vec<Event>>>, Revision)> {
        let state = self.lock()?;
        let head = state.revision;
        let from = if from_revision == 0 { head + 1 } else { from_revision };
        if from <= state.compacted {
            return Err(StoreError::Compacted {
                requested: from,
                oldest: state.compacted + 1,
            });
        }

        // Subscribe while holding the writer lock so that no commit falls between replay & live.
        let rx = self.events.subscribe();
        let mut replayed = vec![];
        if from <= head {
            let (start, end) = (utils::encode_byte_prefix(PREFIX_EVENTS, from), utils::encode_byte_prefix(PREFIX_EVENTS, head));
            for entry in self.tree.range(start..=end) {
                let (key, val) = entry.context(ERR_ITER_FAILURE)?;
                let revision = utils::decode_u64(&key[1..])?;
                let record: RevisionRecord = utils::decode_model(&val)?;
                replayed.extend(record.into_events(revision).filter(|event| event.kv.key.starts_with(prefix)));
            }
        }
        Ok((replayed, rx, head))
    }

    fn txn(&self, txn: Txn) -> StoreResult<TxnResponse> {
        if txn.ops.len() > self.max_txn_ops {
            return Err(StoreError::TooManyOps {
                ops: txn.ops.len(),
                max: self.max_txn_ops,
            });
        }
        let mut keys = HashSet::with_capacity(txn.ops.len());
        if let Some(op) = txn.ops.iter().find(|op| !keys.insert(op.key())) {
            return Err(StoreError::DuplicateKey(op.key().to_string()));
        }

        let mut state = self.lock()?;
        for (idx, compare) in txn.compares.iter().enumerate() {
            let current = self.read_kv(&compare.key)?.map(|kv| kv.mod_revision).unwrap_or(0);
            if current != compare.mod_revision {
                return Ok(TxnResponse {
                    succeeded: false,
                    revision: state.revision,
                    failed_compare: Some(idx),
                });
            }
        }
        for op in txn.ops.iter() {
            if let Op::Put { lease, .. } = op {
                if *lease != 0 && !state.leases.contains_key(lease) {
                    return Err(StoreError::LeaseNotFound(*lease));
                }
            }
        }

        let revision = self.commit(&mut state, txn.ops)?;
        Ok(TxnResponse {
            succeeded: true,
            revision,
            failed_compare: None,
        })
    }

    /// Commit the given operations at the next revision.
    ///
    /// Deletes of absent keys are dropped; if nothing remains the revision does not advance.
    fn commit(&self, state: &mut WriteState, ops: Vec<Op>) -> StoreResult<Revision> {
        let next = state.revision + 1;
        let mut batch = Batch::default();
        let mut events = Vec::with_capacity(ops.len());
        for op in ops {
            match op {
                Op::Put { key, value, lease } => {
                    let create_revision = self.read_kv(&key)?.map(|kv| kv.create_revision).unwrap_or(next);
                    let kv = KeyValue {
                        key,
                        value,
                        create_revision,
                        mod_revision: next,
                        lease,
                    };
                    batch.insert(kv_key(&kv.key), utils::encode_model(&kv)?);
                    events.push(Event {
                        kind: EventKind::Put,
                        kv,
                        revision: next,
                    });
                }
                Op::Delete { key } => {
                    if let Some(mut kv) = self.read_kv(&key)? {
                        batch.remove(kv_key(&key));
                        kv.value.clear();
                        events.push(Event {
                            kind: EventKind::Delete,
                            kv,
                            revision: next,
                        });
                    }
                }
            }
        }
        if events.is_empty() {
            return Ok(state.revision);
        }

        let record = RevisionRecord {
            events: events
                .iter()
                .map(|event| EventEntry {
                    delete: event.kind == EventKind::Delete,
                    kv: Some(event.kv.clone()),
                })
                .collect(),
        };
        batch.insert(&utils::encode_byte_prefix(PREFIX_EVENTS, next)[..], utils::encode_model(&record)?);
        batch.insert(KEY_REVISION, &utils::encode_u64(next)[..]);

        // Drop event history which has fallen out of the retention window.
        let mut compacted = state.compacted;
        if next > self.history_limit && next - self.history_limit > state.compacted {
            compacted = next - self.history_limit;
            let (start, end) = (
                utils::encode_byte_prefix(PREFIX_EVENTS, state.compacted + 1),
                utils::encode_byte_prefix(PREFIX_EVENTS, compacted),
            );
            for entry in self.tree.range(start..=end) {
                let (key, _) = entry.context(ERR_ITER_FAILURE)?;
                batch.remove(key);
            }
            batch.insert(KEY_COMPACTED, &utils::encode_u64(compacted)[..]);
        }

        self.tree.apply_batch(batch).map_err(sled_error)?;
        self.db.flush().context(ERR_DB_FLUSH)?;
        state.revision = next;
        state.compacted = compacted;
        let _ = self.events.send(Arc::new(events));
        Ok(next)
    }

    fn grant_lease(&self, ttl: Duration) -> StoreResult<LeaseId> {
        let mut state = self.lock()?;
        let mut rng = rand::thread_rng();
        let id = loop {
            let id: LeaseId = rng.gen();
            if id != 0 && !state.leases.contains_key(&id) {
                break id;
            }
        };
        state.leases.insert(
            id,
            Lease {
                ttl,
                deadline: Instant::now() + ttl,
            },
        );
        Ok(id)
    }

    fn keep_alive(&self, id: LeaseId) -> StoreResult<()> {
        let mut state = self.lock()?;
        let lease = state.leases.get_mut(&id).ok_or(StoreError::LeaseNotFound(id))?;
        lease.deadline = Instant::now() + lease.ttl;
        Ok(())
    }

    fn revoke_lease(&self, id: LeaseId) -> StoreResult<()> {
        let mut state = self.lock()?;
        if state.leases.remove(&id).is_none() {
            return Err(StoreError::LeaseNotFound(id));
        }
        self.delete_leased_keys(&mut state, |lease| lease == id)?;
        Ok(())
    }

    fn expire_leases(&self) -> StoreResult<usize> {
        let mut state = self.lock()?;
        let now = Instant::now();
        let expired: HashSet<LeaseId> = state
            .leases
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        if expired.is_empty() {
            return Ok(0);
        }
        state.leases.retain(|id, _| !expired.contains(id));
        self.delete_leased_keys(&mut state, |lease| expired.contains(&lease))?;
        Ok(expired.len())
    }

    /// Delete every key bound to a lease matching the given predicate, in a single commit.
    fn delete_leased_keys(&self, state: &mut WriteState, matches: impl Fn(LeaseId) -> bool) -> StoreResult<usize> {
        let mut ops = vec![];
        for entry in self.tree.scan_prefix(PREFIX_KV) {
            let (_, val) = entry.context(ERR_ITER_FAILURE)?;
            let kv: KeyValue = utils::decode_model(&val)?;
            if kv.lease != 0 && matches(kv.lease) {
                ops.push(Op::delete(kv.key));
            }
        }
        let count = ops.len();
        if count > 0 {
            self.commit(state, ops)?;
        }
        Ok(count)
    }
}

fn kv_key(key: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(key.len() + 1);
    buf.extend_from_slice(PREFIX_KV);
    buf.extend_from_slice(key.as_bytes());
    buf
}

fn sled_error(err: sled::Error) -> StoreError {
    match err {
        sled::Error::Io(err) => StoreError::Unavailable(err.to_string()),
        err => StoreError::Internal(anyhow::Error::from(err)),
    }
}
