//! The consistent store interface.
//!
//! Every durable piece of shardkeeper state lives in a linearizable key/value store offering
//! revisioned reads, prefix watches, multi-key conditional transactions and leases. This module
//! defines that interface along with the translation of store failures into the closed set of
//! application errors.

mod embedded;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::AppError;

pub use embedded::{default_data_path, SledStore, DEFAULT_DATA_PATH};

/// A store-wide revision number. Every committed transaction receives the next revision.
pub type Revision = u64;
/// The id of a lease granted by the store.
pub type LeaseId = u64;

/// A shared handle to a store implementation.
pub type StoreRef = Arc<dyn Store>;
/// A stream of events delivered by a store watch.
pub type WatchStream = BoxStream<'static, StoreResult<Event>>;
/// A result type used by store operations.
pub type StoreResult<T> = ::std::result::Result<T, StoreError>;

/// A key along with its value & revision metadata.
#[derive(Clone, PartialEq, prost::Message)]
pub struct KeyValue {
    #[prost(string, tag = "1")]
    pub key: String,
    #[prost(bytes = "vec", tag = "2")]
    pub value: Vec<u8>,
    /// The revision at which this key was created.
    #[prost(uint64, tag = "3")]
    pub create_revision: u64,
    /// The revision at which this key was last modified.
    #[prost(uint64, tag = "4")]
    pub mod_revision: u64,
    /// The lease this key is bound to, or 0 if the key is not bound to a lease.
    #[prost(uint64, tag = "5")]
    pub lease: u64,
}

/// The kind of mutation an event describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    Put,
    Delete,
}

/// A single key mutation observed through a watch.
///
/// For a `Put`, `kv` holds the new value. For a `Delete`, `kv` holds the key along with the
/// revisions of the record which was deleted, and an empty value.
#[derive(Clone, Debug, PartialEq)]
pub struct Event {
    pub kind: EventKind,
    pub kv: KeyValue,
    /// The revision at which this mutation was committed.
    pub revision: Revision,
}

/// A transaction precondition on the modification revision of a key.
///
/// A `mod_revision` of 0 requires that the key does not exist.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Compare {
    pub key: String,
    pub mod_revision: Revision,
}

impl Compare {
    /// Require that the given key does not exist.
    pub fn absent(key: impl Into<String>) -> Self {
        Self { key: key.into(), mod_revision: 0 }
    }

    /// Require that the given key was last modified at exactly the given revision.
    pub fn at(key: impl Into<String>, mod_revision: Revision) -> Self {
        Self { key: key.into(), mod_revision }
    }
}

/// A mutation applied by a transaction.
#[derive(Clone, Debug, PartialEq)]
pub enum Op {
    Put { key: String, value: Vec<u8>, lease: LeaseId },
    Delete { key: String },
}

impl Op {
    pub fn put(key: impl Into<String>, value: Vec<u8>) -> Self {
        Op::Put { key: key.into(), value, lease: 0 }
    }

    /// A put which binds the key to the given lease, deleting it when the lease expires.
    pub fn put_with_lease(key: impl Into<String>, value: Vec<u8>, lease: LeaseId) -> Self {
        Op::Put { key: key.into(), value, lease }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Op::Delete { key: key.into() }
    }

    pub fn key(&self) -> &str {
        match self {
            Op::Put { key, .. } | Op::Delete { key } => key,
        }
    }
}

/// A set of operations applied atomically if and only if all compares hold.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Txn {
    pub compares: Vec<Compare>,
    pub ops: Vec<Op>,
}

impl Txn {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn when(mut self, compare: Compare) -> Self {
        self.compares.push(compare);
        self
    }

    pub fn then(mut self, op: Op) -> Self {
        self.ops.push(op);
        self
    }
}

/// The outcome of a transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxnResponse {
    /// True if all compares held and the operations were applied.
    pub succeeded: bool,
    /// The store revision following the transaction.
    pub revision: Revision,
    /// The index of the first compare which did not hold.
    pub failed_compare: Option<usize>,
}

/// Errors returned by store implementations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("revision {requested} has been compacted, the oldest available revision is {oldest}")]
    Compacted { requested: Revision, oldest: Revision },
    #[error("watch stream lagged behind the store by {0} commits")]
    Lagged(u64),
    #[error("transaction has {ops} operations, exceeding the limit of {max}")]
    TooManyOps { ops: usize, max: usize },
    #[error("transaction operates on key {0} more than once")]
    DuplicateKey(String),
    #[error("lease {0} not found")]
    LeaseNotFound(LeaseId),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Translate a store error into an application error.
pub fn translate_error(err: StoreError) -> AppError {
    match err {
        StoreError::Unavailable(msg) => AppError::StoreUnavailable(msg),
        err @ (StoreError::Compacted { .. } | StoreError::Lagged(_)) => AppError::ResyncRequired(err.to_string()),
        err @ StoreError::TooManyOps { .. } => AppError::InvalidInput(err.to_string()),
        err @ (StoreError::DuplicateKey(_) | StoreError::LeaseNotFound(_)) => AppError::Ise(anyhow::Error::from(err)),
        StoreError::Internal(err) => AppError::Ise(err),
    }
}

/// The consistent store interface.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Get all keys under the given prefix along with the current store revision.
    async fn get(&self, prefix: &str) -> StoreResult<(Vec<KeyValue>, Revision)>;

    /// Get a single key.
    async fn get_key(&self, key: &str) -> StoreResult<Option<KeyValue>> {
        let (kvs, _) = self.get(key).await?;
        Ok(kvs.into_iter().find(|kv| kv.key == key))
    }

    /// Watch all keys under the given prefix, starting at `from_revision` inclusive.
    ///
    /// A `from_revision` of 0 watches only changes committed after this call. Events are
    /// delivered in revision order without gaps. A stream which can no longer guarantee this
    /// yields an error, after which it must be discarded.
    async fn watch(&self, prefix: &str, from_revision: Revision) -> StoreResult<WatchStream>;

    /// Execute the given transaction.
    async fn txn(&self, txn: Txn) -> StoreResult<TxnResponse>;

    /// Put the given value only if the key was last modified at `expected`.
    async fn compare_and_swap(&self, key: &str, expected: Revision, value: Vec<u8>) -> StoreResult<TxnResponse> {
        self.txn(Txn::new().when(Compare::at(key, expected)).then(Op::put(key, value))).await
    }

    /// Grant a new lease with the given TTL.
    async fn grant_lease(&self, ttl: Duration) -> StoreResult<LeaseId>;

    /// Extend the given lease by its TTL.
    async fn keep_alive(&self, lease: LeaseId) -> StoreResult<()>;

    /// Revoke the given lease, deleting all keys bound to it.
    async fn revoke_lease(&self, lease: LeaseId) -> StoreResult<()>;

    /// The maximum number of operations accepted in a single transaction.
    fn max_txn_ops(&self) -> usize;
}
