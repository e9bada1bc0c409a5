//! Shardkeeper error abstractions.

use thiserror::Error;

/// Application error variants.
///
/// This is the closed set of error kinds surfaced to callers. Errors coming from the
/// consistent store are translated into one of these variants at the store boundary, so
/// provider specific codes never leak past it.
#[derive(Debug, Error)]
pub enum AppError {
    /// The given input was invalid.
    #[error("validation error: {0}")]
    InvalidInput(String),
    /// An expected revision did not match the stored revision of the given item.
    #[error("concurrent modification of item {id}: expected revision {expected}")]
    ConcurrentModification { id: String, expected: u64 },
    /// The consistent store could not be reached or failed to respond.
    #[error("the consistent store is unavailable: {0}")]
    StoreUnavailable(String),
    /// The local keyspace mirror diverged from the store and must be rebuilt.
    #[error("keyspace mirror requires resynchronization: {0}")]
    ResyncRequired(String),
    /// The readiness deadline elapsed before enough replicas became ready.
    #[error("timeout waiting for {required} ready replicas of item {id}, observed {ready}")]
    ReadinessTimeout { id: String, required: usize, ready: usize },
    /// The target item does not exist, or was deleted while being observed.
    #[error("item {0} not found")]
    ItemNotFound(String),
    /// The target item already exists.
    #[error("item {0} already exists")]
    ItemExists(String),
    /// Items reference underlying resources which do not exist.
    #[error("referenced resources do not exist: {}", .0.join(", "))]
    MissingResources(Vec<String>),
    /// The server has hit an internal error, but will remain online.
    #[error("internal server error")]
    Ise(anyhow::Error),
}
