//! Core data models, key layout & error types shared by shardkeeper components.

mod error;
pub mod keyspace;
pub mod models;
pub mod prom;

pub use error::AppError;
