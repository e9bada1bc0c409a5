//! Keyspace watchers.

mod keyspace;
#[cfg(test)]
mod keyspace_test;

pub use keyspace::{resync, KeySpaceWatcher, TreeRx};
