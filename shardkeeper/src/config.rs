//! Runtime configuration.

use std::time::Duration;

use anyhow::{ensure, Context, Result};
use serde::Deserialize;

use shardkeeper_core::keyspace::{Layout, DEFAULT_ROOT};

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The server's logging config, which uses Rust's `env_logger` directives.
    pub rust_log: String,
    /// The port which client HTTP traffic & metrics scraping is to use.
    pub http_port: u16,
    /// The name of the pod on which this instance is running.
    ///
    /// Used as this node's member id, and as the base of its leader election identity.
    pub pod_name: String,
    /// The failure zone of this node.
    #[serde(default = "Config::default_zone")]
    pub zone: String,
    /// The maximum number of item assignments this node will accept as a member.
    #[serde(default = "Config::default_item_limit")]
    pub item_limit: u32,
    /// Whether this node should register itself as a member eligible for assignments.
    #[serde(default = "Config::default_true")]
    pub member_enabled: bool,

    /// The root prefix of all keys of this allocation domain.
    #[serde(default = "Config::default_keyspace_root")]
    pub keyspace_root: String,
    /// The key layout derived from `keyspace_root`.
    #[serde(skip, default)]
    pub layout: Layout,

    /// The path to the embedded store on disk.
    #[serde(default = "crate::store::default_data_path")]
    pub storage_data_path: String,
    /// The number of revisions of event history retained for watchers.
    #[serde(default = "Config::default_history_limit")]
    pub history_limit: u64,
    /// The maximum number of operations accepted by the store in a single transaction.
    #[serde(default = "Config::default_max_txn_ops")]
    pub max_txn_ops: usize,
    /// The default maximum number of changes submitted per apply sub-transaction.
    #[serde(default = "Config::default_max_txn_size")]
    pub max_txn_size: usize,

    /// The TTL of leases held by this node, for leadership & member registration.
    #[serde(default = "Config::default_lease_duration_seconds")]
    pub lease_duration_seconds: u64,
    /// The interval at which leases held by this node are renewed.
    #[serde(default = "Config::default_lease_renew_seconds")]
    pub lease_renew_seconds: u64,
    /// The default deadline of readiness waits following item creation.
    #[serde(default = "Config::default_readiness_timeout_ms")]
    pub readiness_timeout_ms: u64,
}

impl Config {
    /// Create a new config instance.
    ///
    /// Currently this routine just parses the runtime environment and builds the application
    /// config from that.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        let config: Config = envy::from_env().context("error building config from env")?;
        config.finish()
    }

    /// Derive computed fields & validate the given config.
    pub(crate) fn finish(mut self) -> Result<Self> {
        ensure!(!self.pod_name.is_empty(), "POD_NAME must not be empty");
        ensure!(self.max_txn_ops > 0, "MAX_TXN_OPS must be greater than 0");
        ensure!(self.max_txn_size > 0, "MAX_TXN_SIZE must be greater than 0");
        ensure!(
            self.max_txn_size <= self.max_txn_ops,
            "MAX_TXN_SIZE ({}) must not exceed MAX_TXN_OPS ({})",
            self.max_txn_size,
            self.max_txn_ops
        );
        ensure!(
            self.lease_duration_seconds > self.lease_renew_seconds,
            "LEASE_DURATION_SECONDS must be greater than LEASE_RENEW_SECONDS"
        );
        self.layout = Layout::new(&self.keyspace_root);
        Ok(self)
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.lease_duration_seconds)
    }

    pub fn lease_renew(&self) -> Duration {
        Duration::from_secs(self.lease_renew_seconds)
    }

    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_millis(self.readiness_timeout_ms)
    }

    fn default_zone() -> String {
        "default".into()
    }

    fn default_item_limit() -> u32 {
        1024
    }

    fn default_true() -> bool {
        true
    }

    fn default_keyspace_root() -> String {
        DEFAULT_ROOT.into()
    }

    fn default_history_limit() -> u64 {
        10_000
    }

    fn default_max_txn_ops() -> usize {
        128
    }

    fn default_max_txn_size() -> usize {
        128
    }

    fn default_lease_duration_seconds() -> u64 {
        15
    }

    fn default_lease_renew_seconds() -> u64 {
        5
    }

    fn default_readiness_timeout_ms() -> u64 {
        1000
    }
}

#[cfg(test)]
impl Config {
    /// Build a config for tests, backed by a fresh temporary data directory.
    pub fn new_test() -> Result<(std::sync::Arc<Self>, tempfile::TempDir)> {
        let tmpdir = tempfile::tempdir_in("/tmp").context("error creating tmp dir in /tmp")?;
        let config = Self {
            rust_log: "error".into(),
            http_port: 7000,
            pod_name: "shardkeeper-0".into(),
            zone: Self::default_zone(),
            item_limit: Self::default_item_limit(),
            member_enabled: false,
            keyspace_root: Self::default_keyspace_root(),
            layout: Layout::default(),
            storage_data_path: tmpdir.path().to_string_lossy().to_string(),
            history_limit: Self::default_history_limit(),
            max_txn_ops: Self::default_max_txn_ops(),
            max_txn_size: 100,
            lease_duration_seconds: 3,
            lease_renew_seconds: 1,
            readiness_timeout_ms: 2000,
        }
        .finish()?;
        Ok((std::sync::Arc::new(config), tmpdir))
    }
}
