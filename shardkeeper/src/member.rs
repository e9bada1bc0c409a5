//! The local member agent.
//!
//! Registers this node as a member of the allocation domain, bound to a lease which is kept
//! alive for as long as the node runs, and reports each assignment made to this node as ready
//! once it has been observed.

use std::sync::Arc;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, WatchStream};

use shardkeeper_core::keyspace::{escape, Layout};
use shardkeeper_core::models::{AssignmentStatus, AssignmentValue, MemberSpec};

use crate::config::Config;
use crate::store::{translate_error, LeaseId, Op, StoreError, StoreRef, Txn};
use crate::tree::Tree;
use crate::watchers::TreeRx;

/// A task which maintains this node's member registration & acknowledges its assignments.
pub struct MemberAgent {
    config: Arc<Config>,
    store: StoreRef,
    /// The member id of this node.
    id: String,
    /// The escaped key segment of `id`.
    segment: String,
    trees: TreeRx,
    shutdown: BroadcastStream<()>,

    /// The lease bound to this node's member key, if currently registered.
    lease: Option<LeaseId>,
}

impl MemberAgent {
    pub fn new(config: Arc<Config>, store: StoreRef, trees: TreeRx, shutdown: broadcast::Receiver<()>) -> Self {
        let id = config.pod_name.clone();
        Self {
            segment: escape(&id),
            id,
            config,
            store,
            trees,
            shutdown: BroadcastStream::new(shutdown),
            lease: None,
        }
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        tracing::info!(member = %self.id, zone = %self.config.zone, "member agent started");
        let mut renew = tokio::time::interval(self.config.lease_renew());
        let mut trees = WatchStream::new(self.trees.clone());

        loop {
            tokio::select! {
                _ = renew.tick() => {
                    if let Err(err) = self.renew().await {
                        tracing::error!(error = ?err, "error maintaining member registration");
                    }
                }
                Some(tree) = trees.next() => {
                    if let Err(err) = self.acknowledge(&tree).await {
                        tracing::error!(error = ?err, "error acknowledging assignments");
                    }
                }
                _ = self.shutdown.next() => break,
            }
        }

        if let Some(lease) = self.lease.take() {
            self.store.revoke_lease(lease).await.map_err(translate_error).context("error revoking member lease")?;
        }
        tracing::info!("member agent stopped");
        Ok(())
    }

    /// Keep the member lease alive, registering afresh if there is no live lease.
    async fn renew(&mut self) -> Result<()> {
        if let Some(lease) = self.lease {
            match self.store.keep_alive(lease).await {
                Ok(()) => return Ok(()),
                Err(StoreError::LeaseNotFound(_)) => {
                    tracing::warn!(lease, "member lease lost, re-registering");
                    self.lease = None;
                }
                Err(err) => return Err(translate_error(err)).context("error renewing member lease"),
            }
        }
        self.register().await
    }

    #[tracing::instrument(level = "debug", skip(self), fields(member = %self.id), err)]
    async fn register(&mut self) -> Result<()> {
        let spec = MemberSpec {
            zone: self.config.zone.clone(),
            item_limit: self.config.item_limit,
        };
        let lease = self
            .store
            .grant_lease(self.config.lease_duration())
            .await
            .map_err(translate_error)
            .context("error granting member lease")?;
        let txn = Txn::new().then(Op::put_with_lease(self.config.layout.member_key(&self.id), spec.encode()?, lease));
        if let Err(err) = self.store.txn(txn).await {
            let _ = self.store.revoke_lease(lease).await;
            return Err(translate_error(err)).context("error writing member registration");
        }
        self.lease = Some(lease);
        tracing::info!(lease, "member registered");
        Ok(())
    }

    /// Mark every not-ready assignment of a live item to this member as ready.
    async fn acknowledge(&self, tree: &Tree) -> Result<()> {
        for (key, revision, value) in pending_assignments(tree, &self.config.layout, &self.segment) {
            let ready = AssignmentValue {
                status: AssignmentStatus::Ready,
                ..value
            };
            let res = self
                .store
                .compare_and_swap(&key, revision, ready.encode()?)
                .await
                .map_err(translate_error)
                .with_context(|| format!("error marking {} ready", key))?;
            if res.succeeded {
                tracing::debug!(%key, "assignment marked ready");
            } else {
                // Reconsidered on the next tree.
                tracing::debug!(%key, "assignment changed before it could be marked ready");
            }
        }
        Ok(())
    }
}

/// Find the not-ready assignments of the given member segment, as `(key, mod_revision, value)`.
pub(crate) fn pending_assignments(tree: &Tree, layout: &Layout, segment: &str) -> Vec<(String, u64, AssignmentValue)> {
    let items_prefix = layout.items_prefix();
    let items = match tree.node(items_prefix.trim_end_matches('/')) {
        Some(items) => items,
        None => return vec![],
    };
    items
        .children()
        .filter(|(_, item)| item.kv().is_some())
        .filter_map(|(_, item)| item.child(segment).and_then(|node| node.kv()))
        .filter_map(|kv| match AssignmentValue::decode(&kv.value) {
            Ok(value) if !value.is_ready() => Some((kv.key.clone(), kv.mod_revision, value)),
            Ok(_) => None,
            Err(err) => {
                tracing::warn!(key = %kv.key, error = ?err, "skipping undecodable assignment");
                None
            }
        })
        .collect()
}
