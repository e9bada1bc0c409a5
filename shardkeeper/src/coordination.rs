//! Lease-based leader election over the consistent store.
//!
//! A candidate acquires leadership by creating the leader key bound to a freshly granted lease,
//! conditional on the key being absent. While leading, the key is never rewritten; leadership
//! is maintained purely by keeping the lease alive. The mod revision of the leader key thus
//! identifies a single term of leadership, and is used by the leader to fence its writes: a
//! transaction which compares the leader key at that revision can only commit while the term
//! is still held.

use std::time::Duration;

use anyhow::{ensure, Context, Result};
use futures::prelude::*;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::wrappers::BroadcastStream;

use crate::sink::SinkRef;
use crate::store::{translate_error, Compare, EventKind, LeaseId, Op, Revision, StoreError, StoreRef, Txn, WatchStream};
use crate::utils;

const JITTER_FACTOR: f64 = 1.2;

/// Different states which a leader elector may be in.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LeaderState {
    /// This node is the leader, for the term identified by the mod revision of the leader key.
    Leading { fence_revision: Revision },
    /// A different node is currently the leader, identified by the encapsulated string.
    Following(String),
    /// The leader is unknown, or the elector task is starting or stopping.
    Standby,
}

/// Configuration for leader election.
#[derive(Clone, Debug)]
pub struct LeaderElectionConfig {
    /// The key holding the identity of the current leader.
    key: String,
    /// The identity to use when leadership is acquired.
    identity: String,
    /// The TTL of the lease bound to the leader key.
    ///
    /// When a leader dies without revoking its lease, candidates must wait up to this long
    /// before the key is released.
    lease_duration: Duration,
    /// The duration for which a leader will keep retrying failed lease renewals before stepping
    /// down.
    renew_deadline: Duration,
    /// The duration between lease renewals while leading, and between acquisition attempts
    /// otherwise.
    retry_period: Duration,
}

impl LeaderElectionConfig {
    /// Create a new `LeaderElectionConfig` instance, validating given inputs.
    pub fn new(key: impl AsRef<str>, identity: String, lease_duration: Duration, renew_deadline: Duration, retry_period: Duration) -> Result<Self> {
        ensure!(lease_duration > renew_deadline, "lease_duration must be greater than renew_deadline");
        ensure!(
            renew_deadline > retry_period.mul_f64(JITTER_FACTOR),
            "renew_deadline must be greater than retry_period*{}",
            JITTER_FACTOR,
        );
        ensure!(lease_duration.as_secs() >= 1, "lease_duration must be at least 1 second");
        ensure!(renew_deadline.as_secs() >= 1, "renew_deadline must be at least 1 second");
        ensure!(retry_period.as_secs() >= 1, "retry_period must be at least 1 second");
        ensure!(!identity.is_empty(), "identity must not be empty");
        Ok(Self {
            key: key.as_ref().to_string(),
            identity,
            lease_duration,
            renew_deadline,
            retry_period,
        })
    }
}

/// A task which is responsible for acquiring and maintaining the leader key.
pub struct LeaderElector {
    store: StoreRef,
    config: LeaderElectionConfig,
    sink: SinkRef,
    /// Sender for the current state of the leadership coordination system.
    state_tx: watch::Sender<LeaderState>,
    /// The last known leader state.
    state: LeaderState,
    /// A broadcast channel used to trigger task shutdown.
    shutdown: BroadcastStream<()>,

    /// The lease bound to the leader key, held only while leading.
    lease: Option<LeaseId>,
    /// The last time the held lease was successfully renewed.
    last_renew: Instant,
}

impl LeaderElector {
    /// Create a new `LeaderElector` instance.
    pub fn new(store: StoreRef, config: LeaderElectionConfig, sink: SinkRef, shutdown: broadcast::Receiver<()>) -> (Self, watch::Receiver<LeaderState>) {
        let (state_tx, state_rx) = watch::channel(LeaderState::Standby);
        (
            Self {
                store,
                config,
                sink,
                state_tx,
                state: LeaderState::Standby,
                shutdown: BroadcastStream::new(shutdown),
                lease: None,
                last_renew: Instant::now(),
            },
            state_rx,
        )
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        tracing::info!(identity = %self.config.identity, "leader elector task started");
        let mut watcher: Option<WatchStream> = None;

        loop {
            // Watch the leader key before acting on it, so that no release goes unobserved.
            if watcher.is_none() {
                match self.store.watch(&self.config.key, 0).await {
                    Ok(stream) => watcher = Some(stream),
                    Err(err) => tracing::error!(error = ?err, "error watching leader key"),
                }
            }
            if let Err(err) = self.try_acquire_or_renew().await {
                tracing::error!(error = ?err, "error during call to try_acquire_or_renew");
            }

            let delay = match &self.state {
                LeaderState::Leading { .. } => self.config.retry_period,
                _ => utils::jitter(self.config.retry_period),
            };
            let next_event = async {
                match watcher.as_mut() {
                    Some(stream) => stream.next().await,
                    None => future::pending().await,
                }
            };
            tokio::select! {
                event = next_event => match event {
                    Some(Ok(event)) if event.kv.key == self.config.key => {
                        if event.kind == EventKind::Delete {
                            tracing::debug!("leader key released");
                            if matches!(self.state, LeaderState::Leading { .. }) {
                                self.lease = None;
                            }
                            self.set_state(LeaderState::Standby);
                        }
                    }
                    Some(Ok(_)) => (),
                    Some(Err(err)) => {
                        tracing::error!(error = ?err, "error from leader key watch stream");
                        watcher = None;
                        tokio::time::sleep(self.config.retry_period).await;
                    }
                    None => watcher = None,
                },
                _ = tokio::time::sleep(delay) => (),
                _ = self.shutdown.next() => break,
            }
        }

        if let Some(lease) = self.lease.take() {
            if let Err(err) = self.store.revoke_lease(lease).await {
                tracing::error!(error = ?err, "error revoking leader lease");
            }
        }
        self.set_state(LeaderState::Standby);
        tracing::info!("leader elector task stopped");
    }

    /// Attempt to acquire leadership, or renew the lease of a held leadership.
    #[tracing::instrument(level = "debug", skip(self), err)]
    async fn try_acquire_or_renew(&mut self) -> Result<()> {
        match (&self.state, self.lease) {
            (LeaderState::Leading { .. }, Some(lease)) => self.renew(lease).await,
            _ => self.acquire().await,
        }
    }

    async fn renew(&mut self, lease: LeaseId) -> Result<()> {
        match self.store.keep_alive(lease).await {
            Ok(()) => {
                self.last_renew = Instant::now();
                Ok(())
            }
            Err(StoreError::LeaseNotFound(_)) => {
                tracing::warn!(lease, "leader lease lost");
                self.lease = None;
                self.set_state(LeaderState::Standby);
                Ok(())
            }
            Err(err) => {
                if self.last_renew.elapsed() > self.config.renew_deadline {
                    tracing::warn!("failed to renew leader lease within the renew deadline, stepping down");
                    self.lease = None;
                    self.set_state(LeaderState::Standby);
                }
                Err(translate_error(err)).context("error renewing leader lease")
            }
        }
    }

    async fn acquire(&mut self) -> Result<()> {
        let lease = self
            .store
            .grant_lease(self.config.lease_duration)
            .await
            .map_err(translate_error)
            .context("error granting leader lease")?;
        let key = self.config.key.as_str();
        let txn = Txn::new()
            .when(Compare::absent(key))
            .then(Op::put_with_lease(key, self.config.identity.clone().into_bytes(), lease));
        let res = match self.store.txn(txn).await {
            Ok(res) => res,
            Err(err) => {
                let _ = self.store.revoke_lease(lease).await;
                return Err(translate_error(err)).context("error acquiring leader key");
            }
        };
        if res.succeeded {
            self.lease = Some(lease);
            self.last_renew = Instant::now();
            self.set_state(LeaderState::Leading {
                fence_revision: res.revision,
            });
            return Ok(());
        }

        // Leadership is held elsewhere.
        self.store.revoke_lease(lease).await.map_err(translate_error).context("error revoking unused lease")?;
        let holder = self.store.get_key(key).await.map_err(translate_error).context("error fetching leader key")?;
        match holder {
            Some(kv) => self.set_state(LeaderState::Following(String::from_utf8_lossy(&kv.value).into_owned())),
            None => self.set_state(LeaderState::Standby),
        }
        Ok(())
    }

    /// Set the current leader state & emit a state update.
    fn set_state(&mut self, state: LeaderState) {
        if self.state == state {
            return;
        }
        tracing::info!(state = ?state, "leader state changed");
        self.sink.leader(matches!(state, LeaderState::Leading { .. }));
        self.state = state;
        let _ = self.state_tx.send(self.state.clone());
    }
}
