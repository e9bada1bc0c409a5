//! Allocator.
//!
//! The allocator is the convergence engine of an allocation domain. Whenever the keyspace
//! mirror changes, the current leader decodes the mirror, solves a min-cost max-flow placement
//! of every item's desired replicas onto live members, and realizes the difference between that
//! placement and the current assignments through conditional store transactions.
//!
//! Every transaction is fenced on the leader key as well as on each key the plan was derived
//! from, so a stale leader or a stale mirror can never overwrite a concurrent change. A failed
//! compare aborts the pass; the change which caused it will arrive through the watch and trigger
//! the next pass.

mod plan;
mod solver;
mod state;


use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::wrappers::{BroadcastStream, WatchStream};

use crate::coordination::LeaderState;
use crate::sink::{MetricsSink, SinkRef};
use crate::store::{translate_error, Compare, Revision, Store, StoreRef};
use crate::tree::Tree;
use crate::watchers::TreeRx;

pub use state::{ClusterState, ItemState, MemberState};

/// The delay before a pass which failed on a store error is retried.
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// A predicate deciding whether an item may be placed on a member.
pub trait PlacementPredicate: Send + Sync + 'static {
    fn is_eligible(&self, item: &ItemState, member: &MemberState) -> bool;
}

/// A predicate accepting every (item, member) pair.
#[derive(Clone, Copy, Debug, Default)]
pub struct AnyMember;

impl PlacementPredicate for AnyMember {
    fn is_eligible(&self, _: &ItemState, _: &MemberState) -> bool {
        true
    }
}

impl<F> PlacementPredicate for F
where
    F: Fn(&ItemState, &MemberState) -> bool + Send + Sync + 'static,
{
    fn is_eligible(&self, item: &ItemState, member: &MemberState) -> bool {
        self(item, member)
    }
}

/// The outcome of a single convergence pass.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PassOutcome {
    pub added: usize,
    pub removed: usize,
    pub packed: usize,
    /// The number of desired replicas which could not be placed.
    pub unassigned: usize,
    /// The revision of the last transaction committed by this pass.
    pub committed_revision: Option<Revision>,
    /// The item whose transaction failed a compare, aborting the pass.
    pub conflict: Option<String>,
}

/// Run a single convergence pass over the given tree.
///
/// When `fence` is given, every transaction of the pass additionally requires it to hold.
/// Conflicting writes abort the pass and are reported through `PassOutcome::conflict`, while
/// store failures are returned as errors.
#[tracing::instrument(level = "debug", skip(store, tree, predicate, sink, fence), fields(revision = tree.revision()))]
pub async fn converge_pass(
    store: &dyn Store, tree: &Tree, predicate: &dyn PlacementPredicate, sink: &dyn MetricsSink, fence: Option<&Compare>,
) -> Result<PassOutcome> {
    sink.converge_pass();
    let state = ClusterState::from_tree(tree);
    let (demands, supplies) = plan::problem(&state, predicate);

    let start = std::time::Instant::now();
    let placement = solver::solve(&demands, &supplies);
    sink.solver_runtime(start.elapsed());

    let mut outcome = PassOutcome {
        unassigned: placement.unplaced(),
        ..Default::default()
    };
    sink.allocation_size(state.items.len(), state.members.len(), placement.desired, outcome.unassigned);
    if outcome.unassigned > 0 {
        tracing::warn!(
            unassigned = outcome.unassigned,
            desired = placement.desired,
            members = state.members.len(),
            "insufficient member capacity to place all desired replicas"
        );
    }

    let max_ops = store.max_txn_ops();
    for item_plan in plan::plan(&state, &placement) {
        if item_plan.ops() > max_ops {
            tracing::error!(item = %item_plan.item, ops = item_plan.ops(), max_ops, "item changes exceed the store transaction limit, skipping item");
            continue;
        }
        let txn = item_plan.txn(tree.layout(), fence)?;
        let res = store
            .txn(txn)
            .await
            .map_err(translate_error)
            .with_context(|| format!("error committing assignment changes of item {}", item_plan.item))?;
        if !res.succeeded {
            tracing::info!(item = %item_plan.item, failed_compare = ?res.failed_compare, "conflicting write detected, aborting convergence pass");
            outcome.conflict = Some(item_plan.item);
            break;
        }

        let (added, removed, packed) = (item_plan.additions.len(), item_plan.removals.len(), item_plan.packed());
        tracing::debug!(item = %item_plan.item, added, removed, packed, revision = res.revision, "assignments updated");
        sink.assignments_added(added as u64);
        sink.assignments_removed(removed as u64);
        sink.assignments_packed(packed as u64);
        outcome.added += added;
        outcome.removed += removed;
        outcome.packed += packed;
        outcome.committed_revision = Some(res.revision);
    }
    Ok(outcome)
}

/// A task driving convergence passes while this node is the leader.
pub struct Allocator {
    store: StoreRef,
    predicate: Arc<dyn PlacementPredicate>,
    sink: SinkRef,
    trees: TreeRx,
    leader: watch::Receiver<LeaderState>,
    shutdown: BroadcastStream<()>,

    /// The most recently observed tree.
    tree: Arc<Tree>,
    /// The most recently observed leader state.
    leader_state: LeaderState,
    /// Passes are deferred until the tree reflects this revision, being the last revision
    /// committed by this allocator.
    awaiting: Revision,
    /// The time at which a pass which failed on a store error is to be retried.
    retry_at: Option<Instant>,
    /// The tree revision & fence of the last completed pass.
    last_pass: Option<(Revision, Revision)>,
}

impl Allocator {
    /// Create a new instance.
    pub fn new(
        store: StoreRef, predicate: Arc<dyn PlacementPredicate>, sink: SinkRef, trees: TreeRx, leader: watch::Receiver<LeaderState>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        let tree = trees.borrow().clone();
        Self {
            store,
            predicate,
            sink,
            trees,
            leader,
            shutdown: BroadcastStream::new(shutdown),
            tree,
            leader_state: LeaderState::Standby,
            awaiting: 0,
            retry_at: None,
            last_pass: None,
        }
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        tracing::debug!("allocator started");
        let mut trees = WatchStream::new(self.trees.clone());
        let mut leader = WatchStream::new(self.leader.clone());

        loop {
            let retry_at = self.retry_at;
            let retry = async move {
                match retry_at {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => futures::future::pending().await,
                }
            };
            tokio::select! {
                Some(tree) = trees.next() => self.tree = tree,
                Some(state) = leader.next() => {
                    tracing::debug!(state = ?state, "allocator observed new leader state");
                    self.leader_state = state;
                }
                _ = retry => self.retry_at = None,
                _ = self.shutdown.next() => break,
            }
            self.maybe_converge().await;
        }

        tracing::debug!("allocator stopped");
        Ok(())
    }

    /// Run a convergence pass if this node is leading and the tree has changed since the last one.
    async fn maybe_converge(&mut self) {
        let fence_revision = match &self.leader_state {
            LeaderState::Leading { fence_revision } => *fence_revision,
            _ => return,
        };
        let revision = self.tree.revision();
        if self.retry_at.is_some() || revision < self.awaiting || self.last_pass == Some((revision, fence_revision)) {
            return;
        }

        let fence = Compare::at(self.tree.layout().leader_key(), fence_revision);
        let res = converge_pass(self.store.as_ref(), &self.tree, self.predicate.as_ref(), self.sink.as_ref(), Some(&fence)).await;
        match res {
            Ok(outcome) => {
                self.last_pass = Some((revision, fence_revision));
                if let Some(committed) = outcome.committed_revision {
                    self.awaiting = committed;
                }
            }
            Err(err) => {
                tracing::error!(error = ?err, "error during convergence pass, will retry");
                self.last_pass = None;
                self.retry_at = Some(Instant::now() + RETRY_DELAY);
            }
        }
    }
}
