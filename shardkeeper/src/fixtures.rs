use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use shardkeeper_core::keyspace::{KeyKind, Layout};
use shardkeeper_core::models::{AssignmentStatus, AssignmentValue, ItemSpec, MemberSpec};

use crate::sink::MetricsSink;
use crate::store::{Op, Revision, Store, Txn};
use crate::tree::Tree;
use crate::watchers::TreeRx;

/// A metrics sink which records everything it receives, for assertions.
#[derive(Default)]
pub struct RecordingSink {
    pub added: AtomicU64,
    pub removed: AtomicU64,
    pub packed: AtomicU64,
    pub passes: AtomicU64,
    pub unassigned: AtomicU64,
    pub watch_errors: AtomicU64,
    pub applied: AtomicU64,
    pub is_leader: AtomicBool,
}

impl RecordingSink {
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::SeqCst)
    }
}

impl MetricsSink for RecordingSink {
    fn assignments_added(&self, count: u64) {
        self.added.fetch_add(count, Ordering::SeqCst);
    }

    fn assignments_removed(&self, count: u64) {
        self.removed.fetch_add(count, Ordering::SeqCst);
    }

    fn assignments_packed(&self, count: u64) {
        self.packed.fetch_add(count, Ordering::SeqCst);
    }

    fn converge_pass(&self) {
        self.passes.fetch_add(1, Ordering::SeqCst);
    }

    fn solver_runtime(&self, _elapsed: Duration) {}

    fn allocation_size(&self, _items: usize, _members: usize, _desired_slots: usize, unassigned_slots: usize) {
        self.unassigned.store(unassigned_slots as u64, Ordering::SeqCst);
    }

    fn leader(&self, is_leader: bool) {
        self.is_leader.store(is_leader, Ordering::SeqCst);
    }

    fn watch_error(&self) {
        self.watch_errors.fetch_add(1, Ordering::SeqCst);
    }

    fn changes_applied(&self, count: u64) {
        self.applied.fetch_add(count, Ordering::SeqCst);
    }
}

/// Write the given item spec, returning the commit revision.
pub async fn put_item(store: &dyn Store, layout: &Layout, id: &str, replication: i32) -> Result<Revision> {
    let spec = ItemSpec {
        id: id.into(),
        replication,
        ..Default::default()
    };
    let res = store.txn(Txn::new().then(Op::put(layout.item_key(id), spec.encode()?))).await?;
    Ok(res.revision)
}

/// Register a member without a lease, returning the commit revision.
pub async fn register_member(store: &dyn Store, layout: &Layout, id: &str, zone: &str, item_limit: u32) -> Result<Revision> {
    let spec = MemberSpec {
        zone: zone.into(),
        item_limit,
    };
    let res = store.txn(Txn::new().then(Op::put(layout.member_key(id), spec.encode()?))).await?;
    Ok(res.revision)
}

/// Build a fresh tree of the full key space.
pub async fn snapshot(store: &dyn Store, layout: &Layout) -> Result<Tree> {
    let (kvs, revision) = store.get(&layout.root_prefix()).await?;
    Ok(Tree::from_snapshot(layout.clone(), kvs, revision)?)
}

/// Wait until the given tree channel publishes a tree at or beyond the given revision.
pub async fn wait_for_revision(rx: &mut TreeRx, revision: Revision) -> Result<Arc<Tree>> {
    tokio::time::timeout(Duration::from_secs(5), next_tree_at(rx, revision))
        .await
        .with_context(|| format!("timeout waiting for tree at revision {}", revision))?
}

async fn next_tree_at(rx: &mut TreeRx, revision: Revision) -> Result<Arc<Tree>> {
    loop {
        let tree = rx.borrow().clone();
        if tree.revision() >= revision {
            return Ok(tree);
        }
        rx.changed().await.context("tree channel closed")?;
    }
}

/// Read the assignments of an item as `(member, value)` pairs ordered by slot.
pub async fn assignments(store: &dyn Store, layout: &Layout, item: &str) -> Result<Vec<(String, AssignmentValue)>> {
    let (kvs, _) = store.get(&layout.assignments_prefix(item)).await?;
    let mut out = vec![];
    for kv in kvs {
        match layout.parse(&kv.key) {
            Some(KeyKind::Assignment { item: parsed, member }) if parsed == item => out.push((member, AssignmentValue::decode(&kv.value)?)),
            other => bail!("unexpected key {} under assignments prefix, parsed as {:?}", kv.key, other),
        }
    }
    out.sort_by_key(|(_, value)| value.slot);
    Ok(out)
}

/// Mark the assignment of the given item to the given member as ready.
pub async fn mark_ready(store: &dyn Store, layout: &Layout, item: &str, member: &str) -> Result<Revision> {
    let key = layout.assignment_key(item, member);
    let kv = store.get_key(&key).await?.context("expected assignment to exist")?;
    let mut value = AssignmentValue::decode(&kv.value)?;
    value.status = AssignmentStatus::Ready;
    let res = store.compare_and_swap(&key, kv.mod_revision, value.encode()?).await?;
    if !res.succeeded {
        bail!("assignment {} was concurrently modified", key);
    }
    Ok(res.revision)
}

/// Assert that the given assignments respect replication & slot invariants.
pub fn assert_conserved(item: &str, replication: usize, assignments: &[(String, AssignmentValue)]) {
    assert!(
        assignments.len() <= replication,
        "item {} has {} assignments exceeding replication {}",
        item,
        assignments.len(),
        replication
    );
    let slots: Vec<u32> = assignments.iter().map(|(_, value)| value.slot).collect();
    let expected: Vec<u32> = (0..assignments.len() as u32).collect();
    assert_eq!(slots, expected, "item {} slots are not contiguous from 0: {:?}", item, slots);
    let mut members: Vec<&str> = assignments.iter().map(|(member, _)| member.as_str()).collect();
    members.sort_unstable();
    members.dedup();
    assert_eq!(members.len(), assignments.len(), "item {} has duplicate member placements", item);
}
