//! Readiness-gated item creation.
//!
//! A creating caller declares an item and then blocks until enough members report its
//! assignments as ready. Each wait mirrors only the item's own subtree, so any number of waits
//! may run concurrently, each bounded by its own deadline.

use std::time::Duration;

use anyhow::Result;
use futures::stream::StreamExt;

use shardkeeper_core::keyspace::Layout;
use shardkeeper_core::models::{AssignmentValue, ItemSpec};

use crate::error::AppError;
use crate::store::{translate_error, Compare, EventKind, Op, Revision, Store, Txn};
use crate::tree::Tree;

/// Create the given item, failing with `ItemExists` if it is already declared.
#[tracing::instrument(level = "debug", skip(store, layout, spec), fields(item = %spec.id), err)]
pub async fn create_item(store: &dyn Store, layout: &Layout, spec: &ItemSpec) -> Result<Revision> {
    spec.validate()?;
    let key = layout.item_key(&spec.id);
    let txn = Txn::new().when(Compare::absent(&key)).then(Op::put(&key, spec.encode()?));
    let res = store.txn(txn).await.map_err(translate_error)?;
    if !res.succeeded {
        return Err(AppError::ItemExists(spec.id.clone()).into());
    }
    Ok(res.revision)
}

/// Create an item with the given replication, then wait until all of its replicas are ready.
///
/// A timeout does not roll back the creation; the item remains declared and will converge.
pub async fn create_and_wait(store: &dyn Store, layout: &Layout, name: &str, replicas: i32, timeout: Duration) -> Result<Revision> {
    let spec = ItemSpec {
        id: name.into(),
        replication: replicas,
        ..Default::default()
    };
    let revision = create_item(store, layout, &spec).await?;
    wait_until_ready(store, layout, name, spec.desired_replicas(), timeout).await?;
    Ok(revision)
}

/// Wait until at least `required` assignments of the given item report ready.
///
/// Fails with `ItemNotFound` if the item does not exist or is deleted while waiting, and with
/// `ReadinessTimeout` if the deadline elapses first.
#[tracing::instrument(level = "debug", skip(store, layout), err)]
pub async fn wait_until_ready(store: &dyn Store, layout: &Layout, id: &str, required: usize, timeout: Duration) -> Result<()> {
    if required == 0 {
        return Ok(());
    }
    let mut ready = 0;
    let res = tokio::time::timeout(timeout, watch_ready(store, layout, id, required, &mut ready)).await;
    match res {
        Ok(res) => res,
        Err(_) => Err(AppError::ReadinessTimeout {
            id: id.into(),
            required,
            ready,
        }
        .into()),
    }
}

async fn watch_ready(store: &dyn Store, layout: &Layout, id: &str, required: usize, ready: &mut usize) -> Result<()> {
    let item_key = layout.item_key(id);
    let assignments_prefix = layout.assignments_prefix(id);
    let in_subtree = |key: &str| key == item_key || key.starts_with(&assignments_prefix);

    // Listing by the item key also matches sibling items sharing its prefix, so filter to the subtree.
    let (kvs, revision) = store.get(&item_key).await.map_err(translate_error)?;
    let kvs = kvs.into_iter().filter(|kv| in_subtree(kv.key.as_str())).collect();
    let mut tree = Tree::from_snapshot(layout.clone(), kvs, revision).map_err(|err| AppError::ResyncRequired(err.to_string()))?;
    if tree.get(&item_key).is_none() {
        return Err(AppError::ItemNotFound(id.into()).into());
    }
    *ready = count_ready(&tree, &item_key);
    if *ready >= required {
        return Ok(());
    }

    let mut stream = store.watch(&item_key, revision + 1).await.map_err(translate_error)?;
    while let Some(res) = stream.next().await {
        let event = res.map_err(translate_error)?;
        if !in_subtree(event.kv.key.as_str()) {
            continue;
        }
        tree.apply_patch(&event).map_err(|err| AppError::ResyncRequired(err.to_string()))?;
        if event.kind == EventKind::Delete && event.kv.key == item_key {
            return Err(AppError::ItemNotFound(id.into()).into());
        }
        *ready = count_ready(&tree, &item_key);
        tracing::trace!(ready = *ready, required, "readiness updated");
        if *ready >= required {
            return Ok(());
        }
    }
    Err(AppError::ResyncRequired("watch stream closed".into()).into())
}

/// Count the ready assignments below the given item.
fn count_ready(tree: &Tree, item_key: &str) -> usize {
    tree.node(item_key)
        .map(|node| {
            node.children()
                .filter_map(|(_, child)| child.kv())
                .filter(|kv| AssignmentValue::decode(&kv.value).map(|value| value.is_ready()).unwrap_or(false))
                .count()
        })
        .unwrap_or(0)
}
