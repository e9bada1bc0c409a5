use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use shardkeeper_core::keyspace::Layout;
use shardkeeper_core::models::{AssignmentStatus, AssignmentValue, ItemSpec};

use crate::config::Config;
use crate::error::AppError;
use crate::fixtures;
use crate::readiness::{create_item, wait_until_ready};
use crate::store::{Op, SledStore, Store, StoreRef, Txn};

async fn put_assignment(store: &dyn Store, layout: &Layout, item: &str, member: &str, slot: u32) -> Result<()> {
    let value = AssignmentValue {
        slot,
        status: AssignmentStatus::NotReady,
    };
    store.txn(Txn::new().then(Op::put(layout.assignment_key(item, member), value.encode()?))).await?;
    Ok(())
}

fn spec(id: &str, replication: i32) -> ItemSpec {
    ItemSpec {
        id: id.into(),
        replication,
        ..Default::default()
    }
}

#[tokio::test]
async fn wait_returns_once_required_replicas_are_ready() -> Result<()> {
    let (config, _tmpdir) = Config::new_test()?;
    let store: StoreRef = Arc::new(SledStore::new(config.clone()).await?);
    let layout = config.layout.clone();
    create_item(store.as_ref(), &layout, &spec("bar", 2)).await?;
    // A sibling item sharing the same key prefix must not be counted.
    create_item(store.as_ref(), &layout, &spec("barn", 2)).await?;

    let (wait_store, wait_layout) = (store.clone(), layout.clone());
    let mut waiter = tokio::spawn(async move { wait_until_ready(wait_store.as_ref(), &wait_layout, "bar", 2, Duration::from_secs(5)).await });

    put_assignment(store.as_ref(), &layout, "barn", "m1", 0).await?;
    fixtures::mark_ready(store.as_ref(), &layout, "barn", "m1").await?;
    put_assignment(store.as_ref(), &layout, "bar", "m1", 0).await?;
    put_assignment(store.as_ref(), &layout, "bar", "m2", 1).await?;
    fixtures::mark_ready(store.as_ref(), &layout, "bar", "m1").await?;
    let early = tokio::time::timeout(Duration::from_millis(100), &mut waiter).await;
    assert!(early.is_err(), "expected wait to block with only 1 ready replica, got {:?}", early);
    fixtures::mark_ready(store.as_ref(), &layout, "bar", "m2").await?;

    tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .context("timeout joining readiness wait")???;

    Ok(())
}

#[tokio::test]
async fn wait_times_out_with_insufficient_ready_replicas() -> Result<()> {
    let (config, _tmpdir) = Config::new_test()?;
    let store = SledStore::new(config.clone()).await?;
    let layout = config.layout.clone();
    create_item(&store, &layout, &spec("bar", 2)).await?;
    put_assignment(&store, &layout, "bar", "m1", 0).await?;
    put_assignment(&store, &layout, "bar", "m2", 1).await?;
    fixtures::mark_ready(&store, &layout, "bar", "m1").await?;

    let err = wait_until_ready(&store, &layout, "bar", 2, Duration::from_millis(200))
        .await
        .err()
        .context("expected readiness wait to time out")?;

    match err.downcast_ref::<AppError>() {
        Some(AppError::ReadinessTimeout { id, required, ready }) => {
            assert_eq!(id, "bar", "expected timeout for bar got {}", id);
            assert_eq!((*required, *ready), (2, 1), "expected 1 of 2 ready got {} of {}", ready, required);
        }
        other => panic!("expected readiness timeout got {:?}", other),
    }
    let item = store.get_key(&layout.item_key("bar")).await?;
    assert!(item.is_some(), "expected item to remain declared after a timeout");

    Ok(())
}

#[tokio::test]
async fn wait_fails_when_item_is_deleted() -> Result<()> {
    let (config, _tmpdir) = Config::new_test()?;
    let store: StoreRef = Arc::new(SledStore::new(config.clone()).await?);
    let layout = config.layout.clone();
    create_item(store.as_ref(), &layout, &spec("bar", 1)).await?;

    let (wait_store, wait_layout) = (store.clone(), layout.clone());
    let waiter = tokio::spawn(async move { wait_until_ready(wait_store.as_ref(), &wait_layout, "bar", 1, Duration::from_secs(5)).await });
    store.txn(Txn::new().then(Op::delete(layout.item_key("bar")))).await?;

    let res = tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .context("timeout joining readiness wait")??;
    let err = res.err().context("expected readiness wait to fail")?;
    assert!(
        matches!(err.downcast_ref::<AppError>(), Some(AppError::ItemNotFound(id)) if id == "bar"),
        "expected item not found got {:?}",
        err
    );

    Ok(())
}

#[tokio::test]
async fn wait_for_zero_replicas_returns_immediately() -> Result<()> {
    let (config, _tmpdir) = Config::new_test()?;
    let store = SledStore::new(config.clone()).await?;

    wait_until_ready(&store, &config.layout, "missing", 0, Duration::from_millis(10)).await?;

    Ok(())
}

#[tokio::test]
async fn create_rejects_existing_items() -> Result<()> {
    let (config, _tmpdir) = Config::new_test()?;
    let store = SledStore::new(config.clone()).await?;
    let layout = config.layout.clone();
    let revision = create_item(&store, &layout, &spec("bar", 1)).await?;

    let err = create_item(&store, &layout, &spec("bar", 3))
        .await
        .err()
        .context("expected second create to fail")?;

    assert!(
        matches!(err.downcast_ref::<AppError>(), Some(AppError::ItemExists(id)) if id == "bar"),
        "expected item exists got {:?}",
        err
    );
    let kv = store.get_key(&layout.item_key("bar")).await?.context("expected bar to exist")?;
    assert_eq!(kv.mod_revision, revision, "expected bar to be unmodified");
    let err = create_item(&store, &layout, &spec("baz", -1))
        .await
        .err()
        .context("expected negative replication to be rejected")?;
    assert!(matches!(err.downcast_ref::<AppError>(), Some(AppError::InvalidInput(_))), "expected validation error got {:?}", err);

    Ok(())
}
