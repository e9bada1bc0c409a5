use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::broadcast;

use shardkeeper_core::keyspace::{escape, Layout};
use shardkeeper_core::models::{AssignmentStatus, AssignmentValue, MemberSpec};

use crate::config::Config;
use crate::fixtures::{self, RecordingSink};
use crate::member::{pending_assignments, MemberAgent};
use crate::store::{Op, SledStore, Store, StoreRef, Txn};
use crate::watchers::KeySpaceWatcher;

async fn put_assignment(store: &dyn Store, layout: &Layout, item: &str, member: &str, status: AssignmentStatus) -> Result<()> {
    let value = AssignmentValue { slot: 0, status };
    store.txn(Txn::new().then(Op::put(layout.assignment_key(item, member), value.encode()?))).await?;
    Ok(())
}

/// Poll the given key until its presence matches `present`.
async fn wait_for_key(store: &dyn Store, key: &str, present: bool) -> Result<()> {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if store.get_key(key).await?.is_some() == present {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .with_context(|| format!("timeout waiting for key {} present={}", key, present))?
}

#[tokio::test]
async fn agent_registers_and_acknowledges_own_assignments() -> Result<()> {
    let (config, _tmpdir) = Config::new_test()?;
    let store: StoreRef = Arc::new(SledStore::new(config.clone()).await?);
    let layout = config.layout.clone();
    let (shutdown_tx, _) = broadcast::channel(1);
    let (watcher, trees) = KeySpaceWatcher::new(store.clone(), layout.clone(), Arc::new(RecordingSink::default()), shutdown_tx.subscribe());
    let watcher = watcher.spawn();
    let agent = MemberAgent::new(config.clone(), store.clone(), trees, shutdown_tx.subscribe()).spawn();

    let member_key = layout.member_key(&config.pod_name);
    wait_for_key(store.as_ref(), &member_key, true).await?;
    let kv = store.get_key(&member_key).await?.context("expected member key to exist")?;
    let spec = MemberSpec::decode(&kv.value)?;
    assert_eq!(spec.item_limit, config.item_limit, "expected configured item limit got {:?}", spec);
    assert_ne!(kv.lease, 0, "expected member key to be bound to a lease");

    fixtures::put_item(store.as_ref(), &layout, "foo", 2).await?;
    put_assignment(store.as_ref(), &layout, "foo", &config.pod_name, AssignmentStatus::NotReady).await?;
    put_assignment(store.as_ref(), &layout, "foo", "other", AssignmentStatus::NotReady).await?;

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let assignments = fixtures::assignments(store.as_ref(), &layout, "foo").await?;
            if assignments.iter().any(|(member, value)| member == &config.pod_name && value.is_ready()) {
                return Ok::<_, anyhow::Error>(assignments);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .context("timeout waiting for assignment to be marked ready")??;
    let other = store.get_key(&layout.assignment_key("foo", "other")).await?.context("expected other assignment")?;
    assert!(!AssignmentValue::decode(&other.value)?.is_ready(), "expected assignments of other members to be untouched");

    let _ = shutdown_tx.send(());
    tokio::time::timeout(Duration::from_secs(5), agent).await.context("timeout joining member agent")???;
    tokio::time::timeout(Duration::from_secs(5), watcher).await.context("timeout joining watcher")???;
    let kv = store.get_key(&member_key).await?;
    assert!(kv.is_none(), "expected member registration to be revoked on shutdown got {:?}", kv);

    Ok(())
}

#[tokio::test]
async fn pending_assignments_skips_ready_and_orphaned_assignments() -> Result<()> {
    let (config, _tmpdir) = Config::new_test()?;
    let store = SledStore::new(config.clone()).await?;
    let layout = config.layout.clone();
    for item in ["foo", "bar"] {
        fixtures::put_item(&store, &layout, item, 1).await?;
    }
    put_assignment(&store, &layout, "foo", "m1", AssignmentStatus::NotReady).await?;
    put_assignment(&store, &layout, "bar", "m1", AssignmentStatus::Ready).await?;
    // An assignment whose item has been deleted.
    put_assignment(&store, &layout, "gone", "m1", AssignmentStatus::NotReady).await?;
    put_assignment(&store, &layout, "bar", "m2", AssignmentStatus::NotReady).await?;

    let tree = fixtures::snapshot(&store, &layout).await?;
    let pending = pending_assignments(&tree, &layout, &escape("m1"));

    let keys: Vec<&str> = pending.iter().map(|(key, _, _)| key.as_str()).collect();
    assert_eq!(keys, vec![layout.assignment_key("foo", "m1").as_str()], "unexpected pending assignments {:?}", keys);

    Ok(())
}
