use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Extension, Path, Query};
use axum::http::StatusCode;

use crate::apply::RegisteredResources;
use crate::config::Config;
use crate::fixtures::{self, RecordingSink};
use crate::server::{apply_items, create_item, list_items, ApplyParams, CreateParams, ServerState, HEADER_REVISION};
use crate::store::{SledStore, StoreRef};

async fn server_state() -> Result<(Arc<ServerState>, tempfile::TempDir)> {
    let (config, tmpdir) = Config::new_test()?;
    let store: StoreRef = Arc::new(SledStore::new(config.clone()).await?);
    let state = ServerState {
        validator: Arc::new(RegisteredResources::new(store.clone(), config.layout.clone())),
        sink: Arc::new(RecordingSink::default()),
        store,
        config,
    };
    Ok((Arc::new(state), tmpdir))
}

const DOC: &str = "
- id: foo
  replication: 2
- id: bar
  replication: 1
";

#[tokio::test]
async fn apply_then_list_returns_declarations_with_revisions() -> Result<()> {
    let (state, _tmpdir) = server_state().await?;

    let (status, _, body) = apply_items(Extension(state.clone()), Query(ApplyParams::default()), DOC.into())
        .await
        .map_err(|(status, msg)| anyhow::anyhow!("apply failed with {}: {}", status, msg))?;
    assert_eq!(status, StatusCode::OK, "expected 200 from apply got {}", status);
    assert!(body.contains("transactions: 1"), "expected a single transaction got {}", body);

    let (status, headers, body) = list_items(Extension(state.clone()))
        .await
        .map_err(|(status, msg)| anyhow::anyhow!("list failed with {}: {}", status, msg))?;
    assert_eq!(status, StatusCode::OK, "expected 200 from list got {}", status);
    let revision = headers.get(HEADER_REVISION).context("expected revision header")?.to_str()?;
    assert_eq!(revision, "1", "expected listing at revision 1 got {}", revision);
    let decls = shardkeeper_core::models::parse_decls(&body)?;
    let ids: Vec<&str> = decls.iter().map(|decl| decl.spec.id.as_str()).collect();
    assert_eq!(ids, vec!["bar", "foo"], "expected listed ids in key order got {:?}", ids);
    assert!(decls.iter().all(|decl| decl.revision == 1), "expected all items at revision 1 got {:?}", decls);

    Ok(())
}

#[tokio::test]
async fn apply_maps_errors_to_status_codes() -> Result<()> {
    let (state, _tmpdir) = server_state().await?;
    apply_items(Extension(state.clone()), Query(ApplyParams::default()), DOC.into())
        .await
        .map_err(|(status, msg)| anyhow::anyhow!("apply failed with {}: {}", status, msg))?;

    let cases = vec![
        ("re-create of existing items", DOC, StatusCode::CONFLICT),
        ("malformed document", "- id: [unterminated", StatusCode::BAD_REQUEST),
        ("negative replication", "- id: baz\n  replication: -2\n", StatusCode::BAD_REQUEST),
        ("missing reference", "- id: baz\n  references: [journal-a]\n", StatusCode::BAD_REQUEST),
    ];
    for (name, doc, expected) in cases {
        let res = apply_items(Extension(state.clone()), Query(ApplyParams::default()), doc.into()).await;
        match res {
            Err((status, _)) => assert_eq!(status, expected, "case {}: expected {} got {}", name, expected, status),
            Ok((status, _, body)) => panic!("case {}: expected failure got {} {}", name, status, body),
        }
    }

    Ok(())
}

#[tokio::test]
async fn create_item_maps_readiness_outcomes() -> Result<()> {
    let (state, _tmpdir) = server_state().await?;

    let params = CreateParams {
        replicas: 0,
        timeout_ms: Some(50),
    };
    let (status, _, body) = create_item(Extension(state.clone()), Path("empty".into()), Query(params.clone()))
        .await
        .map_err(|(status, msg)| anyhow::anyhow!("create failed with {}: {}", status, msg))?;
    assert_eq!(status, StatusCode::CREATED, "expected 201 got {} {}", status, body);

    let res = create_item(Extension(state.clone()), Path("empty".into()), Query(params)).await;
    let status = res.as_ref().err().map(|(status, _)| *status);
    assert_eq!(status, Some(StatusCode::CONFLICT), "expected conflict on re-create got {:?}", res);

    // Without members no replica can become ready.
    let params = CreateParams {
        replicas: 1,
        timeout_ms: Some(50),
    };
    let res = create_item(Extension(state.clone()), Path("single".into()), Query(params)).await;
    let status = res.as_ref().err().map(|(status, _)| *status);
    assert_eq!(status, Some(StatusCode::GATEWAY_TIMEOUT), "expected readiness timeout got {:?}", res);
    let tree = fixtures::snapshot(state.store.as_ref(), &state.config.layout).await?;
    assert!(tree.get(&state.config.layout.item_key("single")).is_some(), "expected item to remain after a timeout");

    Ok(())
}
