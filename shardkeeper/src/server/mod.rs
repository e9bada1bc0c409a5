//! The client-facing HTTP server.

mod prom;
#[cfg(test)]
mod mod_test;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::extract::{Extension, Path, Query};
use axum::http::{header::HeaderName, HeaderMap, HeaderValue, StatusCode};
use axum::routing::{get, post, Router};
use axum::{handler::Handler, AddExtensionLayer};
use futures::prelude::*;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use shardkeeper_core::models::{encode_decls, parse_decls};

use crate::apply::{self, Applied, ApplyOptions, ValidatorRef};
use crate::config::Config;
use crate::error::{AppError, AppErrorExt};
use crate::readiness;
use crate::sink::SinkRef;
use crate::store::{Revision, StoreRef};

pub use prom::install_recorder;

pub(crate) const HEADER_REVISION: &str = "x-shardkeeper-revision";

/// A result type used by request handlers.
type HttpResult<T> = std::result::Result<T, (StatusCode, String)>;

/// Shared state of request handlers.
pub(crate) struct ServerState {
    pub config: Arc<Config>,
    pub store: StoreRef,
    pub validator: ValidatorRef,
    pub sink: SinkRef,
}

/// The HTTP server.
pub struct HttpServer {
    state: Arc<ServerState>,
    metrics: PrometheusHandle,
    /// A channel used for triggering graceful shutdown.
    shutdown: broadcast::Receiver<()>,
}

impl HttpServer {
    /// Construct a new instance.
    pub fn new(
        config: Arc<Config>, store: StoreRef, validator: ValidatorRef, sink: SinkRef, metrics: PrometheusHandle, shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            state: Arc::new(ServerState {
                config,
                store,
                validator,
                sink,
            }),
            metrics,
            shutdown,
        }
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        let port = self.state.config.http_port;
        let router = Router::new()
            .route("/health", get(|| async { StatusCode::OK }))
            .route("/metrics", get(prom::prometheus_scrape.layer(AddExtensionLayer::new(self.metrics))))
            .route("/v1/items", get(list_items))
            .route("/v1/items/:name", post(create_item))
            .route("/v1/apply", post(apply_items))
            .layer(AddExtensionLayer::new(self.state));

        let mut shutdown = self.shutdown;
        let server = axum::Server::bind(&([0, 0, 0, 0], port).into())
            .serve(router.into_make_service())
            .with_graceful_shutdown(async move {
                let _res = shutdown.recv().await;
            });
        tracing::info!("http server is listening at 0.0.0.0:{}", port);
        tokio::spawn(server.map_err(anyhow::Error::from))
    }
}

/// Query parameters of an apply request.
#[derive(Clone, Debug, Default, Deserialize)]
pub(crate) struct ApplyParams {
    #[serde(default)]
    pub dry_run: bool,
    pub max_txn_size: Option<usize>,
}

/// Query parameters of an item creation request.
#[derive(Clone, Debug, Deserialize)]
pub(crate) struct CreateParams {
    pub replicas: i32,
    pub timeout_ms: Option<u64>,
}

/// The response body of a successful item creation.
#[derive(Clone, Debug, Serialize)]
struct Created {
    id: String,
    revision: Revision,
}

/// List all items as a YAML apply document.
pub(crate) async fn list_items(Extension(state): Extension<Arc<ServerState>>) -> HttpResult<(StatusCode, HeaderMap, String)> {
    let (decls, revision) = apply::list_items(state.store.as_ref(), &state.config.layout).await.map_err(AppError::http)?;
    let body = encode_decls(&decls).map_err(AppError::http)?;
    let mut headers = yaml_headers();
    headers.insert(HeaderName::from_static(HEADER_REVISION), HeaderValue::from(revision));
    Ok((StatusCode::OK, headers, body))
}

/// Apply a YAML document of item declarations.
pub(crate) async fn apply_items(
    Extension(state): Extension<Arc<ServerState>>, Query(params): Query<ApplyParams>, body: String,
) -> HttpResult<(StatusCode, HeaderMap, String)> {
    let decls = parse_decls(&body).map_err(AppError::into_status)?;
    let opts = ApplyOptions {
        dry_run: params.dry_run,
        max_txn_size: params.max_txn_size.unwrap_or(state.config.max_txn_size),
    };
    let applied = apply::apply(
        state.store.as_ref(),
        &state.config.layout,
        state.validator.as_ref(),
        state.sink.as_ref(),
        decls,
        opts,
    )
    .await
    .map_err(AppError::http)?;
    match applied {
        Applied::DryRun(request) => yaml(StatusCode::OK, &request),
        Applied::Committed(outcome) => yaml(StatusCode::OK, &outcome),
    }
}

/// Create an item & wait for its replicas to become ready.
pub(crate) async fn create_item(
    Extension(state): Extension<Arc<ServerState>>, Path(name): Path<String>, Query(params): Query<CreateParams>,
) -> HttpResult<(StatusCode, HeaderMap, String)> {
    let timeout = params.timeout_ms.map(Duration::from_millis).unwrap_or_else(|| state.config.readiness_timeout());
    let revision = readiness::create_and_wait(state.store.as_ref(), &state.config.layout, &name, params.replicas, timeout)
        .await
        .map_err(AppError::http)?;
    yaml(StatusCode::CREATED, &Created { id: name, revision })
}

fn yaml<T: Serialize>(status: StatusCode, value: &T) -> HttpResult<(StatusCode, HeaderMap, String)> {
    let body = serde_yaml::to_string(value).map_err(|err| AppError::http(err.into()))?;
    Ok((status, yaml_headers(), body))
}

fn yaml_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(HeaderName::from_static("content-type"), HeaderValue::from_static("application/yaml"));
    headers
}
