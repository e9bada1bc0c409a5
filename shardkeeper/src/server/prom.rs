use anyhow::{Context, Result};
use axum::extract::Extension;
use axum::http::{header::HeaderName, HeaderMap, HeaderValue, StatusCode};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::config::Config;

/// Install the Prometheus recorder as the global metrics recorder, returning a handle for
/// rendering scrapes.
pub fn install_recorder(config: &Config) -> Result<PrometheusHandle> {
    let recorder = PrometheusBuilder::new()
        .add_global_label("pod", config.pod_name.clone())
        .add_global_label("zone", config.zone.clone())
        .build();
    let handle = recorder.handle();
    metrics::set_boxed_recorder(Box::new(recorder)).context("error setting prometheus metrics recorder")?;
    Ok(handle)
}

/// Handle Prometheus metrics scraping.
pub(super) async fn prometheus_scrape(Extension(state): Extension<PrometheusHandle>) -> (StatusCode, HeaderMap, String) {
    let mut headers = HeaderMap::new();
    headers.insert(HeaderName::from_static("content-type"), HeaderValue::from_static("text/plain; version=0.0.4"));
    (StatusCode::OK, headers, state.render())
}
