//! The shardkeeper allocation daemon.

mod allocator;
mod app;
mod apply;
mod config;
mod coordination;
mod error;
#[cfg(test)]
mod fixtures;
mod member;
#[cfg(test)]
mod member_test;
mod readiness;
#[cfg(test)]
mod readiness_test;
mod server;
mod sink;
mod store;
mod tree;
mod utils;
#[cfg(test)]
mod utils_test;
mod watchers;

use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::prelude::*;

use crate::app::App;
use crate::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // Setup tracing/logging system.
    tracing_subscriber::registry()
        // Filter spans based on the RUST_LOG env var.
        .with(tracing_subscriber::EnvFilter::from_default_env())
        // Send a copy of all spans to stdout in compact form.
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_ansi(true)
        )
        // Install this registry as the global tracing registry.
        .try_init()
        .context("error initializing logging/tracing system")?;

    let cfg = Arc::new(Config::new()?);
    let metrics = server::install_recorder(&cfg)?;

    tracing::info!(
        http_port = %cfg.http_port,
        pod_name = %cfg.pod_name,
        zone = %cfg.zone,
        keyspace_root = %cfg.layout.root(),
        storage_data_path = %cfg.storage_data_path,
        "starting shardkeeper",
    );
    let res = match App::new(cfg, metrics).await {
        Ok(app) => app.spawn().await.context("error joining app task").and_then(|res| res),
        Err(err) => Err(err),
    };
    if let Err(err) = res {
        tracing::error!(error = ?err);
    }

    // Ensure any pending output is flushed.
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();

    Ok(())
}
