use std::sync::Arc;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, SignalStream};
use tokio_stream::StreamMap;
use uuid::Uuid;

use crate::allocator::{Allocator, AnyMember};
use crate::apply::RegisteredResources;
use crate::config::Config;
use crate::coordination::{LeaderElectionConfig, LeaderElector};
use crate::member::MemberAgent;
use crate::server::HttpServer;
use crate::sink::{PrometheusSink, SinkRef};
use crate::store::{SledStore, StoreRef};
use crate::watchers::KeySpaceWatcher;

/// The application object for when shardkeeper is running as a server.
pub struct App {
    /// The application's runtime config.
    _config: Arc<Config>,

    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// The join handle of the store's lease reaper.
    reaper: JoinHandle<Result<()>>,
    /// The join handle of the keyspace watcher.
    watcher: JoinHandle<Result<()>>,
    /// The join handle of the leader elector.
    elector: JoinHandle<()>,
    /// The join handle of the allocator.
    allocator: JoinHandle<Result<()>>,
    /// The join handle of the member agent, if this node is a member.
    member: Option<JoinHandle<Result<()>>>,
    /// The join handle of the HTTP server.
    server: JoinHandle<Result<()>>,
}

impl App {
    /// Create a new instance.
    pub async fn new(config: Arc<Config>, metrics: PrometheusHandle) -> Result<Self> {
        // App shutdown channel.
        let (shutdown_tx, shutdown_rx) = broadcast::channel(10);

        // Initialize this node's storage.
        let db = SledStore::new(config.clone()).await.context("error opening store")?;
        let reaper = db.spawn_lease_reaper(shutdown_tx.subscribe());
        let store: StoreRef = Arc::new(db);
        let sink: SinkRef = Arc::new(PrometheusSink::new());

        // Spawn various core tasks.
        let (watcher, trees) = KeySpaceWatcher::new(store.clone(), config.layout.clone(), sink.clone(), shutdown_tx.subscribe());
        let watcher = watcher.spawn();

        let election_config = LeaderElectionConfig::new(
            config.layout.leader_key(),
            format!("{}-{}", config.pod_name, Uuid::new_v4()),
            config.lease_duration(),
            config.lease_duration().mul_f64(2.0 / 3.0),
            config.lease_renew(),
        )
        .context("error building leader election config")?;
        let (elector, leader_rx) = LeaderElector::new(store.clone(), election_config, sink.clone(), shutdown_tx.subscribe());
        let elector = elector.spawn();

        let allocator = Allocator::new(store.clone(), Arc::new(AnyMember), sink.clone(), trees.clone(), leader_rx, shutdown_tx.subscribe()).spawn();

        let member = if config.member_enabled {
            Some(MemberAgent::new(config.clone(), store.clone(), trees, shutdown_tx.subscribe()).spawn())
        } else {
            None
        };

        let validator = Arc::new(RegisteredResources::new(store.clone(), config.layout.clone()));
        let server = HttpServer::new(config.clone(), store, validator, sink, metrics, shutdown_tx.subscribe()).spawn();

        Ok(Self {
            _config: config,
            shutdown_rx: BroadcastStream::new(shutdown_rx),
            shutdown_tx,
            reaper,
            watcher,
            elector,
            allocator,
            member,
            server,
        })
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let mut signals = StreamMap::new();
        signals.insert("sigterm", SignalStream::new(signal(SignalKind::terminate()).context("error building signal stream")?));
        signals.insert("sigint", SignalStream::new(signal(SignalKind::interrupt()).context("error building signal stream")?));

        let mut server_res = None;
        loop {
            tokio::select! {
                Some((_, sig)) = signals.next() => {
                    tracing::debug!(signal = ?sig, "signal received, beginning graceful shutdown");
                    let _ = self.shutdown_tx.send(());
                    break;
                }
                res = &mut self.server => {
                    tracing::error!("http server stopped unexpectedly, beginning shutdown");
                    let _ = self.shutdown_tx.send(());
                    server_res = Some(res);
                    break;
                }
                _ = self.shutdown_rx.next() => break,
            }
        }

        // Begin shutdown routine.
        tracing::debug!("shardkeeper is shutting down");
        let server_res = match server_res {
            Some(res) => res,
            None => self.server.await,
        };
        if let Err(err) = server_res.context("error joining http server handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down http server");
        }
        if let Some(member) = self.member {
            if let Err(err) = member.await.context("error joining member agent handle").and_then(|res| res) {
                tracing::error!(error = ?err, "error shutting down member agent");
            }
        }
        if let Err(err) = self.allocator.await.context("error joining allocator handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down allocator");
        }
        if let Err(err) = self.elector.await {
            tracing::error!(error = ?err, "error joining leader elector task");
        }
        if let Err(err) = self.watcher.await.context("error joining keyspace watcher handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down keyspace watcher");
        }
        if let Err(err) = self.reaper.await.context("error joining lease reaper handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down lease reaper");
        }

        tracing::debug!("shardkeeper shutdown complete");
        Ok(())
    }
}
