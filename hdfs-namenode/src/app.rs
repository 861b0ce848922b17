use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, SignalStream};
use tokio_stream::StreamMap;

use crate::config::Config;
use crate::database::Database;
use crate::facts::FactStore;
use crate::gateway::Gateway;
use crate::orchestrator::{HaCtl, Orchestrator};
use crate::server::spawn_server;

/// The capacity of the queue of inbound unit events.
const EVENTS_CAPACITY: usize = 100;

/// The application object of the namenode agent.
pub struct App {
    /// The application's runtime config.
    _config: Arc<Config>,
    /// The application's database system.
    _db: Database,

    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// The join handle of the HA controller.
    ha_handle: JoinHandle<Result<()>>,
    /// The join handle of the HTTP server.
    http_server: JoinHandle<Result<()>>,
}

impl App {
    /// Create a new instance.
    pub async fn new(config: Arc<Config>, shutdown_tx: broadcast::Sender<()>) -> Result<Self> {
        // Initialize this unit's storage.
        let db = Database::new(config.clone()).await.context("error opening database")?;
        let facts = FactStore::new(&db).await.context("error opening fact store")?;

        // Spawn the HA controller, fed by the HTTP server.
        let (events_tx, events_rx) = mpsc::channel(EVENTS_CAPACITY);
        let gateway = Gateway::new(config.clone());
        let orchestrator = Orchestrator::new(config.clone(), facts, gateway).context("error building orchestrator")?;
        let ha_handle = HaCtl::new(orchestrator, events_rx, Duration::from_secs(config.tick_seconds), shutdown_tx.clone()).spawn();

        let http_server = spawn_server(&config, events_tx, &shutdown_tx);

        Ok(Self {
            _config: config,
            _db: db,
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            shutdown_tx,
            ha_handle,
            http_server,
        })
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let mut signals = StreamMap::new();
        signals.insert("sigterm", SignalStream::new(signal(SignalKind::terminate()).context("error building signal stream")?));
        signals.insert("sigint", SignalStream::new(signal(SignalKind::interrupt()).context("error building signal stream")?));

        loop {
            tokio::select! {
                Some((_, sig)) = signals.next() => {
                    tracing::debug!(signal = ?sig, "signal received, beginning graceful shutdown");
                    let _ = self.shutdown_tx.send(());
                    break;
                }
                _ = self.shutdown_rx.next() => break,
            }
        }

        // Begin shutdown routine.
        tracing::debug!("namenode agent is shutting down");
        if let Err(err) = self.ha_handle.await.context("error joining ha controller handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down ha controller");
        }
        if let Err(err) = self.http_server.await.context("error joining http server handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down http server");
        }

        tracing::debug!("namenode agent shutdown complete");
        Ok(())
    }
}
