//! The agent's HTTP server.
//!
//! The hook shim forwards every hook invocation as a single JSON event to `POST /events`.
//! Events are queued for the HA controller, which evaluates them one at a time. Events carry
//! leader broadcasts, so the ingress only listens on the loopback interface.

mod prom;

use anyhow::Result;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{extract, AddExtensionLayer, Router};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::get_metrics_recorder;
use crate::orchestrator::UnitEvent;

/// The address of the event ingress, which only the local hook shim may reach.
const INGRESS_ADDR: [u8; 4] = [127, 0, 0, 1];
/// The address of the metrics endpoint.
const METRICS_ADDR: [u8; 4] = [0, 0, 0, 0];

/// Spawn the HTTP servers: event ingress & healthchecks on the loopback interface, metrics &
/// healthchecks on all interfaces.
pub fn spawn_server(config: &Config, events_tx: mpsc::Sender<UnitEvent>, shutdown_tx: &broadcast::Sender<()>) -> JoinHandle<Result<()>> {
    let ingress = Router::new()
        .route("/health", get(|| async { StatusCode::OK }))
        .route("/events", post(ingest_event))
        .layer(AddExtensionLayer::new(events_tx));
    let mut ingress_shutdown = shutdown_tx.subscribe();
    let ingress = axum::Server::bind(&(INGRESS_ADDR, config.http_port).into())
        .serve(ingress.into_make_service())
        .with_graceful_shutdown(async move {
            let _res = ingress_shutdown.recv().await;
        });

    let state = get_metrics_recorder(config).handle();
    let metrics = Router::new()
        .route("/health", get(|| async { StatusCode::OK }))
        .route("/metrics", get(prom::prometheus_scrape))
        .layer(AddExtensionLayer::new(state));
    let mut metrics_shutdown = shutdown_tx.subscribe();
    let metrics = axum::Server::bind(&(METRICS_ADDR, config.metrics_port).into())
        .serve(metrics.into_make_service())
        .with_graceful_shutdown(async move {
            let _res = metrics_shutdown.recv().await;
        });

    tracing::info!("event ingress is listening at 127.0.0.1:{}", config.http_port);
    tracing::info!("metrics server is listening at 0.0.0.0:{}", config.metrics_port);
    tokio::spawn(async move {
        futures::future::try_join(ingress, metrics).await?;
        Ok(())
    })
}

/// Queue the given event for evaluation.
///
/// The queue is bounded; a full queue is answered with `503` so the shim retries the hook.
async fn ingest_event(
    extract::Extension(events_tx): extract::Extension<mpsc::Sender<UnitEvent>>, payload: extract::Json<UnitEvent>,
) -> StatusCode {
    let event = payload.0;
    tracing::debug!(?event, "received unit event");
    match events_tx.try_send(event) {
        Ok(()) => StatusCode::ACCEPTED,
        Err(mpsc::error::TrySendError::Full(_)) => {
            tracing::warn!("event queue is full, rejecting event");
            StatusCode::SERVICE_UNAVAILABLE
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            tracing::error!("event queue is closed, the ha controller is gone");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}
