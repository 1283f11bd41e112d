//! Liveness and metrics endpoint for the hub process

use crate::agent::Agent;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, IntCounter, IntGauge, Opts, Registry, TextEncoder};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub const HEALTHZ_PATH: &str = "/healthz";
pub const METRICS_PATH: &str = "/metrics";

/// Per-process series, every one labelled with the hub's stable id
struct HubMetrics {
    registry: Registry,
    syncs: IntCounter,
    sync_failures: IntCounter,
    tls_updates: IntCounter,
    tls_version: IntGauge,
    registered: IntGauge,
    active_flows: IntGauge,
    scrape: Mutex<()>,
}

impl HubMetrics {
    fn new(hub: &str) -> prometheus::Result<Self> {
        let registry = Registry::new();
        let opts = |name: &str, help: &str| Opts::new(name, help).const_label("hub", hub);
        let counter = |name: &str, help: &str| -> prometheus::Result<IntCounter> {
            let metric = IntCounter::with_opts(opts(name, help))?;
            registry.register(Box::new(metric.clone()))?;
            Ok(metric)
        };
        let gauge = |name: &str, help: &str| -> prometheus::Result<IntGauge> {
            let metric = IntGauge::with_opts(opts(name, help))?;
            registry.register(Box::new(metric.clone()))?;
            Ok(metric)
        };

        Ok(Self {
            syncs: counter("meridian_hub_syncs_total", "Successful configuration syncs")?,
            sync_failures: counter(
                "meridian_hub_sync_failures_total",
                "Failed configuration syncs",
            )?,
            tls_updates: counter(
                "meridian_hub_tls_updates_total",
                "TLS material installations",
            )?,
            tls_version: gauge(
                "meridian_hub_tls_version",
                "Version of the served TLS material",
            )?,
            registered: gauge("meridian_hub_registered", "Whether the hub is registered")?,
            active_flows: gauge(
                "meridian_hub_active_flows",
                "Flows awaiting the next report",
            )?,
            registry,
            scrape: Mutex::new(()),
        })
    }

    fn render(&self, agent: &Agent) -> prometheus::Result<String> {
        let _scrape = self.scrape.lock().unwrap_or_else(PoisonError::into_inner);
        let stats = agent.stats();
        advance(&self.syncs, stats.syncs);
        advance(&self.sync_failures, stats.sync_failures);
        advance(&self.tls_updates, stats.tls_updates);
        self.tls_version.set(stats.tls_version);
        self.registered.set(i64::from(stats.registered));
        self.active_flows
            .set(i64::try_from(agent.flows().len()).unwrap_or(i64::MAX));

        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// Move a counter up to a monotonic total kept by the agent
fn advance(counter: &IntCounter, total: u64) {
    let current = counter.get();
    if total > current {
        counter.inc_by(total - current);
    }
}

struct HealthzState {
    agent: Arc<Agent>,
    metrics: HubMetrics,
}

pub fn healthz_router(agent: Arc<Agent>) -> prometheus::Result<Router> {
    let metrics = HubMetrics::new(&agent.stable_id().to_string())?;
    Ok(Router::new()
        .route(HEALTHZ_PATH, get(|| async { StatusCode::OK }))
        .route(METRICS_PATH, get(metrics_handler))
        .with_state(Arc::new(HealthzState { agent, metrics })))
}

pub async fn serve_healthz(
    listener: TcpListener,
    agent: Arc<Agent>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let router = healthz_router(agent).map_err(std::io::Error::other)?;
    info!(addr = %listener.local_addr()?, "Healthz server listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
}

async fn metrics_handler(State(state): State<Arc<HealthzState>>) -> Response {
    match state.metrics.render(&state.agent) {
        Ok(text) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(e) => {
            warn!(error = %e, "Failed to render metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
