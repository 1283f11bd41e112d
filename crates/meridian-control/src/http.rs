//! Plain HTTP surface: liveness, metrics and the discovery document

use crate::metrics::MetricsResult;
use crate::server::ControlState;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use meridian_proto::{DiscoveryDocument, DISCOVERY_PATH};
use std::sync::Arc;
use tracing::warn;

pub const HEALTHZ_PATH: &str = "/healthz";
pub const METRICS_PATH: &str = "/metrics";
pub const METRICS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

pub fn http_router(state: Arc<ControlState>) -> Router {
    Router::new()
        .route(HEALTHZ_PATH, get(healthz))
        .route(METRICS_PATH, get(metrics))
        .route(DISCOVERY_PATH, get(discovery))
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn discovery(State(state): State<Arc<ControlState>>) -> Response {
    if let Some(doc) = &state.static_discovery {
        return Json(doc.clone()).into_response();
    }
    match state.service.hubs().list().await {
        Ok(hubs) => Json(DiscoveryDocument::from_hubs(&hubs)).into_response(),
        Err(e) => {
            warn!(error = %e, "Failed to list hubs for discovery");
            StatusCode::SERVICE_UNAVAILABLE.into_response()
        }
    }
}

async fn metrics(State(state): State<Arc<ControlState>>) -> Response {
    match render_metrics(&state).await {
        Ok(body) => ([(header::CONTENT_TYPE, METRICS_CONTENT_TYPE)], body).into_response(),
        Err(e) => {
            warn!(error = %e, "Failed to render metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Prometheus text exposition of the coordinator's registry
pub async fn render_metrics(state: &ControlState) -> MetricsResult<String> {
    let hubs = match (
        state.service.hubs().count().await,
        state.service.hubs().connected_count().await,
    ) {
        (Ok(registered), Ok(connected)) => Some((registered, connected)),
        (Err(e), _) | (_, Err(e)) => {
            warn!(error = %e, "Failed to count hubs for metrics");
            None
        }
    };

    let aggregator = state.service.flows();
    let flows: Vec<_> = aggregator
        .all_totals()
        .into_iter()
        .map(|(hub_id, totals)| (hub_id, totals, aggregator.last_report(hub_id)))
        .collect();
    let tls = state.service.tls().current();
    let cert_stats = state.cert_stats.as_ref().map(|s| s.snapshot());
    let worker_stats = state.worker_stats.as_ref().map(|s| s.snapshot());

    state.metrics.render(|metrics| {
        if let Some((registered, connected)) = hubs {
            metrics.set_hubs(registered, connected);
        }
        metrics.set_flows(&flows);
        if let Some(material) = &tls {
            metrics.set_tls(&material.domain, material.source_version, material.not_after);
        }
        if let Some(stats) = &cert_stats {
            metrics.set_cert_stats(stats);
        }
        if let Some(stats) = &worker_stats {
            metrics.set_worker_stats(stats);
        }
    })
}
