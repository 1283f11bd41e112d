//! Coordinator metrics on a prometheus registry
//!
//! RPC calls are counted as they complete. Everything else mirrors state
//! owned elsewhere (hub table, flow totals, certificate and job stats) and
//! is copied into the registry under the scrape lock just before encoding.

use crate::flows::FlowTotals;
use chrono::{DateTime, Utc};
use meridian_cert::CertStatsSnapshot;
use meridian_jobs::WorkerStatsSnapshot;
use meridian_proto::{Code, StableId};
use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("failed to register metric: {0}")]
    Registration(#[from] prometheus::Error),

    #[error("failed to encode metrics: {0}")]
    Encoding(String),
}

pub type MetricsResult<T> = Result<T, MetricsError>;

pub struct ControlMetrics {
    registry: Registry,
    rpc_calls: IntCounterVec,
    hubs_registered: IntGauge,
    hubs_connected: IntGauge,
    flow_reports: IntCounterVec,
    flow_transmitted_bytes: IntCounterVec,
    flow_received_bytes: IntCounterVec,
    flow_transmitted_messages: IntCounterVec,
    flow_received_messages: IntCounterVec,
    flow_last_report: IntGaugeVec,
    tls_version: IntGaugeVec,
    tls_not_after: IntGaugeVec,
    cert_issued: IntCounter,
    cert_failures: IntCounter,
    cert_contended: IntCounter,
    jobs_succeeded: IntCounter,
    jobs_failed: IntCounter,
    jobs_dead_lettered: IntCounter,
    jobs_lost_claims: IntCounter,
    scrape: Mutex<()>,
}

fn counter(registry: &Registry, name: &str, help: &str) -> MetricsResult<IntCounter> {
    let metric = IntCounter::with_opts(Opts::new(name, help))?;
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

fn counter_vec(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> MetricsResult<IntCounterVec> {
    let metric = IntCounterVec::new(Opts::new(name, help), labels)?;
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> MetricsResult<IntGauge> {
    let metric = IntGauge::with_opts(Opts::new(name, help))?;
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

fn gauge_vec(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> MetricsResult<IntGaugeVec> {
    let metric = IntGaugeVec::new(Opts::new(name, help), labels)?;
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

/// Move a counter up to a monotonic total kept elsewhere
fn advance(counter: &IntCounter, total: u64) {
    let current = counter.get();
    if total > current {
        counter.inc_by(total - current);
    }
}

fn clamp(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

impl ControlMetrics {
    pub fn new() -> MetricsResult<Self> {
        let registry = Registry::new();
        let per_hub = &["hub_id"];

        Ok(Self {
            rpc_calls: counter_vec(
                &registry,
                "meridian_rpc_calls_total",
                "Completed RPC calls",
                &["method", "code"],
            )?,
            hubs_registered: gauge(
                &registry,
                "meridian_hubs_registered",
                "Hubs known to the coordinator",
            )?,
            hubs_connected: gauge(
                &registry,
                "meridian_hubs_connected",
                "Hubs currently connected",
            )?,
            flow_reports: counter_vec(
                &registry,
                "meridian_flow_reports_total",
                "Flow reports received per hub",
                per_hub,
            )?,
            flow_transmitted_bytes: counter_vec(
                &registry,
                "meridian_flow_transmitted_bytes_total",
                "Bytes sent to clients per hub",
                per_hub,
            )?,
            flow_received_bytes: counter_vec(
                &registry,
                "meridian_flow_received_bytes_total",
                "Bytes received from clients per hub",
                per_hub,
            )?,
            flow_transmitted_messages: counter_vec(
                &registry,
                "meridian_flow_transmitted_messages_total",
                "Messages sent to clients per hub",
                per_hub,
            )?,
            flow_received_messages: counter_vec(
                &registry,
                "meridian_flow_received_messages_total",
                "Messages received from clients per hub",
                per_hub,
            )?,
            flow_last_report: gauge_vec(
                &registry,
                "meridian_flow_last_report_timestamp_seconds",
                "Time of the latest flow report per hub",
                per_hub,
            )?,
            tls_version: gauge_vec(
                &registry,
                "meridian_tls_version",
                "Version of the served certificate",
                &["domain"],
            )?,
            tls_not_after: gauge_vec(
                &registry,
                "meridian_tls_not_after_seconds",
                "Expiry of the served certificate",
                &["domain"],
            )?,
            cert_issued: counter(&registry, "meridian_cert_issued_total", "Certificates issued")?,
            cert_failures: counter(
                &registry,
                "meridian_cert_failures_total",
                "Failed issuance attempts",
            )?,
            cert_contended: counter(
                &registry,
                "meridian_cert_contended_total",
                "Renewals left to another replica",
            )?,
            jobs_succeeded: counter(&registry, "meridian_jobs_succeeded_total", "Jobs completed")?,
            jobs_failed: counter(
                &registry,
                "meridian_jobs_failed_total",
                "Job attempts that failed",
            )?,
            jobs_dead_lettered: counter(
                &registry,
                "meridian_jobs_dead_lettered_total",
                "Jobs moved to the dead-letter state",
            )?,
            jobs_lost_claims: counter(
                &registry,
                "meridian_jobs_lost_claims_total",
                "Job claims taken over after lease expiry",
            )?,
            registry,
            scrape: Mutex::new(()),
        })
    }

    pub fn record_rpc(&self, method: &str, code: Code) {
        let code = code.to_string();
        self.rpc_calls
            .with_label_values(&[method, code.as_str()])
            .inc();
    }

    pub fn rpc_count(&self, method: &str, code: Code) -> u64 {
        let code = code.to_string();
        self.rpc_calls
            .with_label_values(&[method, code.as_str()])
            .get()
    }

    pub fn set_hubs(&self, registered: u64, connected: u64) {
        self.hubs_registered.set(clamp(registered));
        self.hubs_connected.set(clamp(connected));
    }

    /// Replace the per-hub flow series; hubs that were forgotten disappear
    pub fn set_flows(&self, hubs: &[(StableId, FlowTotals, Option<DateTime<Utc>>)]) {
        let families = [
            &self.flow_reports,
            &self.flow_transmitted_bytes,
            &self.flow_received_bytes,
            &self.flow_transmitted_messages,
            &self.flow_received_messages,
        ];
        for family in families {
            family.reset();
        }
        self.flow_last_report.reset();

        for (hub_id, totals, reported_at) in hubs {
            let hub = hub_id.to_string();
            let labels = [hub.as_str()];
            self.flow_reports
                .with_label_values(&labels)
                .inc_by(totals.reports);
            self.flow_transmitted_bytes
                .with_label_values(&labels)
                .inc_by(totals.transmitted_bytes);
            self.flow_received_bytes
                .with_label_values(&labels)
                .inc_by(totals.received_bytes);
            self.flow_transmitted_messages
                .with_label_values(&labels)
                .inc_by(totals.transmitted_messages);
            self.flow_received_messages
                .with_label_values(&labels)
                .inc_by(totals.received_messages);
            if let Some(at) = reported_at {
                self.flow_last_report
                    .with_label_values(&labels)
                    .set(at.timestamp());
            }
        }
    }

    pub fn set_tls(&self, domain: &str, version: i64, not_after: DateTime<Utc>) {
        self.tls_version.reset();
        self.tls_not_after.reset();
        self.tls_version.with_label_values(&[domain]).set(version);
        self.tls_not_after
            .with_label_values(&[domain])
            .set(not_after.timestamp());
    }

    pub fn set_cert_stats(&self, stats: &CertStatsSnapshot) {
        advance(&self.cert_issued, stats.issued);
        advance(&self.cert_failures, stats.failures);
        advance(&self.cert_contended, stats.contended);
    }

    pub fn set_worker_stats(&self, stats: &WorkerStatsSnapshot) {
        advance(&self.jobs_succeeded, stats.succeeded);
        advance(&self.jobs_failed, stats.failed);
        advance(&self.jobs_dead_lettered, stats.dead_lettered);
        advance(&self.jobs_lost_claims, stats.lost_claims);
    }

    /// Fill scrape-time series with `populate`, then encode the registry.
    ///
    /// Concurrent scrapes are serialized so one never encodes a half-reset
    /// family from another.
    pub fn render(&self, populate: impl FnOnce(&Self)) -> MetricsResult<String> {
        let _scrape = self.scrape.lock().unwrap_or_else(PoisonError::into_inner);
        populate(self);

        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| MetricsError::Encoding(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| MetricsError::Encoding(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rpc_counts() {
        let metrics = ControlMetrics::new().unwrap();
        metrics.record_rpc("/a/B", Code::Ok);
        metrics.record_rpc("/a/B", Code::Ok);
        metrics.record_rpc("/a/B", Code::Unauthenticated);
        assert_eq!(metrics.rpc_count("/a/B", Code::Ok), 2);
        assert_eq!(metrics.rpc_count("/a/B", Code::Unauthenticated), 1);
    }

    #[test]
    fn test_snapshot_counters_follow_totals() {
        let metrics = ControlMetrics::new().unwrap();
        let stats = WorkerStatsSnapshot {
            succeeded: 3,
            ..Default::default()
        };
        metrics.render(|m| m.set_worker_stats(&stats)).unwrap();
        let text = metrics.render(|m| m.set_worker_stats(&stats)).unwrap();
        assert!(text.contains("meridian_jobs_succeeded_total 3\n"));
        assert!(text.contains("# TYPE meridian_jobs_succeeded_total counter"));
    }

    #[test]
    fn test_forgotten_hub_leaves_flow_series() {
        let metrics = ControlMetrics::new().unwrap();
        let hub = StableId::from_u128(9);
        let totals = FlowTotals {
            reports: 1,
            transmitted_bytes: 10,
            ..Default::default()
        };

        let text = metrics
            .render(|m| m.set_flows(&[(hub, totals, Some(Utc::now()))]))
            .unwrap();
        assert!(text.contains(&format!(
            "meridian_flow_transmitted_bytes_total{{hub_id=\"{}\"}} 10",
            hub
        )));
        assert!(text.contains("meridian_flow_last_report_timestamp_seconds"));

        let text = metrics.render(|m| m.set_flows(&[])).unwrap();
        assert!(!text.contains(&hub.to_string()));
    }
}
