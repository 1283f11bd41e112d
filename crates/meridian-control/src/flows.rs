//! Flow report aggregation
//!
//! Hubs periodically report per-flow counters accumulated since their
//! previous report. Each replica keeps running totals per hub and the time
//! of the latest report; nothing here is persisted.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use meridian_proto::{FlowRecord, FlowTopReport, StableId};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlowTotals {
    pub reports: u64,
    pub flows: u64,
    pub transmitted_bytes: u64,
    pub received_bytes: u64,
    pub transmitted_messages: u64,
    pub received_messages: u64,
}

impl FlowTotals {
    fn add(&mut self, record: &FlowRecord) {
        self.flows += 1;
        self.transmitted_bytes = self.transmitted_bytes.saturating_add(record.transmitted_bytes);
        self.received_bytes = self.received_bytes.saturating_add(record.received_bytes);
        self.transmitted_messages = self
            .transmitted_messages
            .saturating_add(record.transmitted_messages);
        self.received_messages = self.received_messages.saturating_add(record.received_messages);
    }
}

#[derive(Debug, Clone, Copy)]
struct HubFlows {
    totals: FlowTotals,
    reported_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct FlowAggregator {
    hubs: DashMap<StableId, HubFlows>,
}

impl FlowAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, report: FlowTopReport, now: DateTime<Utc>) {
        let mut entry = self.hubs.entry(report.hub_id).or_insert_with(|| HubFlows {
            totals: FlowTotals::default(),
            reported_at: now,
        });
        entry.totals.reports = entry.totals.reports.saturating_add(1);
        for record in &report.records {
            entry.totals.add(record);
        }
        entry.reported_at = now;
    }

    pub fn totals(&self, hub_id: StableId) -> Option<FlowTotals> {
        self.hubs.get(&hub_id).map(|h| h.totals)
    }

    /// Totals for every reporting hub, ordered by hub id
    pub fn all_totals(&self) -> Vec<(StableId, FlowTotals)> {
        let mut all: Vec<_> = self.hubs.iter().map(|h| (*h.key(), h.totals)).collect();
        all.sort_by_key(|(id, _)| *id);
        all
    }

    pub fn last_report(&self, hub_id: StableId) -> Option<DateTime<Utc>> {
        self.hubs.get(&hub_id).map(|h| h.reported_at)
    }

    /// Drop state for a hub that went away
    pub fn forget(&self, hub_id: StableId) {
        self.hubs.remove(&hub_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(flow: &str, tx: u64, rx: u64) -> FlowRecord {
        FlowRecord {
            flow_id: flow.to_string(),
            service_id: "svc".to_string(),
            account_id: StableId::from_u128(7),
            transmitted_bytes: tx,
            received_bytes: rx,
            transmitted_messages: 1,
            received_messages: 2,
            started_at: Utc::now(),
        }
    }

    #[test]
    fn test_totals_accumulate_across_reports() {
        let flows = FlowAggregator::new();
        let hub = StableId::from_u128(1);

        flows.record(
            FlowTopReport {
                hub_id: hub,
                records: vec![record("a", 100, 10), record("b", 5, 500)],
            },
            Utc::now(),
        );
        flows.record(
            FlowTopReport {
                hub_id: hub,
                records: vec![record("a", 50, 0)],
            },
            Utc::now(),
        );

        let totals = flows.totals(hub).unwrap();
        assert_eq!(totals.reports, 2);
        assert_eq!(totals.flows, 3);
        assert_eq!(totals.transmitted_bytes, 155);
        assert_eq!(totals.received_bytes, 510);
        assert_eq!(totals.received_messages, 6);
    }

    #[test]
    fn test_totals_saturate_and_forget() {
        let flows = FlowAggregator::new();
        let hub = StableId::from_u128(2);
        let at = Utc::now();
        flows.record(
            FlowTopReport {
                hub_id: hub,
                records: vec![record("big", u64::MAX, 1), record("more", 5, 1)],
            },
            at,
        );

        assert_eq!(flows.totals(hub).unwrap().transmitted_bytes, u64::MAX);
        assert_eq!(flows.last_report(hub), Some(at));

        flows.forget(hub);
        assert!(flows.totals(hub).is_none());
        assert!(flows.last_report(hub).is_none());
        assert!(flows.all_totals().is_empty());
    }
}
