//! Per-flow counters reported to the Coordinator

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use meridian_proto::{FlowRecord, StableId};

/// Counters accumulated since the last [`FlowTracker::drain`]
#[derive(Debug, Default)]
pub struct FlowTracker {
    flows: DashMap<String, FlowRecord>,
}

impl FlowTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a flow; returns its id
    pub fn open(&self, service_id: &str, account_id: StableId, now: DateTime<Utc>) -> String {
        let flow_id = StableId::new().to_string();
        self.flows.insert(
            flow_id.clone(),
            FlowRecord {
                flow_id: flow_id.clone(),
                service_id: service_id.to_string(),
                account_id,
                transmitted_bytes: 0,
                received_bytes: 0,
                transmitted_messages: 0,
                received_messages: 0,
                started_at: now,
            },
        );
        flow_id
    }

    /// One message in each direction
    pub fn exchange(&self, flow_id: &str, received_bytes: u64, transmitted_bytes: u64) {
        if let Some(mut flow) = self.flows.get_mut(flow_id) {
            flow.received_bytes = flow.received_bytes.saturating_add(received_bytes);
            flow.transmitted_bytes = flow.transmitted_bytes.saturating_add(transmitted_bytes);
            flow.received_messages = flow.received_messages.saturating_add(1);
            flow.transmitted_messages = flow.transmitted_messages.saturating_add(1);
        }
    }

    /// Take every record with activity, resetting counters. Flows with no
    /// activity since the last drain are dropped.
    pub fn drain(&self) -> Vec<FlowRecord> {
        let mut records = Vec::new();
        self.flows.retain(|_, flow| {
            let active = flow.received_messages > 0 || flow.transmitted_messages > 0;
            if active {
                records.push(flow.clone());
                flow.received_bytes = 0;
                flow.transmitted_bytes = 0;
                flow.received_messages = 0;
                flow.transmitted_messages = 0;
            }
            active
        });
        records.sort_by(|a, b| a.flow_id.cmp(&b.flow_id));
        records
    }

    /// Put back records from a drain whose report never arrived, merging
    /// with anything counted since
    pub fn restore(&self, records: Vec<FlowRecord>) {
        for record in records {
            match self.flows.get_mut(&record.flow_id) {
                Some(mut flow) => {
                    flow.received_bytes = flow.received_bytes.saturating_add(record.received_bytes);
                    flow.transmitted_bytes =
                        flow.transmitted_bytes.saturating_add(record.transmitted_bytes);
                    flow.received_messages =
                        flow.received_messages.saturating_add(record.received_messages);
                    flow.transmitted_messages = flow
                        .transmitted_messages
                        .saturating_add(record.transmitted_messages);
                }
                None => {
                    self.flows.insert(record.flow_id.clone(), record);
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_resets_and_drops_idle() {
        let tracker = FlowTracker::new();
        let account = StableId::from_u128(1);
        let busy = tracker.open("web", account, Utc::now());
        let _idle = tracker.open("web", account, Utc::now());

        tracker.exchange(&busy, 100, 2000);
        tracker.exchange(&busy, 50, 10);

        let drained = tracker.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].received_bytes, 150);
        assert_eq!(drained[0].transmitted_bytes, 2010);
        assert_eq!(drained[0].received_messages, 2);

        // The busy flow stays tracked with zeroed counters
        assert_eq!(tracker.len(), 1);
        assert!(tracker.drain().is_empty());
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_restore_merges_with_new_activity() {
        let tracker = FlowTracker::new();
        let flow = tracker.open("web", StableId::from_u128(1), Utc::now());
        tracker.exchange(&flow, 100, 1000);

        let unsent = tracker.drain();
        tracker.exchange(&flow, 1, 10);
        tracker.restore(unsent);

        let drained = tracker.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].received_bytes, 101);
        assert_eq!(drained[0].transmitted_bytes, 1010);
        assert_eq!(drained[0].received_messages, 2);
    }
}
