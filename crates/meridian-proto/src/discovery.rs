//! Public hub discovery document served over plain HTTP

use crate::labels::LabelSet;
use crate::messages::HubInfo;
use serde::{Deserialize, Serialize};

pub const DISCOVERY_PATH: &str = "/.well-known/meridian/hubs.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryHub {
    pub addresses: Vec<String>,
    pub labels: LabelSet,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryDocument {
    pub hubs: Vec<DiscoveryHub>,
}

impl DiscoveryDocument {
    /// Advertise connected hubs; each hub's addresses keep location order
    /// with duplicates removed.
    pub fn from_hubs<'a>(hubs: impl IntoIterator<Item = &'a HubInfo>) -> Self {
        let hubs = hubs
            .into_iter()
            .filter(|h| h.connected)
            .map(|h| {
                let mut addresses: Vec<String> = Vec::new();
                for addr in h.locations.iter().flat_map(|l| l.addresses.iter()) {
                    if !addresses.contains(addr) {
                        addresses.push(addr.clone());
                    }
                }
                DiscoveryHub {
                    addresses,
                    labels: h.labels.clone(),
                    name: h.name.clone(),
                }
            })
            .collect();
        Self { hubs }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::Location;
    use chrono::Utc;

    fn hub(name: &str, connected: bool) -> HubInfo {
        HubInfo {
            stable_id: crate::StableId::new(),
            name: name.to_string(),
            labels: LabelSet::from_pairs([("region", "eu")]),
            locations: vec![
                Location {
                    labels: LabelSet::from_pairs([("type", "public")]),
                    addresses: vec!["1.2.3.4:443".into()],
                },
                Location {
                    labels: LabelSet::from_pairs([("type", "private")]),
                    addresses: vec!["10.0.0.2:443".into(), "1.2.3.4:443".into()],
                },
            ],
            connected,
            last_seen: Utc::now(),
        }
    }

    #[test]
    fn test_document_shape() {
        let hubs = [hub("a", true), hub("b", false)];
        let doc = DiscoveryDocument::from_hubs(hubs.iter());
        let json = serde_json::to_value(&doc).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "hubs": [{
                    "addresses": ["1.2.3.4:443", "10.0.0.2:443"],
                    "labels": {"labels": [{"name": "region", "value": "eu"}]},
                    "name": "a"
                }]
            })
        );
    }
}
