//! RPC request and response messages
//!
//! Every message is carried as a JSON document inside a length-prefixed RPC
//! frame (see [`crate::rpc`]). TLS material travels as PEM text.

use crate::account::{Account, Capability};
use crate::id::StableId;
use crate::labels::{LabelSet, Location};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Empty request or response
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Noop {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenResponse {
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagementTokenRequest {
    pub namespace: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateTokenRequest {
    pub account: Account,
    pub capabilities: Vec<Capability>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevokeTokenRequest {
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigRequest {
    pub stable_id: StableId,
    /// TLS version the hub already holds, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub known_tls_version: Option<i64>,
}

/// Configuration a hub needs to serve: the hub domain and its TLS material
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigResponse {
    pub domain: String,
    pub tls_version: i64,
    pub tls_cert_pem: String,
    pub tls_key_pem: String,
    pub tls_not_after: DateTime<Utc>,
    /// Namespace the hub should request its service token for
    pub service_namespace: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HubRegisterRequest {
    pub stable_id: StableId,
    pub name: String,
    #[serde(default)]
    pub labels: LabelSet,
    #[serde(default)]
    pub locations: Vec<Location>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HubDisconnectRequest {
    pub stable_id: StableId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceTokenRequest {
    pub namespace: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyTokenRequest {
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyTokenResponse {
    pub account: Account,
    pub capabilities: Vec<Capability>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HubInfo {
    pub stable_id: StableId,
    pub name: String,
    pub labels: LabelSet,
    pub locations: Vec<Location>,
    pub connected: bool,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListHubsResponse {
    pub hubs: Vec<HubInfo>,
}

/// Byte and message counters for one proxied flow since the previous report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowRecord {
    pub flow_id: String,
    pub service_id: String,
    pub account_id: StableId,
    pub transmitted_bytes: u64,
    pub received_bytes: u64,
    pub transmitted_messages: u64,
    pub received_messages: u64,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowTopReport {
    pub hub_id: StableId,
    pub records: Vec<FlowRecord>,
}
