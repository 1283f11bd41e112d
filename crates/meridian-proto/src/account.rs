//! Accounts and capabilities

use crate::id::StableId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Operation classes a capability token may grant
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Capability {
    /// Expose a service through a hub
    Serve,
    /// Reach services advertised in a namespace
    Access,
    /// Open tunnels to a hub
    Connect,
    /// Mint and revoke tokens inside a namespace
    Manage,
    /// Act as a hub towards the coordinator
    Hub,
}

impl Capability {
    pub const ALL: [Capability; 5] = [
        Capability::Serve,
        Capability::Access,
        Capability::Connect,
        Capability::Manage,
        Capability::Hub,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Serve => "SERVE",
            Capability::Access => "ACCESS",
            Capability::Connect => "CONNECT",
            Capability::Manage => "MANAGE",
            Capability::Hub => "HUB",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown capability: {0}")]
pub struct ParseCapabilityError(pub String);

impl FromStr for Capability {
    type Err = ParseCapabilityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Capability::ALL
            .iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(s.trim()))
            .copied()
            .ok_or_else(|| ParseCapabilityError(s.to_string()))
    }
}

/// Tenant owning issued tokens
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Account {
    pub account_id: StableId,
    pub namespace: String,
}

impl Account {
    pub fn new(account_id: StableId, namespace: impl Into<String>) -> Self {
        Self {
            account_id,
            namespace: namespace.into(),
        }
    }
}

/// True when `child` equals `parent` or sits below it in the namespace tree.
///
/// `/tenant1/app` is inside `/tenant1`; `/tenant10` is not.
pub fn namespace_contains(parent: &str, child: &str) -> bool {
    let parent = parent.trim_end_matches('/');
    if parent.is_empty() {
        return child.starts_with('/');
    }
    child == parent
        || child
            .strip_prefix(parent)
            .is_some_and(|rest| rest.starts_with('/'))
}

/// Namespaces are absolute slash-separated paths
pub fn is_valid_namespace(ns: &str) -> bool {
    ns.starts_with('/') && !ns.contains("//") && !ns.chars().any(char::is_whitespace)
}
