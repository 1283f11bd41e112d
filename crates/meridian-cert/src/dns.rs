//! DNS-provider collaborator for DNS-01 challenges

use crate::error::{CertError, CertResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

#[async_trait]
pub trait DnsProvider: Send + Sync {
    /// Publish a TXT record `name` with `value` in `zone_id`
    async fn create_txt(&self, zone_id: &str, name: &str, value: &str) -> CertResult<()>;

    /// Remove the TXT record `name` carrying `value`
    async fn delete_txt(&self, zone_id: &str, name: &str, value: &str) -> CertResult<()>;
}

/// DNS management API speaking the `set-txt`/`clear-txt` protocol of
/// pebble-challtestsrv
pub struct HttpDnsProvider {
    base_url: String,
    client: reqwest::Client,
}

impl HttpDnsProvider {
    pub fn new(base_url: impl Into<String>) -> CertResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| CertError::DnsPropagation(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    async fn post(&self, endpoint: &str, body: serde_json::Value) -> CertResult<()> {
        let url = format!("{}/{}", self.base_url, endpoint);
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| CertError::DnsPropagation(format!("{}: {}", url, e)))?;

        if !response.status().is_success() {
            return Err(CertError::DnsPropagation(format!(
                "{} returned {}",
                url,
                response.status()
            )));
        }
        Ok(())
    }
}

fn fqdn(name: &str) -> String {
    if name.ends_with('.') {
        name.to_string()
    } else {
        format!("{}.", name)
    }
}

#[async_trait]
impl DnsProvider for HttpDnsProvider {
    async fn create_txt(&self, zone_id: &str, name: &str, value: &str) -> CertResult<()> {
        debug!(zone_id = %zone_id, record = %name, "Publishing TXT record");
        self.post(
            "set-txt",
            serde_json::json!({ "host": fqdn(name), "value": value, "zone_id": zone_id }),
        )
        .await
    }

    async fn delete_txt(&self, zone_id: &str, name: &str, _value: &str) -> CertResult<()> {
        debug!(zone_id = %zone_id, record = %name, "Clearing TXT record");
        self.post(
            "clear-txt",
            serde_json::json!({ "host": fqdn(name), "zone_id": zone_id }),
        )
        .await
    }
}

/// In-process TXT records, for tests and dev mode
#[derive(Default)]
pub struct MemoryDns {
    records: Mutex<HashMap<String, Vec<String>>>,
    fail: AtomicBool,
}

impl MemoryDns {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Values currently published under `name`
    pub fn txt(&self, name: &str) -> Vec<String> {
        self.records
            .lock()
            .map(|records| records.get(name).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    pub fn record_count(&self) -> usize {
        self.records
            .lock()
            .map(|records| records.values().map(Vec::len).sum())
            .unwrap_or_default()
    }

    fn check(&self) -> CertResult<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(CertError::DnsPropagation("provider unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl DnsProvider for MemoryDns {
    async fn create_txt(&self, _zone_id: &str, name: &str, value: &str) -> CertResult<()> {
        self.check()?;
        let mut records = self
            .records
            .lock()
            .map_err(|_| CertError::DnsPropagation("record table poisoned".to_string()))?;
        records
            .entry(name.to_string())
            .or_default()
            .push(value.to_string());
        Ok(())
    }

    async fn delete_txt(&self, _zone_id: &str, name: &str, value: &str) -> CertResult<()> {
        self.check()?;
        let mut records = self
            .records
            .lock()
            .map_err(|_| CertError::DnsPropagation("record table poisoned".to_string()))?;
        if let Some(values) = records.get_mut(name) {
            values.retain(|v| v != value);
            if values.is_empty() {
                records.remove(name);
            }
        }
        Ok(())
    }
}
