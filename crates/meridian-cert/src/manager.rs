//! Certificate lifecycle manager
//!
//! Every replica decides on its own whether a domain's certificate is due;
//! only the holder of the `{lock_scope}/renew-cert:{domain}` lease talks to the
//! authority. Everyone else waits for the holder's result to appear in the
//! secret store.

use crate::authority::{CertificateAuthority, DnsChallenge};
use crate::dns::DnsProvider;
use crate::error::{CertError, CertResult};
use crate::material::{CertificateMaterial, StoredMaterial};
use dashmap::DashMap;
use meridian_store::{Clock, LeaseOutcome, Leases, SecretStore};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct CertManagerConfig {
    /// Secret-store prefix; material lives at `{vault_path}/certs/{domain}`
    pub vault_path: String,
    pub dns_zone_id: String,
    /// Lease scope; the renewal lock is `{lock_scope}/renew-cert:{domain}`
    pub lock_scope: String,
    /// Renew once less than `1/renew_divisor` of the validity window remains
    pub renew_divisor: u32,
    /// Bound on DNS-01 validation and download
    pub challenge_timeout: Duration,
    /// Renewal lease TTL; also how long contended callers wait
    pub renew_lease: Duration,
    /// Re-read interval for contended callers
    pub contention_poll: Duration,
}

impl Default for CertManagerConfig {
    fn default() -> Self {
        Self {
            vault_path: "meridian-k1".to_string(),
            dns_zone_id: String::new(),
            lock_scope: "meridian-locks".to_string(),
            renew_divisor: 3,
            challenge_timeout: Duration::from_secs(180),
            renew_lease: Duration::from_secs(600),
            contention_poll: Duration::from_secs(2),
        }
    }
}

impl CertManagerConfig {
    /// Longest a healthy renewal runs: a full contended wait on the renewal
    /// lease followed by a challenge
    pub fn renewal_budget(&self) -> Duration {
        self.renew_lease + self.challenge_timeout
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertState {
    Uninitialized,
    /// First issuance in flight
    Pending,
    Issued,
    Renewing,
}

#[derive(Debug, Default)]
pub struct CertStats {
    pub issued: AtomicU64,
    pub failures: AtomicU64,
    pub contended: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CertStatsSnapshot {
    pub issued: u64,
    pub failures: u64,
    pub contended: u64,
}

impl CertStats {
    pub fn snapshot(&self) -> CertStatsSnapshot {
        CertStatsSnapshot {
            issued: self.issued.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            contended: self.contended.load(Ordering::Relaxed),
        }
    }
}

struct DomainEntry {
    state: CertState,
    material: Option<Arc<CertificateMaterial>>,
}

pub struct CertificateLifecycleManager {
    config: CertManagerConfig,
    authority: Arc<dyn CertificateAuthority>,
    dns: Arc<dyn DnsProvider>,
    secrets: Arc<dyn SecretStore>,
    leases: Leases,
    domains: DashMap<String, DomainEntry>,
    stats: Arc<CertStats>,
}

impl CertificateLifecycleManager {
    pub fn new(
        config: CertManagerConfig,
        authority: Arc<dyn CertificateAuthority>,
        dns: Arc<dyn DnsProvider>,
        secrets: Arc<dyn SecretStore>,
        leases: Leases,
    ) -> Self {
        Self {
            config,
            authority,
            dns,
            secrets,
            leases,
            domains: DashMap::new(),
            stats: Arc::new(CertStats::default()),
        }
    }

    pub fn config(&self) -> &CertManagerConfig {
        &self.config
    }

    pub fn stats(&self) -> Arc<CertStats> {
        self.stats.clone()
    }

    pub fn state(&self, domain: &str) -> CertState {
        self.domains
            .get(domain)
            .map(|entry| entry.state)
            .unwrap_or(CertState::Uninitialized)
    }

    pub fn material_path(&self, domain: &str) -> String {
        format!("{}/certs/{}", self.config.vault_path, domain)
    }

    /// Return the material for `domain`, issuing it if none exists or the
    /// persisted one has expired
    pub async fn obtain(&self, domain: &str) -> CertResult<Arc<CertificateMaterial>> {
        let existing = self.load(domain).await?;
        let now = self.leases.clock().now();
        if let Some(material) = &existing {
            if !material.is_expired(now) {
                return Ok(material.clone());
            }
        }
        let (material, _) = self
            .renew(domain, existing.map(|m| m.source_version))
            .await?;
        Ok(material)
    }

    /// Renew `domain` when due. `changed` is true when the returned material
    /// is newer than what was persisted at the time of the call.
    pub async fn refresh_if_needed(
        &self,
        domain: &str,
    ) -> CertResult<(Arc<CertificateMaterial>, bool)> {
        let existing = self.load(domain).await?;
        let now = self.leases.clock().now();
        match existing {
            Some(material) if !material.needs_renewal(now, self.config.renew_divisor) => {
                debug!(
                    domain = %domain,
                    version = material.source_version,
                    not_after = %material.not_after,
                    "Certificate not due for renewal"
                );
                Ok((material, false))
            }
            other => self.renew(domain, other.map(|m| m.source_version)).await,
        }
    }

    /// Last persisted material; never contacts the authority
    pub async fn current(&self, domain: &str) -> CertResult<Arc<CertificateMaterial>> {
        self.load(domain)
            .await?
            .ok_or_else(|| CertError::NotIssued(domain.to_string()))
    }

    async fn load(&self, domain: &str) -> CertResult<Option<Arc<CertificateMaterial>>> {
        let Some(secret) = self.secrets.read(&self.material_path(domain)).await? else {
            return Ok(None);
        };

        if let Some(cached) = self.cached(domain) {
            if cached.source_version == secret.version {
                return Ok(Some(cached));
            }
        }

        let stored: StoredMaterial = serde_json::from_slice(&secret.data)
            .map_err(|e| CertError::InvalidMaterial(format!("stored material: {}", e)))?;
        let material = Arc::new(CertificateMaterial::from_stored(stored, secret.version)?);
        self.remember(domain, &material);
        Ok(Some(material))
    }

    fn cached(&self, domain: &str) -> Option<Arc<CertificateMaterial>> {
        self.domains
            .get(domain)
            .and_then(|entry| entry.material.clone())
    }

    fn remember(&self, domain: &str, material: &Arc<CertificateMaterial>) {
        let mut entry = self
            .domains
            .entry(domain.to_string())
            .or_insert_with(|| DomainEntry {
                state: CertState::Issued,
                material: None,
            });
        let newer = entry
            .material
            .as_ref()
            .map_or(true, |m| m.source_version < material.source_version);
        if newer {
            entry.material = Some(material.clone());
        }
        if entry.state == CertState::Uninitialized {
            entry.state = CertState::Issued;
        }
    }

    fn set_state(&self, domain: &str, state: CertState) {
        self.domains
            .entry(domain.to_string())
            .or_insert_with(|| DomainEntry {
                state,
                material: None,
            })
            .state = state;
    }

    async fn renew(
        &self,
        domain: &str,
        seen: Option<i64>,
    ) -> CertResult<(Arc<CertificateMaterial>, bool)> {
        let lease_name = format!("{}/renew-cert:{}", self.config.lock_scope, domain);
        match self
            .leases
            .try_acquire(&lease_name, self.config.renew_lease)
            .await?
        {
            LeaseOutcome::Acquired(guard) => {
                let result = self.renew_holding_lease(domain, seen).await;
                if let Err(e) = guard.release().await {
                    warn!(domain = %domain, "Failed to release renewal lease: {}", e);
                }
                result
            }
            LeaseOutcome::Contended => {
                self.stats.contended.fetch_add(1, Ordering::Relaxed);
                debug!(domain = %domain, "Renewal in progress elsewhere, waiting");
                self.wait_for_renewal(domain, seen, &lease_name).await
            }
        }
    }

    async fn renew_holding_lease(
        &self,
        domain: &str,
        seen: Option<i64>,
    ) -> CertResult<(Arc<CertificateMaterial>, bool)> {
        // The previous holder may have finished between our check and the acquisition
        if let Some(material) = self.load(domain).await? {
            let now = self.leases.clock().now();
            if !material.needs_renewal(now, self.config.renew_divisor) {
                let changed = Some(material.source_version) != seen;
                return Ok((material, changed));
            }
        }

        let had_material = seen.is_some();
        self.set_state(
            domain,
            if had_material {
                CertState::Renewing
            } else {
                CertState::Pending
            },
        );

        match self.issue(domain).await {
            Ok(material) => {
                self.remember(domain, &material);
                self.set_state(domain, CertState::Issued);
                self.stats.issued.fetch_add(1, Ordering::Relaxed);
                info!(
                    domain = %domain,
                    version = material.source_version,
                    not_after = %material.not_after,
                    "Certificate issued"
                );
                Ok((material, true))
            }
            Err(e) => {
                self.stats.failures.fetch_add(1, Ordering::Relaxed);
                self.set_state(
                    domain,
                    if self.cached(domain).is_some() {
                        CertState::Issued
                    } else {
                        CertState::Uninitialized
                    },
                );
                warn!(domain = %domain, "Certificate issuance failed: {}", e);
                Err(e)
            }
        }
    }

    async fn wait_for_renewal(
        &self,
        domain: &str,
        seen: Option<i64>,
        lease_name: &str,
    ) -> CertResult<(Arc<CertificateMaterial>, bool)> {
        let deadline = tokio::time::Instant::now() + self.config.renew_lease;
        loop {
            tokio::time::sleep(self.config.contention_poll).await;

            if let Some(material) = self.load(domain).await? {
                if Some(material.source_version) != seen {
                    return Ok((material, true));
                }
            }
            if !self.leases.is_held(lease_name).await? {
                // Released between the two reads, or the holder gave up
                return match self.load(domain).await? {
                    Some(material) if Some(material.source_version) != seen => {
                        Ok((material, true))
                    }
                    _ => Err(CertError::LeaseConflict(domain.to_string())),
                };
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(CertError::LeaseConflict(domain.to_string()));
            }
        }
    }

    /// Run one order against the authority and persist the result.
    /// Published TXT records are removed on every exit path.
    async fn issue(&self, domain: &str) -> CertResult<Arc<CertificateMaterial>> {
        let order = self.authority.begin(domain).await?;
        let challenges = order.challenges().to_vec();
        let zone = self.config.dns_zone_id.as_str();
        let mut published: Vec<DnsChallenge> = Vec::new();

        let outcome = async {
            for challenge in &challenges {
                self.dns
                    .create_txt(zone, &challenge.record_name, &challenge.value)
                    .await?;
                published.push(challenge.clone());
            }
            debug!(domain = %domain, records = published.len(), "Challenge records published");

            match tokio::time::timeout(self.config.challenge_timeout, order.complete()).await {
                Ok(result) => result,
                Err(_) => Err(CertError::ChallengeTimeout {
                    domain: domain.to_string(),
                }),
            }
        }
        .await;

        for challenge in &published {
            if let Err(e) = self
                .dns
                .delete_txt(zone, &challenge.record_name, &challenge.value)
                .await
            {
                warn!(
                    domain = %domain,
                    record = %challenge.record_name,
                    "Failed to remove challenge record: {}",
                    e
                );
            }
        }

        let issued = outcome?;
        let candidate = CertificateMaterial::from_pem(
            domain,
            issued.certificate_chain,
            issued.private_key,
            0,
        )?;
        if !candidate.is_for(domain) {
            return Err(CertError::InvalidMaterial(format!(
                "issued certificate does not name {}",
                domain
            )));
        }

        let data = serde_json::to_vec(&candidate.to_stored())
            .map_err(|e| CertError::InvalidMaterial(e.to_string()))?;
        let version = self.secrets.write(&self.material_path(domain), &data).await?;

        Ok(Arc::new(CertificateMaterial {
            source_version: version.version,
            ..candidate
        }))
    }
}
