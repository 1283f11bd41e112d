//! Hub TLS material served by the Coordinator listener and handed to hubs

use crate::error::{ControlError, ControlResult};
use meridian_cert::{CertError, CertificateLifecycleManager, CertificateMaterial, HotSwapResolver};
use meridian_store::{Clock, SharedClock};
use rustls::ServerConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const ALPN_H2: &[u8] = b"h2";
pub const ALPN_HTTP11: &[u8] = b"http/1.1";

/// Served domain for a certificate domain: `*.example.com` serves `example.com`
pub fn hub_domain(cert_domain: &str) -> &str {
    cert_domain.strip_prefix("*.").unwrap_or(cert_domain)
}

/// Current hub certificate, swappable while the listener runs
pub struct HubTls {
    cert_domain: String,
    resolver: Arc<HotSwapResolver>,
    clock: SharedClock,
}

impl HubTls {
    pub fn new(cert_domain: impl Into<String>, clock: SharedClock) -> Self {
        Self {
            cert_domain: cert_domain.into(),
            resolver: Arc::new(HotSwapResolver::new()),
            clock,
        }
    }

    /// Domain the certificate is issued for, wildcard included
    pub fn cert_domain(&self) -> &str {
        &self.cert_domain
    }

    pub fn hub_domain(&self) -> &str {
        hub_domain(&self.cert_domain)
    }

    /// Install new material. New handshakes use it immediately; sessions
    /// negotiated under the previous material are untouched.
    pub fn set_hub_tls(&self, material: Arc<CertificateMaterial>) -> ControlResult<()> {
        if material.is_expired(self.clock.now()) {
            return Err(ControlError::InvalidArgument(format!(
                "certificate for {} expired at {}",
                material.domain, material.not_after
            )));
        }
        if !material.is_for(&self.cert_domain) {
            return Err(ControlError::InvalidArgument(format!(
                "certificate names {:?} do not match {}",
                material.names, self.cert_domain
            )));
        }

        let version = material.source_version;
        let not_after = material.not_after;
        self.resolver.install(material)?;
        info!(
            domain = %self.cert_domain,
            version,
            not_after = %not_after,
            "Installed hub TLS material"
        );
        Ok(())
    }

    /// Install material given as PEM text
    pub fn set_hub_tls_pem(
        &self,
        certificate_chain: String,
        private_key: String,
        domain: &str,
        version: i64,
    ) -> ControlResult<()> {
        let material =
            CertificateMaterial::from_pem(domain, certificate_chain, private_key, version)?;
        self.set_hub_tls(Arc::new(material))
    }

    pub fn current(&self) -> Option<Arc<CertificateMaterial>> {
        self.resolver.current()
    }

    pub fn current_version(&self) -> Option<i64> {
        self.current().map(|m| m.source_version)
    }

    /// rustls configuration resolving through the swappable material
    pub fn server_config(&self) -> ControlResult<Arc<ServerConfig>> {
        let mut config = ServerConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(|e| ControlError::Tls(e.to_string()))?
        .with_no_client_auth()
        .with_cert_resolver(self.resolver.clone());
        config.alpn_protocols = vec![ALPN_H2.to_vec(), ALPN_HTTP11.to_vec()];
        Ok(Arc::new(config))
    }
}

/// Re-read the persisted certificate every `interval` and install it when
/// its version moved.
pub async fn run_tls_refresh(
    manager: Arc<CertificateLifecycleManager>,
    tls: Arc<HubTls>,
    interval: Duration,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("TLS refresh loop stopped");
                return;
            }
            _ = tokio::time::sleep(interval) => {}
        }

        match refresh_once(&manager, &tls).await {
            Ok(true) => {}
            Ok(false) => debug!(domain = %tls.cert_domain(), "Hub TLS material unchanged"),
            Err(e) => warn!(domain = %tls.cert_domain(), error = %e, "Hub TLS refresh failed"),
        }
    }
}

/// One refresh pass; true when new material was installed
pub async fn refresh_once(
    manager: &CertificateLifecycleManager,
    tls: &HubTls,
) -> ControlResult<bool> {
    let material = match manager.current(tls.cert_domain()).await {
        Ok(material) => material,
        Err(CertError::NotIssued(_)) => return Ok(false),
        Err(e) => return Err(e.into()),
    };
    if tls.current_version() == Some(material.source_version) {
        return Ok(false);
    }
    tls.set_hub_tls(material)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};
    use meridian_cert::generate_self_signed;
    use meridian_store::system_clock;

    fn material(domain: &str, age: ChronoDuration, validity: Duration) -> Arc<CertificateMaterial> {
        let issued = generate_self_signed(domain, Utc::now() - age, validity).unwrap();
        Arc::new(
            CertificateMaterial::from_pem(domain, issued.certificate_chain, issued.private_key, 1)
                .unwrap(),
        )
    }

    #[test]
    fn test_hub_domain_strips_wildcard() {
        assert_eq!(hub_domain("*.example.com"), "example.com");
        assert_eq!(hub_domain("hub.example.com"), "hub.example.com");
    }

    #[test]
    fn test_rejects_expired_material() {
        let tls = HubTls::new("hub.example.com", system_clock());
        let expired = material(
            "hub.example.com",
            ChronoDuration::days(10),
            Duration::from_secs(24 * 3600),
        );
        assert!(matches!(
            tls.set_hub_tls(expired),
            Err(ControlError::InvalidArgument(_))
        ));
        assert!(tls.current().is_none());
    }

    #[test]
    fn test_rejects_material_for_other_domain() {
        let tls = HubTls::new("hub.example.com", system_clock());
        let other = material(
            "other.example.org",
            ChronoDuration::zero(),
            Duration::from_secs(3600),
        );
        assert!(tls.set_hub_tls(other).is_err());
        assert!(tls.current().is_none());
    }

    #[test]
    fn test_installs_valid_material() {
        let tls = HubTls::new("*.example.com", system_clock());
        let wildcard = material("*.example.com", ChronoDuration::zero(), Duration::from_secs(3600));
        tls.set_hub_tls(wildcard).unwrap();
        assert_eq!(tls.current_version(), Some(1));
        assert!(tls.server_config().is_ok());
    }
}
