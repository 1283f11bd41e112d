//! Certificate material and its persisted form

use crate::error::{CertError, CertResult};
use chrono::{DateTime, Utc};
use rustls::pki_types::CertificateDer;
use rustls::sign::CertifiedKey;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use x509_parser::extensions::GeneralName;
use x509_parser::pem::parse_x509_pem;

/// A certificate chain with its key, as issued for one domain.
///
/// Material is never mutated after issuance; renewal produces a new value
/// with a higher `source_version`.
#[derive(Clone, PartialEq, Eq)]
pub struct CertificateMaterial {
    pub domain: String,
    /// PEM chain, leaf first
    pub certificate_chain: String,
    /// PEM private key
    pub private_key: String,
    /// Secret-store version this material was read from
    pub source_version: i64,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    /// DNS names on the leaf
    pub names: Vec<String>,
}

impl std::fmt::Debug for CertificateMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateMaterial")
            .field("domain", &self.domain)
            .field("source_version", &self.source_version)
            .field("not_before", &self.not_before)
            .field("not_after", &self.not_after)
            .field("names", &self.names)
            .finish_non_exhaustive()
    }
}

/// Persisted form in the secret store
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct StoredMaterial {
    pub domain: String,
    pub certificate_chain: String,
    pub private_key: String,
}

impl CertificateMaterial {
    /// Parse PEM material, reading validity and names from the leaf
    pub fn from_pem(
        domain: &str,
        certificate_chain: String,
        private_key: String,
        source_version: i64,
    ) -> CertResult<Self> {
        let (_, pem) = parse_x509_pem(certificate_chain.as_bytes())
            .map_err(|e| CertError::InvalidMaterial(format!("certificate PEM: {}", e)))?;
        let leaf = pem
            .parse_x509()
            .map_err(|e| CertError::InvalidMaterial(format!("certificate: {}", e)))?;

        let validity = leaf.validity();
        let not_before = timestamp(validity.not_before.timestamp())?;
        let not_after = timestamp(validity.not_after.timestamp())?;

        let mut names = Vec::new();
        if let Ok(Some(san)) = leaf.subject_alternative_name() {
            for name in &san.value.general_names {
                if let GeneralName::DNSName(dns) = name {
                    names.push(dns.to_ascii_lowercase());
                }
            }
        }

        if !private_key.contains("PRIVATE KEY") {
            return Err(CertError::InvalidMaterial(
                "private key is not PEM encoded".to_string(),
            ));
        }

        Ok(Self {
            domain: domain.to_string(),
            certificate_chain,
            private_key,
            source_version,
            not_before,
            not_after,
            names,
        })
    }

    pub(crate) fn from_stored(stored: StoredMaterial, version: i64) -> CertResult<Self> {
        Self::from_pem(
            &stored.domain,
            stored.certificate_chain,
            stored.private_key,
            version,
        )
    }

    pub(crate) fn to_stored(&self) -> StoredMaterial {
        StoredMaterial {
            domain: self.domain.clone(),
            certificate_chain: self.certificate_chain.clone(),
            private_key: self.private_key.clone(),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.not_after
    }

    /// True once less than `1/divisor` of the validity window remains
    pub fn needs_renewal(&self, now: DateTime<Utc>, divisor: u32) -> bool {
        let total = self.not_after - self.not_before;
        let remaining = self.not_after - now;
        remaining < total / divisor.max(1) as i32
    }

    /// Whether the leaf was issued for `domain`
    ///
    /// `*.example.com` is satisfied by a wildcard name; a bare domain by the
    /// name itself or by its wildcard.
    pub fn is_for(&self, domain: &str) -> bool {
        let domain = domain.to_ascii_lowercase();
        if self.names.iter().any(|n| *n == domain) {
            return true;
        }
        let wildcard = format!("*.{}", domain.trim_start_matches("*."));
        self.names.iter().any(|n| *n == wildcard)
    }

    /// Whether a TLS client asking for `host` would accept this leaf
    pub fn covers(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        self.names.iter().any(|name| match name.strip_prefix("*.") {
            Some(suffix) => host
                .strip_suffix(suffix)
                .and_then(|label| label.strip_suffix('.'))
                .is_some_and(|label| !label.is_empty() && !label.contains('.')),
            None => *name == host,
        })
    }

    /// Build the signing key rustls serves from
    pub fn certified_key(&self) -> CertResult<Arc<CertifiedKey>> {
        let certs: Vec<CertificateDer<'static>> =
            rustls_pemfile::certs(&mut self.certificate_chain.as_bytes())
                .collect::<Result<_, _>>()
                .map_err(|e| CertError::InvalidMaterial(format!("certificate chain: {}", e)))?;
        if certs.is_empty() {
            return Err(CertError::InvalidMaterial("empty certificate chain".to_string()));
        }

        let key = rustls_pemfile::private_key(&mut self.private_key.as_bytes())
            .map_err(|e| CertError::InvalidMaterial(format!("private key: {}", e)))?
            .ok_or_else(|| CertError::InvalidMaterial("no private key found".to_string()))?;
        let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
            .map_err(|e| CertError::InvalidMaterial(format!("unsupported key: {}", e)))?;

        Ok(Arc::new(CertifiedKey::new(certs, signing_key)))
    }
}

fn timestamp(secs: i64) -> CertResult<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| CertError::InvalidMaterial(format!("timestamp {} out of range", secs)))
}
