//! Self-signed material for development and tests
//!
//! **Not for production.** Browsers and hubs only accept it with
//! verification disabled.

use crate::error::{CertError, CertResult};
use chrono::{DateTime, Utc};
use rcgen::{CertificateParams, DistinguishedName, DnType, Ia5String, KeyPair, SanType};
use std::time::Duration;

/// PEM chain and key as returned by an issuer
#[derive(Clone)]
pub struct IssuedCertificate {
    pub certificate_chain: String,
    pub private_key: String,
}

/// Generate a certificate for `domain` and its wildcard, valid from
/// `not_before` for `validity`
pub fn generate_self_signed(
    domain: &str,
    not_before: DateTime<Utc>,
    validity: Duration,
) -> CertResult<IssuedCertificate> {
    let base = domain.trim_start_matches("*.");
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, base);
    dn.push(DnType::OrganizationName, "Meridian Dev");
    params.distinguished_name = dn;

    params.subject_alt_names = [base.to_string(), format!("*.{}", base)]
        .into_iter()
        .map(|name| {
            Ia5String::try_from(name)
                .map(SanType::DnsName)
                .map_err(|e| CertError::InvalidMaterial(e.to_string()))
        })
        .collect::<CertResult<Vec<_>>>()?;

    let start = not_before.timestamp();
    let end = start.saturating_add(validity.as_secs() as i64);
    params.not_before = offset(start)?;
    params.not_after = offset(end)?;
    params.serial_number = Some(rcgen::SerialNumber::from(rand::random::<u64>()));

    let key_pair = KeyPair::generate().map_err(|e| CertError::InvalidMaterial(e.to_string()))?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| CertError::InvalidMaterial(e.to_string()))?;

    Ok(IssuedCertificate {
        certificate_chain: cert.pem(),
        private_key: key_pair.serialize_pem(),
    })
}

fn offset(secs: i64) -> CertResult<time::OffsetDateTime> {
    time::OffsetDateTime::from_unix_timestamp(secs)
        .map_err(|e| CertError::InvalidMaterial(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_self_signed() {
        let cert =
            generate_self_signed("*.hub.localhost", Utc::now(), Duration::from_secs(3600)).unwrap();
        assert!(cert.certificate_chain.contains("BEGIN CERTIFICATE"));
        assert!(cert.private_key.contains("BEGIN PRIVATE KEY"));
    }
}
