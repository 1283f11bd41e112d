//! Certificate lifecycle errors

use meridian_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CertError {
    #[error("challenge for {domain} was not validated in time")]
    ChallengeTimeout { domain: String },

    #[error("DNS provider error: {0}")]
    DnsPropagation(String),

    /// Another replica holds the renewal lease and did not finish in time
    #[error("renewal of {0} is held by another replica")]
    LeaseConflict(String),

    #[error("ACME error: {0}")]
    Acme(String),

    #[error("invalid certificate material: {0}")]
    InvalidMaterial(String),

    #[error("no certificate has been issued for {0}")]
    NotIssued(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<instant_acme::Error> for CertError {
    fn from(e: instant_acme::Error) -> Self {
        CertError::Acme(e.to_string())
    }
}

pub type CertResult<T> = Result<T, CertError>;
