//! Certificate lifecycle
//!
//! Obtains the hub domain's certificate through an ACME DNS-01 flow,
//! persists it as versioned secrets and renews it under a lease so only one
//! replica talks to the authority at a time.

pub mod authority;
pub mod dns;
pub mod error;
pub mod manager;
pub mod material;
pub mod renewal;
pub mod resolver;
pub mod self_signed;

pub use authority::{
    challenge_record_name, AcmeAuthority, AcmeConfig, CertificateAuthority, DnsChallenge,
    PendingOrder, SelfSignedAuthority,
};
pub use dns::{DnsProvider, HttpDnsProvider, MemoryDns};
pub use error::{CertError, CertResult};
pub use manager::{
    CertManagerConfig, CertState, CertStats, CertStatsSnapshot, CertificateLifecycleManager,
};
pub use material::CertificateMaterial;
pub use renewal::{check_job_lease, register_renewal_job, RENEW_JOB_TYPE};
pub use resolver::HotSwapResolver;
pub use self_signed::{generate_self_signed, IssuedCertificate};
