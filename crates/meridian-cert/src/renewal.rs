//! Periodic renewal job

use crate::error::{CertError, CertResult};
use crate::manager::{CertManagerConfig, CertificateLifecycleManager};
use meridian_jobs::{HandlerRegistry, JobResult};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub const RENEW_JOB_TYPE: &str = "renew-hub-cert";

/// Reject a job lease shorter than a renewal may legitimately take.
///
/// The worker times handlers out at the job lease, so a renewal waiting on
/// another replica would otherwise count as a failure and let a second
/// worker claim the same occurrence.
pub fn check_job_lease(job_lease: Duration, config: &CertManagerConfig) -> CertResult<()> {
    let budget = config.renewal_budget();
    if job_lease <= budget {
        return Err(CertError::Config(format!(
            "job lease {}s must exceed renewal lease plus challenge timeout ({}s)",
            job_lease.as_secs(),
            budget.as_secs()
        )));
    }
    Ok(())
}

/// Register the `renew-hub-cert` handler and its periodic job.
///
/// The job payload names the domain; the periodic instance has no payload
/// and renews `domain`.
pub fn register_renewal_job(
    registry: &mut HandlerRegistry,
    manager: Arc<CertificateLifecycleManager>,
    domain: &str,
    queue: &str,
    interval: Duration,
) -> JobResult<()> {
    let default_domain = domain.to_string();
    registry.register_handler(RENEW_JOB_TYPE, move |payload: Vec<u8>| {
        let manager = manager.clone();
        let domain = if payload.is_empty() {
            default_domain.clone()
        } else {
            String::from_utf8_lossy(&payload).into_owned()
        };
        async move {
            let result: anyhow::Result<()> = match manager.refresh_if_needed(&domain).await {
                Ok((material, true)) => {
                    info!(
                        domain = %domain,
                        version = material.source_version,
                        "Certificate renewed"
                    );
                    Ok(())
                }
                Ok((_, false)) => Ok(()),
                Err(CertError::LeaseConflict(_)) => {
                    debug!(domain = %domain, "Renewal held by another replica");
                    Ok(())
                }
                Err(e) => Err(e.into()),
            };
            result
        }
    });

    registry.register_periodic_job(RENEW_JOB_TYPE, queue, RENEW_JOB_TYPE, Duration::ZERO, interval)
}
