//! Handler registry
//!
//! Built once at startup, then frozen behind an `Arc` and shared with the
//! worker; lookups need no locking.

use crate::error::{JobError, JobResult};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub type Handler = Arc<dyn Fn(Vec<u8>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeriodicRegistration {
    pub name: String,
    pub job_type: String,
    pub queue: String,
    pub initial_delay: Duration,
    pub interval: Duration,
}

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Handler>,
    periodic: Vec<PeriodicRegistration>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for `job_type`, replacing any earlier one
    pub fn register_handler<F, Fut>(&mut self, job_type: impl Into<String>, handler: F)
    where
        F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |payload| Box::pin(handler(payload)));
        self.handlers.insert(job_type.into(), handler);
    }

    /// Declare a periodic job. Registering the same `name` again updates the
    /// existing declaration instead of adding a second one.
    pub fn register_periodic_job(
        &mut self,
        job_type: impl Into<String>,
        queue: impl Into<String>,
        name: impl Into<String>,
        initial_delay: Duration,
        interval: Duration,
    ) -> JobResult<()> {
        let registration = PeriodicRegistration {
            name: name.into(),
            job_type: job_type.into(),
            queue: queue.into(),
            initial_delay,
            interval,
        };
        if registration.interval.is_zero() {
            return Err(JobError::InvalidArgument(format!(
                "periodic job {} has a zero interval",
                registration.name
            )));
        }
        if registration.name.is_empty() {
            return Err(JobError::InvalidArgument(
                "periodic job name is empty".to_string(),
            ));
        }

        match self
            .periodic
            .iter_mut()
            .find(|p| p.name == registration.name)
        {
            Some(existing) => *existing = registration,
            None => self.periodic.push(registration),
        }
        Ok(())
    }

    pub fn handler(&self, job_type: &str) -> Option<&Handler> {
        self.handlers.get(job_type)
    }

    pub fn periodic_jobs(&self) -> &[PeriodicRegistration] {
        &self.periodic
    }

    /// Log the registered handlers and periodic jobs
    pub fn log_handlers(&self) {
        let mut types: Vec<&String> = self.handlers.keys().collect();
        types.sort();
        for job_type in types {
            info!(job_type = %job_type, "Registered job handler");
        }
        for p in &self.periodic {
            info!(
                name = %p.name,
                job_type = %p.job_type,
                queue = %p.queue,
                interval_secs = p.interval.as_secs(),
                "Registered periodic job"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_and_invoke() {
        let mut registry = HandlerRegistry::new();
        registry.register_handler("echo", |payload: Vec<u8>| async move {
            anyhow::ensure!(payload == b"hi", "unexpected payload");
            Ok(())
        });

        let handler = registry.handler("echo").unwrap();
        handler(b"hi".to_vec()).await.unwrap();
        assert!(handler(b"no".to_vec()).await.is_err());
        assert!(registry.handler("missing").is_none());
    }

    #[test]
    fn test_periodic_registration_is_idempotent() {
        let mut registry = HandlerRegistry::new();
        let hour = Duration::from_secs(3600);
        registry
            .register_periodic_job("cleanup", "default", "cleanup", Duration::ZERO, hour)
            .unwrap();
        registry
            .register_periodic_job("cleanup", "default", "cleanup", Duration::ZERO, hour * 2)
            .unwrap();

        assert_eq!(registry.periodic_jobs().len(), 1);
        assert_eq!(registry.periodic_jobs()[0].interval, hour * 2);
    }

    #[test]
    fn test_zero_interval_rejected() {
        let mut registry = HandlerRegistry::new();
        let err = registry
            .register_periodic_job("x", "default", "x", Duration::ZERO, Duration::ZERO)
            .unwrap_err();
        assert!(matches!(err, JobError::InvalidArgument(_)));
    }
}
