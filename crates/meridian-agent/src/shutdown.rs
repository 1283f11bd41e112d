//! Ordered release of acquired resources

use futures::future::BoxFuture;
use std::future::Future;
use tracing::{info, warn};

type Release = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// Release steps pushed as resources are acquired and run in reverse on
/// the way out. A failing step is logged and does not stop the rest.
#[derive(Default)]
pub struct ShutdownStack {
    steps: Vec<(String, Release)>,
}

impl ShutdownStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push<F, Fut>(&mut self, name: impl Into<String>, release: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.steps
            .push((name.into(), Box::new(move || Box::pin(release()))));
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Run every step, last pushed first. Returns the number that failed.
    pub async fn release_all(mut self) -> usize {
        let mut failed = 0;
        while let Some((name, release)) = self.steps.pop() {
            match release().await {
                Ok(()) => info!(step = %name, "Released"),
                Err(e) => {
                    failed += 1;
                    warn!(step = %name, error = %e, "Release failed");
                }
            }
        }
        failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn test_release_runs_in_reverse_and_continues_past_failures() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut stack = ShutdownStack::new();

        for name in ["listener", "registration", "healthz"] {
            let order = order.clone();
            stack.push(name, move || async move {
                order.lock().unwrap().push(name);
                if name == "registration" {
                    anyhow::bail!("coordinator gone");
                }
                Ok(())
            });
        }
        assert_eq!(stack.len(), 3);

        let failed = stack.release_all().await;
        assert_eq!(failed, 1);
        assert_eq!(
            *order.lock().unwrap(),
            vec!["healthz", "registration", "listener"]
        );
    }
}
