//! Retry with exponential backoff

use crate::error::{AgentError, AgentResult};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Delay before the next attempt; doubles up to the cap
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60))
    }
}

/// Sleep unless cancelled first
pub async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> AgentResult<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(AgentError::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

/// Run `op` until it succeeds or fails permanently. Transient failures are
/// retried with backoff; cancellation stops the wait.
pub async fn retry<T, F, Fut>(
    what: &str,
    mut backoff: Backoff,
    cancel: &CancellationToken,
    mut op: F,
) -> AgentResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = AgentResult<T>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(AgentError::Cancelled),
            result = op() => result,
        };
        match result {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() => {
                let delay = backoff.next_delay();
                warn!(
                    what,
                    attempt,
                    error = %e,
                    retry_in = ?delay,
                    "Attempt failed, retrying"
                );
                sleep_or_cancel(delay, cancel).await?;
            }
            Err(e) => return Err(e),
        }
    }
}
