//! Time sources
//!
//! Stores and schedulers never read the wall clock directly; they take a
//! `Clock` so tests can drive time with `tokio::time::pause()`.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;

pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

pub type SharedClock = Arc<dyn Clock>;

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// UTC time derived from the tokio clock.
///
/// Starts at the wall-clock time of construction and advances with
/// `tokio::time::Instant`, so it follows paused and auto-advanced test time.
#[derive(Debug, Clone)]
pub struct TokioClock {
    base: DateTime<Utc>,
    start: tokio::time::Instant,
}

impl TokioClock {
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    pub fn starting_at(base: DateTime<Utc>) -> Self {
        Self {
            base,
            start: tokio::time::Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = self.start.elapsed();
        self.base + ChronoDuration::from_std(elapsed).unwrap_or_else(|_| ChronoDuration::zero())
    }
}

pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}
