//! Job records

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Ready,
    /// Retry budget exhausted; needs operator attention
    Dead,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Ready => "ready",
            JobState::Dead => "dead",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ready" => Some(JobState::Ready),
            "dead" => Some(JobState::Dead),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Periodic {
    pub name: String,
    pub interval: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub id: i64,
    pub queue: String,
    pub job_type: String,
    pub payload: Vec<u8>,
    /// Next time this job may be claimed; pushed back by retries
    pub run_at: DateTime<Utc>,
    /// Slot this occurrence was scheduled for; retries leave it alone
    pub scheduled_at: DateTime<Utc>,
    pub periodic: Option<Periodic>,
    /// Claims so far, including the current one
    pub attempts: u32,
    pub state: JobState,
    /// Claim token of the current holder
    pub claimed_by: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A one-shot job to enqueue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    pub queue: String,
    pub job_type: String,
    pub payload: Vec<u8>,
    pub run_at: Option<DateTime<Utc>>,
}

impl NewJob {
    pub fn new(queue: impl Into<String>, job_type: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            queue: queue.into(),
            job_type: job_type.into(),
            payload,
            run_at: None,
        }
    }

    pub fn run_at(mut self, at: DateTime<Utc>) -> Self {
        self.run_at = Some(at);
        self
    }
}

/// First occurrence on the `scheduled + k * interval` grid strictly after `now`.
///
/// Anchoring on the scheduled time rather than the completion time keeps
/// the cadence from drifting; missed occurrences are skipped, not replayed.
pub fn next_occurrence(
    scheduled: DateTime<Utc>,
    interval: Duration,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    let interval_ms = (interval.as_millis() as i64).max(1);
    let behind_ms = (now - scheduled).num_milliseconds();
    let k = if behind_ms < 0 {
        1
    } else {
        behind_ms / interval_ms + 1
    };
    scheduled + ChronoDuration::milliseconds(k * interval_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_occurrence_ignores_completion_time() {
        let t0 = Utc::now();
        let hour = Duration::from_secs(3600);

        // Finished 5 minutes late; next run is still on the grid
        let next = next_occurrence(t0, hour, t0 + ChronoDuration::minutes(5));
        assert_eq!(next, t0 + ChronoDuration::hours(1));

        // Finished before the scheduled time
        let next = next_occurrence(t0, hour, t0 - ChronoDuration::seconds(1));
        assert_eq!(next, t0 + ChronoDuration::hours(1));
    }

    #[test]
    fn test_next_occurrence_skips_missed_slots() {
        let t0 = Utc::now();
        let hour = Duration::from_secs(3600);

        let next = next_occurrence(t0, hour, t0 + ChronoDuration::minutes(150));
        assert_eq!(next, t0 + ChronoDuration::hours(3));

        // Exactly on a slot boundary moves to the following slot
        let next = next_occurrence(t0, hour, t0 + ChronoDuration::hours(1));
        assert_eq!(next, t0 + ChronoDuration::hours(2));
    }

    #[test]
    fn test_state_strings() {
        assert_eq!(JobState::parse("dead"), Some(JobState::Dead));
        assert_eq!(JobState::parse(JobState::Ready.as_str()), Some(JobState::Ready));
        assert_eq!(JobState::parse("running"), None);
    }
}
