use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use super::job::Job;
use crate::error::WorkflowError;

/// What the dispatcher should do with a job whose workflow failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextAction {
    /// Return the job to pending, claimable no earlier than the given time.
    RetryAt(DateTime<Utc>),
    /// Mark the job permanently failed.
    GiveUp,
}

/// Exponential backoff configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total executions allowed, counting the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub base_delay: Duration,
    /// Growth factor applied per further attempt.
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(5 * 60),
            multiplier: 4,
        }
    }
}

impl RetryPolicy {
    /// delay = base_delay * multiplier^(attempt - 1), saturating on overflow.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor)
    }

    pub fn next_action(&self, job: &Job, error: &WorkflowError, now: DateTime<Utc>) -> NextAction {
        if !error.is_retryable() || job.attempt_count >= self.max_attempts {
            return NextAction::GiveUp;
        }

        let delay = TimeDelta::from_std(self.delay_for_attempt(job.attempt_count)).unwrap_or(TimeDelta::MAX);
        let at = now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC);
        NextAction::RetryAt(at)
    }
}
