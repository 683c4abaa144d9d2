use std::fmt;

use chrono::{DateTime, Utc};
use serde_json::Value;

use super::job::JobStatus;

/// A requested lifecycle change for a job.
///
/// Each variant carries the data the transition writes onto the job record;
/// [`StateMachine::next`] only looks at the variant itself.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// A worker takes ownership of a pending job.
    Claim { worker: String },
    /// The workflow reached its terminal step.
    Complete { result: Value },
    /// The workflow failed and the retry policy scheduled another attempt.
    Retry { error: String, at: DateTime<Utc> },
    /// The workflow failed permanently.
    GiveUp { error: String },
    /// The processing lease expired before the worker wrote an outcome.
    Expire { error: String, give_up: bool },
}

impl Transition {
    pub fn name(&self) -> &'static str {
        match self {
            Transition::Claim { .. } => "claim",
            Transition::Complete { .. } => "complete",
            Transition::Retry { .. } => "retry",
            Transition::GiveUp { .. } => "give_up",
            Transition::Expire { .. } => "expire",
        }
    }
}

/// Rejected transition, e.g. completing a job that is still pending.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid transition: cannot {transition} a {from} job")]
pub struct InvalidTransition {
    pub from: JobStatus,
    pub transition: &'static str,
}

/// The job lifecycle table.
///
/// ```text
/// Pending ──claim──▶ Processing ──complete──▶ Completed
///    ▲                  │  │
///    └──retry/expire────┘  └──give_up/expire──▶ Failed
/// ```
///
/// `Completed` and `Failed` are terminal.
pub struct StateMachine;

impl StateMachine {
    pub fn next(from: JobStatus, transition: &Transition) -> Result<JobStatus, InvalidTransition> {
        let to = match (from, transition) {
            (JobStatus::Pending, Transition::Claim { .. }) => JobStatus::Processing,
            (JobStatus::Processing, Transition::Complete { .. }) => JobStatus::Completed,
            (JobStatus::Processing, Transition::Retry { .. }) => JobStatus::Pending,
            (JobStatus::Processing, Transition::GiveUp { .. }) => JobStatus::Failed,
            (JobStatus::Processing, Transition::Expire { give_up, .. }) => {
                if *give_up {
                    JobStatus::Failed
                } else {
                    JobStatus::Pending
                }
            }
            _ => {
                return Err(InvalidTransition {
                    from,
                    transition: transition.name(),
                });
            }
        };
        Ok(to)
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
