mod job;
mod retry;
mod state;

pub use job::{
    ExecutionOutcome, ExecutionRecord, Job, JobId, JobKind, JobOwner, JobStatus, NewJob,
    UnknownJobKind,
};
pub use retry::{NextAction, RetryPolicy};
pub use state::{InvalidTransition, StateMachine, Transition};
