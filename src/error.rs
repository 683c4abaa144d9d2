use thiserror::Error;

use crate::anthropic::AnthropicError;
use crate::state_machine::{InvalidTransition, JobId};

/// Failures of the durable job store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),

    /// The job is no longer held by this execution: the lease was swept and
    /// the job re-claimed or finished elsewhere.
    #[error("lease lost for job {id} (attempt {attempt})")]
    LeaseLost { id: JobId, attempt: u32 },

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("storage error: {0}")]
    Storage(String),
}

/// Failures of external services called from workflow steps.
#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("language model error: {0}")]
    Model(String),

    #[error("web search error: {0}")]
    Search(String),

    #[error("content storage error: {0}")]
    Storage(String),
}

impl From<AnthropicError> for CollaboratorError {
    fn from(err: AnthropicError) -> Self {
        CollaboratorError::Model(err.to_string())
    }
}

impl From<StoreError> for CollaboratorError {
    fn from(err: StoreError) -> Self {
        CollaboratorError::Storage(err.to_string())
    }
}

/// Error returned by a single workflow step.
#[derive(Debug, Error)]
pub enum StepError {
    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),

    /// Generated content failed a structural check.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The job input cannot seed this workflow. Retrying cannot fix it.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

/// Configuration defects detected while walking a graph.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineFault {
    #[error("no edge matched after step `{step}` and no default is declared")]
    NoMatchingEdge { step: String },

    #[error("transition limit of {limit} exceeded")]
    StepLimitExceeded { limit: usize },

    #[error("edge targets unknown step `{0}`")]
    UnknownStep(String),
}

/// Why a job's workflow did not produce a result.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("unknown workflow type: {0}")]
    UnknownWorkflowType(String),

    #[error("step `{step}` failed: {source}")]
    Step {
        step: String,
        #[source]
        source: StepError,
    },

    #[error("engine fault: {0}")]
    Engine(#[from] EngineFault),

    #[error("workflow panicked: {0}")]
    Panicked(String),
}

impl WorkflowError {
    /// Whether another attempt could succeed. Configuration defects and bad
    /// input are permanent.
    pub fn is_retryable(&self) -> bool {
        match self {
            WorkflowError::UnknownWorkflowType(_) | WorkflowError::Engine(_) => false,
            WorkflowError::Step {
                source: StepError::InvalidInput(_),
                ..
            } => false,
            WorkflowError::Step { .. } | WorkflowError::Panicked(_) => true,
        }
    }
}

/// Rejections from the enqueue path.
#[derive(Debug, Error)]
pub enum EnqueueError {
    #[error("unknown workflow type: {0}")]
    UnknownWorkflowType(String),

    #[error("invalid job input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Rejections from the status query path.
#[derive(Debug, Error)]
pub enum StatusError {
    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("job {0} is not visible to this requester")]
    Forbidden(JobId),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryability_follows_taxonomy() {
        let transient = WorkflowError::Step {
            step: "search_web".into(),
            source: StepError::Collaborator(CollaboratorError::Search("timeout".into())),
        };
        assert!(transient.is_retryable());
        assert!(!WorkflowError::UnknownWorkflowType("x".into()).is_retryable());
        assert!(
            !WorkflowError::Engine(EngineFault::NoMatchingEdge {
                step: "classify_intent".into()
            })
            .is_retryable()
        );
    }

    #[test]
    fn anthropic_errors_become_model_errors() {
        let err: CollaboratorError = AnthropicError::RateLimited {
            retry_after_ms: 2000,
        }
        .into();
        assert!(matches!(err, CollaboratorError::Model(ref m) if m.contains("rate limited")));
    }

    #[test]
    fn step_error_display_includes_step_name() {
        let err = WorkflowError::Step {
            step: "validate_structure".into(),
            source: StepError::Validation("modules missing".into()),
        };
        assert_eq!(
            err.to_string(),
            "step `validate_structure` failed: validation failed: modules missing"
        );
    }

    #[test]
    fn errors_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<StoreError>();
        assert_send_sync::<WorkflowError>();
    }
}
