use std::sync::Arc;

use serde_json::Value;
use tracing::info;

use crate::error::EnqueueError;
use crate::state_machine::{Job, JobId, JobKind, JobOwner, NewJob};
use crate::store::JobStore;
use crate::workflow::WorkflowRegistry;

/// Entry point for callers that want work done asynchronously.
#[derive(Clone)]
pub struct JobQueue {
    store: Arc<dyn JobStore>,
    registry: Arc<WorkflowRegistry>,
}

impl JobQueue {
    pub fn new(store: Arc<dyn JobStore>, registry: Arc<WorkflowRegistry>) -> Self {
        Self { store, registry }
    }

    /// Create a pending job for the workflow named `kind`.
    pub async fn create_job(&self, kind: &str, input: Value, owner: JobOwner) -> Result<JobId, EnqueueError> {
        let kind: JobKind = kind
            .parse()
            .map_err(|_| EnqueueError::UnknownWorkflowType(kind.to_string()))?;
        let job = self.submit(NewJob::new(kind, input).with_owner(owner)).await?;
        Ok(job.id)
    }

    pub async fn submit(&self, new: NewJob) -> Result<Job, EnqueueError> {
        if !self.registry.contains(new.kind) {
            return Err(EnqueueError::UnknownWorkflowType(new.kind.to_string()));
        }
        if !new.input.is_object() {
            return Err(EnqueueError::InvalidInput("input must be a JSON object".into()));
        }
        let job = self.store.create(new).await?;
        info!(job_id = %job.id, kind = %job.kind, user = ?job.owner.user_id, "job enqueued");
        Ok(job)
    }
}
