use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::error::{StatusError, StoreError};
use crate::state_machine::{Job, JobId, JobKind, JobStatus};
use crate::store::{JobStore, QueueMetrics};

/// What a caller is allowed to see of a job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStatusView {
    pub id: JobId,
    pub kind: JobKind,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub attempt_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Job> for JobStatusView {
    fn from(job: Job) -> Self {
        let result = match job.status {
            JobStatus::Completed => job.result,
            _ => None,
        };
        // A pending job carries an error only while it waits out a retry.
        let error = match job.status {
            JobStatus::Failed | JobStatus::Pending => job.error,
            _ => None,
        };
        let retry_at = match job.status {
            JobStatus::Pending => job.run_after,
            _ => None,
        };
        Self {
            id: job.id,
            kind: job.kind,
            status: job.status,
            result,
            error,
            attempt_count: job.attempt_count,
            retry_at,
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}

/// Identity of whoever is asking about a job.
#[derive(Debug, Clone, Default)]
pub struct Requester {
    pub user_id: Option<String>,
    pub is_staff: bool,
}

impl Requester {
    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            is_staff: false,
        }
    }

    pub fn staff() -> Self {
        Self {
            user_id: None,
            is_staff: true,
        }
    }

    fn can_see(&self, job: &Job) -> bool {
        match &job.owner.user_id {
            None => true,
            Some(owner) => self.is_staff || self.user_id.as_deref() == Some(owner.as_str()),
        }
    }
}

/// Read-only view over the job store.
#[derive(Clone)]
pub struct StatusService {
    store: Arc<dyn JobStore>,
}

impl StatusService {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    pub async fn status(&self, id: JobId) -> Result<JobStatusView, StatusError> {
        Ok(self.load(id).await?.into())
    }

    /// Like [`status`](Self::status), but a job owned by a user is only
    /// visible to that user or to staff.
    pub async fn status_for(&self, id: JobId, requester: &Requester) -> Result<JobStatusView, StatusError> {
        let job = self.load(id).await?;
        if !requester.can_see(&job) {
            return Err(StatusError::Forbidden(id));
        }
        Ok(job.into())
    }

    /// Queue snapshot over the trailing `window`.
    pub async fn metrics(&self, window: TimeDelta) -> Result<QueueMetrics, StatusError> {
        let now = Utc::now();
        let since = now.checked_sub_signed(window).unwrap_or(DateTime::<Utc>::MIN_UTC);
        Ok(self.store.metrics(since, now).await?)
    }

    async fn load(&self, id: JobId) -> Result<Job, StatusError> {
        self.store.get(id).await.map_err(|err| match err {
            StoreError::NotFound(id) => StatusError::NotFound(id),
            other => StatusError::Store(other),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::{JobOwner, NewJob};
    use crate::store::InMemoryJobStore;
    use serde_json::json;

    async fn setup() -> (StatusService, Arc<InMemoryJobStore>) {
        let store = InMemoryJobStore::arc();
        (StatusService::new(store.clone()), store)
    }

    fn owned_job() -> NewJob {
        NewJob::new(JobKind::SyllabusGeneration, json!({"topic": "Graph Theory"}))
            .with_owner(JobOwner::user("u-1"))
    }

    #[tokio::test]
    async fn pending_job_has_no_result_or_error() {
        let (service, store) = setup().await;
        let job = store.create(owned_job()).await.unwrap();

        let view = service.status(job.id).await.unwrap();
        assert_eq!(view.status, JobStatus::Pending);
        assert_eq!(view.attempt_count, 0);
        assert!(view.result.is_none());
        assert!(view.error.is_none());

        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["kind"], json!("syllabus_generation"));
        assert!(json.get("result").is_none());
    }

    #[tokio::test]
    async fn retry_and_failure_expose_error() {
        let (service, store) = setup().await;
        let job = store.create(owned_job()).await.unwrap();
        let claimed = store.claim_next("w", Utc::now()).await.unwrap().unwrap();
        let at = Utc::now() + TimeDelta::minutes(5);
        store.fail(job.id, claimed.attempt_count, "model timeout", Some(at)).await.unwrap();

        let view = service.status(job.id).await.unwrap();
        assert_eq!(view.status, JobStatus::Pending);
        assert_eq!(view.error.as_deref(), Some("model timeout"));
        assert_eq!(view.retry_at, Some(at));
    }

    #[tokio::test]
    async fn completed_job_exposes_result() {
        let (service, store) = setup().await;
        let job = store.create(owned_job()).await.unwrap();
        let claimed = store.claim_next("w", Utc::now()).await.unwrap().unwrap();
        store
            .complete(job.id, claimed.attempt_count, json!({"syllabus_id": "s-1"}))
            .await
            .unwrap();

        let view = service.status(job.id).await.unwrap();
        assert_eq!(view.status, JobStatus::Completed);
        assert_eq!(view.result, Some(json!({"syllabus_id": "s-1"})));
        assert_eq!(view.attempt_count, 1);
    }

    #[tokio::test]
    async fn owner_check() {
        let (service, store) = setup().await;
        let owned = store.create(owned_job()).await.unwrap();
        let anonymous = store
            .create(NewJob::new(JobKind::LessonContent, json!({"lesson_id": "l-1"})))
            .await
            .unwrap();

        assert!(service.status_for(owned.id, &Requester::user("u-1")).await.is_ok());
        assert!(service.status_for(owned.id, &Requester::staff()).await.is_ok());
        assert!(matches!(
            service.status_for(owned.id, &Requester::user("u-2")).await,
            Err(StatusError::Forbidden(_))
        ));
        assert!(matches!(
            service.status_for(owned.id, &Requester::default()).await,
            Err(StatusError::Forbidden(_))
        ));
        assert!(service.status_for(anonymous.id, &Requester::user("u-2")).await.is_ok());
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let (service, _) = setup().await;
        assert!(matches!(service.status(JobId::new()).await, Err(StatusError::NotFound(_))));
    }

    #[tokio::test]
    async fn metrics_over_window() {
        let (service, store) = setup().await;
        let job = store.create(owned_job()).await.unwrap();
        store.create(owned_job()).await.unwrap();
        let claimed = store.claim_next("w-1", Utc::now()).await.unwrap().unwrap();
        store.complete(job.id, claimed.attempt_count, json!({})).await.unwrap();
        store.claim_next("w-2", Utc::now()).await.unwrap().unwrap();

        let metrics = service.metrics(TimeDelta::hours(24)).await.unwrap();
        assert_eq!(metrics.completed, 1);
        assert_eq!(metrics.processing, 1);
        assert_eq!(metrics.active_workers, 1);
        assert_eq!(metrics.by_kind.get("syllabus_generation"), Some(&2));
        assert!(metrics.avg_completion_secs.is_some());
    }
}
