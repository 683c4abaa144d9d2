use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use super::{JobStore, LEASE_EXPIRED, QueueMetrics};
use crate::error::StoreError;
use crate::state_machine::{Job, JobId, JobStatus, NewJob, Transition};

#[derive(Debug, Default)]
struct Inner {
    // Insertion sequence breaks ties between equal `created_at` values.
    jobs: HashMap<JobId, (u64, Job)>,
    next_seq: u64,
}

/// In-memory job store for tests and embedding.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    inner: Mutex<Inner>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Storage("job store lock poisoned".into()))
    }
}

/// The job currently held by execution `attempt`, or why it is not.
fn held(inner: &mut Inner, id: JobId, attempt: u32) -> Result<&mut Job, StoreError> {
    let (_, job) = inner.jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
    if job.status != JobStatus::Processing || job.attempt_count != attempt {
        return Err(StoreError::LeaseLost { id, attempt });
    }
    Ok(job)
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create(&self, new: NewJob) -> Result<Job, StoreError> {
        let job = Job::new(new, Utc::now());
        let mut inner = self.lock()?;
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.jobs.insert(job.id, (seq, job.clone()));
        Ok(job)
    }

    async fn claim_next(&self, worker: &str, now: DateTime<Utc>) -> Result<Option<Job>, StoreError> {
        let mut inner = self.lock()?;

        let next = inner
            .jobs
            .values()
            .filter(|(_, job)| job.is_due(now))
            .min_by_key(|(seq, job)| (job.created_at, *seq))
            .map(|(_, job)| job.id);

        let Some(id) = next else {
            return Ok(None);
        };
        let Some((_, job)) = inner.jobs.get_mut(&id) else {
            return Ok(None);
        };
        job.apply(
            Transition::Claim {
                worker: worker.to_string(),
            },
            now,
        )?;
        Ok(Some(job.clone()))
    }

    async fn complete(&self, id: JobId, attempt: u32, result: Value) -> Result<Job, StoreError> {
        let mut inner = self.lock()?;
        let job = held(&mut inner, id, attempt)?;
        job.apply(Transition::Complete { result }, Utc::now())?;
        Ok(job.clone())
    }

    async fn fail(
        &self,
        id: JobId,
        attempt: u32,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<Job, StoreError> {
        let mut inner = self.lock()?;
        let job = held(&mut inner, id, attempt)?;
        let error = error.to_string();
        let transition = match retry_at {
            Some(at) => Transition::Retry { error, at },
            None => Transition::GiveUp { error },
        };
        job.apply(transition, Utc::now())?;
        Ok(job.clone())
    }

    async fn get(&self, id: JobId) -> Result<Job, StoreError> {
        let inner = self.lock()?;
        inner
            .jobs
            .get(&id)
            .map(|(_, job)| job.clone())
            .ok_or(StoreError::NotFound(id))
    }

    async fn reclaim_stale(
        &self,
        cutoff: DateTime<Utc>,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, StoreError> {
        let mut inner = self.lock()?;
        let mut swept = Vec::new();

        for (_, job) in inner.jobs.values_mut() {
            let stale = job.status == JobStatus::Processing && job.claimed_at.is_some_and(|at| at <= cutoff);
            if !stale {
                continue;
            }
            let give_up = job.attempt_count.saturating_add(1) >= max_attempts;
            job.apply(
                Transition::Expire {
                    error: LEASE_EXPIRED.to_string(),
                    give_up,
                },
                now,
            )?;
            swept.push(job.clone());
        }

        Ok(swept)
    }

    async fn metrics(&self, since: DateTime<Utc>, now: DateTime<Utc>) -> Result<QueueMetrics, StoreError> {
        let inner = self.lock()?;
        let mut metrics = QueueMetrics {
            since: Some(since),
            ..Default::default()
        };
        let mut by_kind = BTreeMap::new();
        let mut workers = HashSet::new();
        let mut latency_total = 0.0;

        for (_, job) in inner.jobs.values() {
            if job.created_at >= since {
                *by_kind.entry(job.kind.to_string()).or_insert(0) += 1;
            }
            let in_window = job.updated_at >= since;
            match job.status {
                JobStatus::Pending => {
                    metrics.pending += 1;
                    if job.run_after.is_some_and(|at| at > now) {
                        metrics.scheduled += 1;
                    }
                }
                JobStatus::Processing => {
                    metrics.processing += 1;
                    if let Some(worker) = &job.claimed_by {
                        workers.insert(worker.clone());
                    }
                }
                JobStatus::Completed if in_window => {
                    metrics.completed += 1;
                    latency_total += (job.updated_at - job.created_at).num_milliseconds() as f64 / 1000.0;
                }
                JobStatus::Failed if in_window => metrics.failed += 1,
                JobStatus::Completed | JobStatus::Failed => {}
            }
        }

        metrics.by_kind = by_kind;
        metrics.active_workers = workers.len() as u64;
        if metrics.completed > 0 {
            metrics.avg_completion_secs = Some(latency_total / metrics.completed as f64);
        }
        Ok(metrics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::contract;
    use crate::state_machine::JobKind;
    use serde_json::json;

    #[tokio::test]
    async fn create_and_get() {
        contract::create_and_get(&InMemoryJobStore::new()).await;
    }

    #[tokio::test]
    async fn claims_oldest_first() {
        contract::claims_oldest_first(&InMemoryJobStore::new()).await;
    }

    #[tokio::test]
    async fn complete_and_fail_are_fenced() {
        contract::complete_and_fail_are_fenced(&InMemoryJobStore::new()).await;
    }

    #[tokio::test]
    async fn retry_delay_is_respected() {
        contract::retry_delay_is_respected(&InMemoryJobStore::new()).await;
    }

    #[tokio::test]
    async fn sweep_requeues_then_fails() {
        contract::sweep_requeues_then_fails(&InMemoryJobStore::new()).await;
    }

    #[tokio::test]
    async fn metrics_reflect_queue() {
        contract::metrics_reflect_queue(&InMemoryJobStore::new()).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claims_hand_out_one_job_once() {
        let store = InMemoryJobStore::arc();
        store
            .create(NewJob::new(JobKind::LessonContent, json!({"lesson_id": "l1"})))
            .await
            .unwrap();

        let handles: Vec<_> = (0..16)
            .map(|n| {
                let store = Arc::clone(&store);
                tokio::spawn(async move { store.claim_next(&format!("w-{n}"), Utc::now()).await })
            })
            .collect();

        let mut claimed = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap().is_some() {
                claimed += 1;
            }
        }
        assert_eq!(claimed, 1);
    }
}
