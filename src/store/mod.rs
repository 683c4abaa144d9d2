//! Durable job records.
//!
//! [`JobStore`] is the only component that mutates job status. Every write
//! after a claim is fenced by the attempt number the claim returned, so a
//! worker whose lease was swept cannot overwrite a newer execution.

mod memory;
mod sqlite;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::error::StoreError;
use crate::state_machine::{Job, JobId, NewJob};

pub use memory::InMemoryJobStore;
pub use sqlite::{SqliteJobStore, open_pool};

/// Error message recorded on jobs returned to the queue by the sweep.
pub const LEASE_EXPIRED: &str = "processing lease expired";

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new pending job with zero attempts.
    async fn create(&self, new: NewJob) -> Result<Job, StoreError>;

    /// Atomically claim the oldest due pending job for `worker`.
    ///
    /// Returns `None` when nothing is eligible. Two concurrent callers never
    /// receive the same job.
    async fn claim_next(&self, worker: &str, now: DateTime<Utc>) -> Result<Option<Job>, StoreError>;

    /// Store the result of the execution identified by `(id, attempt)`.
    async fn complete(&self, id: JobId, attempt: u32, result: Value) -> Result<Job, StoreError>;

    /// Record a failed execution. `retry_at` returns the job to pending,
    /// `None` fails it permanently.
    async fn fail(
        &self,
        id: JobId,
        attempt: u32,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<Job, StoreError>;

    async fn get(&self, id: JobId) -> Result<Job, StoreError>;

    /// Return processing jobs claimed at or before `cutoff` to the queue.
    ///
    /// The attempt count is incremented; a job that reaches `max_attempts`
    /// this way is failed instead of requeued. Returns the swept jobs.
    async fn reclaim_stale(
        &self,
        cutoff: DateTime<Utc>,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, StoreError>;

    /// Aggregate counts for the monitoring surface.
    async fn metrics(&self, since: DateTime<Utc>, now: DateTime<Utc>) -> Result<QueueMetrics, StoreError>;
}

/// Queue health snapshot. Completed and failed counts, latency and the
/// per-kind breakdown cover the trailing window starting at `since`; the
/// other counts describe the queue as it is now.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueueMetrics {
    pub since: Option<DateTime<Utc>>,
    pub pending: u64,
    /// Pending jobs still waiting out a retry delay.
    pub scheduled: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub by_kind: BTreeMap<String, u64>,
    pub avg_completion_secs: Option<f64>,
    pub active_workers: u64,
}
