//! Worker loop: claim a job, run its workflow, store the outcome.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::enqueue::JobQueue;
use crate::error::{StoreError, WorkflowError};
use crate::state_machine::{ExecutionOutcome, ExecutionRecord, Job, NextAction, RetryPolicy};
use crate::store::JobStore;
use crate::workflow::{Engine, WorkflowRegistry, WorkflowRun};

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Number of concurrent worker loops.
    pub workers: usize,
    /// Sleep between polls when the queue is empty.
    pub poll_interval: Duration,
    /// A processing job claimed longer ago than this is considered abandoned.
    pub processing_timeout: Duration,
    pub sweep_interval: Duration,
    pub metrics_interval: Duration,
    pub worker_prefix: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            poll_interval: Duration::from_secs(5),
            processing_timeout: Duration::from_secs(60 * 60),
            sweep_interval: Duration::from_secs(60),
            metrics_interval: Duration::from_secs(15 * 60),
            worker_prefix: "worker".to_string(),
        }
    }
}

/// Drives claimed jobs through their workflows and records every outcome in
/// the job store.
pub struct Dispatcher {
    store: Arc<dyn JobStore>,
    registry: Arc<WorkflowRegistry>,
    queue: JobQueue,
    engine: Engine,
    retry: RetryPolicy,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn JobStore>, registry: Arc<WorkflowRegistry>) -> Self {
        Self {
            queue: JobQueue::new(store.clone(), registry.clone()),
            store,
            registry,
            engine: Engine::default(),
            retry: RetryPolicy::default(),
            config: DispatcherConfig::default(),
        }
    }

    pub fn with_engine(mut self, engine: Engine) -> Self {
        self.engine = engine;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_config(mut self, config: DispatcherConfig) -> Self {
        self.config = config;
        self
    }

    /// Claim at most one job and drive it to a stored outcome.
    ///
    /// Returns `None` when no job was eligible. A store error while writing
    /// the outcome is returned; the job then stays processing until the sweep
    /// reclaims it.
    pub async fn tick(&self, worker: &str) -> Result<Option<ExecutionRecord>, StoreError> {
        let Some(job) = self.store.claim_next(worker, Utc::now()).await? else {
            return Ok(None);
        };
        let started_at = Utc::now();
        info!(
            job_id = %job.id,
            kind = %job.kind,
            attempt = job.attempt_count,
            worker,
            "job claimed"
        );

        let record = match self.execute(&job).await {
            Ok(run) => self.finish(&job, worker, run, started_at).await?,
            Err(err) => self.handle_failure(&job, worker, err, started_at).await?,
        };
        debug!(
            job_id = %record.job_id,
            duration_ms = record.duration_ms,
            outcome = ?record.outcome,
            "execution recorded"
        );
        Ok(Some(record))
    }

    /// Run the job's workflow on its own task so a panicking step cannot take
    /// the worker down.
    async fn execute(&self, job: &Job) -> Result<WorkflowRun, WorkflowError> {
        let workflow = self.registry.lookup(job.kind)?;
        let engine = self.engine;
        let input = job.input.clone();
        let handle = tokio::spawn(async move { workflow.run(&engine, &input).await });
        match handle.await {
            Ok(result) => result,
            Err(join) if join.is_panic() => Err(WorkflowError::Panicked(panic_message(join.into_panic()))),
            Err(join) => Err(WorkflowError::Panicked(join.to_string())),
        }
    }

    async fn finish(
        &self,
        job: &Job,
        worker: &str,
        run: WorkflowRun,
        started_at: DateTime<Utc>,
    ) -> Result<ExecutionRecord, StoreError> {
        let WorkflowRun { output, path } = run;
        match self.store.complete(job.id, job.attempt_count, output.result).await {
            Ok(_) => {}
            Err(StoreError::LeaseLost { .. }) => {
                warn!(job_id = %job.id, attempt = job.attempt_count, worker, "lease lost, result discarded");
                return Ok(ExecutionRecord::new(job, worker, path, ExecutionOutcome::LeaseLost, started_at));
            }
            Err(err) => return Err(err),
        }
        info!(job_id = %job.id, kind = %job.kind, attempt = job.attempt_count, steps = path.len(), "job completed");

        for follow_up in output.follow_ups {
            let kind = follow_up.kind;
            match self.queue.submit(follow_up).await {
                Ok(child) => info!(parent = %job.id, job_id = %child.id, kind = %kind, "follow-up enqueued"),
                Err(err) => error!(parent = %job.id, kind = %kind, error = %err, "failed to enqueue follow-up"),
            }
        }

        Ok(ExecutionRecord::new(job, worker, path, ExecutionOutcome::Completed, started_at))
    }

    async fn handle_failure(
        &self,
        job: &Job,
        worker: &str,
        err: WorkflowError,
        started_at: DateTime<Utc>,
    ) -> Result<ExecutionRecord, StoreError> {
        let message = err.to_string();
        let (retry_at, outcome) = match self.retry.next_action(job, &err, Utc::now()) {
            NextAction::RetryAt(at) => (
                Some(at),
                ExecutionOutcome::RetryScheduled {
                    at,
                    error: message.clone(),
                },
            ),
            NextAction::GiveUp => (
                None,
                ExecutionOutcome::Failed {
                    error: message.clone(),
                },
            ),
        };

        match self.store.fail(job.id, job.attempt_count, &message, retry_at).await {
            Ok(_) => {}
            Err(StoreError::LeaseLost { .. }) => {
                warn!(job_id = %job.id, attempt = job.attempt_count, worker, "lease lost, failure discarded");
                return Ok(ExecutionRecord::new(job, worker, Vec::new(), ExecutionOutcome::LeaseLost, started_at));
            }
            Err(err) => return Err(err),
        }

        match retry_at {
            Some(at) => warn!(
                job_id = %job.id,
                kind = %job.kind,
                attempt = job.attempt_count,
                retry_at = %at,
                error = %message,
                "job failed, retry scheduled"
            ),
            None => error!(
                job_id = %job.id,
                kind = %job.kind,
                attempt = job.attempt_count,
                retryable = err.is_retryable(),
                error = %message,
                "job failed permanently"
            ),
        }
        Ok(ExecutionRecord::new(job, worker, Vec::new(), outcome, started_at))
    }

    /// Return abandoned processing jobs to the queue.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        let timeout = TimeDelta::from_std(self.config.processing_timeout).unwrap_or(TimeDelta::MAX);
        let cutoff = now.checked_sub_signed(timeout).unwrap_or(DateTime::<Utc>::MIN_UTC);
        let swept = self.store.reclaim_stale(cutoff, self.retry.max_attempts, now).await?;
        for job in &swept {
            warn!(
                job_id = %job.id,
                kind = %job.kind,
                attempt = job.attempt_count,
                status = %job.status,
                "stale lease reclaimed"
            );
        }
        Ok(swept)
    }

    /// Run worker loops, the sweeper and the metrics logger until `shutdown`
    /// flips to true. Jobs in flight finish before their worker exits.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        info!(
            workers = self.config.workers,
            poll_interval_ms = self.config.poll_interval.as_millis(),
            max_attempts = self.retry.max_attempts,
            kinds = ?self.registry.kinds().collect::<Vec<_>>(),
            "dispatcher started"
        );

        let mut tasks = JoinSet::new();
        for n in 1..=self.config.workers.max(1) {
            let worker = format!("{}-{n}", self.config.worker_prefix);
            tasks.spawn(self.clone().worker_loop(worker, shutdown.clone()));
        }
        tasks.spawn(self.clone().sweep_loop(shutdown.clone()));
        tasks.spawn(self.clone().metrics_loop(shutdown));

        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "dispatcher task aborted");
            }
        }
        info!("dispatcher stopped");
    }

    async fn worker_loop(self: Arc<Self>, worker: String, mut shutdown: watch::Receiver<bool>) {
        debug!(worker, "worker started");
        while !*shutdown.borrow() {
            match self.tick(&worker).await {
                // Drain the queue before sleeping.
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(err) => error!(worker, error = %err, "job write-back failed"),
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        debug!(worker, "worker stopped");
    }

    async fn sweep_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.sweep_interval) => {
                    if let Err(err) = self.sweep(Utc::now()).await {
                        error!(error = %err, "stale lease sweep failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn metrics_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let window = TimeDelta::from_std(self.config.metrics_interval).unwrap_or(TimeDelta::hours(1));
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.metrics_interval) => {
                    let now = Utc::now();
                    match self.store.metrics(now - window, now).await {
                        Ok(m) => info!(
                            pending = m.pending,
                            scheduled = m.scheduled,
                            processing = m.processing,
                            completed = m.completed,
                            failed = m.failed,
                            active_workers = m.active_workers,
                            avg_completion_secs = ?m.avg_completion_secs,
                            "queue metrics"
                        ),
                        Err(err) => warn!(error = %err, "failed to collect queue metrics"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
