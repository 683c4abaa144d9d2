use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::debug;

use super::{JobStore, LEASE_EXPIRED, QueueMetrics};
use crate::error::StoreError;
use crate::state_machine::{Job, JobId, JobOwner, JobStatus, NewJob};

const JOB_COLUMNS: &str = "id, kind, status, input, result, error, attempt_count, run_after, \
     claimed_by, claimed_at, user_id, syllabus_id, lesson_id, created_at, updated_at";

/// Open a pool on `database_url`, creating the database file if needed.
///
/// In-memory databases are pinned to a single connection that never idles
/// out, otherwise each new connection would see an empty database.
pub async fn open_pool(database_url: &str, max_connections: u32) -> Result<SqlitePool, StoreError> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .busy_timeout(Duration::from_secs(5));

    let pool = if database_url.contains(":memory:") {
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?
    } else {
        SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options.journal_mode(SqliteJournalMode::Wal))
            .await?
    };
    Ok(pool)
}

/// Job store backed by a SQLite table. This is the system of record.
#[derive(Debug, Clone)]
pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    /// Wrap `pool`, creating the schema if it does not exist yet.
    pub async fn new(pool: SqlitePool) -> Result<Self, StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id             TEXT PRIMARY KEY,
                kind           TEXT NOT NULL,
                status         TEXT NOT NULL,
                input          TEXT NOT NULL,
                result         TEXT NULL,
                error          TEXT NULL,
                attempt_count  INTEGER NOT NULL DEFAULT 0,
                run_after      INTEGER NULL,
                claimed_by     TEXT NULL,
                claimed_at     INTEGER NULL,
                user_id        TEXT NULL,
                syllabus_id    TEXT NULL,
                lesson_id      TEXT NULL,
                created_at     INTEGER NOT NULL,
                updated_at     INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS jobs_status_created ON jobs (status, created_at)")
            .execute(&pool)
            .await?;

        Ok(Self { pool })
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = open_pool(database_url, max_connections).await?;
        Self::new(pool).await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Distinguish a missing job from one whose lease moved on.
    async fn fenced_out(&self, id: JobId, attempt: u32) -> StoreError {
        match self.get(id).await {
            Ok(_) => StoreError::LeaseLost { id, attempt },
            Err(err) => err,
        }
    }
}

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| StoreError::Storage(format!("timestamp out of range: {ms}")))
}

fn job_from_row(row: &SqliteRow) -> Result<Job, StoreError> {
    let id: String = row.try_get("id")?;
    let kind: String = row.try_get("kind")?;
    let status: String = row.try_get("status")?;
    let input: String = row.try_get("input")?;
    let result: Option<String> = row.try_get("result")?;
    let attempt_count: i64 = row.try_get("attempt_count")?;
    let run_after: Option<i64> = row.try_get("run_after")?;
    let claimed_at: Option<i64> = row.try_get("claimed_at")?;

    Ok(Job {
        id: JobId::from_str(&id).map_err(|e| StoreError::Storage(format!("bad job id {id}: {e}")))?,
        kind: kind.parse().map_err(|e| StoreError::Storage(format!("{e}")))?,
        status: status.parse::<JobStatus>().map_err(StoreError::Storage)?,
        input: serde_json::from_str(&input)?,
        result: result.as_deref().map(serde_json::from_str).transpose()?,
        error: row.try_get("error")?,
        attempt_count: u32::try_from(attempt_count).unwrap_or(u32::MAX),
        run_after: run_after.map(from_millis).transpose()?,
        claimed_by: row.try_get("claimed_by")?,
        claimed_at: claimed_at.map(from_millis).transpose()?,
        owner: JobOwner {
            user_id: row.try_get("user_id")?,
            syllabus_id: row.try_get("syllabus_id")?,
            lesson_id: row.try_get("lesson_id")?,
        },
        created_at: from_millis(row.try_get("created_at")?)?,
        updated_at: from_millis(row.try_get("updated_at")?)?,
    })
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn create(&self, new: NewJob) -> Result<Job, StoreError> {
        let job = Job::new(new, Utc::now());
        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, kind, status, input, attempt_count,
                user_id, syllabus_id, lesson_id, created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6, ?7, ?8, ?8)
            "#,
        )
        .bind(job.id.to_string())
        .bind(job.kind.as_str())
        .bind(job.status.as_str())
        .bind(job.input.to_string())
        .bind(job.owner.user_id.as_deref())
        .bind(job.owner.syllabus_id.as_deref())
        .bind(job.owner.lesson_id.as_deref())
        .bind(millis(job.created_at))
        .execute(&self.pool)
        .await?;

        debug!(job_id = %job.id, kind = %job.kind, "job created");
        Ok(job)
    }

    async fn claim_next(&self, worker: &str, now: DateTime<Utc>) -> Result<Option<Job>, StoreError> {
        // Selection and transition happen in one statement, so SQLite's
        // write lock serializes competing claimers.
        let sql = format!(
            r#"
            UPDATE jobs
            SET status = 'processing',
                attempt_count = attempt_count + 1,
                claimed_by = ?1,
                claimed_at = ?2,
                run_after = NULL,
                error = NULL,
                updated_at = ?2
            WHERE id = (
                SELECT id FROM jobs
                WHERE status = 'pending' AND (run_after IS NULL OR run_after <= ?2)
                ORDER BY created_at, rowid
                LIMIT 1
            )
            AND status = 'pending'
            RETURNING {JOB_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(worker)
            .bind(millis(now))
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(job_from_row).transpose()
    }

    async fn complete(&self, id: JobId, attempt: u32, result: Value) -> Result<Job, StoreError> {
        let sql = format!(
            r#"
            UPDATE jobs
            SET status = 'completed', result = ?1, error = NULL, run_after = NULL,
                claimed_by = NULL, updated_at = ?2
            WHERE id = ?3 AND attempt_count = ?4 AND status = 'processing'
            RETURNING {JOB_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(result.to_string())
            .bind(millis(Utc::now()))
            .bind(id.to_string())
            .bind(i64::from(attempt))
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => job_from_row(&row),
            None => Err(self.fenced_out(id, attempt).await),
        }
    }

    async fn fail(
        &self,
        id: JobId,
        attempt: u32,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<Job, StoreError> {
        let status = if retry_at.is_some() {
            JobStatus::Pending
        } else {
            JobStatus::Failed
        };
        let sql = format!(
            r#"
            UPDATE jobs
            SET status = ?1, error = ?2, run_after = ?3, claimed_by = NULL, updated_at = ?4
            WHERE id = ?5 AND attempt_count = ?6 AND status = 'processing'
            RETURNING {JOB_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(status.as_str())
            .bind(error)
            .bind(retry_at.map(millis))
            .bind(millis(Utc::now()))
            .bind(id.to_string())
            .bind(i64::from(attempt))
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => job_from_row(&row),
            None => Err(self.fenced_out(id, attempt).await),
        }
    }

    async fn get(&self, id: JobId) -> Result<Job, StoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1");
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => job_from_row(&row),
            None => Err(StoreError::NotFound(id)),
        }
    }

    async fn reclaim_stale(
        &self,
        cutoff: DateTime<Utc>,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, StoreError> {
        // SET expressions read the pre-update attempt_count.
        let sql = format!(
            r#"
            UPDATE jobs
            SET status = CASE WHEN attempt_count + 1 >= ?1 THEN 'failed' ELSE 'pending' END,
                run_after = CASE WHEN attempt_count + 1 >= ?1 THEN NULL ELSE ?2 END,
                attempt_count = CASE WHEN attempt_count + 1 >= ?1 THEN attempt_count ELSE attempt_count + 1 END,
                error = ?3,
                claimed_by = NULL,
                updated_at = ?2
            WHERE status = 'processing' AND claimed_at <= ?4
            RETURNING {JOB_COLUMNS}
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(i64::from(max_attempts))
            .bind(millis(now))
            .bind(LEASE_EXPIRED)
            .bind(millis(cutoff))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(job_from_row).collect()
    }

    async fn metrics(&self, since: DateTime<Utc>, now: DateTime<Utc>) -> Result<QueueMetrics, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                SUM(CASE WHEN status = 'pending' THEN 1 ELSE 0 END) AS pending,
                SUM(CASE WHEN status = 'pending' AND run_after > ?2 THEN 1 ELSE 0 END) AS scheduled,
                SUM(CASE WHEN status = 'processing' THEN 1 ELSE 0 END) AS processing,
                SUM(CASE WHEN status = 'completed' AND updated_at >= ?1 THEN 1 ELSE 0 END) AS completed,
                SUM(CASE WHEN status = 'failed' AND updated_at >= ?1 THEN 1 ELSE 0 END) AS failed,
                AVG(CASE WHEN status = 'completed' AND updated_at >= ?1
                    THEN (updated_at - created_at) / 1000.0 END) AS avg_completion_secs,
                COUNT(DISTINCT CASE WHEN status = 'processing' THEN claimed_by END) AS active_workers
            FROM jobs
            "#,
        )
        .bind(millis(since))
        .bind(millis(now))
        .fetch_one(&self.pool)
        .await?;

        let count = |name: &str| -> Result<u64, StoreError> {
            let value: Option<i64> = row.try_get(name)?;
            Ok(value.unwrap_or(0).max(0) as u64)
        };

        let kinds = sqlx::query("SELECT kind, COUNT(*) AS n FROM jobs WHERE created_at >= ?1 GROUP BY kind")
            .bind(millis(since))
            .fetch_all(&self.pool)
            .await?;
        let mut by_kind = BTreeMap::new();
        for kind in &kinds {
            let n: i64 = kind.try_get("n")?;
            by_kind.insert(kind.try_get::<String, _>("kind")?, n.max(0) as u64);
        }

        Ok(QueueMetrics {
            since: Some(since),
            pending: count("pending")?,
            scheduled: count("scheduled")?,
            processing: count("processing")?,
            completed: count("completed")?,
            failed: count("failed")?,
            by_kind,
            avg_completion_secs: row.try_get("avg_completion_secs")?,
            active_workers: count("active_workers")?,
        })
    }
}
