use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::state::{InvalidTransition, StateMachine, Transition};

/// Opaque, immutable job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// The closed set of workflow identifiers a job can be created with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    SyllabusGeneration,
    LessonContent,
    LessonInteraction,
    OnboardingAssessment,
}

impl JobKind {
    pub const ALL: [JobKind; 4] = [
        JobKind::SyllabusGeneration,
        JobKind::LessonContent,
        JobKind::LessonInteraction,
        JobKind::OnboardingAssessment,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::SyllabusGeneration => "syllabus_generation",
            JobKind::LessonContent => "lesson_content",
            JobKind::LessonInteraction => "lesson_interaction",
            JobKind::OnboardingAssessment => "onboarding_assessment",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a job type string names no known workflow.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown workflow type: {0}")]
pub struct UnknownJobKind(pub String);

impl FromStr for JobKind {
    type Err = UnknownJobKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        JobKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| UnknownJobKind(s.to_string()))
    }
}

/// Lifecycle status of a job. See [`StateMachine`] for the legal transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("invalid job status: {other}")),
        }
    }
}

/// Optional domain back-references. The engine never reads these; callers use
/// them for authorization and filtering.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOwner {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub syllabus_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lesson_id: Option<String>,
}

impl JobOwner {
    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            ..Default::default()
        }
    }
}

/// A request to create a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub kind: JobKind,
    pub input: Value,
    #[serde(default)]
    pub owner: JobOwner,
}

impl NewJob {
    pub fn new(kind: JobKind, input: Value) -> Self {
        Self {
            kind,
            input,
            owner: JobOwner::default(),
        }
    }

    pub fn with_owner(mut self, owner: JobOwner) -> Self {
        self.owner = owner;
        self
    }
}

/// A unit of asynchronous work as recorded by the job store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    pub status: JobStatus,
    pub input: Value,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub attempt_count: u32,
    /// Earliest time a pending job may be claimed. `None` means immediately.
    pub run_after: Option<DateTime<Utc>>,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub owner: JobOwner,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(new: NewJob, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            kind: new.kind,
            status: JobStatus::Pending,
            input: new.input,
            result: None,
            error: None,
            attempt_count: 0,
            run_after: None,
            claimed_by: None,
            claimed_at: None,
            owner: new.owner,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether a pending job's retry delay has elapsed.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.run_after.is_none_or(|at| at <= now)
    }

    /// Apply a lifecycle transition, updating every field the transition owns.
    pub fn apply(&mut self, transition: Transition, now: DateTime<Utc>) -> Result<(), InvalidTransition> {
        let next = StateMachine::next(self.status, &transition)?;

        match transition {
            Transition::Claim { worker } => {
                self.attempt_count += 1;
                self.error = None;
                self.claimed_by = Some(worker);
                self.claimed_at = Some(now);
                self.run_after = None;
            }
            Transition::Complete { result } => {
                self.result = Some(result);
                self.error = None;
                self.run_after = None;
                self.claimed_by = None;
            }
            Transition::Retry { error, at } => {
                self.error = Some(error);
                self.run_after = Some(at);
                self.claimed_by = None;
            }
            Transition::GiveUp { error } => {
                self.error = Some(error);
                self.run_after = None;
                self.claimed_by = None;
            }
            Transition::Expire { error, give_up } => {
                // A requeued lease burns an attempt; a final one is already counted.
                if !give_up {
                    self.attempt_count += 1;
                }
                self.error = Some(error);
                self.claimed_by = None;
                self.run_after = if give_up { None } else { Some(now) };
            }
        }

        self.status = next;
        self.updated_at = now;
        Ok(())
    }
}

/// How one execution of a job ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Completed,
    RetryScheduled { at: DateTime<Utc>, error: String },
    Failed { error: String },
    /// The lease was swept while the workflow ran; the write-back was discarded.
    LeaseLost,
}

/// Audit record produced by the dispatcher after each execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub job_id: JobId,
    pub kind: JobKind,
    pub worker: String,
    pub attempt: u32,
    /// Steps visited in order, terminal included. Empty when the workflow
    /// failed before reaching a terminal step.
    pub path: Vec<String>,
    pub outcome: ExecutionOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: i64,
}

impl ExecutionRecord {
    pub fn new(
        job: &Job,
        worker: &str,
        path: Vec<String>,
        outcome: ExecutionOutcome,
        started_at: DateTime<Utc>,
    ) -> Self {
        let finished_at = Utc::now();
        Self {
            job_id: job.id,
            kind: job.kind,
            worker: worker.to_string(),
            attempt: job.attempt_count,
            path,
            outcome,
            started_at,
            finished_at,
            duration_ms: (finished_at - started_at).num_milliseconds(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn make_job() -> Job {
        Job::new(
            NewJob::new(JobKind::SyllabusGeneration, json!({"topic": "Graph Theory"})),
            Utc::now(),
        )
    }

    #[test]
    fn job_creation_defaults() {
        let job = make_job();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempt_count, 0);
        assert!(job.result.is_none());
        assert!(job.error.is_none());
        assert!(job.is_due(Utc::now()));
    }

    #[test]
    fn job_kind_parses_known_and_rejects_unknown() {
        assert_eq!("syllabus_generation".parse::<JobKind>(), Ok(JobKind::SyllabusGeneration));
        assert_eq!("lesson-content".parse::<JobKind>(), Ok(JobKind::LessonContent));
        assert_eq!(
            "quiz_interaction".parse::<JobKind>(),
            Err(UnknownJobKind("quiz_interaction".into()))
        );
    }

    #[test]
    fn claim_increments_attempts_and_records_worker() {
        let mut job = make_job();
        let now = Utc::now();
        job.apply(Transition::Claim { worker: "w-1".into() }, now).unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.attempt_count, 1);
        assert_eq!(job.claimed_by.as_deref(), Some("w-1"));
        assert_eq!(job.claimed_at, Some(now));
    }

    #[test]
    fn complete_sets_result_and_clears_error() {
        let mut job = make_job();
        let now = Utc::now();
        job.apply(Transition::Claim { worker: "w".into() }, now).unwrap();
        job.apply(
            Transition::Retry {
                error: "timeout".into(),
                at: now,
            },
            now,
        )
        .unwrap();
        assert_eq!(job.error.as_deref(), Some("timeout"));

        job.apply(Transition::Claim { worker: "w".into() }, now).unwrap();
        job.apply(Transition::Complete { result: json!({"ok": true}) }, now)
            .unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.error.is_none());
        assert_eq!(job.result, Some(json!({"ok": true})));
    }

    #[test]
    fn claim_clears_previous_attempt_error() {
        let mut job = make_job();
        let now = Utc::now();
        job.apply(Transition::Claim { worker: "w".into() }, now).unwrap();
        job.apply(
            Transition::Retry {
                error: "timeout".into(),
                at: now,
            },
            now,
        )
        .unwrap();
        job.apply(Transition::Claim { worker: "w".into() }, now).unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert!(job.error.is_none());
    }

    #[test]
    fn final_expire_does_not_count_past_the_claim() {
        let mut job = make_job();
        let now = Utc::now();
        job.apply(Transition::Claim { worker: "w".into() }, now).unwrap();
        job.apply(
            Transition::Expire {
                error: "lease".into(),
                give_up: false,
            },
            now,
        )
        .unwrap();
        assert_eq!(job.attempt_count, 2);

        job.apply(Transition::Claim { worker: "w".into() }, now).unwrap();
        job.apply(
            Transition::Expire {
                error: "lease".into(),
                give_up: true,
            },
            now,
        )
        .unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempt_count, 3);
        assert!(job.run_after.is_none());
    }

    #[test]
    fn retry_delays_eligibility() {
        let mut job = make_job();
        let now = Utc::now();
        let later = now + chrono::Duration::minutes(5);
        job.apply(Transition::Claim { worker: "w".into() }, now).unwrap();
        job.apply(
            Transition::Retry {
                error: "boom".into(),
                at: later,
            },
            now,
        )
        .unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(!job.is_due(now));
        assert!(job.is_due(later));
    }

    #[test]
    fn terminal_job_rejects_further_transitions() {
        let mut job = make_job();
        let now = Utc::now();
        job.apply(Transition::Claim { worker: "w".into() }, now).unwrap();
        job.apply(Transition::GiveUp { error: "fatal".into() }, now).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.apply(Transition::Claim { worker: "w".into() }, now).is_err());
        assert_eq!(job.attempt_count, 1);
    }

    #[test]
    fn job_serialization_roundtrip() {
        let job = make_job();
        let json = serde_json::to_string(&job).unwrap();
        let deserialized: Job = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized.id, job.id);
        assert_eq!(deserialized.kind, JobKind::SyllabusGeneration);
        assert!(json.contains("\"syllabus_generation\""));
    }

    #[test]
    fn execution_record_from_job() {
        let mut job = make_job();
        let started = Utc::now();
        job.apply(Transition::Claim { worker: "w-2".into() }, started).unwrap();
        let record = ExecutionRecord::new(
            &job,
            "w-2",
            vec!["initialize".into(), "finalize".into()],
            ExecutionOutcome::Completed,
            started,
        );
        assert_eq!(record.job_id, job.id);
        assert_eq!(record.attempt, 1);
        assert!(record.duration_ms >= 0);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["outcome"]["status"], "completed");
    }
}
