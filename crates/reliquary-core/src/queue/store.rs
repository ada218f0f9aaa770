use super::error::QueueError;
use super::types::{EnqueueOutcome, FailOutcome, Job, JobStatus, JobType, NewJob, QueueStats};
use chrono::{DateTime, Utc};
use serde_json::Value;

/// Persistence behind [`JobQueue`](super::JobQueue).
///
/// Implementations must make `claim` atomic across every handle that shares
/// the same backing store, including handles in other processes: two
/// concurrent callers never receive the same job.
pub trait QueueStore: Send + Sync {
    /// Insert a pending job. When `idempotency_key` is already taken, returns
    /// the existing job id with `created = false` and writes nothing.
    fn insert(&self, job: &NewJob) -> Result<EnqueueOutcome, QueueError>;

    /// Move the highest-priority, oldest pending job to processing.
    fn claim(
        &self,
        worker_id: &str,
        job_type: Option<JobType>,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, QueueError>;

    /// processing -> completed.
    fn complete(
        &self,
        job_id: &str,
        result: Option<&Value>,
        now: DateTime<Utc>,
    ) -> Result<(), QueueError>;

    /// processing -> pending (retry budget left and `retry`), else failed.
    fn fail(
        &self,
        job_id: &str,
        error_message: &str,
        retry: bool,
        now: DateTime<Utc>,
    ) -> Result<FailOutcome, QueueError>;

    fn get(&self, job_id: &str) -> Result<Option<Job>, QueueError>;

    /// Newest first.
    fn list(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<Job>, QueueError>;

    fn stats(&self) -> Result<QueueStats, QueueError>;

    /// Processing jobs whose `started_at` is before `started_before`.
    fn stale_processing(&self, started_before: DateTime<Utc>) -> Result<Vec<Job>, QueueError>;
}
