//! Durable job queue.
//!
//! Jobs move `pending -> processing -> completed | failed`, with failed
//! attempts going back to `pending` while retry budget remains. The queue
//! is a thin facade over a [`QueueStore`]; the store owns atomicity.

pub mod error;
pub mod schema;
pub mod sqlite;
pub mod store;
pub mod types;

pub use error::QueueError;
pub use sqlite::SqliteQueueStore;
pub use store::QueueStore;
pub use types::{
    BundleCreatePayload, EnqueueOptions, EnqueueOutcome, FailOutcome, Job, JobPayload, JobStatus,
    JobType, NewJob, QueueStats, RehydratePayload, DEFAULT_CHUNK_SIZE_MB,
};

use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_MAX_RETRIES: u32 = 3;

#[derive(Clone)]
pub struct JobQueue {
    store: Arc<dyn QueueStore>,
    default_max_retries: u32,
}

impl JobQueue {
    pub fn new(store: Arc<dyn QueueStore>) -> Self {
        Self {
            store,
            default_max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_default_max_retries(mut self, max_retries: u32) -> Self {
        self.default_max_retries = max_retries;
        self
    }

    pub fn default_max_retries(&self) -> u32 {
        self.default_max_retries
    }

    /// Enqueue a job and return its id.
    ///
    /// With an idempotency key that is already taken, returns the existing
    /// job's id and enqueues nothing.
    pub fn enqueue(&self, payload: JobPayload, options: EnqueueOptions) -> Result<String, QueueError> {
        let job_type = payload.job_type();
        let new_job = NewJob {
            job_id: uuid::Uuid::new_v4().to_string(),
            payload,
            idempotency_key: options.idempotency_key,
            priority: options.priority,
            max_retries: options.max_retries.unwrap_or(self.default_max_retries),
            created_at: Utc::now(),
        };

        let outcome = self.store.insert(&new_job)?;
        if outcome.created {
            tracing::info!(
                job_id = %outcome.job_id,
                job_type = %job_type,
                priority = new_job.priority,
                "job enqueued"
            );
        } else {
            tracing::debug!(
                job_id = %outcome.job_id,
                idempotency_key = ?new_job.idempotency_key,
                "enqueue deduplicated"
            );
        }
        Ok(outcome.job_id)
    }

    /// Atomically claim the next job, or `None` when nothing matches.
    pub fn claim(&self, worker_id: &str, job_type: Option<JobType>) -> Result<Option<Job>, QueueError> {
        let job = self.store.claim(worker_id, job_type, Utc::now())?;
        if let Some(job) = &job {
            tracing::debug!(job_id = %job.job_id, worker_id, "job claimed");
        }
        Ok(job)
    }

    pub fn complete(&self, job_id: &str, result: Option<&Value>) -> Result<(), QueueError> {
        self.store.complete(job_id, result, Utc::now())?;
        tracing::info!(job_id, "job completed");
        Ok(())
    }

    /// Record a failed attempt. `retry = false` fails the job outright.
    pub fn fail(&self, job_id: &str, error_message: &str, retry: bool) -> Result<FailOutcome, QueueError> {
        let outcome = self.store.fail(job_id, error_message, retry, Utc::now())?;
        match outcome {
            FailOutcome::Requeued { retry_count } => {
                tracing::warn!(job_id, retry_count, error = error_message, "job requeued")
            }
            FailOutcome::Failed => tracing::error!(job_id, error = error_message, "job failed"),
        }
        Ok(outcome)
    }

    pub fn get(&self, job_id: &str) -> Result<Option<Job>, QueueError> {
        self.store.get(job_id)
    }

    pub fn list(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<Job>, QueueError> {
        self.store.list(status, limit)
    }

    pub fn stats(&self) -> Result<QueueStats, QueueError> {
        self.store.stats()
    }

    /// Jobs processing for longer than `older_than`. Read-only: nothing is
    /// reclaimed.
    pub fn stale_processing(&self, older_than: Duration) -> Result<Vec<Job>, QueueError> {
        let cutoff = chrono::Duration::from_std(older_than)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
            .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);
        self.store.stale_processing(cutoff)
    }
}
