//! Job model: types, statuses, payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use super::error::QueueError;

pub const DEFAULT_CHUNK_SIZE_MB: u64 = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    BundleCreate,
    Rehydrate,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::BundleCreate => "bundle_create",
            JobType::Rehydrate => "rehydrate",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bundle_create" => Ok(JobType::BundleCreate),
            "rehydrate" => Ok(JobType::Rehydrate),
            other => Err(QueueError::Corrupt {
                message: format!("unknown job type '{other}'"),
            }),
        }
    }
}

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
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(QueueError::Corrupt {
                message: format!("unknown job status '{other}'"),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BundleCreatePayload {
    pub incident_id: String,
    #[serde(default = "default_chunk_size_mb")]
    pub chunk_size_mb: u64,
}

fn default_chunk_size_mb() -> u64 {
    DEFAULT_CHUNK_SIZE_MB
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RehydratePayload {
    pub bundle_path: PathBuf,
    #[serde(default = "default_verify_signature")]
    pub verify_signature: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

fn default_verify_signature() -> bool {
    true
}

/// Closed set of job bodies. The stored `job_type` column always matches
/// the variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobPayload {
    BundleCreate(BundleCreatePayload),
    Rehydrate(RehydratePayload),
}

impl JobPayload {
    pub fn bundle_create(incident_id: impl Into<String>, chunk_size_mb: u64) -> Self {
        JobPayload::BundleCreate(BundleCreatePayload {
            incident_id: incident_id.into(),
            chunk_size_mb,
        })
    }

    pub fn rehydrate(
        bundle_path: impl Into<PathBuf>,
        verify_signature: bool,
        idempotency_key: Option<String>,
    ) -> Self {
        JobPayload::Rehydrate(RehydratePayload {
            bundle_path: bundle_path.into(),
            verify_signature,
            idempotency_key,
        })
    }

    pub fn job_type(&self) -> JobType {
        match self {
            JobPayload::BundleCreate(_) => JobType::BundleCreate,
            JobPayload::Rehydrate(_) => JobType::Rehydrate,
        }
    }

    /// JSON stored in the `payload` column.
    pub fn to_json(&self) -> Result<String, QueueError> {
        let encoded = match self {
            JobPayload::BundleCreate(p) => serde_json::to_string(p),
            JobPayload::Rehydrate(p) => serde_json::to_string(p),
        };
        encoded.map_err(|e| QueueError::Payload {
            message: e.to_string(),
        })
    }

    pub fn from_parts(job_type: JobType, json: &str) -> Result<Self, QueueError> {
        let payload = match job_type {
            JobType::BundleCreate => serde_json::from_str(json).map(JobPayload::BundleCreate),
            JobType::Rehydrate => serde_json::from_str(json).map(JobPayload::Rehydrate),
        };
        payload.map_err(|e| QueueError::Payload {
            message: format!("{job_type}: {e}"),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub job_id: String,
    pub status: JobStatus,
    pub payload: JobPayload,
    pub idempotency_key: Option<String>,
    pub priority: i32,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,
    pub error_message: Option<String>,
    pub result: Option<Value>,
}

impl Job {
    pub fn job_type(&self) -> JobType {
        self.payload.job_type()
    }
}

/// Enqueue parameters beyond the payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnqueueOptions {
    pub idempotency_key: Option<String>,
    /// Higher runs first.
    pub priority: i32,
    /// Falls back to the queue default when unset.
    pub max_retries: Option<u32>,
}

impl EnqueueOptions {
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// A fully specified row for [`QueueStore::insert`](super::QueueStore::insert).
#[derive(Debug, Clone)]
pub struct NewJob {
    pub job_id: String,
    pub payload: JobPayload,
    pub idempotency_key: Option<String>,
    pub priority: i32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueOutcome {
    pub job_id: String,
    /// False when an existing job with the same idempotency key was returned.
    pub created: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Back to pending; `retry_count` after the increment.
    Requeued { retry_count: u32 },
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
}

impl QueueStats {
    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.completed + self.failed
    }
}
