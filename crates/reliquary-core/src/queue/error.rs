use super::types::JobStatus;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("job not found: {job_id}")]
    NotFound { job_id: String },

    #[error("cannot {action} job {job_id} in status {status}")]
    InvalidTransition {
        job_id: String,
        status: JobStatus,
        action: &'static str,
    },

    #[error("invalid job payload: {message}")]
    Payload { message: String },

    #[error("corrupt queue row: {message}")]
    Corrupt { message: String },

    #[error("queue database error: {0}")]
    Database(String),
}

impl QueueError {
    /// Database errors are usually lock contention or I/O.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Database(_))
    }
}

impl From<rusqlite::Error> for QueueError {
    fn from(e: rusqlite::Error) -> Self {
        QueueError::Database(e.to_string())
    }
}
