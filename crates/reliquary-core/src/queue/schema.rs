//! SQLite schema for the job queue.
//!
//! Timestamps are RFC 3339 UTC with fixed microsecond precision, so text
//! ordering equals time ordering. `seq` breaks ties between jobs created in
//! the same microsecond.

/// DDL for the job queue.
///
/// Schema version: 1
pub const QUEUE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    seq              INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id           TEXT NOT NULL UNIQUE,
    job_type         TEXT NOT NULL CHECK (job_type IN ('bundle_create', 'rehydrate')),
    status           TEXT NOT NULL DEFAULT 'pending'
                     CHECK (status IN ('pending', 'processing', 'completed', 'failed')),
    payload          TEXT NOT NULL,
    idempotency_key  TEXT UNIQUE,
    priority         INTEGER NOT NULL DEFAULT 0,
    retry_count      INTEGER NOT NULL DEFAULT 0,
    max_retries      INTEGER NOT NULL DEFAULT 3,
    created_at       TEXT NOT NULL,
    started_at       TEXT,
    completed_at     TEXT,
    worker_id        TEXT,
    error_message    TEXT,
    result           TEXT
);

CREATE INDEX IF NOT EXISTS idx_jobs_claim
    ON jobs(status, priority DESC, created_at, seq);
CREATE INDEX IF NOT EXISTS idx_jobs_type_status
    ON jobs(job_type, status);
"#;
