//! SqliteQueueStore: SQLite-backed [`QueueStore`].
//!
//! Every mutation runs inside `BEGIN IMMEDIATE`, which takes the database
//! write lock up front. That lock is the mutual exclusion for `claim` across
//! connections and processes; the connection mutex covers threads sharing
//! one handle. Claim selects and updates in a single `UPDATE .. RETURNING`
//! statement.

use super::error::QueueError;
use super::schema::QUEUE_SCHEMA;
use super::store::QueueStore;
use super::types::{
    EnqueueOutcome, FailOutcome, Job, JobPayload, JobStatus, JobType, NewJob, QueueStats,
};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const JOB_COLUMNS: &str = "job_id, job_type, status, payload, idempotency_key, priority, \
     retry_count, max_retries, created_at, started_at, completed_at, worker_id, \
     error_message, result";

/// SQLite-backed job store.
#[derive(Clone)]
pub struct SqliteQueueStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteQueueStore {
    /// Open a file-backed store.
    pub fn open(path: &Path) -> Result<Self, QueueError> {
        Self::from_connection(Connection::open(path)?)
    }

    /// Create an in-memory store (for testing).
    pub fn memory() -> Result<Self, QueueError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    pub fn from_connection(conn: Connection) -> Result<Self, QueueError> {
        Self::init_connection(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_connection(conn: &Connection) -> Result<(), QueueError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        // WAL for file-backed DBs; in-memory reports "memory"
        let _ = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get::<_, String>(0));
        conn.execute_batch(QUEUE_SCHEMA)?;
        Ok(())
    }

    fn in_immediate<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, QueueError>,
    ) -> Result<T, QueueError> {
        let conn = self.conn.lock().unwrap();
        conn.execute("BEGIN IMMEDIATE", [])?;
        let result = f(&conn).and_then(|value| {
            conn.execute("COMMIT", [])?;
            Ok(value)
        });
        // a failed COMMIT can leave the transaction open on this connection
        if result.is_err() {
            let _ = conn.execute("ROLLBACK", []);
        }
        result
    }
}

fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>, QueueError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| QueueError::Corrupt {
            message: format!("bad timestamp '{s}': {e}"),
        })
}

/// Untyped row, converted to [`Job`] outside the rusqlite closure.
struct JobRow {
    job_id: String,
    job_type: String,
    status: String,
    payload: String,
    idempotency_key: Option<String>,
    priority: i64,
    retry_count: i64,
    max_retries: i64,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    worker_id: Option<String>,
    error_message: Option<String>,
    result: Option<String>,
}

impl JobRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            job_id: row.get(0)?,
            job_type: row.get(1)?,
            status: row.get(2)?,
            payload: row.get(3)?,
            idempotency_key: row.get(4)?,
            priority: row.get(5)?,
            retry_count: row.get(6)?,
            max_retries: row.get(7)?,
            created_at: row.get(8)?,
            started_at: row.get(9)?,
            completed_at: row.get(10)?,
            worker_id: row.get(11)?,
            error_message: row.get(12)?,
            result: row.get(13)?,
        })
    }

    fn into_job(self) -> Result<Job, QueueError> {
        let job_type: JobType = self.job_type.parse()?;
        let result = self
            .result
            .map(|r| serde_json::from_str::<Value>(&r))
            .transpose()
            .map_err(|e| QueueError::Corrupt {
                message: format!("job {}: bad result json: {e}", self.job_id),
            })?;
        Ok(Job {
            status: self.status.parse()?,
            payload: JobPayload::from_parts(job_type, &self.payload)?,
            idempotency_key: self.idempotency_key,
            priority: self.priority as i32,
            retry_count: self.retry_count as u32,
            max_retries: self.max_retries as u32,
            created_at: parse_ts(&self.created_at)?,
            started_at: self.started_at.as_deref().map(parse_ts).transpose()?,
            completed_at: self.completed_at.as_deref().map(parse_ts).transpose()?,
            worker_id: self.worker_id,
            error_message: self.error_message,
            result,
            job_id: self.job_id,
        })
    }
}

fn collect_jobs(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<Job>, QueueError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, JobRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(JobRow::into_job).collect()
}

/// Status plus retry counters for a transition check.
fn lock_row(
    conn: &Connection,
    job_id: &str,
    action: &'static str,
) -> Result<(u32, u32), QueueError> {
    let row: Option<(String, i64, i64)> = conn
        .query_row(
            "SELECT status, retry_count, max_retries FROM jobs WHERE job_id = ?",
            [job_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;
    let (status, retry_count, max_retries) = row.ok_or_else(|| QueueError::NotFound {
        job_id: job_id.to_string(),
    })?;
    let status: JobStatus = status.parse()?;
    if status != JobStatus::Processing {
        return Err(QueueError::InvalidTransition {
            job_id: job_id.to_string(),
            status,
            action,
        });
    }
    Ok((retry_count as u32, max_retries as u32))
}

impl QueueStore for SqliteQueueStore {
    fn insert(&self, job: &NewJob) -> Result<EnqueueOutcome, QueueError> {
        let payload = job.payload.to_json()?;
        self.in_immediate(|conn| {
            let inserted = conn.execute(
                r#"
                INSERT INTO jobs (
                    job_id, job_type, status, payload, idempotency_key,
                    priority, max_retries, created_at
                ) VALUES (?1, ?2, 'pending', ?3, ?4, ?5, ?6, ?7)
                ON CONFLICT(idempotency_key) DO NOTHING
                "#,
                params![
                    job.job_id,
                    job.payload.job_type().as_str(),
                    payload,
                    job.idempotency_key,
                    job.priority,
                    job.max_retries,
                    ts(job.created_at),
                ],
            )?;
            if inserted == 1 {
                return Ok(EnqueueOutcome {
                    job_id: job.job_id.clone(),
                    created: true,
                });
            }

            let existing: Option<String> = conn
                .query_row(
                    "SELECT job_id FROM jobs WHERE idempotency_key = ?",
                    [&job.idempotency_key],
                    |row| row.get(0),
                )
                .optional()?;
            let job_id = existing.ok_or_else(|| QueueError::Corrupt {
                message: "insert ignored but no row holds the idempotency key".into(),
            })?;
            Ok(EnqueueOutcome {
                job_id,
                created: false,
            })
        })
    }

    fn claim(
        &self,
        worker_id: &str,
        job_type: Option<JobType>,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, QueueError> {
        let sql = format!(
            r#"
            UPDATE jobs
            SET status = 'processing', worker_id = ?1, started_at = ?2
            WHERE seq = (
                SELECT seq FROM jobs
                WHERE status = 'pending' AND (?3 IS NULL OR job_type = ?3)
                ORDER BY priority DESC, created_at ASC, seq ASC
                LIMIT 1
            )
            RETURNING {JOB_COLUMNS}
            "#
        );
        self.in_immediate(|conn| loop {
            let row = conn
                .query_row(
                    &sql,
                    params![worker_id, ts(now), job_type.map(|t| t.as_str())],
                    JobRow::from_row,
                )
                .optional()?;
            let Some(row) = row else {
                return Ok(None);
            };
            let job_id = row.job_id.clone();
            match row.into_job() {
                Ok(job) => return Ok(Some(job)),
                Err(e) => {
                    // undecodable rows would otherwise sit in processing forever
                    tracing::warn!(job_id = %job_id, error = %e, "failing undecodable job");
                    conn.execute(
                        "UPDATE jobs SET status = 'failed', completed_at = ?1, error_message = ?2 \
                         WHERE job_id = ?3",
                        params![ts(now), e.to_string(), job_id],
                    )?;
                }
            }
        })
    }

    fn complete(
        &self,
        job_id: &str,
        result: Option<&Value>,
        now: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        let result = result.map(|v| v.to_string());
        self.in_immediate(|conn| {
            lock_row(conn, job_id, "complete")?;
            conn.execute(
                "UPDATE jobs SET status = 'completed', completed_at = ?1, result = ?2 \
                 WHERE job_id = ?3",
                params![ts(now), result, job_id],
            )?;
            Ok(())
        })
    }

    fn fail(
        &self,
        job_id: &str,
        error_message: &str,
        retry: bool,
        now: DateTime<Utc>,
    ) -> Result<FailOutcome, QueueError> {
        self.in_immediate(|conn| {
            let (retry_count, max_retries) = lock_row(conn, job_id, "fail")?;
            if retry && retry_count < max_retries {
                conn.execute(
                    r#"
                    UPDATE jobs
                    SET status = 'pending', retry_count = retry_count + 1,
                        worker_id = NULL, started_at = NULL, error_message = ?1
                    WHERE job_id = ?2
                    "#,
                    params![error_message, job_id],
                )?;
                Ok(FailOutcome::Requeued {
                    retry_count: retry_count + 1,
                })
            } else {
                conn.execute(
                    "UPDATE jobs SET status = 'failed', completed_at = ?1, error_message = ?2 \
                     WHERE job_id = ?3",
                    params![ts(now), error_message, job_id],
                )?;
                Ok(FailOutcome::Failed)
            }
        })
    }

    fn get(&self, job_id: &str) -> Result<Option<Job>, QueueError> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE job_id = ?"),
                [job_id],
                JobRow::from_row,
            )
            .optional()?;
        row.map(JobRow::into_job).transpose()
    }

    fn list(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<Job>, QueueError> {
        let conn = self.conn.lock().unwrap();
        collect_jobs(
            &conn,
            &format!(
                "SELECT {JOB_COLUMNS} FROM jobs WHERE (?1 IS NULL OR status = ?1) \
                 ORDER BY created_at DESC, seq DESC LIMIT ?2"
            ),
            params![status.map(|s| s.as_str()), limit as i64],
        )
    }

    fn stats(&self) -> Result<QueueStats, QueueError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM jobs GROUP BY status")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stats = QueueStats::default();
        for (status, count) in rows {
            let count = count as u64;
            match status.parse::<JobStatus>()? {
                JobStatus::Pending => stats.pending = count,
                JobStatus::Processing => stats.processing = count,
                JobStatus::Completed => stats.completed = count,
                JobStatus::Failed => stats.failed = count,
            }
        }
        Ok(stats)
    }

    fn stale_processing(&self, started_before: DateTime<Utc>) -> Result<Vec<Job>, QueueError> {
        let conn = self.conn.lock().unwrap();
        collect_jobs(
            &conn,
            &format!(
                "SELECT {JOB_COLUMNS} FROM jobs WHERE status = 'processing' AND started_at < ?1 \
                 ORDER BY started_at ASC, seq ASC"
            ),
            params![ts(started_before)],
        )
    }
}
