//! StateStore: SQLite-backed restored incident state.
//!
//! Holds what rehydration writes: timeline entries, alerts, restored
//! artifact locations, and the idempotency records that make a rehydration
//! happen at most once per key.

pub mod schema;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use schema::STATE_SCHEMA;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum StateError {
    #[error("corrupt state row: {message}")]
    Corrupt { message: String },

    #[error("state database error: {0}")]
    Database(String),
}

impl StateError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Database(_))
    }
}

impl From<rusqlite::Error> for StateError {
    fn from(e: rusqlite::Error) -> Self {
        StateError::Database(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Timeline,
    Alert,
}

impl RecordKind {
    fn table(&self) -> &'static str {
        match self {
            RecordKind::Timeline => "timeline_entries",
            RecordKind::Alert => "alerts",
        }
    }

    fn id_column(&self) -> &'static str {
        match self {
            RecordKind::Timeline => "entry_id",
            RecordKind::Alert => "alert_id",
        }
    }
}

/// One timeline entry or alert, already canonicalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateRecord {
    pub record_id: String,
    /// `sha256:` over `body`.
    pub content_hash: String,
    /// Canonical JSON.
    pub body: String,
}

/// Everything one rehydration merges, applied in a single transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreBatch {
    pub incident_id: String,
    pub timeline: Vec<StateRecord>,
    pub alerts: Vec<StateRecord>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeCounts {
    pub restored: usize,
    /// Already present. Includes records whose stored content differs.
    pub unchanged: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub timeline: MergeCounts,
    pub alerts: MergeCounts,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoredArtifact {
    pub incident_id: String,
    /// Path inside the bundle.
    pub path: String,
    pub sha256: String,
    pub size: u64,
    pub stored_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencyRecord {
    pub key: String,
    pub incident_id: String,
    pub status: String,
    pub processed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateCounts {
    pub timeline: u64,
    pub alerts: u64,
    pub artifacts: u64,
}

/// SQLite-backed incident state.
#[derive(Clone)]
pub struct StateStore {
    conn: Arc<Mutex<Connection>>,
}

impl StateStore {
    /// Open a file-backed store.
    pub fn open(path: &Path) -> Result<Self, StateError> {
        Self::from_connection(Connection::open(path)?)
    }

    /// Create an in-memory store (for testing).
    pub fn memory() -> Result<Self, StateError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    pub fn from_connection(conn: Connection) -> Result<Self, StateError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        let _ = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get::<_, String>(0));
        conn.execute_batch(STATE_SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Merge timeline entries and alerts. Records already present are left
    /// untouched; a differing body on an existing id is logged and kept.
    pub fn apply(&self, batch: &RestoreBatch, now: DateTime<Utc>) -> Result<ApplyOutcome, StateError> {
        let conn = self.conn.lock().unwrap();

        conn.execute("BEGIN IMMEDIATE", [])?;
        let result = apply_inner(&conn, batch, &ts(now)).and_then(|outcome| {
            conn.execute("COMMIT", [])?;
            Ok(outcome)
        });
        // a failed COMMIT can leave the transaction open on this connection
        if result.is_err() {
            let _ = conn.execute("ROLLBACK", []);
        }
        result
    }

    /// Upsert where a restored artifact now lives.
    pub fn record_artifact(&self, artifact: &RestoredArtifact, now: DateTime<Utc>) -> Result<(), StateError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO restored_artifacts (incident_id, path, sha256, size, stored_path, restored_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(incident_id, path) DO UPDATE SET
                sha256 = excluded.sha256,
                size = excluded.size,
                stored_path = excluded.stored_path,
                restored_at = excluded.restored_at
            "#,
            params![
                artifact.incident_id,
                artifact.path,
                artifact.sha256,
                artifact.size as i64,
                artifact.stored_path.to_string_lossy(),
                ts(now),
            ],
        )?;
        Ok(())
    }

    pub fn idempotency_record(&self, key: &str) -> Result<Option<IdempotencyRecord>, StateError> {
        let conn = self.conn.lock().unwrap();
        let row: Option<(String, String, String, String)> = conn
            .query_row(
                "SELECT idempotency_key, incident_id, status, processed_at \
                 FROM idempotency_records WHERE idempotency_key = ?",
                [key],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;

        row.map(|(key, incident_id, status, processed_at)| {
            Ok(IdempotencyRecord {
                key,
                incident_id,
                status,
                processed_at: parse_ts(&processed_at)?,
            })
        })
        .transpose()
    }

    /// Write-once. Returns false when the key was already recorded.
    pub fn record_idempotency(&self, record: &IdempotencyRecord) -> Result<bool, StateError> {
        let conn = self.conn.lock().unwrap();
        let inserted = conn.execute(
            "INSERT INTO idempotency_records (idempotency_key, incident_id, status, processed_at) \
             VALUES (?1, ?2, ?3, ?4) ON CONFLICT(idempotency_key) DO NOTHING",
            params![
                record.key,
                record.incident_id,
                record.status,
                ts(record.processed_at)
            ],
        )?;
        Ok(inserted == 1)
    }

    pub fn get_record(
        &self,
        kind: RecordKind,
        incident_id: &str,
        record_id: &str,
    ) -> Result<Option<StateRecord>, StateError> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT {id}, content_hash, body FROM {table} WHERE incident_id = ?1 AND {id} = ?2",
            id = kind.id_column(),
            table = kind.table(),
        );
        Ok(conn
            .query_row(&sql, params![incident_id, record_id], |row| {
                Ok(StateRecord {
                    record_id: row.get(0)?,
                    content_hash: row.get(1)?,
                    body: row.get(2)?,
                })
            })
            .optional()?)
    }

    pub fn counts(&self, incident_id: &str) -> Result<StateCounts, StateError> {
        let conn = self.conn.lock().unwrap();
        let count = |table: &str| -> Result<u64, StateError> {
            let n: i64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM {table} WHERE incident_id = ?"),
                [incident_id],
                |row| row.get(0),
            )?;
            Ok(n as u64)
        };
        Ok(StateCounts {
            timeline: count("timeline_entries")?,
            alerts: count("alerts")?,
            artifacts: count("restored_artifacts")?,
        })
    }
}

fn apply_inner(conn: &Connection, batch: &RestoreBatch, now: &str) -> Result<ApplyOutcome, StateError> {
    Ok(ApplyOutcome {
        timeline: merge(conn, RecordKind::Timeline, &batch.incident_id, &batch.timeline, now)?,
        alerts: merge(conn, RecordKind::Alert, &batch.incident_id, &batch.alerts, now)?,
    })
}

fn merge(
    conn: &Connection,
    kind: RecordKind,
    incident_id: &str,
    records: &[StateRecord],
    now: &str,
) -> Result<MergeCounts, StateError> {
    let mut insert = conn.prepare(&format!(
        "INSERT INTO {table} (incident_id, {id}, content_hash, body, restored_at) \
         VALUES (?1, ?2, ?3, ?4, ?5) ON CONFLICT(incident_id, {id}) DO NOTHING",
        table = kind.table(),
        id = kind.id_column(),
    ))?;
    let mut existing = conn.prepare(&format!(
        "SELECT content_hash FROM {table} WHERE incident_id = ?1 AND {id} = ?2",
        table = kind.table(),
        id = kind.id_column(),
    ))?;

    let mut counts = MergeCounts::default();
    for record in records {
        let inserted = insert.execute(params![
            incident_id,
            record.record_id,
            record.content_hash,
            record.body,
            now
        ])?;
        if inserted == 1 {
            counts.restored += 1;
            continue;
        }

        counts.unchanged += 1;
        let stored: String = existing.query_row(params![incident_id, record.record_id], |row| row.get(0))?;
        if stored != record.content_hash {
            tracing::warn!(
                incident_id,
                table = kind.table(),
                record_id = %record.record_id,
                stored = %stored,
                incoming = %record.content_hash,
                "record exists with different content; keeping stored version"
            );
        }
    }
    Ok(counts)
}

fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>, StateError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StateError::Corrupt {
            message: format!("bad timestamp '{s}': {e}"),
        })
}
