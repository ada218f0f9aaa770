//! SQLite schema for restored incident state.

/// DDL for restored incident state.
///
/// Schema version: 1
pub const STATE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS timeline_entries (
    incident_id   TEXT NOT NULL,
    entry_id      TEXT NOT NULL,
    content_hash  TEXT NOT NULL,
    body          TEXT NOT NULL,
    restored_at   TEXT NOT NULL,
    PRIMARY KEY (incident_id, entry_id)
);

CREATE TABLE IF NOT EXISTS alerts (
    incident_id   TEXT NOT NULL,
    alert_id      TEXT NOT NULL,
    content_hash  TEXT NOT NULL,
    body          TEXT NOT NULL,
    restored_at   TEXT NOT NULL,
    PRIMARY KEY (incident_id, alert_id)
);

CREATE TABLE IF NOT EXISTS restored_artifacts (
    incident_id   TEXT NOT NULL,
    path          TEXT NOT NULL,
    sha256        TEXT NOT NULL,
    size          INTEGER NOT NULL,
    stored_path   TEXT NOT NULL,
    restored_at   TEXT NOT NULL,
    PRIMARY KEY (incident_id, path)
);

CREATE TABLE IF NOT EXISTS idempotency_records (
    idempotency_key  TEXT PRIMARY KEY,
    incident_id      TEXT NOT NULL,
    status           TEXT NOT NULL,
    processed_at     TEXT NOT NULL
);
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn test_schema_is_valid_sql() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(STATE_SCHEMA).unwrap();
    }

    #[test]
    fn test_schema_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(STATE_SCHEMA).unwrap();
        conn.execute_batch(STATE_SCHEMA).unwrap();
    }
}
