//! StateReconciler: turns a bundle's timeline and alerts into state records.
//!
//! Parsing happens entirely in [`StateReconciler::prepare`], before any
//! write, so a malformed section aborts the rehydration with the store
//! untouched.

use super::RehydrateError;
use crate::state::{ApplyOutcome, RestoreBatch, StateRecord, StateStore};
use chrono::Utc;
use reliquary_evidence::crypto::{jcs, normalize_hash, sha256_prefixed};
use reliquary_evidence::manifest::{ALERTS_FILE, TIMELINE_FILE};
use reliquary_evidence::Manifest;
use serde_json::Value;
use std::fs;
use std::path::Path;

/// Id fields tried in order before falling back to a content hash.
const TIMELINE_ID_FIELDS: &[&str] = &["id", "entry_id"];
const ALERT_ID_FIELDS: &[&str] = &["id", "alert_id"];

pub struct StateReconciler {
    state: StateStore,
}

impl StateReconciler {
    pub fn new(state: StateStore) -> Self {
        Self { state }
    }

    /// Read, hash-check, and parse the sections the manifest lists.
    pub fn prepare(&self, bundle_dir: &Path, manifest: &Manifest) -> Result<RestoreBatch, RehydrateError> {
        let timeline = match read_section(bundle_dir, manifest, TIMELINE_FILE)? {
            Some(value) => timeline_records(value)?,
            None => Vec::new(),
        };
        let alerts = match read_section(bundle_dir, manifest, ALERTS_FILE)? {
            Some(value) => alert_records(value)?,
            None => Vec::new(),
        };
        Ok(RestoreBatch {
            incident_id: manifest.incident_id.clone(),
            timeline,
            alerts,
        })
    }

    pub fn apply(&self, batch: &RestoreBatch) -> Result<ApplyOutcome, RehydrateError> {
        let outcome = self.state.apply(batch, Utc::now())?;
        tracing::debug!(
            incident_id = %batch.incident_id,
            timeline_restored = outcome.timeline.restored,
            alerts_restored = outcome.alerts.restored,
            "state merged"
        );
        Ok(outcome)
    }
}

fn read_section(bundle_dir: &Path, manifest: &Manifest, name: &str) -> Result<Option<Value>, RehydrateError> {
    let Some(entry) = manifest.file(name) else {
        return Ok(None);
    };
    let bytes = fs::read(bundle_dir.join(name)).map_err(|e| invalid(name, format!("unreadable: {e}")))?;

    let digest = sha256_prefixed(&bytes);
    if bytes.len() as u64 != entry.size || digest != normalize_hash(&entry.sha256) {
        return Err(invalid(
            name,
            format!("content does not match manifest (expected {}, got {digest})", entry.sha256),
        ));
    }

    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| invalid(name, e.to_string()))
}

/// Accepts an array of entries, an object wrapping one under `events` or
/// `entries`, or a single entry object. `null` means no timeline.
fn timeline_records(value: Value) -> Result<Vec<StateRecord>, RehydrateError> {
    let entries = match value {
        Value::Null => Vec::new(),
        Value::Array(items) => items,
        Value::Object(mut map) => match ["events", "entries"]
            .iter()
            .find_map(|k| match map.get(*k) {
                Some(Value::Array(_)) => Some(*k),
                _ => None,
            }) {
            Some(key) => match map.remove(key) {
                Some(Value::Array(items)) => items,
                _ => Vec::new(),
            },
            None => vec![Value::Object(map)],
        },
        other => {
            return Err(invalid(
                TIMELINE_FILE,
                format!("expected array or object, found {}", json_kind(&other)),
            ))
        }
    };
    entries
        .iter()
        .map(|entry| to_record(TIMELINE_FILE, entry, TIMELINE_ID_FIELDS))
        .collect()
}

fn alert_records(value: Value) -> Result<Vec<StateRecord>, RehydrateError> {
    let Value::Array(items) = value else {
        return Err(invalid(
            ALERTS_FILE,
            format!("expected array, found {}", json_kind(&value)),
        ));
    };
    items
        .iter()
        .map(|alert| to_record(ALERTS_FILE, alert, ALERT_ID_FIELDS))
        .collect()
}

fn to_record(file: &str, value: &Value, id_fields: &[&str]) -> Result<StateRecord, RehydrateError> {
    let body = jcs::to_string(value).map_err(|e| invalid(file, e.to_string()))?;
    let content_hash = sha256_prefixed(body.as_bytes());
    let record_id = record_id(value, id_fields).unwrap_or_else(|| content_hash.clone());
    Ok(StateRecord {
        record_id,
        content_hash,
        body,
    })
}

/// Keys carry the JSON type, so `1`, `"1"` and a content hash never share
/// a key.
fn record_id(value: &Value, id_fields: &[&str]) -> Option<String> {
    let map = value.as_object()?;
    id_fields.iter().find_map(|field| match map.get(*field)? {
        Value::String(s) if !s.is_empty() => Some(format!("str:{s}")),
        Value::Number(n) => Some(format!("num:{n}")),
        _ => None,
    })
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn invalid(file: &str, message: impl Into<String>) -> RehydrateError {
    RehydrateError::InvalidSection {
        file: file.to_string(),
        message: message.into(),
    }
}
