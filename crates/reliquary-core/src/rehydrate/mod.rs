//! Rehydration: restore a bundle into live incident state, at most once.
//!
//! Order matters. The idempotency check comes first, then unpacking and
//! verification; nothing is written to the state store or artifact root
//! until the bundle has passed. The idempotency record is written last, so
//! a crash mid-way leaves the key unrecorded and a retry redoes the
//! (conflict-tolerant) merge.

pub mod ingest;
pub mod reconciler;

pub use ingest::{ArtifactIngestor, IngestReport, SkippedArtifact};
pub use reconciler::StateReconciler;

use crate::state::{IdempotencyRecord, StateError, StateStore};
use chrono::Utc;
use reliquary_evidence::{
    load_manifest, unpack_archive, verify_manifest_integrity, ArchiveError, ArchiveLimits,
    BundleVerifier, Manifest, VerifyError,
};
use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum RehydrateError {
    #[error("bundle not found: {}", path.display())]
    BundleNotFound { path: PathBuf },

    #[error("signature verification requested but no verification key is configured")]
    VerificationKeyMissing,

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error("bundle verification failed: {0}")]
    Verification(#[from] VerifyError),

    #[error("invalid {file}: {message}")]
    InvalidSection { file: String, message: String },

    #[error(transparent)]
    State(#[from] StateError),

    #[error("rehydrate io error: {0}")]
    Io(#[from] io::Error),

    #[error("rehydrate task failed: {0}")]
    Task(String),
}

impl RehydrateError {
    /// Missing inputs and untrusted bundles fail the same way on retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::BundleNotFound { .. }
            | Self::VerificationKeyMissing
            | Self::Verification(_)
            | Self::InvalidSection { .. } => false,
            Self::Archive(e) => matches!(e, ArchiveError::Io(_)),
            Self::State(e) => e.is_retryable(),
            Self::Io(_) | Self::Task(_) => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RehydrationStatus {
    Completed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RehydrationResult {
    pub status: RehydrationStatus,
    pub incident_id: String,
    pub timeline_restored: usize,
    pub timeline_unchanged: usize,
    pub alerts_restored: usize,
    pub alerts_unchanged: usize,
    pub artifacts_restored: usize,
    pub artifacts_skipped: usize,
    /// Whether the signature and every file and chunk hash were checked.
    pub verified: bool,
}

impl RehydrationResult {
    fn skipped(incident_id: String) -> Self {
        Self {
            status: RehydrationStatus::Skipped,
            incident_id,
            timeline_restored: 0,
            timeline_unchanged: 0,
            alerts_restored: 0,
            alerts_unchanged: 0,
            artifacts_restored: 0,
            artifacts_skipped: 0,
            verified: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RehydratorConfig {
    pub artifact_root: PathBuf,
    /// Scratch space for unpacking; system temp dir when unset.
    pub work_dir: Option<PathBuf>,
    pub limits: ArchiveLimits,
}

impl RehydratorConfig {
    pub fn new(artifact_root: impl Into<PathBuf>) -> Self {
        Self {
            artifact_root: artifact_root.into(),
            work_dir: None,
            limits: ArchiveLimits::default(),
        }
    }

    pub fn with_work_dir(mut self, work_dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(work_dir.into());
        self
    }

    pub fn with_limits(mut self, limits: ArchiveLimits) -> Self {
        self.limits = limits;
        self
    }
}

#[derive(Clone)]
pub struct Rehydrator {
    state: StateStore,
    verifier: Option<Arc<BundleVerifier>>,
    config: RehydratorConfig,
}

impl Rehydrator {
    pub fn new(state: StateStore, config: RehydratorConfig) -> Self {
        Self {
            state,
            verifier: None,
            config,
        }
    }

    pub fn with_verifier(mut self, verifier: Arc<BundleVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn state(&self) -> &StateStore {
        &self.state
    }

    pub async fn rehydrate(
        &self,
        bundle_path: &Path,
        verify_signature: bool,
        idempotency_key: Option<&str>,
    ) -> Result<RehydrationResult, RehydrateError> {
        let this = self.clone();
        let bundle_path = bundle_path.to_path_buf();
        let idempotency_key = idempotency_key.map(str::to_string);
        tokio::task::spawn_blocking(move || {
            this.rehydrate_blocking(&bundle_path, verify_signature, idempotency_key.as_deref())
        })
        .await
        .map_err(|e| RehydrateError::Task(e.to_string()))?
    }

    /// Synchronous body of [`Rehydrator::rehydrate`].
    pub fn rehydrate_blocking(
        &self,
        bundle_path: &Path,
        verify_signature: bool,
        idempotency_key: Option<&str>,
    ) -> Result<RehydrationResult, RehydrateError> {
        if let Some(key) = idempotency_key {
            if let Some(record) = self.state.idempotency_record(key)? {
                info!(
                    idempotency_key = key,
                    incident_id = %record.incident_id,
                    processed_at = %record.processed_at,
                    "rehydration already processed; skipping"
                );
                return Ok(RehydrationResult::skipped(record.incident_id));
            }
        }

        if !bundle_path.is_file() {
            return Err(RehydrateError::BundleNotFound {
                path: bundle_path.to_path_buf(),
            });
        }
        let verifier = match (verify_signature, &self.verifier) {
            (true, Some(v)) => Some(v.as_ref()),
            (true, None) => return Err(RehydrateError::VerificationKeyMissing),
            (false, _) => None,
        };

        let scratch = match &self.config.work_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                tempfile::Builder::new()
                    .prefix("reliquary-restore-")
                    .tempdir_in(dir)?
            }
            None => tempfile::Builder::new().prefix("reliquary-restore-").tempdir()?,
        };
        let bundle_dir = scratch.path();
        unpack_archive(bundle_path, bundle_dir, &self.config.limits)?;

        let manifest = open_manifest(bundle_dir, verifier)?;
        let reconciler = StateReconciler::new(self.state.clone());
        let batch = reconciler.prepare(bundle_dir, &manifest)?;

        // first write
        let merged = reconciler.apply(&batch)?;

        let report = ArtifactIngestor::new(&self.config.artifact_root).ingest(bundle_dir, &manifest)?;
        let now = Utc::now();
        for artifact in &report.restored {
            self.state.record_artifact(artifact, now)?;
        }

        if let Some(key) = idempotency_key {
            self.state.record_idempotency(&IdempotencyRecord {
                key: key.to_string(),
                incident_id: manifest.incident_id.clone(),
                status: "completed".into(),
                processed_at: now,
            })?;
        }

        let result = RehydrationResult {
            status: RehydrationStatus::Completed,
            incident_id: manifest.incident_id,
            timeline_restored: merged.timeline.restored,
            timeline_unchanged: merged.timeline.unchanged,
            alerts_restored: merged.alerts.restored,
            alerts_unchanged: merged.alerts.unchanged,
            artifacts_restored: report.restored.len(),
            artifacts_skipped: report.skipped.len(),
            verified: verifier.is_some(),
        };
        info!(
            incident_id = %result.incident_id,
            timeline_restored = result.timeline_restored,
            alerts_restored = result.alerts_restored,
            artifacts_restored = result.artifacts_restored,
            artifacts_skipped = result.artifacts_skipped,
            verified = result.verified,
            "rehydration completed"
        );
        Ok(result)
    }
}

/// Full verification when a verifier is given; otherwise structure and
/// `manifest_hash` only.
fn open_manifest(bundle_dir: &Path, verifier: Option<&BundleVerifier>) -> Result<Manifest, RehydrateError> {
    match verifier {
        Some(verifier) => Ok(verifier.verify_bundle(bundle_dir)?.manifest),
        None => {
            let manifest = load_manifest(bundle_dir)?;
            verify_manifest_integrity(&manifest)?;
            tracing::warn!(
                incident_id = %manifest.incident_id,
                "signature verification disabled; restoring on manifest integrity only"
            );
            Ok(manifest)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rehydrator(root: &Path) -> Rehydrator {
        Rehydrator::new(StateStore::memory().unwrap(), RehydratorConfig::new(root))
    }

    #[test]
    fn test_missing_bundle_is_not_retryable() {
        let dir = tempfile::tempdir().unwrap();
        let err = rehydrator(dir.path())
            .rehydrate_blocking(&dir.path().join("nope.tar.zst"), false, None)
            .unwrap_err();
        assert!(matches!(err, RehydrateError::BundleNotFound { .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_verify_without_key_fails_before_unpack() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = dir.path().join("b.tar.zst");
        std::fs::write(&bundle, b"not an archive").unwrap();

        let err = rehydrator(dir.path())
            .rehydrate_blocking(&bundle, true, None)
            .unwrap_err();
        assert!(matches!(err, RehydrateError::VerificationKeyMissing));
    }

    #[test]
    fn test_recorded_key_skips_without_touching_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let rehydrator = rehydrator(dir.path());
        rehydrator
            .state()
            .record_idempotency(&IdempotencyRecord {
                key: "k1".into(),
                incident_id: "INC-1".into(),
                status: "completed".into(),
                processed_at: Utc::now(),
            })
            .unwrap();

        let result = rehydrator
            .rehydrate_blocking(&dir.path().join("absent.tar.zst"), true, Some("k1"))
            .unwrap();
        assert_eq!(result.status, RehydrationStatus::Skipped);
        assert_eq!(result.incident_id, "INC-1");
    }

    #[test]
    fn test_garbage_archive_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = dir.path().join("b.tar.zst");
        std::fs::write(&bundle, b"not an archive").unwrap();

        let err = rehydrator(dir.path())
            .rehydrate_blocking(&bundle, false, None)
            .unwrap_err();
        assert!(matches!(
            err,
            RehydrateError::Archive(ArchiveError::UnknownFormat { .. })
        ));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_unverified_manifest_with_empty_segment_writes_nothing() {
        use reliquary_evidence::crypto::sha256_prefixed;
        use reliquary_evidence::{pack_directory, Compression, ErrorCode, FileEntry, Metadata};

        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let outside_rel = outside.path().to_str().unwrap().trim_start_matches('/');

        let staging = dir.path().join("staging");
        let artifact_dir = staging.join("artifacts").join(outside_rel);
        std::fs::create_dir_all(&artifact_dir).unwrap();
        std::fs::write(artifact_dir.join("dropped.txt"), b"payload").unwrap();

        let mut manifest = Manifest {
            version: 1,
            incident_id: "INC-1".into(),
            created_at: "2026-03-01T12:00:00Z".into(),
            files: vec![FileEntry {
                path: format!("artifacts//{outside_rel}/dropped.txt"),
                size: 7,
                sha256: sha256_prefixed(b"payload"),
            }],
            chunks: None,
            metadata: Metadata::new(),
            manifest_hash: String::new(),
        };
        manifest.manifest_hash = manifest.compute_hash().unwrap();
        std::fs::write(
            staging.join("manifest.json"),
            manifest.to_canonical_vec().unwrap(),
        )
        .unwrap();
        let bundle = dir.path().join("b.tar.gz");
        pack_directory(&staging, &bundle, Compression::Gzip).unwrap();

        let rehydrator = rehydrator(&dir.path().join("store"));
        let err = rehydrator
            .rehydrate_blocking(&bundle, false, None)
            .unwrap_err();
        match err {
            RehydrateError::Verification(e) => {
                assert_eq!(e.code(), ErrorCode::SecurityPathTraversal)
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!outside.path().join("dropped.txt").exists());
        assert!(!dir.path().join("store").exists());
    }
}
