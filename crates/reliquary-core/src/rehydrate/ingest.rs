//! ArtifactIngestor: copies bundle artifacts into durable storage.
//!
//! Each artifact is streamed into a `.partial` file beside its target while
//! being hashed, and only renamed into place when size and SHA-256 match
//! the manifest. A mismatch or a missing source skips that one artifact.
//! Failures writing the destination abort the ingest.

use crate::state::RestoredArtifact;
use reliquary_evidence::crypto::{normalize_hash, HashingWriter};
use reliquary_evidence::manifest::{validate_bundle_path, validate_incident_id, ARTIFACTS_DIR};
use reliquary_evidence::{FileEntry, Manifest};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedArtifact {
    pub path: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub restored: Vec<RestoredArtifact>,
    pub skipped: Vec<SkippedArtifact>,
}

#[derive(Debug, Clone)]
pub struct ArtifactIngestor {
    root: PathBuf,
}

impl ArtifactIngestor {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where `artifacts/<id>/<file>` of an incident is stored. `None` when
    /// the incident id or bundle path would resolve outside the root.
    pub fn target_path(&self, incident_id: &str, bundle_path: &str) -> Option<PathBuf> {
        validate_incident_id(incident_id).ok()?;
        validate_bundle_path(bundle_path).ok()?;
        let rel = Path::new(
            bundle_path
                .strip_prefix(ARTIFACTS_DIR)
                .and_then(|p| p.strip_prefix('/'))
                .unwrap_or(bundle_path),
        );
        if !rel.components().all(|c| matches!(c, Component::Normal(_))) {
            return None;
        }
        let base = self.root.join(incident_id);
        let target = base.join(rel);
        target.starts_with(&base).then_some(target)
    }

    pub fn ingest(&self, bundle_dir: &Path, manifest: &Manifest) -> io::Result<IngestReport> {
        let mut report = IngestReport::default();
        let prefix = format!("{ARTIFACTS_DIR}/");

        for entry in manifest.files.iter().filter(|f| f.path.starts_with(&prefix)) {
            let outcome = match self.target_path(&manifest.incident_id, &entry.path) {
                Some(target) => self
                    .ingest_one(&bundle_dir.join(&entry.path), &target, entry)?
                    .map(|()| target),
                None => Err("path escapes the artifact root".to_string()),
            };
            match outcome {
                Ok(target) => {
                    debug!(path = %entry.path, target = %target.display(), "artifact restored");
                    report.restored.push(RestoredArtifact {
                        incident_id: manifest.incident_id.clone(),
                        path: entry.path.clone(),
                        sha256: entry.sha256.clone(),
                        size: entry.size,
                        stored_path: target,
                    });
                }
                Err(reason) => {
                    warn!(
                        incident_id = %manifest.incident_id,
                        path = %entry.path,
                        reason = %reason,
                        "skipping artifact"
                    );
                    report.skipped.push(SkippedArtifact {
                        path: entry.path.clone(),
                        reason,
                    });
                }
            }
        }
        Ok(report)
    }

    /// Outer error aborts; inner error is a per-artifact skip reason.
    fn ingest_one(
        &self,
        source: &Path,
        target: &Path,
        entry: &FileEntry,
    ) -> io::Result<Result<(), String>> {
        let source = match File::open(source) {
            Ok(f) => f,
            Err(e) => return Ok(Err(format!("source unreadable: {e}"))),
        };
        let parent = target.parent().unwrap_or(&self.root);
        fs::create_dir_all(parent)?;

        let partial = tempfile::Builder::new()
            .prefix(".ingest-")
            .suffix(".partial")
            .tempfile_in(parent)?;
        let mut writer = HashingWriter::new(BufWriter::new(partial));
        if let Err(e) = io::copy(&mut BufReader::new(source), &mut writer) {
            return Ok(Err(format!("copy failed: {e}")));
        }
        let (inner, sha256, size) = writer.finish()?;
        let partial = inner.into_inner().map_err(|e| e.into_error())?;

        if size != entry.size || sha256 != normalize_hash(&entry.sha256) {
            // dropping `partial` removes the corrupt copy
            return Ok(Err(format!(
                "hash mismatch: expected {} ({} bytes), got {sha256} ({size} bytes)",
                entry.sha256, entry.size
            )));
        }

        partial.as_file().sync_all()?;
        partial.persist(target).map_err(|e| e.error)?;
        Ok(Ok(()))
    }
}
