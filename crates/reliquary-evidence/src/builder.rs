//! Bundle construction: fetch, stage, manifest, sign, pack.
//!
//! The builder holds no per-call state. Each `create_bundle` call stages into
//! its own temporary directory and publishes the archive with a rename, so a
//! crashed build never leaves a half-written bundle under its final name.

use crate::archive::{pack_directory, resolve_compression, ArchiveError, Compression};
use crate::chunker::{ChunkError, StreamingChunker};
use crate::crypto::{jcs, HashingWriter, SHA256_PREFIX};
use crate::manifest::{
    validate_bundle_path, validate_incident_id, ChunkEntry, FileEntry, ManifestError,
    ManifestGenerator, Metadata, ALERTS_FILE, ARTIFACTS_DIR, MANIFEST_FILE, SIGNATURE_FILE,
    TIMELINE_FILE,
};
use crate::signing::{ManifestSigner, SignError};
use crate::sources::{ArtifactRef, EvidenceSources};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const GENERATOR: &str = concat!("reliquary/", env!("CARGO_PKG_VERSION"));

pub const SECTION_TIMELINE: &str = "timeline";
pub const SECTION_ALERTS: &str = "alerts";
pub const SECTION_ARTIFACTS: &str = "artifacts";

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("signing is required but no signing key is configured")]
    SigningKeyMissing,

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Chunk(#[from] ChunkError),

    #[error(transparent)]
    Sign(#[from] SignError),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error("bundle io error: {0}")]
    Io(#[from] io::Error),

    #[error("bundle task failed: {0}")]
    Task(String),
}

impl BuildError {
    /// Missing keys and invalid requests will fail the same way on retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::SigningKeyMissing | Self::Manifest(_) | Self::Sign(_) => false,
            Self::Chunk(e) => matches!(e, ChunkError::Io(_)),
            Self::Archive(e) => matches!(e, ArchiveError::Io(_)),
            Self::Io(_) | Self::Task(_) => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuilderConfig {
    /// Published archives land here.
    pub output_dir: PathBuf,
    /// Parent of staging directories; system temp dir when unset.
    pub work_dir: Option<PathBuf>,
    pub compression: Compression,
    /// Fail instead of producing an unsigned bundle when no key is set.
    pub require_signature: bool,
}

impl BuilderConfig {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            work_dir: None,
            compression: Compression::Zstd,
            require_signature: false,
        }
    }

    pub fn with_work_dir(mut self, work_dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(work_dir.into());
        self
    }

    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    pub fn with_require_signature(mut self, require: bool) -> Self {
        self.require_signature = require;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BundleResult {
    pub incident_id: String,
    pub archive_path: PathBuf,
    pub compression: Compression,
    /// SHA-256 of the final archive bytes.
    pub bundle_hash: String,
    pub size: u64,
    pub file_count: usize,
    pub chunk_count: usize,
    pub manifest_hash: String,
    pub signed: bool,
    pub omitted_sections: Vec<String>,
}

/// Evidence gathered from collaborators for one build.
#[derive(Debug, Default)]
struct Collected {
    timeline: Option<Value>,
    alerts: Option<Vec<Value>>,
    artifacts: Option<Vec<ArtifactRef>>,
    omitted: Vec<String>,
}

pub struct BundleBuilder {
    sources: Arc<dyn EvidenceSources>,
    signer: Option<Arc<ManifestSigner>>,
    config: BuilderConfig,
}

impl BundleBuilder {
    pub fn new(sources: Arc<dyn EvidenceSources>, config: BuilderConfig) -> Self {
        Self {
            sources,
            signer: None,
            config,
        }
    }

    pub fn with_signer(mut self, signer: Arc<ManifestSigner>) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn config(&self) -> &BuilderConfig {
        &self.config
    }

    pub async fn create_bundle(
        &self,
        incident_id: &str,
        chunk_size_mb: u64,
    ) -> Result<BundleResult, BuildError> {
        validate_incident_id(incident_id)?;
        let chunker = StreamingChunker::from_megabytes(chunk_size_mb)?;
        if self.config.require_signature && self.signer.is_none() {
            return Err(BuildError::SigningKeyMissing);
        }

        let collected = self.collect(incident_id).await;

        let job = StageJob {
            incident_id: incident_id.to_string(),
            chunker,
            signer: self.signer.clone(),
            config: self.config.clone(),
            collected,
        };
        let result = tokio::task::spawn_blocking(move || job.run())
            .await
            .map_err(|e| BuildError::Task(e.to_string()))??;

        info!(
            incident_id = %result.incident_id,
            bundle_hash = %result.bundle_hash,
            size = result.size,
            files = result.file_count,
            chunks = result.chunk_count,
            signed = result.signed,
            "bundle created"
        );
        Ok(result)
    }

    async fn collect(&self, incident_id: &str) -> Collected {
        let (timeline, alerts, artifacts) = tokio::join!(
            self.sources.fetch_timeline(incident_id),
            self.sources.fetch_alerts(incident_id),
            self.sources.fetch_artifacts(incident_id),
        );

        let mut collected = Collected::default();
        match timeline {
            Ok(t) => collected.timeline = t,
            Err(e) => {
                warn!(incident_id, section = SECTION_TIMELINE, error = %e, "omitting section");
                collected.omitted.push(SECTION_TIMELINE.into());
            }
        }
        match alerts {
            Ok(a) => collected.alerts = Some(a),
            Err(e) => {
                warn!(incident_id, section = SECTION_ALERTS, error = %e, "omitting section");
                collected.omitted.push(SECTION_ALERTS.into());
            }
        }
        match artifacts {
            Ok(a) => collected.artifacts = Some(a),
            Err(e) => {
                warn!(incident_id, section = SECTION_ARTIFACTS, error = %e, "omitting section");
                collected.omitted.push(SECTION_ARTIFACTS.into());
            }
        }
        collected
    }
}

/// Blocking half of a build.
struct StageJob {
    incident_id: String,
    chunker: StreamingChunker,
    signer: Option<Arc<ManifestSigner>>,
    config: BuilderConfig,
    collected: Collected,
}

impl StageJob {
    fn run(self) -> Result<BundleResult, BuildError> {
        let staging = match &self.config.work_dir {
            Some(dir) => {
                fs::create_dir_all(dir)?;
                tempfile::Builder::new()
                    .prefix("reliquary-stage-")
                    .tempdir_in(dir)?
            }
            None => tempfile::Builder::new().prefix("reliquary-stage-").tempdir()?,
        };
        let root = staging.path();

        let mut files = Vec::new();
        let mut chunks = Vec::new();
        let mut sections = Vec::new();

        if let Some(timeline) = &self.collected.timeline {
            files.push(write_json(root, TIMELINE_FILE, timeline)?);
            sections.push(SECTION_TIMELINE);
        }
        if let Some(alerts) = &self.collected.alerts {
            files.push(write_json(root, ALERTS_FILE, alerts)?);
            sections.push(SECTION_ALERTS);
        }

        let mut artifact_count = 0usize;
        let mut skipped = Vec::new();
        if let Some(artifacts) = &self.collected.artifacts {
            sections.push(SECTION_ARTIFACTS);
            let mut seen = HashSet::new();
            for artifact in artifacts {
                match self.stage_artifact(root, artifact, &mut seen, chunks.len() as u64)? {
                    Some((entry, artifact_chunks)) => {
                        files.push(entry);
                        chunks.extend(artifact_chunks);
                        artifact_count += 1;
                    }
                    None => skipped.push(artifact.artifact_id.clone()),
                }
            }
        }

        let compression = resolve_compression(self.config.compression);
        let signed = self.signer.is_some();

        let mut metadata = Metadata::new();
        metadata.insert("signed".into(), json!(signed));
        metadata.insert(
            "trust_level".into(),
            json!(if signed { "signed" } else { "unsigned" }),
        );
        metadata.insert("sections".into(), json!(sections));
        metadata.insert("omitted_sections".into(), json!(self.collected.omitted));
        metadata.insert("chunk_size_bytes".into(), json!(self.chunker.chunk_size()));
        metadata.insert("compression".into(), json!(compression.as_str()));
        metadata.insert("artifact_count".into(), json!(artifact_count));
        if !skipped.is_empty() {
            metadata.insert("skipped_artifacts".into(), json!(skipped));
        }
        metadata.insert("generator".into(), json!(GENERATOR));

        let chunks = (!chunks.is_empty()).then_some(chunks);
        let manifest = ManifestGenerator::new().generate(&self.incident_id, files, chunks, metadata)?;

        if let Some(signer) = &self.signer {
            let record = signer.sign(&manifest)?;
            fs::write(root.join(SIGNATURE_FILE), record.to_json_vec()?)?;
        }
        fs::write(root.join(MANIFEST_FILE), manifest.to_canonical_vec()?)?;

        fs::create_dir_all(&self.config.output_dir)?;
        let partial = tempfile::Builder::new()
            .prefix(&format!(".{}-", self.incident_id))
            .suffix(".partial")
            .tempfile_in(&self.config.output_dir)?;
        let packed = pack_directory(root, partial.path(), compression)?;

        let digest_hex = packed
            .sha256
            .strip_prefix(SHA256_PREFIX)
            .unwrap_or(&packed.sha256);
        let final_path = self.config.output_dir.join(format!(
            "{}-{}.{}",
            self.incident_id,
            &digest_hex[..12.min(digest_hex.len())],
            packed.compression.extension()
        ));
        partial.persist(&final_path).map_err(|e| e.error)?;

        Ok(BundleResult {
            incident_id: self.incident_id,
            archive_path: final_path,
            compression: packed.compression,
            bundle_hash: packed.sha256,
            size: packed.size,
            file_count: manifest.files.len(),
            chunk_count: manifest.chunks().len(),
            manifest_hash: manifest.manifest_hash,
            signed,
            omitted_sections: self.collected.omitted,
        })
    }

    /// Copy one artifact into `artifacts/<id>/<filename>`, hashing and
    /// chunking in the same pass. `Ok(None)` means the artifact was skipped.
    fn stage_artifact(
        &self,
        root: &Path,
        artifact: &ArtifactRef,
        seen: &mut HashSet<String>,
        first_index: u64,
    ) -> Result<Option<(FileEntry, Vec<ChunkEntry>)>, BuildError> {
        let file_name = artifact
            .filepath
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        let rel = format!("{}/{}/{}", ARTIFACTS_DIR, artifact.artifact_id, file_name);

        if file_name.is_empty()
            || matches!(artifact.artifact_id.as_str(), "" | "." | "..")
            || artifact.artifact_id.contains('/')
            || validate_bundle_path(&rel).is_err()
        {
            warn!(artifact_id = %artifact.artifact_id, path = %artifact.filepath.display(), "skipping artifact with unusable path");
            return Ok(None);
        }
        if !seen.insert(rel.clone()) {
            warn!(artifact_id = %artifact.artifact_id, path = %rel, "skipping duplicate artifact");
            return Ok(None);
        }

        let source = match File::open(&artifact.filepath) {
            Ok(f) => f,
            Err(e) => {
                warn!(
                    artifact_id = %artifact.artifact_id,
                    path = %artifact.filepath.display(),
                    error = %e,
                    "skipping unreadable artifact"
                );
                return Ok(None);
            }
        };

        let target = root.join(&rel);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let out = OpenOptions::new().write(true).create_new(true).open(&target)?;
        let mut writer = BufWriter::new(out);
        let summary = self
            .chunker
            .chunk_into(BufReader::new(source), &mut writer)?;
        writer.into_inner().map_err(|e| e.into_error())?.sync_all()?;

        debug!(
            artifact_id = %artifact.artifact_id,
            bytes = summary.total_bytes,
            chunks = summary.chunks.len(),
            "artifact staged"
        );

        let chunks = summary
            .chunks
            .into_iter()
            .map(|c| ChunkEntry {
                index: first_index + c.index,
                path: rel.clone(),
                offset: c.offset,
                size: c.size,
                sha256: c.sha256,
            })
            .collect();
        let entry = FileEntry {
            path: rel,
            size: summary.total_bytes,
            sha256: summary.overall_sha256,
        };
        Ok(Some((entry, chunks)))
    }
}

/// Write canonical JSON, hashing on the way out.
fn write_json<T: Serialize>(root: &Path, name: &str, value: &T) -> Result<FileEntry, BuildError> {
    let bytes = jcs::to_vec(value)
        .map_err(|e| ManifestError::Serialization(format!("{name}: {e}")))?;
    let mut writer = HashingWriter::new(BufWriter::new(File::create(root.join(name))?));
    writer.write_all(&bytes)?;
    let (inner, sha256, size) = writer.finish()?;
    inner.into_inner().map_err(|e| e.into_error())?.sync_all()?;
    Ok(FileEntry {
        path: name.to_string(),
        size,
        sha256,
    })
}
