//! Bundle manifest: canonical description of a bundle's contents.
//!
//! `manifest_hash` is the SHA-256 of the JCS encoding of every other field.
//! Files are sorted by path and chunks by index before hashing, so the hash
//! never depends on the order in which evidence was fetched or staged.

use crate::crypto::{jcs, normalize_hash, sha256_prefixed};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

pub const MANIFEST_VERSION: u32 = 1;
pub const MANIFEST_FILE: &str = "manifest.json";
pub const SIGNATURE_FILE: &str = "manifest.sig";
pub const TIMELINE_FILE: &str = "timeline.json";
pub const ALERTS_FILE: &str = "alerts.json";
pub const ARTIFACTS_DIR: &str = "artifacts";

pub type Metadata = BTreeMap<String, serde_json::Value>;

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("manifest hash mismatch: stored {stored}, computed {computed}")]
    HashMismatch { stored: String, computed: String },

    #[error("unsupported manifest version {found} (supported: {supported})")]
    UnsupportedVersion { found: u32, supported: u32 },

    #[error("duplicate file entry '{path}'")]
    DuplicateFile { path: String },

    #[error("duplicate chunk index {index}")]
    DuplicateChunk { index: u64 },

    #[error("chunk {index} references unknown file '{path}'")]
    UnknownChunkPath { index: u64, path: String },

    #[error("unsafe path '{path}' in manifest")]
    UnsafePath { path: String },

    #[error("invalid incident id '{incident_id}'")]
    InvalidIncidentId { incident_id: String },

    #[error("manifest serialization failed: {0}")]
    Serialization(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Relative path inside the bundle, `/`-separated.
    pub path: String,
    pub size: u64,
    pub sha256: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkEntry {
    /// Bundle-wide chunk index.
    pub index: u64,
    /// File the chunk belongs to.
    pub path: String,
    /// Byte offset within that file.
    pub offset: u64,
    pub size: u64,
    pub sha256: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub incident_id: String,
    /// RFC 3339, second precision, UTC.
    pub created_at: String,
    pub files: Vec<FileEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunks: Option<Vec<ChunkEntry>>,
    #[serde(default)]
    pub metadata: Metadata,
    pub manifest_hash: String,
}

/// Exactly what goes into `manifest_hash` and the signature: every field
/// except `manifest_hash` itself.
#[derive(Serialize)]
struct HashableManifest<'a> {
    version: u32,
    incident_id: &'a str,
    created_at: &'a str,
    files: &'a [FileEntry],
    #[serde(skip_serializing_if = "Option::is_none")]
    chunks: Option<&'a [ChunkEntry]>,
    metadata: &'a Metadata,
}

impl Manifest {
    /// Canonical bytes covered by the hash and the signature.
    pub fn canonical_content(&self) -> Result<Vec<u8>, ManifestError> {
        let hashable = HashableManifest {
            version: self.version,
            incident_id: &self.incident_id,
            created_at: &self.created_at,
            files: &self.files,
            chunks: self.chunks.as_deref(),
            metadata: &self.metadata,
        };
        jcs::to_vec(&hashable).map_err(|e| ManifestError::Serialization(e.to_string()))
    }

    /// Recompute the hash from the current content.
    pub fn compute_hash(&self) -> Result<String, ManifestError> {
        Ok(sha256_prefixed(&self.canonical_content()?))
    }

    /// Canonical encoding of the full manifest, as written to `manifest.json`.
    pub fn to_canonical_vec(&self) -> Result<Vec<u8>, ManifestError> {
        jcs::to_vec(self).map_err(|e| ManifestError::Serialization(e.to_string()))
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, ManifestError> {
        serde_json::from_slice(bytes).map_err(|e| ManifestError::Serialization(e.to_string()))
    }

    pub fn file(&self, path: &str) -> Option<&FileEntry> {
        self.files.iter().find(|f| f.path == path)
    }

    pub fn chunks(&self) -> &[ChunkEntry] {
        self.chunks.as_deref().unwrap_or(&[])
    }

    /// Whether the manifest claims to be signed.
    pub fn is_signed(&self) -> bool {
        self.metadata
            .get("signed")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    /// Validate structural invariants: version, path safety, uniqueness, and
    /// that every chunk points at a listed file.
    pub fn validate(&self) -> Result<(), ManifestError> {
        if self.version != MANIFEST_VERSION {
            return Err(ManifestError::UnsupportedVersion {
                found: self.version,
                supported: MANIFEST_VERSION,
            });
        }
        validate_incident_id(&self.incident_id)?;

        let mut paths = HashSet::new();
        for file in &self.files {
            validate_bundle_path(&file.path)?;
            if !paths.insert(file.path.as_str()) {
                return Err(ManifestError::DuplicateFile {
                    path: file.path.clone(),
                });
            }
        }

        let mut indices = HashSet::new();
        for chunk in self.chunks() {
            if !indices.insert(chunk.index) {
                return Err(ManifestError::DuplicateChunk { index: chunk.index });
            }
            if !paths.contains(chunk.path.as_str()) {
                return Err(ManifestError::UnknownChunkPath {
                    index: chunk.index,
                    path: chunk.path.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Builds manifests with deterministic ordering.
#[derive(Debug, Clone, Default)]
pub struct ManifestGenerator;

impl ManifestGenerator {
    pub fn new() -> Self {
        Self
    }

    pub fn generate(
        &self,
        incident_id: &str,
        files: Vec<FileEntry>,
        chunks: Option<Vec<ChunkEntry>>,
        metadata: Metadata,
    ) -> Result<Manifest, ManifestError> {
        self.generate_at(incident_id, files, chunks, metadata, Utc::now())
    }

    /// Like [`generate`](Self::generate) with an explicit creation time.
    pub fn generate_at(
        &self,
        incident_id: &str,
        mut files: Vec<FileEntry>,
        chunks: Option<Vec<ChunkEntry>>,
        metadata: Metadata,
        created_at: DateTime<Utc>,
    ) -> Result<Manifest, ManifestError> {
        for file in &mut files {
            file.sha256 = normalize_hash(&file.sha256);
        }
        files.sort_by(|a, b| a.path.cmp(&b.path));

        let chunks = chunks.map(|mut chunks| {
            for chunk in &mut chunks {
                chunk.sha256 = normalize_hash(&chunk.sha256);
            }
            chunks.sort_by_key(|c| c.index);
            chunks
        });

        let mut manifest = Manifest {
            version: MANIFEST_VERSION,
            incident_id: incident_id.to_string(),
            created_at: created_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            files,
            chunks,
            metadata,
            manifest_hash: String::new(),
        };
        manifest.validate()?;
        manifest.manifest_hash = manifest.compute_hash()?;
        Ok(manifest)
    }
}

/// Strip `manifest_hash`, recanonicalize, rehash, and compare.
///
/// A mismatch is always an error.
pub fn verify_integrity(manifest: &Manifest) -> Result<(), ManifestError> {
    let computed = manifest.compute_hash()?;
    if normalize_hash(&manifest.manifest_hash) != computed {
        return Err(ManifestError::HashMismatch {
            stored: manifest.manifest_hash.clone(),
            computed,
        });
    }
    Ok(())
}

/// Incident ids end up in file names and storage paths.
pub fn validate_incident_id(incident_id: &str) -> Result<(), ManifestError> {
    let valid = !incident_id.is_empty()
        && incident_id.len() <= 128
        && incident_id != "."
        && incident_id != ".."
        && incident_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(ManifestError::InvalidIncidentId {
            incident_id: incident_id.to_string(),
        })
    }
}

/// Relative, `/`-separated, no traversal, not one of the reserved files.
pub fn validate_bundle_path(path: &str) -> Result<(), ManifestError> {
    let unsafe_path = || ManifestError::UnsafePath {
        path: path.to_string(),
    };
    if path.is_empty() || path.contains('\\') || path == MANIFEST_FILE || path == SIGNATURE_FILE {
        return Err(unsafe_path());
    }
    // `Path::components` folds away empty and `.` segments, so check the raw text.
    if path
        .split('/')
        .any(|segment| segment.is_empty() || segment == "." || segment == "..")
    {
        return Err(unsafe_path());
    }
    Ok(())
}
