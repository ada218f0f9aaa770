//! Fail-closed bundle verification.
//!
//! [`BundleVerifier::verify_bundle`] runs, in order:
//!
//! 1. manifest structure and `manifest_hash` recomputation
//! 2. signature presence, binding, `key_id`, and RSA-PSS check
//! 3. strict allowlist over the directory (no unlisted files, no symlinks)
//! 4. size and SHA-256 of every listed file
//! 5. SHA-256 of every chunk range
//!
//! The first failure ends verification. There is no partial acceptance.

use crate::crypto::{normalize_hash, sha256_reader};
use crate::manifest::{verify_integrity, Manifest, ManifestError, MANIFEST_FILE, SIGNATURE_FILE};
use crate::signing::{
    compute_key_id, key_bits, max_pss_salt_len, SignatureRecord, MIN_RSA_KEY_BITS,
    SIGNATURE_ALGORITHM,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rsa::pss::{Signature, VerifyingKey};
use rsa::signature::Verifier;
use rsa::RsaPublicKey;
use serde::Serialize;
use sha2::Sha256;
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

/// Upper bound on `manifest.json` / `manifest.sig` reads.
pub const MAX_MANIFEST_BYTES: u64 = 64 * 1024 * 1024;

/// Verification error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Hash or signature mismatch, unreadable content.
    Integrity,
    /// Missing or malformed bundle members.
    Contract,
    /// Wrong key, traversal, symlinks.
    Security,
    /// Resource limit exceeded.
    Limits,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Stable error codes for verification failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorCode {
    // Integrity
    IntegrityManifestHash,
    IntegritySignature,
    IntegrityFileHash,
    IntegrityFileSizeMismatch,
    IntegrityChunkHash,
    IntegrityIo,
    // Contract
    ContractMissingManifest,
    ContractMissingSignature,
    ContractMissingFile,
    ContractUnexpectedFile,
    ContractInvalidJson,
    ContractManifest,
    ContractAlgorithm,
    ContractChunkRange,
    // Security
    SecurityKeyMismatch,
    SecurityPathTraversal,
    SecuritySymlink,
    // Limits
    LimitKeySize,
    LimitManifestBytes,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Typed verification error with stable code.
#[derive(Debug, thiserror::Error)]
#[error("{class}: {message} ({code})")]
pub struct VerifyError {
    pub class: ErrorClass,
    pub code: ErrorCode,
    pub message: String,
    #[source]
    pub source: Option<anyhow::Error>,
}

impl VerifyError {
    pub fn new(class: ErrorClass, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            class,
            code,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(mut self, source: impl Into<anyhow::Error>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.message = format!("{}: {}", context.into(), self.message);
        self
    }

    pub fn class(&self) -> ErrorClass {
        self.class
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    fn integrity(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Integrity, code, message)
    }

    fn contract(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Contract, code, message)
    }

    fn security(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Security, code, message)
    }
}

impl From<io::Error> for VerifyError {
    fn from(err: io::Error) -> Self {
        Self::integrity(ErrorCode::IntegrityIo, err.to_string()).with_source(err)
    }
}

impl From<ManifestError> for VerifyError {
    fn from(err: ManifestError) -> Self {
        let (class, code) = match &err {
            ManifestError::HashMismatch { .. } => {
                (ErrorClass::Integrity, ErrorCode::IntegrityManifestHash)
            }
            ManifestError::UnsafePath { .. } | ManifestError::InvalidIncidentId { .. } => {
                (ErrorClass::Security, ErrorCode::SecurityPathTraversal)
            }
            ManifestError::Serialization(_) => (ErrorClass::Contract, ErrorCode::ContractInvalidJson),
            _ => (ErrorClass::Contract, ErrorCode::ContractManifest),
        };
        Self::new(class, code, err.to_string()).with_source(err)
    }
}

/// Summary of a bundle that passed every check.
#[derive(Debug, Clone)]
pub struct VerifiedBundle {
    pub manifest: Manifest,
    pub signature: SignatureRecord,
    pub files_verified: usize,
    pub chunks_verified: usize,
    pub bytes_verified: u64,
}

/// Verify a signature record against a manifest.
///
/// Fails closed on: unknown algorithm, weak key, `key_id` mismatch, a record
/// bound to another manifest hash, a manifest whose own hash is broken,
/// undecodable signature bytes, or a failed RSA-PSS check.
pub fn verify_signature(
    manifest: &Manifest,
    record: &SignatureRecord,
    public_key: &RsaPublicKey,
) -> Result<(), VerifyError> {
    if record.algorithm != SIGNATURE_ALGORITHM {
        return Err(VerifyError::contract(
            ErrorCode::ContractAlgorithm,
            format!(
                "unsupported signature algorithm '{}' (expected {})",
                record.algorithm, SIGNATURE_ALGORITHM
            ),
        ));
    }

    let bits = key_bits(public_key);
    if bits < MIN_RSA_KEY_BITS {
        return Err(VerifyError::new(
            ErrorClass::Limits,
            ErrorCode::LimitKeySize,
            format!("verification key is {bits} bits; at least {MIN_RSA_KEY_BITS} required"),
        ));
    }

    let expected_key_id = compute_key_id(public_key).map_err(|e| {
        VerifyError::security(ErrorCode::SecurityKeyMismatch, e.to_string())
    })?;
    if normalize_hash(&record.key_id) != expected_key_id {
        return Err(VerifyError::security(
            ErrorCode::SecurityKeyMismatch,
            format!(
                "signature key_id {} does not match verification key {}",
                record.key_id, expected_key_id
            ),
        ));
    }

    if normalize_hash(&record.manifest_hash) != normalize_hash(&manifest.manifest_hash) {
        return Err(VerifyError::integrity(
            ErrorCode::IntegrityManifestHash,
            format!(
                "signature covers {} but manifest hash is {}",
                record.manifest_hash, manifest.manifest_hash
            ),
        ));
    }
    verify_integrity(manifest)?;

    let raw = BASE64.decode(record.signature.trim()).map_err(|e| {
        VerifyError::integrity(ErrorCode::IntegritySignature, "signature is not valid base64")
            .with_source(e)
    })?;
    let signature = Signature::try_from(raw.as_slice()).map_err(|e| {
        VerifyError::integrity(ErrorCode::IntegritySignature, "malformed signature bytes")
            .with_source(anyhow::anyhow!(e.to_string()))
    })?;

    let content = manifest.canonical_content()?;
    let verifying_key =
        VerifyingKey::<Sha256>::new_with_salt_len(public_key.clone(), max_pss_salt_len(public_key));
    verifying_key.verify(&content, &signature).map_err(|_| {
        VerifyError::integrity(
            ErrorCode::IntegritySignature,
            "RSA-PSS signature verification failed",
        )
    })
}

/// Read and parse `manifest.json` from a bundle directory.
pub fn load_manifest(bundle_dir: &Path) -> Result<Manifest, VerifyError> {
    let bytes = read_bounded(&bundle_dir.join(MANIFEST_FILE), ErrorCode::ContractMissingManifest)?;
    serde_json::from_slice(&bytes).map_err(|e| {
        VerifyError::contract(ErrorCode::ContractInvalidJson, e.to_string())
            .with_context(MANIFEST_FILE)
            .with_source(e)
    })
}

/// Read and parse `manifest.sig`. `Ok(None)` when the bundle is unsigned.
pub fn load_signature(bundle_dir: &Path) -> Result<Option<SignatureRecord>, VerifyError> {
    let path = bundle_dir.join(SIGNATURE_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let bytes = read_bounded(&path, ErrorCode::ContractMissingSignature)?;
    serde_json::from_slice(&bytes).map(Some).map_err(|e| {
        VerifyError::contract(ErrorCode::ContractInvalidJson, e.to_string())
            .with_context(SIGNATURE_FILE)
            .with_source(e)
    })
}

/// Structural validation plus `manifest_hash` recomputation.
pub fn verify_manifest_integrity(manifest: &Manifest) -> Result<(), VerifyError> {
    manifest.validate()?;
    verify_integrity(manifest)?;
    Ok(())
}

fn read_bounded(path: &Path, missing: ErrorCode) -> Result<Vec<u8>, VerifyError> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(VerifyError::contract(
                missing,
                format!("{} not found", path.display()),
            ));
        }
        Err(e) => return Err(e.into()),
    };
    let mut bytes = Vec::new();
    file.take(MAX_MANIFEST_BYTES + 1).read_to_end(&mut bytes)?;
    if bytes.len() as u64 > MAX_MANIFEST_BYTES {
        return Err(VerifyError::new(
            ErrorClass::Limits,
            ErrorCode::LimitManifestBytes,
            format!("{} exceeds {} bytes", path.display(), MAX_MANIFEST_BYTES),
        ));
    }
    Ok(bytes)
}

/// Verifies extracted bundle directories against a trusted public key.
#[derive(Debug, Clone)]
pub struct BundleVerifier {
    public_key: RsaPublicKey,
}

impl BundleVerifier {
    pub fn new(public_key: RsaPublicKey) -> Result<Self, VerifyError> {
        let bits = key_bits(&public_key);
        if bits < MIN_RSA_KEY_BITS {
            return Err(VerifyError::new(
                ErrorClass::Limits,
                ErrorCode::LimitKeySize,
                format!("verification key is {bits} bits; at least {MIN_RSA_KEY_BITS} required"),
            ));
        }
        Ok(Self { public_key })
    }

    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public_key
    }

    pub fn verify_bundle(&self, bundle_dir: &Path) -> Result<VerifiedBundle, VerifyError> {
        let manifest = load_manifest(bundle_dir)?;
        verify_manifest_integrity(&manifest)?;

        let signature = load_signature(bundle_dir)?.ok_or_else(|| {
            VerifyError::contract(
                ErrorCode::ContractMissingSignature,
                format!("{SIGNATURE_FILE} is required"),
            )
        })?;
        verify_signature(&manifest, &signature, &self.public_key)?;

        check_allowlist(bundle_dir, &manifest)?;

        let mut bytes_verified = 0u64;
        for entry in &manifest.files {
            let path = bundle_dir.join(&entry.path);
            let file = File::open(&path)?;
            let actual_size = file.metadata()?.len();
            if actual_size != entry.size {
                return Err(VerifyError::integrity(
                    ErrorCode::IntegrityFileSizeMismatch,
                    format!(
                        "{}: manifest says {} bytes, found {}",
                        entry.path, entry.size, actual_size
                    ),
                ));
            }
            let (digest, read) = sha256_reader(file)?;
            if read != entry.size || digest != normalize_hash(&entry.sha256) {
                return Err(VerifyError::integrity(
                    ErrorCode::IntegrityFileHash,
                    format!("{}: expected {}, computed {}", entry.path, entry.sha256, digest),
                ));
            }
            bytes_verified += read;
        }

        for chunk in manifest.chunks() {
            let file_size = manifest.file(&chunk.path).map(|f| f.size).unwrap_or(0);
            let end = chunk.offset.checked_add(chunk.size);
            if end.map_or(true, |end| end > file_size) {
                return Err(VerifyError::contract(
                    ErrorCode::ContractChunkRange,
                    format!(
                        "chunk {} ({}+{}) exceeds {} ({} bytes)",
                        chunk.index, chunk.offset, chunk.size, chunk.path, file_size
                    ),
                ));
            }

            let mut file = File::open(bundle_dir.join(&chunk.path))?;
            file.seek(SeekFrom::Start(chunk.offset))?;
            let (digest, read) = sha256_reader(file.take(chunk.size))?;
            if read != chunk.size || digest != normalize_hash(&chunk.sha256) {
                return Err(VerifyError::integrity(
                    ErrorCode::IntegrityChunkHash,
                    format!(
                        "chunk {} of {}: expected {}, computed {}",
                        chunk.index, chunk.path, chunk.sha256, digest
                    ),
                ));
            }
        }

        tracing::debug!(
            incident_id = %manifest.incident_id,
            files = manifest.files.len(),
            chunks = manifest.chunks().len(),
            "bundle verified"
        );

        Ok(VerifiedBundle {
            files_verified: manifest.files.len(),
            chunks_verified: manifest.chunks().len(),
            bytes_verified,
            signature,
            manifest,
        })
    }
}

/// Every regular file under `bundle_dir` must be `manifest.json`,
/// `manifest.sig`, or listed in the manifest; every listed file must exist.
fn check_allowlist(bundle_dir: &Path, manifest: &Manifest) -> Result<(), VerifyError> {
    let mut found = BTreeSet::new();
    collect_files(bundle_dir, "", &mut found)?;

    let listed: BTreeSet<&str> = manifest.files.iter().map(|f| f.path.as_str()).collect();
    for path in &found {
        let allowed =
            path == MANIFEST_FILE || path == SIGNATURE_FILE || listed.contains(path.as_str());
        if !allowed {
            return Err(VerifyError::contract(
                ErrorCode::ContractUnexpectedFile,
                format!("'{path}' is not listed in the manifest"),
            ));
        }
    }
    for path in listed {
        if !found.contains(path) {
            return Err(VerifyError::contract(
                ErrorCode::ContractMissingFile,
                format!("'{path}' is listed in the manifest but missing"),
            ));
        }
    }
    Ok(())
}

fn collect_files(dir: &Path, prefix: &str, out: &mut BTreeSet<String>) -> Result<(), VerifyError> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_str().ok_or_else(|| {
            VerifyError::security(
                ErrorCode::SecurityPathTraversal,
                format!("non-UTF-8 file name under '{prefix}'"),
            )
        })?;
        let rel = if prefix.is_empty() {
            name.to_string()
        } else {
            format!("{prefix}/{name}")
        };

        let file_type = entry.file_type()?;
        if file_type.is_symlink() {
            return Err(VerifyError::security(
                ErrorCode::SecuritySymlink,
                format!("'{rel}' is a symlink"),
            ));
        } else if file_type.is_dir() {
            collect_files(&entry.path(), &rel, out)?;
        } else if file_type.is_file() {
            out.insert(rel);
        } else {
            return Err(VerifyError::contract(
                ErrorCode::ContractUnexpectedFile,
                format!("'{rel}' is not a regular file"),
            ));
        }
    }
    Ok(())
}
