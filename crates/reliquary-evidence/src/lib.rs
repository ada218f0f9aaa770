//! Signed, integrity-verified incident evidence bundles.
//!
//! A bundle is a tar archive (zstd or gzip) holding `manifest.json`, an
//! optional detached `manifest.sig`, and the evidence files the manifest
//! lists. Every file and every artifact chunk is SHA-256 addressed, and the
//! manifest hash covers all of them.

pub mod archive;
pub mod builder;
pub mod chunker;
pub mod crypto;
pub mod manifest;
pub mod signing;
pub mod sources;
pub mod verify;

pub use archive::{
    detect_compression, pack_directory, unpack_archive, ArchiveError, ArchiveLimits, Compression,
    PackedArchive, UnpackSummary,
};
pub use builder::{BuildError, BuilderConfig, BundleBuilder, BundleResult};
pub use chunker::{ChunkDigest, ChunkError, ChunkSummary, StreamingChunker};
pub use manifest::{
    verify_integrity, ChunkEntry, FileEntry, Manifest, ManifestError, ManifestGenerator, Metadata,
};
pub use signing::{
    compute_key_id, load_private_key_pem, load_public_key_file, load_public_key_pem,
    ManifestSigner, SignError, SignatureRecord, SIGNATURE_ALGORITHM,
};
pub use sources::{
    ArtifactRef, EvidenceSources, HttpEvidenceSources, SourceError, SourcesConfig,
    StaticEvidenceSources,
};
pub use verify::{
    load_manifest, load_signature, verify_manifest_integrity, verify_signature, BundleVerifier,
    ErrorClass, ErrorCode, VerifiedBundle, VerifyError,
};

pub use rsa::{RsaPrivateKey, RsaPublicKey};
