//! End-to-end build, unpack, and verify, plus tamper detection.
//!
//! Every tamper case starts from a bundle that verifies cleanly, so a failure
//! is caused by the mutation and not by a broken fixture.

use reliquary_evidence::{
    load_public_key_pem, unpack_archive, ArchiveLimits, ArtifactRef, BuilderConfig, BundleBuilder,
    BundleResult, BundleVerifier, Compression, ErrorCode, ManifestSigner, StaticEvidenceSources,
};
use serde_json::json;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

const SIGNING_KEY: &str = include_str!("fixtures/signing_key.pem");
const SIGNING_PUB: &str = include_str!("fixtures/signing_key.pub.pem");
const OTHER_PUB: &str = include_str!("fixtures/other_key.pub.pem");

const ARTIFACT_BYTES: usize = 3 * 1024 * 1024 + 17;

fn artifact_payload() -> Vec<u8> {
    (0..ARTIFACT_BYTES).map(|i| (i % 251) as u8).collect()
}

async fn build_signed(scratch: &Path, compression: Compression) -> BundleResult {
    let artifact = scratch.join("memory.dmp");
    fs::write(&artifact, artifact_payload()).unwrap();

    let sources = StaticEvidenceSources {
        timeline: Some(json!({"events": [{"id": "t1", "at": "2026-03-01T12:00:00Z"}]})),
        alerts: vec![json!({"id": "a1", "severity": "high"}), json!({"id": "a2"})],
        artifacts: vec![ArtifactRef {
            artifact_id: "mem-1".into(),
            filepath: artifact,
        }],
        ..Default::default()
    };
    let signer = Arc::new(ManifestSigner::from_pem(SIGNING_KEY).unwrap());
    let config = BuilderConfig::new(scratch.join("out"))
        .with_work_dir(scratch.join("work"))
        .with_compression(compression);

    BundleBuilder::new(Arc::new(sources), config)
        .with_signer(signer)
        .create_bundle("INC-42", 1)
        .await
        .expect("build failed")
}

fn verifier() -> BundleVerifier {
    BundleVerifier::new(load_public_key_pem(SIGNING_PUB, "fixture").unwrap()).unwrap()
}

fn unpack(result: &BundleResult, dest: &Path) {
    unpack_archive(&result.archive_path, dest, &ArchiveLimits::default()).unwrap();
}

#[tokio::test]
async fn signed_bundle_verifies_end_to_end() {
    let scratch = TempDir::new().unwrap();
    let result = build_signed(scratch.path(), Compression::Zstd).await;

    assert!(result.signed);
    assert_eq!(result.file_count, 3);
    assert_eq!(result.chunk_count, 4);
    let expected = reliquary_evidence::archive::resolve_compression(Compression::Zstd);
    assert!(result
        .archive_path
        .to_string_lossy()
        .ends_with(expected.extension()));
    let (digest, size) = reliquary_evidence::crypto::sha256_file(&result.archive_path).unwrap();
    assert_eq!(digest, result.bundle_hash);
    assert_eq!(size, result.size);

    let dest = scratch.path().join("x");
    unpack(&result, &dest);
    let verified = verifier().verify_bundle(&dest).expect("clean bundle must verify");

    assert_eq!(verified.manifest.incident_id, "INC-42");
    assert_eq!(verified.manifest.manifest_hash, result.manifest_hash);
    assert_eq!(verified.files_verified, 3);
    assert_eq!(verified.chunks_verified, 4);
    assert_eq!(
        verified.manifest.metadata.get("trust_level"),
        Some(&json!("signed"))
    );
    assert_eq!(
        fs::read(dest.join("artifacts/mem-1/memory.dmp")).unwrap(),
        artifact_payload()
    );
}

#[tokio::test]
async fn gzip_bundle_verifies() {
    let scratch = TempDir::new().unwrap();
    let result = build_signed(scratch.path(), Compression::Gzip).await;
    assert_eq!(result.compression, Compression::Gzip);

    let dest = scratch.path().join("x");
    unpack(&result, &dest);
    verifier().verify_bundle(&dest).unwrap();
}

#[tokio::test]
async fn one_byte_flip_in_artifact_fails() {
    let scratch = TempDir::new().unwrap();
    let result = build_signed(scratch.path(), Compression::Zstd).await;
    let dest = scratch.path().join("x");
    unpack(&result, &dest);

    let path = dest.join("artifacts/mem-1/memory.dmp");
    let mut bytes = fs::read(&path).unwrap();
    bytes[2 * 1024 * 1024 + 5] ^= 0x01;
    fs::write(&path, bytes).unwrap();

    let err = verifier().verify_bundle(&dest).unwrap_err();
    assert_eq!(err.code, ErrorCode::IntegrityFileHash);
}

#[tokio::test]
async fn edited_manifest_fails_hash_check() {
    let scratch = TempDir::new().unwrap();
    let result = build_signed(scratch.path(), Compression::Zstd).await;
    let dest = scratch.path().join("x");
    unpack(&result, &dest);

    let path = dest.join("manifest.json");
    let mut manifest: serde_json::Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
    manifest["metadata"]["trust_level"] = json!("unsigned");
    fs::write(&path, serde_json::to_vec(&manifest).unwrap()).unwrap();

    let err = verifier().verify_bundle(&dest).unwrap_err();
    assert_eq!(err.code, ErrorCode::IntegrityManifestHash);
}

#[tokio::test]
async fn altered_signature_fails() {
    let scratch = TempDir::new().unwrap();
    let result = build_signed(scratch.path(), Compression::Zstd).await;
    let dest = scratch.path().join("x");
    unpack(&result, &dest);

    let path = dest.join("manifest.sig");
    let mut sig: serde_json::Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
    let original = sig["signature"].as_str().unwrap().to_string();
    let flipped = if original.starts_with('A') { "B" } else { "A" };
    sig["signature"] = json!(format!("{}{}", flipped, &original[1..]));
    fs::write(&path, serde_json::to_vec(&sig).unwrap()).unwrap();

    let err = verifier().verify_bundle(&dest).unwrap_err();
    assert_eq!(err.code, ErrorCode::IntegritySignature);
}

#[tokio::test]
async fn missing_signature_fails_closed() {
    let scratch = TempDir::new().unwrap();
    let result = build_signed(scratch.path(), Compression::Zstd).await;
    let dest = scratch.path().join("x");
    unpack(&result, &dest);
    fs::remove_file(dest.join("manifest.sig")).unwrap();

    let err = verifier().verify_bundle(&dest).unwrap_err();
    assert_eq!(err.code, ErrorCode::ContractMissingSignature);
}

#[tokio::test]
async fn unlisted_file_fails_allowlist() {
    let scratch = TempDir::new().unwrap();
    let result = build_signed(scratch.path(), Compression::Zstd).await;
    let dest = scratch.path().join("x");
    unpack(&result, &dest);
    fs::write(dest.join("artifacts/mem-1/extra.bin"), b"smuggled").unwrap();

    let err = verifier().verify_bundle(&dest).unwrap_err();
    assert_eq!(err.code, ErrorCode::ContractUnexpectedFile);
}

#[tokio::test]
async fn wrong_verification_key_fails() {
    let scratch = TempDir::new().unwrap();
    let result = build_signed(scratch.path(), Compression::Zstd).await;
    let dest = scratch.path().join("x");
    unpack(&result, &dest);

    let other = BundleVerifier::new(load_public_key_pem(OTHER_PUB, "fixture").unwrap()).unwrap();
    let err = other.verify_bundle(&dest).unwrap_err();
    assert_eq!(err.code, ErrorCode::SecurityKeyMismatch);
}

#[test]
fn weak_verification_key_rejected() {
    let weak = load_public_key_pem(include_str!("fixtures/weak_key.pub.pem"), "fixture").unwrap();
    let err = BundleVerifier::new(weak).unwrap_err();
    assert_eq!(err.code, ErrorCode::LimitKeySize);
}

#[tokio::test]
async fn dot_and_empty_artifact_ids_never_reach_the_manifest() {
    let scratch = TempDir::new().unwrap();
    let mut artifacts = Vec::new();
    for (n, id) in ["", ".", "..", "pcap-1"].into_iter().enumerate() {
        let path = scratch.path().join(format!("f{n}.bin"));
        fs::write(&path, format!("artifact {n}")).unwrap();
        artifacts.push(ArtifactRef {
            artifact_id: id.into(),
            filepath: path,
        });
    }
    let sources = StaticEvidenceSources {
        artifacts,
        ..Default::default()
    };
    let signer = Arc::new(ManifestSigner::from_pem(SIGNING_KEY).unwrap());
    let result = BundleBuilder::new(
        Arc::new(sources),
        BuilderConfig::new(scratch.path().join("out")).with_compression(Compression::Gzip),
    )
    .with_signer(signer)
    .create_bundle("INC-9", 1)
    .await
    .unwrap();

    let dest = scratch.path().join("unpacked");
    unpack(&result, &dest);
    let verified = verifier().verify_bundle(&dest).unwrap();
    let paths: Vec<&str> = verified
        .manifest
        .files
        .iter()
        .map(|f| f.path.as_str())
        .filter(|p| p.starts_with("artifacts/"))
        .collect();
    assert_eq!(paths, vec!["artifacts/pcap-1/f3.bin"]);
}
