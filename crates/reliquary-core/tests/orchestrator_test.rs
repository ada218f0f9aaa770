//! End-to-end: enqueue, work, build, rehydrate.
//!
//! Sources are static in-process fixtures; everything else (SQLite files,
//! archives, artifact storage) is real and lives in a temp dir.

use reliquary_core::{
    EnqueueOptions, JobStatus, Orchestrator, OrchestratorConfig, RehydrateError, RehydrationStatus,
};
use reliquary_evidence::crypto::sha256_file;
use reliquary_evidence::{
    pack_directory, unpack_archive, ArchiveLimits, ArtifactRef, BundleResult, Compression,
    ErrorCode, StaticEvidenceSources,
};
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const FIXTURES: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures");

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

struct Harness {
    dir: TempDir,
    orchestrator: Orchestrator,
}

impl Harness {
    fn new() -> Self {
        init_tracing();
        let dir = TempDir::new().unwrap();
        let root = dir.path();

        let artifact = root.join("host-1.pcap");
        fs::write(&artifact, (0..200_000u32).map(|i| (i % 253) as u8).collect::<Vec<_>>()).unwrap();

        let sources = StaticEvidenceSources {
            timeline: Some(json!({"events": [
                {"id": "t1", "at": "2026-03-01T12:00:00Z", "what": "page"},
                {"id": "t2", "at": "2026-03-01T12:05:00Z", "what": "ack"},
            ]})),
            alerts: vec![
                json!({"alert_id": "a1", "severity": "critical"}),
                json!({"alert_id": "a2", "severity": "low"}),
                json!({"alert_id": "a3", "severity": "low"}),
            ],
            artifacts: vec![ArtifactRef {
                artifact_id: "pcap-1".into(),
                filepath: artifact,
            }],
            ..Default::default()
        };

        let config = OrchestratorConfig::default()
            .with_database_path(root.join("queue.db"))
            .with_state_database_path(root.join("state.db"))
            .with_output_dir(root.join("bundles"))
            .with_work_dir(root.join("work"))
            .with_artifact_root(root.join("restored"))
            .with_workers(2)
            .with_poll_interval_ms(20)
            .with_signing_key(Path::new(FIXTURES).join("signing_key.pem"))
            .with_verify_key(Path::new(FIXTURES).join("signing_key.pub.pem"));

        let orchestrator = Orchestrator::with_sources(config, Arc::new(sources)).unwrap();
        Self { dir, orchestrator }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    async fn build(&self) -> BundleResult {
        self.orchestrator
            .builder()
            .create_bundle("INC-1", 1)
            .await
            .expect("build failed")
    }

    /// Unpack, mutate, and repack a bundle into `name`.
    fn tamper(&self, bundle: &BundleResult, name: &str, mutate: impl FnOnce(&Path)) -> PathBuf {
        let staging = self.path(&format!("{name}-staging"));
        unpack_archive(&bundle.archive_path, &staging, &ArchiveLimits::default()).unwrap();
        mutate(&staging);
        let out = self.path(name);
        pack_directory(&staging, &out, Compression::Zstd).unwrap();
        out
    }

    fn restored_files(&self) -> usize {
        let root = self.path("restored");
        if !root.exists() {
            return 0;
        }
        walk(&root)
    }
}

fn walk(dir: &Path) -> usize {
    fs::read_dir(dir)
        .unwrap()
        .map(|e| {
            let path = e.unwrap().path();
            if path.is_dir() {
                walk(&path)
            } else {
                1
            }
        })
        .sum()
}

fn flip_first_byte(path: &Path) {
    let mut bytes = fs::read(path).unwrap();
    bytes[0] ^= 0xff;
    fs::write(path, bytes).unwrap();
}

async fn wait_for(orchestrator: &Orchestrator, job_id: &str) -> reliquary_core::Job {
    for _ in 0..1000 {
        let job = orchestrator.queue().get(job_id).unwrap().unwrap();
        if job.status.is_terminal() {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("job {job_id} never finished");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_bundle_job_completes_with_recomputable_hash() {
    let h = Harness::new();
    let job_id = h
        .orchestrator
        .enqueue_bundle("INC-1", 256, EnqueueOptions::default())
        .unwrap();
    assert_eq!(
        h.orchestrator.queue().get(&job_id).unwrap().unwrap().status,
        JobStatus::Pending
    );

    let pool = h.orchestrator.start_workers();
    let job = wait_for(&h.orchestrator, &job_id).await;
    pool.stop().await;

    assert_eq!(job.status, JobStatus::Completed, "error: {:?}", job.error_message);
    assert!(job.worker_id.is_some());
    assert!(job.started_at.is_some() && job.completed_at.is_some());

    let result = job.result.unwrap();
    let archive = PathBuf::from(result["archive_path"].as_str().unwrap());
    let (digest, size) = sha256_file(&archive).unwrap();
    assert_eq!(Value::String(digest), result["bundle_hash"]);
    assert_eq!(json!(size), result["size"]);
    assert_eq!(result["signed"], json!(true));
    assert_eq!(result["file_count"], json!(3));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_rehydrate_job_restores_state() {
    let h = Harness::new();
    let bundle = h.build().await;

    let job_id = h
        .orchestrator
        .enqueue_rehydrate(&bundle.archive_path, true, Some("rk-job".into()), EnqueueOptions::default())
        .unwrap();
    let pool = h.orchestrator.start_workers();
    let job = wait_for(&h.orchestrator, &job_id).await;
    pool.stop().await;

    assert_eq!(job.status, JobStatus::Completed, "error: {:?}", job.error_message);
    let result = job.result.unwrap();
    assert_eq!(result["status"], json!("completed"));
    assert_eq!(result["verified"], json!(true));
    assert_eq!(result["timeline_restored"], json!(2));
    assert_eq!(result["alerts_restored"], json!(3));
    assert_eq!(result["artifacts_restored"], json!(1));

    let restored = h.path("restored/INC-1/pcap-1/host-1.pcap");
    assert_eq!(fs::read(restored).unwrap(), fs::read(h.path("host-1.pcap")).unwrap());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_altered_signature_aborts_with_zero_writes() {
    let h = Harness::new();
    let bundle = h.build().await;
    let tampered = h.tamper(&bundle, "bad-sig.tar.zst", |dir| {
        let path = dir.join("manifest.sig");
        let mut record: Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        let sig = record["signature"].as_str().unwrap().to_string();
        let replacement = if sig.starts_with('A') { "B" } else { "A" };
        record["signature"] = json!(format!("{replacement}{}", &sig[1..]));
        fs::write(&path, serde_json::to_vec(&record).unwrap()).unwrap();
    });

    let rehydrator = h.orchestrator.rehydrator();
    let before = rehydrator.state().counts("INC-1").unwrap();
    let err = rehydrator
        .rehydrate(&tampered, true, Some("rk-tampered"))
        .await
        .unwrap_err();

    match &err {
        RehydrateError::Verification(e) => assert_eq!(e.code(), ErrorCode::IntegritySignature),
        other => panic!("expected verification failure, got {other}"),
    }
    assert!(!err.is_retryable());
    assert_eq!(rehydrator.state().counts("INC-1").unwrap(), before);
    assert!(rehydrator.state().idempotency_record("rk-tampered").unwrap().is_none());
    assert_eq!(h.restored_files(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_verified_rehydrate_rejects_corrupt_artifact() {
    let h = Harness::new();
    let bundle = h.build().await;
    let tampered = h.tamper(&bundle, "bad-artifact.tar.zst", |dir| {
        flip_first_byte(&dir.join("artifacts/pcap-1/host-1.pcap"));
    });

    let rehydrator = h.orchestrator.rehydrator();
    let err = rehydrator.rehydrate(&tampered, true, None).await.unwrap_err();
    assert!(matches!(
        &err,
        RehydrateError::Verification(e) if e.code() == ErrorCode::IntegrityFileHash
    ));
    let counts = rehydrator.state().counts("INC-1").unwrap();
    assert_eq!((counts.timeline, counts.alerts, counts.artifacts), (0, 0, 0));
    assert_eq!(h.restored_files(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_same_idempotency_key_twice_is_skipped() {
    let h = Harness::new();
    let bundle = h.build().await;
    let rehydrator = h.orchestrator.rehydrator();

    let first = rehydrator
        .rehydrate(&bundle.archive_path, true, Some("rk-1"))
        .await
        .unwrap();
    assert_eq!(first.status, RehydrationStatus::Completed);
    assert_eq!((first.timeline_restored, first.alerts_restored), (2, 3));
    let after_first = rehydrator.state().counts("INC-1").unwrap();

    let second = rehydrator
        .rehydrate(&bundle.archive_path, true, Some("rk-1"))
        .await
        .unwrap();
    assert_eq!(second.status, RehydrationStatus::Skipped);
    assert_eq!(second.incident_id, "INC-1");
    assert_eq!(rehydrator.state().counts("INC-1").unwrap(), after_first);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_new_key_on_restored_bundle_merges_as_noop() {
    let h = Harness::new();
    let bundle = h.build().await;
    let rehydrator = h.orchestrator.rehydrator();

    rehydrator
        .rehydrate(&bundle.archive_path, true, Some("rk-a"))
        .await
        .unwrap();
    let again = rehydrator
        .rehydrate(&bundle.archive_path, true, Some("rk-b"))
        .await
        .unwrap();

    assert_eq!(again.status, RehydrationStatus::Completed);
    assert_eq!((again.timeline_restored, again.timeline_unchanged), (0, 2));
    assert_eq!((again.alerts_restored, again.alerts_unchanged), (0, 3));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unverified_rehydrate_skips_corrupt_artifact() {
    let h = Harness::new();
    let bundle = h.build().await;
    let tampered = h.tamper(&bundle, "unverified.tar.zst", |dir| {
        flip_first_byte(&dir.join("artifacts/pcap-1/host-1.pcap"));
    });

    let result = h
        .orchestrator
        .rehydrator()
        .rehydrate(&tampered, false, None)
        .await
        .unwrap();

    assert_eq!(result.status, RehydrationStatus::Completed);
    assert!(!result.verified);
    assert_eq!(result.timeline_restored, 2);
    assert_eq!(result.artifacts_restored, 0);
    assert_eq!(result.artifacts_skipped, 1);
    assert!(!h.path("restored/INC-1/pcap-1/host-1.pcap").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unverified_rehydrate_still_checks_manifest_hash() {
    let h = Harness::new();
    let bundle = h.build().await;
    let tampered = h.tamper(&bundle, "edited-manifest.tar.zst", |dir| {
        let path = dir.join("manifest.json");
        let mut manifest: Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        manifest["metadata"]["trust_level"] = json!("elevated");
        fs::write(&path, serde_json::to_vec(&manifest).unwrap()).unwrap();
    });

    let err = h
        .orchestrator
        .rehydrator()
        .rehydrate(&tampered, false, None)
        .await
        .unwrap_err();
    assert!(matches!(
        &err,
        RehydrateError::Verification(e) if e.code() == ErrorCode::IntegrityManifestHash
    ));
    assert_eq!(h.orchestrator.rehydrator().state().counts("INC-1").unwrap().alerts, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_missing_bundle_fails_job_without_retry() {
    let h = Harness::new();
    let job_id = h
        .orchestrator
        .enqueue_rehydrate(h.path("nope.tar.zst"), true, None, EnqueueOptions::default())
        .unwrap();
    let pool = h.orchestrator.start_workers();
    let job = wait_for(&h.orchestrator, &job_id).await;
    pool.stop().await;

    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.retry_count, 0);
    assert!(job.error_message.unwrap().contains("bundle not found"));
}
