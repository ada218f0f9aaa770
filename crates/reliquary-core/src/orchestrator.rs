//! Wires configuration into a queue, a builder, a rehydrator, and workers.

use crate::config::OrchestratorConfig;
use crate::queue::{EnqueueOptions, JobPayload, JobQueue, QueueError, SqliteQueueStore};
use crate::rehydrate::{Rehydrator, RehydratorConfig};
use crate::state::StateStore;
use crate::worker::{JobExecutor, OrchestratorExecutor, WorkerConfig, WorkerPool};
use anyhow::Context;
use reliquary_evidence::{
    load_public_key_file, BuilderConfig, BundleBuilder, BundleVerifier, EvidenceSources,
    HttpEvidenceSources, ManifestSigner,
};
use std::path::PathBuf;
use std::sync::Arc;

pub struct Orchestrator {
    config: OrchestratorConfig,
    queue: JobQueue,
    builder: Arc<BundleBuilder>,
    rehydrator: Arc<Rehydrator>,
}

impl Orchestrator {
    /// Build with HTTP evidence sources from `config.sources`.
    pub fn from_config(config: OrchestratorConfig) -> anyhow::Result<Self> {
        let sources = HttpEvidenceSources::new(config.sources.clone())
            .context("failed to build evidence source client")?;
        Self::with_sources(config, Arc::new(sources))
    }

    pub fn with_sources(
        config: OrchestratorConfig,
        sources: Arc<dyn EvidenceSources>,
    ) -> anyhow::Result<Self> {
        config.validate()?;

        let store = SqliteQueueStore::open(&config.database_path).with_context(|| {
            format!("failed to open job queue {}", config.database_path.display())
        })?;
        let queue = JobQueue::new(Arc::new(store)).with_default_max_retries(config.default_max_retries);

        let mut builder_config = BuilderConfig::new(&config.output_dir)
            .with_compression(config.compression)
            .with_require_signature(config.require_signature);
        if let Some(dir) = &config.work_dir {
            builder_config = builder_config.with_work_dir(dir);
        }
        let mut builder = BundleBuilder::new(sources, builder_config);
        if let Some(path) = &config.signing_key_path {
            let signer = ManifestSigner::from_pem_file(path)
                .with_context(|| format!("failed to load signing key {}", path.display()))?;
            tracing::info!(key_id = %signer.key_id(), "bundle signing enabled");
            builder = builder.with_signer(Arc::new(signer));
        } else {
            tracing::warn!("no signing key configured; bundles will be unsigned");
        }

        let state = StateStore::open(&config.state_database_path).with_context(|| {
            format!(
                "failed to open state store {}",
                config.state_database_path.display()
            )
        })?;
        let mut rehydrator_config = RehydratorConfig::new(&config.artifact_root);
        if let Some(dir) = &config.work_dir {
            rehydrator_config = rehydrator_config.with_work_dir(dir);
        }
        let mut rehydrator = Rehydrator::new(state, rehydrator_config);
        if let Some(path) = &config.verify_key_path {
            let key = load_public_key_file(path)
                .with_context(|| format!("failed to load verification key {}", path.display()))?;
            let verifier = BundleVerifier::new(key)
                .with_context(|| format!("unusable verification key {}", path.display()))?;
            rehydrator = rehydrator.with_verifier(Arc::new(verifier));
        }

        Ok(Self {
            config,
            queue,
            builder: Arc::new(builder),
            rehydrator: Arc::new(rehydrator),
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn builder(&self) -> &Arc<BundleBuilder> {
        &self.builder
    }

    pub fn rehydrator(&self) -> &Arc<Rehydrator> {
        &self.rehydrator
    }

    pub fn enqueue_bundle(
        &self,
        incident_id: &str,
        chunk_size_mb: u64,
        options: EnqueueOptions,
    ) -> Result<String, QueueError> {
        self.queue
            .enqueue(JobPayload::bundle_create(incident_id, chunk_size_mb), options)
    }

    /// The rehydrate idempotency key also dedupes the enqueue, unless
    /// `options` carries its own.
    pub fn enqueue_rehydrate(
        &self,
        bundle_path: impl Into<PathBuf>,
        verify_signature: bool,
        idempotency_key: Option<String>,
        mut options: EnqueueOptions,
    ) -> Result<String, QueueError> {
        if options.idempotency_key.is_none() {
            options.idempotency_key = idempotency_key.as_ref().map(|k| format!("rehydrate:{k}"));
        }
        self.queue.enqueue(
            JobPayload::rehydrate(bundle_path, verify_signature, idempotency_key),
            options,
        )
    }

    pub fn executor(&self) -> Arc<dyn JobExecutor> {
        Arc::new(OrchestratorExecutor::new(
            self.builder.clone(),
            self.rehydrator.clone(),
        ))
    }

    /// Start `config.workers` workers on the current runtime.
    pub fn start_workers(&self) -> WorkerPool {
        WorkerPool::start(
            self.queue.clone(),
            self.executor(),
            WorkerConfig {
                workers: self.config.workers,
                poll_interval: self.config.poll_interval(),
                ..WorkerConfig::default()
            },
        )
    }
}
