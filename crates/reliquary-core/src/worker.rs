//! WorkerPool: N polling loops that claim jobs and dispatch them.
//!
//! Each job body runs in its own task so a long build never blocks the
//! loop that owns it from recording the outcome. Queue calls are blocking
//! SQLite work and go through `spawn_blocking`.
//!
//! Shutdown is cooperative: [`WorkerPool::stop`] prevents new claims and
//! waits for in-flight job bodies to finish. Nothing is cancelled.

use crate::queue::{Job, JobPayload, JobQueue, JobType};
use crate::rehydrate::{RehydrateError, Rehydrator};
use async_trait::async_trait;
use reliquary_evidence::{BuildError, BundleBuilder};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};

#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Rehydrate(#[from] RehydrateError),

    #[error("job result could not be encoded: {0}")]
    Encode(String),

    #[error("job body panicked: {0}")]
    Panicked(String),
}

impl JobError {
    /// Decides the `retry` flag passed to [`JobQueue::fail`].
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Build(e) => e.is_retryable(),
            Self::Rehydrate(e) => e.is_retryable(),
            Self::Encode(_) => false,
            Self::Panicked(_) => true,
        }
    }
}

/// Runs one claimed job. The returned value is stored as the job result.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, job: &Job) -> Result<Option<Value>, JobError>;
}

/// Dispatches bundle builds and rehydrations.
pub struct OrchestratorExecutor {
    builder: Arc<BundleBuilder>,
    rehydrator: Arc<Rehydrator>,
}

impl OrchestratorExecutor {
    pub fn new(builder: Arc<BundleBuilder>, rehydrator: Arc<Rehydrator>) -> Self {
        Self {
            builder,
            rehydrator,
        }
    }
}

#[async_trait]
impl JobExecutor for OrchestratorExecutor {
    async fn execute(&self, job: &Job) -> Result<Option<Value>, JobError> {
        let value = match &job.payload {
            JobPayload::BundleCreate(p) => {
                let result = self
                    .builder
                    .create_bundle(&p.incident_id, p.chunk_size_mb)
                    .await?;
                serde_json::to_value(result)
            }
            JobPayload::Rehydrate(p) => {
                let result = self
                    .rehydrator
                    .rehydrate(&p.bundle_path, p.verify_signature, p.idempotency_key.as_deref())
                    .await?;
                serde_json::to_value(result)
            }
        };
        value
            .map(Some)
            .map_err(|e| JobError::Encode(e.to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub workers: usize,
    /// Sleep between empty claims.
    pub poll_interval: Duration,
    /// Only claim jobs of this type.
    pub job_type: Option<JobType>,
    pub worker_id_prefix: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            poll_interval: Duration::from_secs(1),
            job_type: None,
            worker_id_prefix: "worker".into(),
        }
    }
}

pub struct WorkerPool {
    shutdown: watch::Sender<bool>,
    tasks: JoinSet<()>,
    worker_ids: Vec<String>,
}

impl WorkerPool {
    /// Spawn the workers onto the current tokio runtime.
    pub fn start(queue: JobQueue, executor: Arc<dyn JobExecutor>, config: WorkerConfig) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut tasks = JoinSet::new();
        let mut worker_ids = Vec::new();

        for n in 0..config.workers.max(1) {
            let worker_id = format!("{}-{}-{}", config.worker_id_prefix, std::process::id(), n);
            let worker = Worker {
                worker_id: worker_id.clone(),
                queue: queue.clone(),
                executor: executor.clone(),
                poll_interval: config.poll_interval,
                job_type: config.job_type,
            };
            tasks.spawn(worker.run(shutdown_rx.clone()));
            worker_ids.push(worker_id);
        }

        info!(workers = worker_ids.len(), "worker pool started");
        Self {
            shutdown,
            tasks,
            worker_ids,
        }
    }

    pub fn worker_ids(&self) -> &[String] {
        &self.worker_ids
    }

    /// Stop claiming and wait for running jobs to finish.
    pub async fn stop(mut self) {
        let _ = self.shutdown.send(true);
        while let Some(res) = self.tasks.join_next().await {
            if let Err(e) = res {
                error!(error = %e, "worker task ended abnormally");
            }
        }
        info!("worker pool stopped");
    }
}

struct Worker {
    worker_id: String,
    queue: JobQueue,
    executor: Arc<dyn JobExecutor>,
    poll_interval: Duration,
    job_type: Option<JobType>,
}

impl Worker {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        debug!(worker_id = %self.worker_id, "worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.claim_next().await {
                Ok(Some(job)) => {
                    self.process(job).await;
                    continue;
                }
                Ok(None) => {}
                Err(e) => warn!(worker_id = %self.worker_id, error = %e, "claim failed"),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                res = shutdown.changed() => {
                    if res.is_err() {
                        break;
                    }
                }
            }
        }
        debug!(worker_id = %self.worker_id, "worker stopped");
    }

    async fn claim_next(&self) -> anyhow::Result<Option<Job>> {
        let queue = self.queue.clone();
        let worker_id = self.worker_id.clone();
        let job_type = self.job_type;
        let job = tokio::task::spawn_blocking(move || queue.claim(&worker_id, job_type)).await??;
        Ok(job)
    }

    async fn process(&self, job: Job) {
        let span = info_span!(
            "job",
            job_id = %job.job_id,
            job_type = %job.job_type(),
            worker_id = %self.worker_id
        );
        let job_id = job.job_id.clone();
        let executor = self.executor.clone();

        let body = tokio::spawn(async move { executor.execute(&job).await }.instrument(span.clone()));
        let outcome = match body.await {
            Ok(outcome) => outcome,
            Err(e) => Err(JobError::Panicked(e.to_string())),
        };

        let queue = self.queue.clone();
        let recorded = tokio::task::spawn_blocking(move || match outcome {
            Ok(value) => queue.complete(&job_id, value.as_ref()),
            Err(e) => queue
                .fail(&job_id, &e.to_string(), e.is_retryable())
                .map(|_| ()),
        })
        .instrument(span.clone())
        .await;
        span.in_scope(|| match recorded {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "could not record job outcome"),
            Err(e) => error!(error = %e, "job outcome task failed"),
        });
    }
}
