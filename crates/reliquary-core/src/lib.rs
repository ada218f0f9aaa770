//! Incident bundle orchestration.
//!
//! A durable SQLite job queue feeds a pool of workers that build signed
//! evidence bundles ([`reliquary_evidence::BundleBuilder`]) or restore them
//! into incident state ([`rehydrate::Rehydrator`]).

pub mod config;
pub mod orchestrator;
pub mod queue;
pub mod rehydrate;
pub mod state;
pub mod worker;

pub use config::{ConfigError, OrchestratorConfig};
pub use orchestrator::Orchestrator;
pub use queue::{
    EnqueueOptions, FailOutcome, Job, JobPayload, JobQueue, JobStatus, JobType, QueueError,
    QueueStats, QueueStore, SqliteQueueStore,
};
pub use rehydrate::{
    ArtifactIngestor, RehydrateError, RehydrationResult, RehydrationStatus, Rehydrator,
    RehydratorConfig, StateReconciler,
};
pub use state::{StateError, StateStore};
pub use worker::{JobError, JobExecutor, OrchestratorExecutor, WorkerConfig, WorkerPool};
