//! Scheduler engine: queue, adapters, job lifecycle, dispatch, checkpoints
//! and the background loops that tie them together.

pub mod adapter;
pub mod checkpoint;
pub mod config;
#[cfg(feature = "redis")]
pub mod consumer;
pub mod coordinator;
pub mod dispatch;
pub mod engine;
pub mod health;
pub mod jobs;
pub mod metadata;
pub mod queue;
pub mod retry;

pub use adapter::{Adapter, AdapterRegistry, Evaluation, JobRequest, Matcher, RetryDecision};
pub use checkpoint::{CheckpointStore, Checkpointer, InMemoryCheckpointStore, PostgresCheckpointStore};
pub use config::EngineConfig;
pub use coordinator::{Coordinator, CoordinatorHandle, CoordinatorStats};
pub use dispatch::{BackendRegistry, Dispatcher, ExecutionBackend};
pub use engine::{
    Engine, EngineError, EngineParts, EngineStats, IntakeOutcome, RestoreReport, ShutdownMode, TickReport,
};
pub use health::{HealthMonitor, HealthReport, UNHEALTHY_STATUS};
pub use jobs::{Job, JobLifecycleManager, JobStatus};
pub use metadata::{InMemoryMetadataStore, MetadataStore};
pub use queue::{EventQueue, EventRecord, OrderingPolicy};
