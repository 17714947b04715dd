//! Ingestion engine
//!
//! Pulls batches from pluggable sources, checkpoints progress per source and
//! persists normalized records idempotently.

pub mod adapter;
pub mod checkpoint;
pub mod drift;
pub mod entity;
pub mod failure;
pub mod rate_limiter;
pub mod records;
pub mod retry;
pub mod runner;
pub mod scheduler;
pub mod sources;
pub mod types;

pub use adapter::SourceAdapter;
pub use checkpoint::{CheckpointStore, RunHandle};
pub use drift::{DriftReport, SchemaDriftDetector};
pub use entity::EntityResolver;
pub use failure::{FailureInjector, FailureKind};
pub use rate_limiter::TokenBucket;
pub use records::RecordStore;
pub use retry::RetryPolicy;
pub use runner::{IngestionRunner, RunnerBuilder};
pub use scheduler::Scheduler;
pub use types::{
    Checkpoint, CheckpointStatus, DriftObservation, EntityMapping, FetchedBatch, MasterEntity,
    NormalizedRecord, RawRecord, RunRecord, RunStatus, StoredRecord,
};
