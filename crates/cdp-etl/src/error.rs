//! ETL error types
//!
//! The pipeline distinguishes errors that skip a single record
//! ([`EtlError::Validation`]) from errors that abort the whole run. Transient
//! fetch errors are retried by the runner before they escalate.

use crate::ingest::failure::FailureKind;
use thiserror::Error;
use uuid::Uuid;

/// Result type alias for ETL operations
pub type EtlResult<T> = std::result::Result<T, EtlError>;

#[derive(Error, Debug)]
pub enum EtlError {
    #[error("Transient {kind} error: {message}")]
    TransientFetch { kind: FailureKind, message: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Persistence error: {0}")]
    Persistence(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Orchestration error: {0}")]
    Orchestration(String),

    #[error("Rate limit error: {0}")]
    RateLimit(String),

    #[error("A run is already in progress for source '{0}'")]
    RunInProgress(String),

    #[error("Run {run_id} no longer owns the checkpoint for source '{source_name}'")]
    StaleRun { source_name: String, run_id: Uuid },

    #[error("Run cancelled: {0}")]
    Cancelled(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown source: {0}")]
    UnknownSource(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EtlError {
    pub fn transient(kind: FailureKind, message: impl Into<String>) -> Self {
        EtlError::TransientFetch {
            kind,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        EtlError::Validation(message.into())
    }

    pub fn orchestration(message: impl Into<String>) -> Self {
        EtlError::Orchestration(message.into())
    }

    /// Errors the runner retries with backoff
    pub fn is_transient(&self) -> bool {
        matches!(self, EtlError::TransientFetch { .. })
    }

    /// Errors that skip one record without aborting the batch
    pub fn is_validation(&self) -> bool {
        matches!(self, EtlError::Validation(_))
    }
}

impl From<cdp_common::CommonError> for EtlError {
    fn from(err: cdp_common::CommonError) -> Self {
        match err {
            cdp_common::CommonError::Serialization(e) => EtlError::Serialization(e),
            other => EtlError::Orchestration(other.to_string()),
        }
    }
}
