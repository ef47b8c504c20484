//! Error types for the ingest pipeline

use thiserror::Error;
use uuid::Uuid;

use crate::model::IngestStage;

/// Result type alias for ingest operations
pub type Result<T> = std::result::Result<T, IngestError>;

/// Errors surfaced by stages, stores and collaborators
///
/// Item-level failures never show up here: tasks catch them and record them
/// on the item, the task record and the audit log.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Ingest operation not found: {0}")]
    IngestNotFound(Uuid),

    #[error("Ingest item not found: {0}")]
    ItemNotFound(Uuid),

    #[error("Invalid stage: {0}")]
    InvalidStage(String),

    #[error("Invalid task status: {0}")]
    InvalidTaskStatus(String),

    #[error("Ingest stage cannot move from {from} to {to}")]
    StageConflict { from: IngestStage, to: IngestStage },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Upload error: {0}")]
    Upload(String),

    #[error("Executor error: {0}")]
    Executor(String),

    #[error("BIM error: {0}")]
    Bim(#[from] bim_common::BimError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl IngestError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn upload(msg: impl Into<String>) -> Self {
        Self::Upload(msg.into())
    }

    pub fn executor(msg: impl Into<String>) -> Self {
        Self::Executor(msg.into())
    }
}
