//! Row storage behind the orchestrator.
//!
//! Only the rows this core reads and writes are modeled; schema migration
//! and the rest of the product's tables live elsewhere. Datasets are
//! read-only lookups here; the surrounding product owns their CRUD and
//! seeds them through `insert_dataset`.

pub mod json;
pub mod memory;

pub use json::JsonStorage;
pub use memory::MemoryStorage;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::Result;
use crate::session::types::{EpochMetrics, ModelId, ModelRecord, SessionId, TrainingSession};

/// Severity of a training log row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    /// Routine progress
    Info,
    /// Recoverable anomaly
    Warn,
    /// Failure
    Error,
}

/// One row of the training log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingLogRow {
    /// Model the row belongs to
    pub model_id: ModelId,
    /// Severity
    pub level: LogLevel,
    /// Human-readable message
    pub message: String,
    /// Epoch the row refers to, when applicable
    pub epoch: Option<usize>,
    /// Loss at that epoch, when applicable
    pub loss: Option<f64>,
    /// Accuracy at that epoch, when applicable
    pub accuracy: Option<f64>,
    /// Row creation time
    pub timestamp: DateTime<Utc>,
}

/// One persisted checkpoint reference. Append-only, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointRow {
    /// Model the artifact belongs to
    pub model_id: ModelId,
    /// Epoch the artifact captures
    pub epoch: usize,
    /// Artifact location on disk
    pub file_path: PathBuf,
    /// Metrics at checkpoint time
    pub metrics: Option<EpochMetrics>,
    /// Row creation time
    pub created_at: DateTime<Utc>,
}

/// One labeled text sample
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sample {
    /// Raw text
    pub text: String,
    /// Class label index
    pub label: u32,
}

/// A dataset owned by the surrounding product
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetRecord {
    /// Dataset identity
    pub id: String,
    /// Human-readable name
    pub name: String,
    /// Labeled samples
    pub samples: Vec<Sample>,
}

impl DatasetRecord {
    /// Number of distinct classes, assuming dense labels from zero
    pub fn num_classes(&self) -> usize {
        self.samples
            .iter()
            .map(|s| s.label as usize + 1)
            .max()
            .unwrap_or(0)
    }
}

/// Persistence surface the orchestrator writes through.
///
/// Implementations must tolerate concurrent calls; the orchestrator never
/// assumes a write succeeded before the call returns.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Fetch a model row
    async fn fetch_model(&self, id: ModelId) -> Result<Option<ModelRecord>>;

    /// Insert or replace a model row
    async fn upsert_model(&self, record: ModelRecord) -> Result<()>;

    /// Fetch a dataset
    async fn fetch_dataset(&self, id: &str) -> Result<Option<DatasetRecord>>;

    /// Seed a dataset (called by the surrounding product, not this core)
    async fn insert_dataset(&self, record: DatasetRecord) -> Result<()>;

    /// Insert or replace a session row
    async fn upsert_session(&self, session: TrainingSession) -> Result<()>;

    /// Fetch a session row
    async fn fetch_session(&self, id: SessionId) -> Result<Option<TrainingSession>>;

    /// All sessions recorded for a model, oldest first
    async fn sessions_for_model(&self, model_id: ModelId) -> Result<Vec<TrainingSession>>;

    /// Append a training log row
    async fn append_log(&self, row: TrainingLogRow) -> Result<()>;

    /// All log rows for a model, oldest first
    async fn logs_for_model(&self, model_id: ModelId) -> Result<Vec<TrainingLogRow>>;

    /// Record a checkpoint reference
    async fn insert_checkpoint(&self, row: CheckpointRow) -> Result<()>;

    /// All checkpoint rows for a model, oldest first
    async fn checkpoints_for_model(&self, model_id: ModelId) -> Result<Vec<CheckpointRow>>;

    /// The highest-epoch checkpoint recorded for a model
    async fn latest_checkpoint(&self, model_id: ModelId) -> Result<Option<CheckpointRow>> {
        let rows = self.checkpoints_for_model(model_id).await?;
        Ok(rows.into_iter().max_by_key(|row| row.epoch))
    }
}

/// Build the storage backend selected by configuration
pub fn create_storage(config: &crate::config::StorageConfig) -> Result<Arc<dyn Storage>> {
    match config.backend {
        crate::config::StorageBackend::Memory => Ok(Arc::new(MemoryStorage::new())),
        crate::config::StorageBackend::Json => {
            let storage = JsonStorage::open(&config.data_dir)?;
            Ok(Arc::new(storage))
        }
    }
}
