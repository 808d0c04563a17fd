//! Trainyard - training session orchestration for small text classifiers
//!
//! This crate coordinates the full lifecycle of model training jobs: dataset
//! encoding through a shared grow-only tokenizer, epoch loops on a candle
//! recurrent classifier or a deterministic synthetic engine, cooperative
//! stop/pause/resume, checkpoint artifacts, and progress fan-out over a
//! broadcast bus.

#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod session;
pub mod storage;
pub mod tokenizer;
pub mod worker;

// Re-exports
pub use config::{Config, EngineKind, ExecutionStrategy, StorageBackend};
pub use engine::{CancelToken, EventSink, RunEvent, RunOutcome, TrainingEngine};
pub use error::{Error, Result};
pub use events::{Event, EventBus};
pub use session::{
    ModelId, ModelRecord, ModelStatus, Orchestrator, SessionConfig, SessionId, SessionStatus,
    TrainingSession,
};
pub use storage::{create_storage, Storage};
pub use tokenizer::{Tokenizer, Vocabulary};
pub use worker::{WorkerMetric, WorkerPool};
