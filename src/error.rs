//! Error types for the trainyard system

use thiserror::Error;

use crate::session::types::ModelId;

/// Main error type for trainyard operations
#[derive(Error, Debug)]
pub enum Error {
    /// Model row lookup miss, rejected before dispatch
    #[error("model {0} not found")]
    ModelNotFound(ModelId),

    /// Dataset lookup miss, rejected before dispatch
    #[error("dataset '{0}' not found")]
    DatasetNotFound(String),

    /// A non-terminal session already exists for the model
    #[error("model {0} already has an active training session")]
    AlreadyTraining(ModelId),

    /// Stop/pause/resume issued with nothing running
    #[error("no active training session for model {0}")]
    NoActiveSession(ModelId),

    /// Encoded token id fell outside the vocabulary at train time
    #[error("encoded id {id} out of range for vocabulary of size {vocab_size}")]
    EncodingOverflow { id: u32, vocab_size: usize },

    /// Failure inside the epoch loop
    #[error("compute failure: {0}")]
    ComputeFailure(String),

    /// Worker pool rejected or could not accept a task
    #[error("worker pool unavailable: {0}")]
    WorkerUnavailable(String),

    /// Row or artifact write failed
    #[error("persistence failure: {0}")]
    Persistence(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid input
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Tensor operation error
    #[error("tensor operation error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Other errors
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for trainyard operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a compute failure error
    pub fn compute(msg: impl Into<String>) -> Self {
        Self::ComputeFailure(msg.into())
    }

    /// Create a worker-unavailable error
    pub fn worker(msg: impl Into<String>) -> Self {
        Self::WorkerUnavailable(msg.into())
    }

    /// Create a persistence error
    pub fn persistence(msg: impl Into<String>) -> Self {
        Self::Persistence(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// True for errors a caller of `start`/`stop` receives synchronously,
    /// before any dispatch happened.
    pub fn is_pre_dispatch(&self) -> bool {
        matches!(
            self,
            Self::ModelNotFound(_)
                | Self::DatasetNotFound(_)
                | Self::AlreadyTraining(_)
                | Self::NoActiveSession(_)
                | Self::WorkerUnavailable(_)
                | Self::Config(_)
                | Self::InvalidInput(_)
        )
    }
}
