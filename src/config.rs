//! Configuration structures for the trainyard system

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::session::types::SessionConfig;

/// Main configuration for the training orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Tokenizer configuration
    pub tokenizer: TokenizerConfig,
    /// Compute engine configuration
    pub engine: EngineConfig,
    /// Checkpoint configuration
    pub checkpoint: CheckpointConfig,
    /// Execution strategy configuration
    pub execution: ExecutionConfig,
    /// Hyperparameters applied when a job request omits its own
    pub training: SessionConfig,
    /// Row storage configuration
    pub storage: StorageConfig,
}

impl Config {
    /// Load configuration from a file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Write configuration to a file
    pub fn save(&self, path: impl AsRef<std::path::Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.tokenizer.max_len == 0 {
            return Err(Error::config("Tokenizer max_len must be > 0"));
        }

        if self.engine.embedding_dim == 0 {
            return Err(Error::config("Engine embedding dimension must be > 0"));
        }
        if self.engine.hidden_dim == 0 {
            return Err(Error::config("Engine hidden dimension must be > 0"));
        }

        if self.checkpoint.every_epochs == 0 {
            return Err(Error::config("Checkpoint cadence must be > 0 epochs"));
        }

        if matches!(self.execution.strategy, ExecutionStrategy::Pooled)
            && self.execution.workers == 0
        {
            return Err(Error::config("Pooled execution requires at least one worker"));
        }
        if self.execution.metrics_interval_secs == 0 {
            return Err(Error::config("Metrics sampling interval must be > 0 seconds"));
        }

        if self.training.epochs == 0 {
            return Err(Error::config("Training epochs must be > 0"));
        }
        if self.training.batch_size == 0 {
            return Err(Error::config("Training batch size must be > 0"));
        }
        if self.training.learning_rate <= 0.0 {
            return Err(Error::config("Learning rate must be > 0"));
        }
        if !(0.0..1.0).contains(&self.training.validation_split) {
            return Err(Error::config("Validation split must be in [0, 1)"));
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tokenizer: TokenizerConfig::default(),
            engine: EngineConfig::default(),
            checkpoint: CheckpointConfig::default(),
            execution: ExecutionConfig::default(),
            training: SessionConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

/// Tokenizer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenizerConfig {
    /// Fixed length of every encoded sequence
    pub max_len: usize,
    /// Location of the vocabulary artifact
    pub vocab_path: PathBuf,
}

impl Default for TokenizerConfig {
    fn default() -> Self {
        Self {
            max_len: 64,
            vocab_path: PathBuf::from("data/vocabulary.json"),
        }
    }
}

/// Compute engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Which engine implementation to run
    pub kind: EngineKind,
    /// Device to place tensors on
    pub device: DeviceType,
    /// Embedding table width
    pub embedding_dim: usize,
    /// Recurrent layer hidden size
    pub hidden_dim: usize,
    /// Per-epoch delay of the synthetic engine, in milliseconds
    pub synthetic_epoch_millis: u64,
    /// Seed for shuffling and synthetic metrics
    pub seed: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            kind: EngineKind::Recurrent,
            device: DeviceType::Cpu,
            embedding_dim: 64,
            hidden_dim: 128,
            synthetic_epoch_millis: 200,
            seed: 42,
        }
    }
}

/// Engine implementation options
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// Real classifier training over candle
    Recurrent,
    /// Deterministic progress generator for demo/offline deployments
    Synthetic,
}

/// Device types
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    /// CPU device
    Cpu,
    /// CUDA GPU
    Cuda,
    /// Metal (Apple Silicon)
    Metal,
}

/// Checkpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Directory checkpoint artifacts are written under
    pub dir: PathBuf,
    /// Persist a checkpoint every N epochs (the final epoch always gets one)
    pub every_epochs: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("data/checkpoints"),
            every_epochs: 5,
        }
    }
}

/// Execution strategy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Where training runs: in-process or on the worker pool
    pub strategy: ExecutionStrategy,
    /// Worker pool size (pooled strategy only)
    pub workers: usize,
    /// Worker metrics sampling interval in seconds
    pub metrics_interval_secs: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            strategy: ExecutionStrategy::Inline,
            workers: num_cpus::get().min(4),
            metrics_interval_secs: 10,
        }
    }
}

/// Execution strategy options
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStrategy {
    /// Epoch loop runs as a cooperative blocking task in-process
    Inline,
    /// Epoch loop runs on an isolated worker thread from the pool
    Pooled,
}

/// Row storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Storage backend
    pub backend: StorageBackend,
    /// Data directory for the JSON backend
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Json,
            data_dir: PathBuf::from("data"),
        }
    }
}

/// Storage backend options
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// In-memory rows, lost on shutdown
    Memory,
    /// One JSON file per table under the data directory
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn zero_max_len_is_rejected() {
        let mut config = Config::default();
        config.tokenizer.max_len = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn pooled_strategy_requires_workers() {
        let mut config = Config::default();
        config.execution.strategy = ExecutionStrategy::Pooled;
        config.execution.workers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = Config::default();
        config.save(&path).unwrap();
        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.tokenizer.max_len, config.tokenizer.max_len);
        assert_eq!(loaded.execution.workers, config.execution.workers);
    }
}
