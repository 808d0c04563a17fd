//! Checkpoint artifacts: weight snapshots plus metrics sidecars

use std::path::{Path, PathBuf};

use candle_nn::VarMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::session::types::{EpochMetrics, ModelId};

/// Sidecar describing a checkpoint artifact
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMeta {
    /// Model the artifact belongs to
    pub model_id: ModelId,
    /// Epoch the artifact captures
    pub epoch: usize,
    /// Metrics at checkpoint time
    pub metrics: EpochMetrics,
    /// Artifact creation time
    pub created_at: DateTime<Utc>,
}

/// Writes and validates checkpoint artifacts under one directory tree.
///
/// Layout: `<dir>/model-<id>/epoch-<n>.safetensors` with an
/// `epoch-<n>.json` sidecar; metadata-only artifacts (synthetic runs)
/// carry just the sidecar.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
    every_epochs: usize,
}

impl CheckpointStore {
    /// Create a store rooted at `dir`, checkpointing every `every_epochs`
    pub fn new(dir: PathBuf, every_epochs: usize) -> Self {
        Self { dir, every_epochs }
    }

    /// Configured cadence in epochs
    pub fn every_epochs(&self) -> usize {
        self.every_epochs
    }

    /// True when `epoch` is on the cadence or is the final epoch
    pub fn is_due(&self, epoch: usize, total_epochs: usize) -> bool {
        epoch == total_epochs || (self.every_epochs > 0 && epoch % self.every_epochs == 0)
    }

    /// Weight artifact location for a model/epoch pair
    pub fn weights_path(&self, model_id: ModelId, epoch: usize) -> PathBuf {
        self.model_dir(model_id).join(format!("epoch-{epoch}.safetensors"))
    }

    /// Sidecar location for a model/epoch pair
    pub fn metadata_path(&self, model_id: ModelId, epoch: usize) -> PathBuf {
        self.model_dir(model_id).join(format!("epoch-{epoch}.json"))
    }

    fn model_dir(&self, model_id: ModelId) -> PathBuf {
        self.dir.join(format!("model-{model_id}"))
    }

    /// Persist model weights plus the metrics sidecar; returns the weight
    /// artifact path
    pub fn save_weights(
        &self,
        varmap: &VarMap,
        model_id: ModelId,
        epoch: usize,
        metrics: &EpochMetrics,
    ) -> Result<PathBuf> {
        let path = self.weights_path(model_id, epoch);
        std::fs::create_dir_all(self.model_dir(model_id))?;
        varmap.save(&path)?;
        self.write_sidecar(model_id, epoch, metrics)?;
        debug!(model_id = %model_id, epoch, path = %path.display(), "checkpoint saved");
        Ok(path)
    }

    /// Persist a metadata-only artifact; returns the sidecar path
    pub fn save_metadata(
        &self,
        model_id: ModelId,
        epoch: usize,
        metrics: &EpochMetrics,
    ) -> Result<PathBuf> {
        std::fs::create_dir_all(self.model_dir(model_id))?;
        let path = self.write_sidecar(model_id, epoch, metrics)?;
        debug!(model_id = %model_id, epoch, path = %path.display(), "checkpoint metadata saved");
        Ok(path)
    }

    fn write_sidecar(
        &self,
        model_id: ModelId,
        epoch: usize,
        metrics: &EpochMetrics,
    ) -> Result<PathBuf> {
        let meta = CheckpointMeta {
            model_id,
            epoch,
            metrics: *metrics,
            created_at: Utc::now(),
        };
        let path = self.metadata_path(model_id, epoch);
        std::fs::write(&path, serde_json::to_string_pretty(&meta)?)?;
        Ok(path)
    }

    /// Read a sidecar back
    pub fn load_metadata(&self, path: &Path) -> Result<CheckpointMeta> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Check a weight artifact parses as safetensors before loading it
    pub fn validate(&self, path: &Path) -> Result<()> {
        let bytes = std::fs::read(path)
            .map_err(|e| Error::persistence(format!("read {}: {e}", path.display())))?;
        safetensors::SafeTensors::deserialize(&bytes)
            .map_err(|e| Error::persistence(format!("corrupt checkpoint {}: {e}", path.display())))?;
        Ok(())
    }

    /// Load a validated weight artifact into an already-built var map
    pub fn load_into(&self, varmap: &mut VarMap, path: &Path) -> Result<()> {
        self.validate(path)?;
        varmap.load(path)?;
        Ok(())
    }
}
