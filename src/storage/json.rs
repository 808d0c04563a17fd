//! File-backed storage keeping one JSON document per table.
//!
//! Tables are small (this core's rows, not the product's), so each write
//! rewrites the whole table file; logs append as JSON lines instead.

use std::collections::HashMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use super::{CheckpointRow, DatasetRecord, Storage, TrainingLogRow};
use crate::error::{Error, Result};
use crate::session::types::{ModelId, ModelRecord, SessionId, TrainingSession};

const MODELS_FILE: &str = "models.json";
const DATASETS_FILE: &str = "datasets.json";
const SESSIONS_FILE: &str = "training_sessions.json";
const CHECKPOINTS_FILE: &str = "checkpoints.json";
const LOGS_FILE: &str = "training_logs.jsonl";

/// Storage persisting every table under a data directory
#[derive(Debug)]
pub struct JsonStorage {
    dir: PathBuf,
    models: RwLock<HashMap<ModelId, ModelRecord>>,
    datasets: RwLock<HashMap<String, DatasetRecord>>,
    sessions: RwLock<Vec<TrainingSession>>,
    logs: RwLock<Vec<TrainingLogRow>>,
    checkpoints: RwLock<Vec<CheckpointRow>>,
}

impl JsonStorage {
    /// Open (or initialize) storage under a data directory
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .map_err(|e| Error::persistence(format!("create {}: {e}", dir.display())))?;

        let models: Vec<ModelRecord> = read_table(&dir.join(MODELS_FILE))?.unwrap_or_default();
        let datasets: Vec<DatasetRecord> =
            read_table(&dir.join(DATASETS_FILE))?.unwrap_or_default();
        let sessions: Vec<TrainingSession> =
            read_table(&dir.join(SESSIONS_FILE))?.unwrap_or_default();
        let checkpoints: Vec<CheckpointRow> =
            read_table(&dir.join(CHECKPOINTS_FILE))?.unwrap_or_default();
        let logs = read_log_lines(&dir.join(LOGS_FILE))?;

        debug!(
            dir = %dir.display(),
            models = models.len(),
            sessions = sessions.len(),
            "opened json storage"
        );

        Ok(Self {
            dir,
            models: RwLock::new(models.into_iter().map(|m| (m.id, m)).collect()),
            datasets: RwLock::new(datasets.into_iter().map(|d| (d.id.clone(), d)).collect()),
            sessions: RwLock::new(sessions),
            logs: RwLock::new(logs),
            checkpoints: RwLock::new(checkpoints),
        })
    }

    fn write_table<T: Serialize>(&self, name: &str, value: &T) -> Result<()> {
        let path = self.dir.join(name);
        let json = serde_json::to_string_pretty(value)
            .map_err(|e| Error::persistence(format!("serialize {name}: {e}")))?;
        std::fs::write(&path, json)
            .map_err(|e| Error::persistence(format!("write {}: {e}", path.display())))?;
        Ok(())
    }

    fn append_log_line(&self, row: &TrainingLogRow) -> Result<()> {
        let path = self.dir.join(LOGS_FILE);
        let line = serde_json::to_string(row)
            .map_err(|e| Error::persistence(format!("serialize log row: {e}")))?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| Error::persistence(format!("open {}: {e}", path.display())))?;
        writeln!(file, "{line}")
            .map_err(|e| Error::persistence(format!("append {}: {e}", path.display())))?;
        Ok(())
    }
}

fn read_table<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::persistence(format!("read {}: {e}", path.display())))?;
    let value = serde_json::from_str(&content)
        .map_err(|e| Error::persistence(format!("parse {}: {e}", path.display())))?;
    Ok(Some(value))
}

fn read_log_lines(path: &Path) -> Result<Vec<TrainingLogRow>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::persistence(format!("read {}: {e}", path.display())))?;
    let mut rows = Vec::new();
    for line in content.lines().filter(|l| !l.trim().is_empty()) {
        let row = serde_json::from_str(line)
            .map_err(|e| Error::persistence(format!("parse log line: {e}")))?;
        rows.push(row);
    }
    Ok(rows)
}

#[async_trait]
impl Storage for JsonStorage {
    async fn fetch_model(&self, id: ModelId) -> Result<Option<ModelRecord>> {
        Ok(self.models.read().get(&id).cloned())
    }

    async fn upsert_model(&self, record: ModelRecord) -> Result<()> {
        let models = {
            let mut guard = self.models.write();
            guard.insert(record.id, record);
            let mut rows: Vec<ModelRecord> = guard.values().cloned().collect();
            rows.sort_by_key(|m| m.id);
            rows
        };
        self.write_table(MODELS_FILE, &models)
    }

    async fn fetch_dataset(&self, id: &str) -> Result<Option<DatasetRecord>> {
        Ok(self.datasets.read().get(id).cloned())
    }

    async fn insert_dataset(&self, record: DatasetRecord) -> Result<()> {
        let datasets = {
            let mut guard = self.datasets.write();
            guard.insert(record.id.clone(), record);
            let mut rows: Vec<DatasetRecord> = guard.values().cloned().collect();
            rows.sort_by(|a, b| a.id.cmp(&b.id));
            rows
        };
        self.write_table(DATASETS_FILE, &datasets)
    }

    async fn upsert_session(&self, session: TrainingSession) -> Result<()> {
        let sessions = {
            let mut guard = self.sessions.write();
            match guard
                .iter_mut()
                .find(|s| s.session_id == session.session_id)
            {
                Some(existing) => *existing = session,
                None => guard.push(session),
            }
            guard.clone()
        };
        self.write_table(SESSIONS_FILE, &sessions)
    }

    async fn fetch_session(&self, id: SessionId) -> Result<Option<TrainingSession>> {
        Ok(self
            .sessions
            .read()
            .iter()
            .find(|s| s.session_id == id)
            .cloned())
    }

    async fn sessions_for_model(&self, model_id: ModelId) -> Result<Vec<TrainingSession>> {
        Ok(self
            .sessions
            .read()
            .iter()
            .filter(|s| s.model_id == model_id)
            .cloned()
            .collect())
    }

    async fn append_log(&self, row: TrainingLogRow) -> Result<()> {
        self.append_log_line(&row)?;
        self.logs.write().push(row);
        Ok(())
    }

    async fn logs_for_model(&self, model_id: ModelId) -> Result<Vec<TrainingLogRow>> {
        Ok(self
            .logs
            .read()
            .iter()
            .filter(|row| row.model_id == model_id)
            .cloned()
            .collect())
    }

    async fn insert_checkpoint(&self, row: CheckpointRow) -> Result<()> {
        let checkpoints = {
            let mut guard = self.checkpoints.write();
            guard.push(row);
            guard.clone()
        };
        self.write_table(CHECKPOINTS_FILE, &checkpoints)
    }

    async fn checkpoints_for_model(&self, model_id: ModelId) -> Result<Vec<CheckpointRow>> {
        Ok(self
            .checkpoints
            .read()
            .iter()
            .filter(|row| row.model_id == model_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::types::SessionConfig;
    use crate::storage::LogLevel;
    use chrono::Utc;

    #[tokio::test]
    async fn rows_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();

        {
            let storage = JsonStorage::open(dir.path()).unwrap();
            storage
                .upsert_model(ModelRecord::new(ModelId(1), "reopened"))
                .await
                .unwrap();
            let session = TrainingSession::new(ModelId(1), "d1", SessionConfig::default(), 1);
            storage.upsert_session(session).await.unwrap();
            storage
                .insert_checkpoint(CheckpointRow {
                    model_id: ModelId(1),
                    epoch: 5,
                    file_path: dir.path().join("ckpt"),
                    metrics: None,
                    created_at: Utc::now(),
                })
                .await
                .unwrap();
        }

        let storage = JsonStorage::open(dir.path()).unwrap();
        let model = storage.fetch_model(ModelId(1)).await.unwrap().unwrap();
        assert_eq!(model.name, "reopened");
        assert_eq!(storage.sessions_for_model(ModelId(1)).await.unwrap().len(), 1);
        let latest = storage.latest_checkpoint(ModelId(1)).await.unwrap().unwrap();
        assert_eq!(latest.epoch, 5);
    }

    #[tokio::test]
    async fn logs_append_as_lines() {
        let dir = tempfile::tempdir().unwrap();
        {
            let storage = JsonStorage::open(dir.path()).unwrap();
            for epoch in 1..=3 {
                storage
                    .append_log(TrainingLogRow {
                        model_id: ModelId(2),
                        level: LogLevel::Info,
                        message: format!("epoch {epoch} done"),
                        epoch: Some(epoch),
                        loss: Some(0.5),
                        accuracy: Some(0.8),
                        timestamp: Utc::now(),
                    })
                    .await
                    .unwrap();
            }
        }

        let raw = std::fs::read_to_string(dir.path().join(LOGS_FILE)).unwrap();
        assert_eq!(raw.lines().count(), 3);

        let storage = JsonStorage::open(dir.path()).unwrap();
        let rows = storage.logs_for_model(ModelId(2)).await.unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[2].epoch, Some(3));
    }
}
