//! In-memory storage backend for tests and demo runs

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{CheckpointRow, DatasetRecord, Storage, TrainingLogRow};
use crate::error::Result;
use crate::session::types::{ModelId, ModelRecord, SessionId, TrainingSession};

/// Storage keeping every table in process memory. Rows are lost on shutdown.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    models: RwLock<HashMap<ModelId, ModelRecord>>,
    datasets: RwLock<HashMap<String, DatasetRecord>>,
    sessions: RwLock<Vec<TrainingSession>>,
    logs: RwLock<Vec<TrainingLogRow>>,
    checkpoints: RwLock<Vec<CheckpointRow>>,
}

impl MemoryStorage {
    /// Create an empty storage
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn fetch_model(&self, id: ModelId) -> Result<Option<ModelRecord>> {
        Ok(self.models.read().get(&id).cloned())
    }

    async fn upsert_model(&self, record: ModelRecord) -> Result<()> {
        self.models.write().insert(record.id, record);
        Ok(())
    }

    async fn fetch_dataset(&self, id: &str) -> Result<Option<DatasetRecord>> {
        Ok(self.datasets.read().get(id).cloned())
    }

    async fn insert_dataset(&self, record: DatasetRecord) -> Result<()> {
        self.datasets.write().insert(record.id.clone(), record);
        Ok(())
    }

    async fn upsert_session(&self, session: TrainingSession) -> Result<()> {
        let mut sessions = self.sessions.write();
        match sessions
            .iter_mut()
            .find(|s| s.session_id == session.session_id)
        {
            Some(existing) => *existing = session,
            None => sessions.push(session),
        }
        Ok(())
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
        self.checkpoints.write().push(row);
        Ok(())
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
    use chrono::Utc;
    use std::path::PathBuf;

    #[tokio::test]
    async fn model_rows_round_trip() {
        let storage = MemoryStorage::new();
        assert!(storage.fetch_model(ModelId(1)).await.unwrap().is_none());

        storage
            .upsert_model(ModelRecord::new(ModelId(1), "sentiment"))
            .await
            .unwrap();
        let row = storage.fetch_model(ModelId(1)).await.unwrap().unwrap();
        assert_eq!(row.name, "sentiment");
    }

    #[tokio::test]
    async fn session_upsert_replaces_in_place() {
        let storage = MemoryStorage::new();
        let mut session = TrainingSession::new(ModelId(2), "d1", SessionConfig::default(), 1);
        storage.upsert_session(session.clone()).await.unwrap();

        session.current_epoch = 3;
        storage.upsert_session(session.clone()).await.unwrap();

        let rows = storage.sessions_for_model(ModelId(2)).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].current_epoch, 3);
    }

    #[tokio::test]
    async fn latest_checkpoint_picks_highest_epoch() {
        let storage = MemoryStorage::new();
        for epoch in [5, 15, 10] {
            storage
                .insert_checkpoint(CheckpointRow {
                    model_id: ModelId(3),
                    epoch,
                    file_path: PathBuf::from(format!("ckpt-{epoch}")),
                    metrics: None,
                    created_at: Utc::now(),
                })
                .await
                .unwrap();
        }
        let latest = storage.latest_checkpoint(ModelId(3)).await.unwrap().unwrap();
        assert_eq!(latest.epoch, 15);
        assert!(storage
            .latest_checkpoint(ModelId(99))
            .await
            .unwrap()
            .is_none());
    }
}
