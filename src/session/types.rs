//! Core data model: ids, statuses, session and model records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifier of a model row owned by the surrounding product
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelId(pub i64);

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one training session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// Generate a fresh session id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle states of a training session.
///
/// `Queued → Running → {Paused, Completed, Failed, Stopped}`. The three
/// terminal states never transition again; a paused session resumes as a
/// fresh session on the same model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Accepted, not yet dispatched
    Queued,
    /// Epoch loop in flight
    Running,
    /// Suspended; still holds the model's session slot
    Paused,
    /// Reached its final epoch
    Completed,
    /// Epoch loop failed
    Failed,
    /// Stopped by an operator
    Stopped,
}

impl SessionStatus {
    /// True once no further transition is possible
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Stopped)
    }

    /// Status name as persisted and logged
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Externally visible model states mirrored from the active session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelStatus {
    /// No session has ever run, or the last one was cleared
    Idle,
    /// A session is actively training
    Training,
    /// Last session paused mid-run
    Paused,
    /// Last session completed
    Completed,
    /// Last session failed
    Failed,
    /// Last session was stopped
    Stopped,
}

impl ModelStatus {
    /// Status name as persisted and logged
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Training => "training",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for ModelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hyperparameters of one training job
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionConfig {
    /// Number of epochs
    pub epochs: usize,
    /// Batch size
    pub batch_size: usize,
    /// Learning rate
    pub learning_rate: f64,
    /// Fraction of samples held out for validation
    pub validation_split: f32,
    /// Stop early when validation loss stops improving
    pub early_stopping: bool,
    /// Epochs without improvement tolerated before early stop
    pub patience: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            epochs: 10,
            batch_size: 32,
            learning_rate: 1e-3,
            validation_split: 0.2,
            early_stopping: false,
            patience: 3,
        }
    }
}

/// Metrics snapshot emitted at the end of an epoch
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    /// 1-based epoch number
    pub epoch: usize,
    /// Training loss
    pub loss: f64,
    /// Training accuracy in [0, 1]
    pub accuracy: f64,
    /// Validation loss, when a validation split was held out
    #[serde(skip_serializing_if = "Option::is_none")]
    pub val_loss: Option<f64>,
    /// Validation accuracy, when a validation split was held out
    #[serde(skip_serializing_if = "Option::is_none")]
    pub val_accuracy: Option<f64>,
}

/// One attempt to train a model to a terminal outcome.
///
/// Owned exclusively by the orchestrator while active; once terminal it is
/// an immutable historical record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSession {
    /// Session identity
    pub session_id: SessionId,
    /// Model this session trains
    pub model_id: ModelId,
    /// Dataset the samples come from
    pub dataset_id: String,
    /// Hyperparameters
    pub config: SessionConfig,
    /// Current lifecycle state
    pub status: SessionStatus,
    /// When the session was accepted
    pub started_at: DateTime<Utc>,
    /// When the session reached a terminal or paused state
    pub ended_at: Option<DateTime<Utc>>,
    /// Last epoch the session reached
    pub current_epoch: usize,
    /// Metrics of the final epoch, set on completion
    pub final_metrics: Option<EpochMetrics>,
    /// User who submitted the job
    pub owner_user_id: i64,
}

impl TrainingSession {
    /// Create a freshly accepted session
    pub fn new(
        model_id: ModelId,
        dataset_id: impl Into<String>,
        config: SessionConfig,
        owner_user_id: i64,
    ) -> Self {
        Self {
            session_id: SessionId::new(),
            model_id,
            dataset_id: dataset_id.into(),
            config,
            status: SessionStatus::Queued,
            started_at: Utc::now(),
            ended_at: None,
            current_epoch: 0,
            final_metrics: None,
            owner_user_id,
        }
    }

    /// True once the session can no longer transition
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Externally pollable mirror of a model's training state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRecord {
    /// Model identity
    pub id: ModelId,
    /// Human-readable name
    pub name: String,
    /// Mirrored session state
    pub status: ModelStatus,
    /// Last epoch reached by the active or most recent session
    pub current_epoch: usize,
    /// Last observed training loss
    pub loss: Option<f64>,
    /// Last observed training accuracy
    pub accuracy: Option<f64>,
    /// Total epochs of the active or most recent session
    pub epochs: usize,
    /// Last mutation time
    pub updated_at: DateTime<Utc>,
}

impl ModelRecord {
    /// Create an idle model row
    pub fn new(id: ModelId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            status: ModelStatus::Idle,
            current_epoch: 0,
            loss: None,
            accuracy: None,
            epochs: 0,
            updated_at: Utc::now(),
        }
    }
}

/// Answer to a status poll
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StatusView {
    /// True while a session is queued, running, or paused
    pub is_training: bool,
    /// Mirrored model status
    pub status: ModelStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_are_exactly_three() {
        for status in [
            SessionStatus::Queued,
            SessionStatus::Running,
            SessionStatus::Paused,
        ] {
            assert!(!status.is_terminal());
        }
        for status in [
            SessionStatus::Completed,
            SessionStatus::Failed,
            SessionStatus::Stopped,
        ] {
            assert!(status.is_terminal());
        }
    }

    #[test]
    fn new_session_starts_queued_at_epoch_zero() {
        let session = TrainingSession::new(ModelId(1), "d1", SessionConfig::default(), 9);
        assert_eq!(session.status, SessionStatus::Queued);
        assert_eq!(session.current_epoch, 0);
        assert!(session.ended_at.is_none());
        assert!(session.final_metrics.is_none());
    }

    #[test]
    fn ids_serialize_transparently() {
        assert_eq!(serde_json::to_string(&ModelId(7)).unwrap(), "7");
        let status = serde_json::to_string(&SessionStatus::Running).unwrap();
        assert_eq!(status, "\"running\"");
    }
}
