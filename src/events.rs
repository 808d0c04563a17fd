//! Event bus broadcasting training progress to external subscribers.
//!
//! Dashboards and socket layers subscribe here. Delivery is at-most-once:
//! a lagging or absent subscriber misses events and recovers by polling the
//! model row, which stays authoritative.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use crate::session::types::{ModelId, SessionId};

/// Events published by the orchestrator during a session's lifetime
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// One epoch finished
    TrainingProgress {
        model_id: ModelId,
        session_id: SessionId,
        epoch: usize,
        loss: f64,
        accuracy: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        val_loss: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        val_accuracy: Option<f64>,
    },

    /// Session reached its final epoch
    TrainingCompleted {
        model_id: ModelId,
        session_id: SessionId,
    },

    /// Session failed inside the epoch loop
    TrainingFailed {
        model_id: ModelId,
        session_id: SessionId,
        error: String,
    },

    /// Session was stopped by an operator
    TrainingStopped { model_id: ModelId },

    /// Aggregate worker pool resource snapshot
    WorkerMetrics {
        memory_usage: u64,
        cpu_usage: f64,
        active_workers: usize,
        total_workers: usize,
    },
}

impl Event {
    /// Topic name as the wire tag spells it
    pub fn topic(&self) -> &'static str {
        match self {
            Event::TrainingProgress { .. } => "training_progress",
            Event::TrainingCompleted { .. } => "training_completed",
            Event::TrainingFailed { .. } => "training_failed",
            Event::TrainingStopped { .. } => "training_stopped",
            Event::WorkerMetrics { .. } => "worker_metrics",
        }
    }
}

/// Broadcast bus the orchestrator publishes on.
///
/// `publish` never blocks and never fails the caller; subscribers that fall
/// behind are the subscribers' problem.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a bus retaining up to `capacity` undelivered events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event, fire-and-forget
    pub fn publish(&self, event: Event) {
        trace!(topic = event.topic(), "publishing event");
        let _ = self.tx.send(event);
    }

    /// Open a new subscription
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Number of currently connected subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn progress_event() -> Event {
        Event::TrainingProgress {
            model_id: ModelId(7),
            session_id: SessionId(Uuid::nil()),
            epoch: 1,
            loss: 0.5,
            accuracy: 0.8,
            val_loss: None,
            val_accuracy: None,
        }
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        let bus = EventBus::new(8);
        bus.publish(progress_event());
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.publish(progress_event());
        let event = rx.recv().await.unwrap();
        assert_eq!(event.topic(), "training_progress");
    }

    #[test]
    fn events_serialize_with_topic_tag() {
        let v = serde_json::to_value(progress_event()).unwrap();
        assert_eq!(v["type"], "training_progress");
        assert_eq!(v["epoch"], 1);
        // optional validation fields are omitted, not null
        assert!(v.get("val_loss").is_none());

        let v = serde_json::to_value(Event::WorkerMetrics {
            memory_usage: 1024,
            cpu_usage: 12.5,
            active_workers: 2,
            total_workers: 4,
        })
        .unwrap();
        assert_eq!(v["type"], "worker_metrics");
        assert_eq!(v["total_workers"], 4);
    }
}
