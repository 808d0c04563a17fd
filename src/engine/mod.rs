//! Compute engines running the epoch loop.
//!
//! An engine owns one trainable model per run: it receives pre-encoded
//! samples, trains epoch by epoch, streams non-terminal events through an
//! [`EventSink`], and reports the terminal outcome through its return value,
//! so completion and failure are exactly-once by construction.
//!
//! Two implementations satisfy the same contract:
//!
//! - **RecurrentEngine**: real classifier training over candle
//! - **SyntheticEngine**: deterministic progress generator for demo/offline
//!   deployments, indistinguishable from a real run except by data values
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use trainyard::engine::{create_engine, CancelToken, EventSink, TrainRequest};
//!
//! let engine = create_engine(&config.engine, &config.checkpoint)?;
//! let (sink, mut events) = EventSink::new();
//! let cancel = CancelToken::new();
//! let outcome = engine.run(request, sink, cancel)?;
//! ```

pub mod checkpoint;
pub mod classifier;
pub mod recurrent;
pub mod synthetic;

pub use checkpoint::CheckpointStore;
pub use classifier::TextClassifier;
pub use recurrent::RecurrentEngine;
pub use synthetic::SyntheticEngine;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use candle_core::Device;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::config::{CheckpointConfig, DeviceType, EngineConfig, EngineKind};
use crate::error::Result;
use crate::session::types::{EpochMetrics, ModelId, SessionConfig, SessionId};

/// One pre-encoded training sample
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncodedSample {
    /// Fixed-length token ids
    pub ids: Vec<u32>,
    /// Class label index
    pub label: u32,
}

/// Everything an engine needs to run one training job
#[derive(Debug, Clone)]
pub struct TrainRequest {
    /// Model the run belongs to (keys checkpoint artifacts)
    pub model_id: ModelId,
    /// Session identity, echoed in events
    pub session_id: SessionId,
    /// Pre-encoded samples; the vocabulary is already finalized
    pub samples: Vec<EncodedSample>,
    /// Vocabulary size the embedding table is built with
    pub vocab_size: usize,
    /// Number of output classes
    pub num_classes: usize,
    /// Hyperparameters
    pub config: SessionConfig,
    /// Epochs already completed by an earlier session (resume), 0 otherwise
    pub initial_epoch: usize,
    /// Checkpoint artifact to restore weights from when resuming
    pub resume_from: Option<PathBuf>,
}

/// Non-terminal events streamed while a run is in flight
#[derive(Debug, Clone)]
pub enum RunEvent {
    /// One epoch finished
    Epoch(EpochMetrics),
    /// A checkpoint artifact was written
    Checkpoint { epoch: usize, path: PathBuf },
}

/// Terminal outcome of a run that did not fail
#[derive(Debug, Clone)]
pub enum RunOutcome {
    /// Reached the final epoch
    Completed { final_metrics: EpochMetrics },
    /// Cooperative stop observed at an epoch boundary
    Stopped { epoch: usize },
    /// Cooperative pause observed at an epoch boundary
    Paused { epoch: usize },
}

/// What the epoch loop should do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunSignal {
    /// Keep training
    Continue,
    /// Suspend at this epoch boundary
    Pause,
    /// Stop at this epoch boundary
    Stop,
}

const SIGNAL_RUN: u8 = 0;
const SIGNAL_PAUSE: u8 = 1;
const SIGNAL_STOP: u8 = 2;

/// Cooperative cancellation flag, observed between epochs only.
///
/// A stop request is final; a pause request does not downgrade an earlier
/// stop. Neither preempts an in-flight epoch.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicU8>,
}

impl CancelToken {
    /// Create a token in the running state
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a stop at the next epoch boundary
    pub fn request_stop(&self) {
        self.flag.store(SIGNAL_STOP, Ordering::SeqCst);
    }

    /// Request a pause at the next epoch boundary
    pub fn request_pause(&self) {
        let _ = self.flag.compare_exchange(
            SIGNAL_RUN,
            SIGNAL_PAUSE,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    /// Read the current signal
    pub fn check(&self) -> RunSignal {
        match self.flag.load(Ordering::SeqCst) {
            SIGNAL_PAUSE => RunSignal::Pause,
            SIGNAL_STOP => RunSignal::Stop,
            _ => RunSignal::Continue,
        }
    }

    /// True once a stop was requested
    pub fn is_stop_requested(&self) -> bool {
        self.flag.load(Ordering::SeqCst) == SIGNAL_STOP
    }
}

/// Sending half of a run's event stream.
///
/// Emission never blocks the epoch loop and never fails it: events after
/// the receiver went away are silently dropped.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<RunEvent>,
}

impl EventSink {
    /// Create a sink and the receiver the relay loop drains
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RunEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Emit a non-terminal event, fire-and-forget
    pub fn emit(&self, event: RunEvent) {
        let _ = self.tx.send(event);
    }
}

/// Samples and artifact reference for an evaluation pass
#[derive(Debug, Clone)]
pub struct EvalRequest {
    /// Model whose artifact is evaluated
    pub model_id: ModelId,
    /// Checkpoint artifact to load weights from
    pub checkpoint_path: PathBuf,
    /// Pre-encoded labeled samples
    pub samples: Vec<EncodedSample>,
    /// Vocabulary size the artifact was trained with
    pub vocab_size: usize,
    /// Number of output classes
    pub num_classes: usize,
}

/// Sequences and artifact reference for an inference pass
#[derive(Debug, Clone)]
pub struct PredictRequest {
    /// Model whose artifact serves the predictions
    pub model_id: ModelId,
    /// Checkpoint artifact to load weights from
    pub checkpoint_path: PathBuf,
    /// Pre-encoded unlabeled sequences
    pub sequences: Vec<Vec<u32>>,
    /// Vocabulary size the artifact was trained with
    pub vocab_size: usize,
    /// Number of output classes
    pub num_classes: usize,
}

/// Small learning-rate search over short trial runs
#[derive(Debug, Clone)]
pub struct OptimizeRequest {
    /// Configuration the winning learning rate is written back into
    pub base: SessionConfig,
    /// Learning rates to try
    pub candidates: Vec<f64>,
    /// Epochs per trial
    pub trial_epochs: usize,
    /// Pre-encoded labeled samples
    pub samples: Vec<EncodedSample>,
    /// Vocabulary size
    pub vocab_size: usize,
    /// Number of output classes
    pub num_classes: usize,
}

/// One finished optimization trial
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrialResult {
    /// Learning rate tried
    pub learning_rate: f64,
    /// Final training loss of the trial
    pub loss: f64,
}

/// Outcome of a hyperparameter search
#[derive(Debug, Clone)]
pub struct OptimizeReport {
    /// Base configuration with the winning learning rate applied
    pub best: SessionConfig,
    /// Every trial, in the order tried
    pub trials: Vec<TrialResult>,
}

/// A compute engine owning one trainable model per run.
///
/// Implementations must not let an epoch-loop failure escape as a panic;
/// any error surfaces once through the returned `Err` and no further
/// events fire after it.
pub trait TrainingEngine: Send + Sync {
    /// Implementation name, for logs
    fn name(&self) -> &'static str;

    /// Run one training job to its terminal outcome. Blocking; callers run
    /// it on a blocking thread or a pool worker.
    fn run(&self, request: TrainRequest, sink: EventSink, cancel: CancelToken)
        -> Result<RunOutcome>;

    /// Score a checkpoint artifact against labeled samples
    fn evaluate(&self, request: EvalRequest) -> Result<EpochMetrics>;

    /// Predict class labels from a checkpoint artifact
    fn predict(&self, request: PredictRequest) -> Result<Vec<u32>>;

    /// Try candidate learning rates on short runs and report the best
    fn optimize(&self, request: OptimizeRequest) -> Result<OptimizeReport>;
}

/// Build the engine the deployment configuration selects
pub fn create_engine(
    engine: &EngineConfig,
    checkpoint: &CheckpointConfig,
) -> Result<Arc<dyn TrainingEngine>> {
    let store = CheckpointStore::new(checkpoint.dir.clone(), checkpoint.every_epochs);
    match engine.kind {
        EngineKind::Recurrent => {
            let engine = RecurrentEngine::new(engine.clone(), store)?;
            Ok(Arc::new(engine))
        }
        EngineKind::Synthetic => {
            let engine = SyntheticEngine::new(engine.clone(), store);
            Ok(Arc::new(engine))
        }
    }
}

/// Map the configured device type onto a candle device
pub(crate) fn select_device(device: DeviceType) -> Result<Device> {
    match device {
        DeviceType::Cpu => Ok(Device::Cpu),
        DeviceType::Cuda => Ok(Device::new_cuda(0)?),
        DeviceType::Metal => Ok(Device::new_metal(0)?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_token_signals_continue() {
        let token = CancelToken::new();
        assert_eq!(token.check(), RunSignal::Continue);
        assert!(!token.is_stop_requested());
    }

    #[test]
    fn pause_does_not_downgrade_stop() {
        let token = CancelToken::new();
        token.request_stop();
        token.request_pause();
        assert_eq!(token.check(), RunSignal::Stop);
    }

    #[test]
    fn stop_overrides_pause() {
        let token = CancelToken::new();
        token.request_pause();
        assert_eq!(token.check(), RunSignal::Pause);
        token.request_stop();
        assert_eq!(token.check(), RunSignal::Stop);
    }

    #[tokio::test]
    async fn sink_delivers_events_in_order() {
        let (sink, mut rx) = EventSink::new();
        for epoch in 1..=3 {
            sink.emit(RunEvent::Epoch(EpochMetrics {
                epoch,
                loss: 1.0 / epoch as f64,
                accuracy: 0.5,
                val_loss: None,
                val_accuracy: None,
            }));
        }
        drop(sink);
        let mut seen = Vec::new();
        while let Some(RunEvent::Epoch(m)) = rx.recv().await {
            seen.push(m.epoch);
        }
        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[test]
    fn emit_after_receiver_dropped_is_silent() {
        let (sink, rx) = EventSink::new();
        drop(rx);
        sink.emit(RunEvent::Checkpoint {
            epoch: 1,
            path: PathBuf::from("x"),
        });
    }
}
