//! Simulated engine for development and integration tests.
//!
//! Produces a deterministic convergence curve instead of touching tensors,
//! sleeping a configurable amount per epoch so cancellation and progress
//! reporting can be exercised at realistic speed.

use std::thread;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

use super::{
    CancelToken, CheckpointStore, EvalRequest, EventSink, OptimizeReport, OptimizeRequest,
    PredictRequest, RunEvent, RunOutcome, RunSignal, TrainRequest, TrainingEngine, TrialResult,
};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::session::types::{EpochMetrics, ModelId};

/// Engine that fabricates plausible training metrics without a model.
pub struct SyntheticEngine {
    config: EngineConfig,
    store: CheckpointStore,
}

impl SyntheticEngine {
    /// Create a simulated engine
    pub fn new(config: EngineConfig, store: CheckpointStore) -> Self {
        Self { config, store }
    }

    fn run_seed(&self, model_id: ModelId) -> u64 {
        self.config.seed ^ (model_id.0 as u64)
    }

    /// Deterministic loss/accuracy for one epoch of a simulated run.
    ///
    /// The curve decays exponentially with a rate tied to the learning rate,
    /// plus a small seeded jitter; too-large rates overshoot and stall high.
    fn epoch_metrics(
        seed: u64,
        epoch: usize,
        total_epochs: usize,
        learning_rate: f64,
    ) -> (f64, f64) {
        let mut rng = StdRng::seed_from_u64(seed.wrapping_add(epoch as u64));
        let jitter: f64 = rng.random_range(-0.02..0.02);
        let progress = epoch as f64 / total_epochs.max(1) as f64;
        let rate = (learning_rate * 1e3).clamp(0.05, 5.0);
        let overshoot = (learning_rate * 1e3 / 8.0).powi(2) * 0.05;
        let loss = (2.0 * (-rate * progress).exp() + 0.08 + overshoot + jitter).max(0.01);
        let accuracy = (1.0 - loss / 2.2).clamp(0.0, 1.0);
        (loss, accuracy)
    }

    fn fit(
        &self,
        request: &TrainRequest,
        sink: &EventSink,
        cancel: &CancelToken,
        write_checkpoints: bool,
    ) -> Result<RunOutcome> {
        if request.samples.is_empty() {
            return Err(Error::invalid_input("training requires at least one sample"));
        }
        if request.initial_epoch >= request.config.epochs {
            return Err(Error::invalid_input(format!(
                "nothing left to train: {} of {} epochs already done",
                request.initial_epoch, request.config.epochs
            )));
        }

        let seed = self.run_seed(request.model_id);
        let total_epochs = request.config.epochs;
        let synthesize_validation = request.config.validation_split > 0.0;

        let mut completed_epoch = request.initial_epoch;
        let mut last_metrics: Option<EpochMetrics> = None;

        for epoch in (request.initial_epoch + 1)..=total_epochs {
            match cancel.check() {
                RunSignal::Stop => {
                    info!(epoch = completed_epoch, "stop observed at epoch boundary");
                    return Ok(RunOutcome::Stopped {
                        epoch: completed_epoch,
                    });
                }
                RunSignal::Pause => {
                    info!(epoch = completed_epoch, "pause observed at epoch boundary");
                    return Ok(RunOutcome::Paused {
                        epoch: completed_epoch,
                    });
                }
                RunSignal::Continue => {}
            }

            if self.config.synthetic_epoch_millis > 0 {
                thread::sleep(Duration::from_millis(self.config.synthetic_epoch_millis));
            }

            let (loss, accuracy) =
                Self::epoch_metrics(seed, epoch, total_epochs, request.config.learning_rate);
            let (val_loss, val_accuracy) = if synthesize_validation {
                // validation tracks training with a fixed generalization gap
                (Some(loss * 1.08), Some((accuracy - 0.03).max(0.0)))
            } else {
                (None, None)
            };

            completed_epoch = epoch;
            let metrics = EpochMetrics {
                epoch,
                loss,
                accuracy,
                val_loss,
                val_accuracy,
            };
            last_metrics = Some(metrics);
            debug!(epoch, loss, accuracy, "synthetic epoch finished");
            sink.emit(RunEvent::Epoch(metrics));

            if write_checkpoints && self.store.is_due(epoch, total_epochs) {
                let path = self.store.save_metadata(request.model_id, epoch, &metrics)?;
                sink.emit(RunEvent::Checkpoint { epoch, path });
            }
        }

        let final_metrics =
            last_metrics.ok_or_else(|| Error::compute("epoch loop produced no metrics"))?;
        Ok(RunOutcome::Completed { final_metrics })
    }
}

impl TrainingEngine for SyntheticEngine {
    fn name(&self) -> &'static str {
        "synthetic"
    }

    fn run(
        &self,
        request: TrainRequest,
        sink: EventSink,
        cancel: CancelToken,
    ) -> Result<RunOutcome> {
        info!(
            model_id = %request.model_id,
            session_id = %request.session_id,
            samples = request.samples.len(),
            epochs = request.config.epochs,
            initial_epoch = request.initial_epoch,
            "starting simulated training run"
        );
        self.fit(&request, &sink, &cancel, true)
    }

    /// Replays the metrics recorded when the checkpoint was written.
    fn evaluate(&self, request: EvalRequest) -> Result<EpochMetrics> {
        let meta = self.store.load_metadata(&request.checkpoint_path)?;
        Ok(EpochMetrics {
            epoch: 0,
            loss: meta.metrics.loss,
            accuracy: meta.metrics.accuracy,
            val_loss: None,
            val_accuracy: None,
        })
    }

    /// Stable label per sequence, derived from its token ids and the seed.
    fn predict(&self, request: PredictRequest) -> Result<Vec<u32>> {
        if request.num_classes == 0 {
            return Err(Error::invalid_input("prediction requires at least one class"));
        }
        let seed = self.run_seed(request.model_id);
        Ok(request
            .sequences
            .iter()
            .map(|ids| {
                let sum: u64 = ids.iter().map(|&id| id as u64).sum();
                (sum.wrapping_add(seed) % request.num_classes as u64) as u32
            })
            .collect())
    }

    fn optimize(&self, request: OptimizeRequest) -> Result<OptimizeReport> {
        if request.candidates.is_empty() {
            return Err(Error::invalid_input("no learning rates to try"));
        }
        if request.trial_epochs == 0 {
            return Err(Error::invalid_input("trials need at least one epoch"));
        }

        let trials: Vec<TrialResult> = request
            .candidates
            .iter()
            .map(|&learning_rate| {
                let (loss, _) = Self::epoch_metrics(
                    self.config.seed,
                    request.trial_epochs,
                    request.trial_epochs,
                    learning_rate,
                );
                TrialResult {
                    learning_rate,
                    loss,
                }
            })
            .collect();

        let best_trial = trials
            .iter()
            .min_by(|a, b| a.loss.total_cmp(&b.loss))
            .ok_or_else(|| Error::compute("no trials finished"))?;
        let mut best = request.base.clone();
        best.learning_rate = best_trial.learning_rate;
        info!(
            learning_rate = best_trial.learning_rate,
            loss = best_trial.loss,
            "simulated hyperparameter search finished"
        );
        Ok(OptimizeReport { best, trials })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeviceType, EngineKind};
    use crate::engine::EncodedSample;
    use crate::session::types::{SessionConfig, SessionId};

    fn engine(dir: &std::path::Path, epoch_millis: u64) -> SyntheticEngine {
        let config = EngineConfig {
            kind: EngineKind::Synthetic,
            device: DeviceType::Cpu,
            embedding_dim: 8,
            hidden_dim: 8,
            synthetic_epoch_millis: epoch_millis,
            seed: 11,
        };
        let store = CheckpointStore::new(dir.to_path_buf(), 2);
        SyntheticEngine::new(config, store)
    }

    fn request(epochs: usize) -> TrainRequest {
        TrainRequest {
            model_id: ModelId(3),
            session_id: SessionId::new(),
            samples: vec![EncodedSample {
                ids: vec![2, 3, 0],
                label: 0,
            }],
            vocab_size: 8,
            num_classes: 2,
            config: SessionConfig {
                epochs,
                ..SessionConfig::default()
            },
            initial_epoch: 0,
            resume_from: None,
        }
    }

    fn collect_epochs(rx: &mut tokio::sync::mpsc::UnboundedReceiver<RunEvent>) -> Vec<EpochMetrics> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let RunEvent::Epoch(m) = event {
                out.push(m);
            }
        }
        out
    }

    #[test]
    fn identical_runs_produce_identical_curves() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path(), 0);

        let (sink_a, mut rx_a) = EventSink::new();
        engine.run(request(4), sink_a, CancelToken::new()).unwrap();
        let (sink_b, mut rx_b) = EventSink::new();
        engine.run(request(4), sink_b, CancelToken::new()).unwrap();

        let a = collect_epochs(&mut rx_a);
        let b = collect_epochs(&mut rx_b);
        assert_eq!(a.len(), 4);
        for (x, y) in a.iter().zip(&b) {
            assert_eq!(x.epoch, y.epoch);
            assert_eq!(x.loss, y.loss);
            assert_eq!(x.accuracy, y.accuracy);
        }
    }

    #[test]
    fn checkpoints_follow_cadence_and_final_epoch() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path(), 0);
        let (sink, mut rx) = EventSink::new();

        let outcome = engine.run(request(5), sink, CancelToken::new()).unwrap();
        assert!(matches!(outcome, RunOutcome::Completed { .. }));

        let mut checkpoints = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let RunEvent::Checkpoint { epoch, path } = event {
                assert!(path.exists());
                checkpoints.push(epoch);
            }
        }
        assert_eq!(checkpoints, vec![2, 4, 5]);
    }

    /// Drains run events on a side thread, firing `signal` once the first
    /// epoch lands; returns every epoch seen.
    fn watch_and_signal(
        mut rx: tokio::sync::mpsc::UnboundedReceiver<RunEvent>,
        signal: impl Fn() + Send + 'static,
    ) -> std::thread::JoinHandle<Vec<EpochMetrics>> {
        std::thread::spawn(move || {
            use tokio::sync::mpsc::error::TryRecvError;
            let mut epochs = Vec::new();
            loop {
                match rx.try_recv() {
                    Ok(RunEvent::Epoch(m)) => {
                        epochs.push(m);
                        signal();
                    }
                    Ok(_) => {}
                    Err(TryRecvError::Empty) => {
                        std::thread::sleep(Duration::from_millis(2))
                    }
                    Err(TryRecvError::Disconnected) => break,
                }
            }
            epochs
        })
    }

    #[test]
    fn stop_is_observed_between_epochs() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path(), 10);
        let (sink, rx) = EventSink::new();
        let cancel = CancelToken::new();

        let watcher = {
            let cancel = cancel.clone();
            watch_and_signal(rx, move || cancel.request_stop())
        };
        let outcome = engine.run(request(100), sink, cancel).unwrap();
        watcher.join().unwrap();

        match outcome {
            RunOutcome::Stopped { epoch } => {
                assert!(epoch >= 1);
                assert!(epoch < 100);
            }
            other => panic!("expected stop, got {other:?}"),
        }
    }

    #[test]
    fn pause_preserves_the_completed_epoch() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path(), 10);
        let (sink, rx) = EventSink::new();
        let cancel = CancelToken::new();

        let watcher = {
            let cancel = cancel.clone();
            watch_and_signal(rx, move || cancel.request_pause())
        };
        let outcome = engine.run(request(100), sink, cancel).unwrap();
        let epochs = watcher.join().unwrap();

        let paused_at = match outcome {
            RunOutcome::Paused { epoch } => epoch,
            other => panic!("expected pause, got {other:?}"),
        };
        assert!(paused_at >= 1);
        assert_eq!(epochs.last().map(|m| m.epoch), Some(paused_at));
    }

    #[test]
    fn evaluate_replays_checkpoint_metrics() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path(), 0);
        let (sink, mut rx) = EventSink::new();

        engine.run(request(2), sink, CancelToken::new()).unwrap();

        let mut recorded = None;
        let mut checkpoint_path = None;
        while let Ok(event) = rx.try_recv() {
            match event {
                RunEvent::Epoch(m) => recorded = Some(m),
                RunEvent::Checkpoint { path, .. } => checkpoint_path = Some(path),
            }
        }
        let recorded = recorded.unwrap();
        let report = engine
            .evaluate(EvalRequest {
                model_id: ModelId(3),
                checkpoint_path: checkpoint_path.unwrap(),
                samples: Vec::new(),
                vocab_size: 8,
                num_classes: 2,
            })
            .unwrap();
        assert_eq!(report.loss, recorded.loss);
        assert_eq!(report.accuracy, recorded.accuracy);
    }

    #[test]
    fn predictions_are_stable_and_in_range() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path(), 0);
        let request = PredictRequest {
            model_id: ModelId(3),
            checkpoint_path: std::path::PathBuf::new(),
            sequences: vec![vec![1, 2, 3], vec![4, 5, 6], vec![1, 2, 3]],
            vocab_size: 8,
            num_classes: 3,
        };
        let first = engine.predict(request.clone()).unwrap();
        let second = engine.predict(request).unwrap();
        assert_eq!(first, second);
        assert_eq!(first[0], first[2]);
        assert!(first.iter().all(|&label| label < 3));
    }

    #[test]
    fn optimize_prefers_moderate_learning_rates() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path(), 0);
        let report = engine
            .optimize(OptimizeRequest {
                base: SessionConfig::default(),
                candidates: vec![1e-4, 3e-3, 0.5],
                trial_epochs: 5,
                samples: Vec::new(),
                vocab_size: 8,
                num_classes: 2,
            })
            .unwrap();
        assert_eq!(report.trials.len(), 3);
        // the huge rate overshoots, the tiny one barely moves
        assert_eq!(report.best.learning_rate, 3e-3);
    }
}
