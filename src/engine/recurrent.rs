//! Real training engine: classifier epochs over candle

use candle_core::DType;
use candle_nn::{loss, AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::{debug, info, warn};

use super::classifier::{accuracy, ids_tensor, labels_tensor, ClassifierConfig, TextClassifier};
use super::{
    CancelToken, CheckpointStore, EncodedSample, EvalRequest, EventSink, OptimizeReport,
    OptimizeRequest, PredictRequest, RunEvent, RunOutcome, RunSignal, TrainRequest,
    TrainingEngine, TrialResult,
};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::session::types::EpochMetrics;

/// Engine training the recurrent text classifier for real.
///
/// Builds one model per run, sized by the request's finalized vocabulary,
/// and drives the epoch loop to a terminal outcome.
pub struct RecurrentEngine {
    config: EngineConfig,
    store: CheckpointStore,
    device: candle_core::Device,
}

impl RecurrentEngine {
    /// Create an engine on the configured device
    pub fn new(config: EngineConfig, store: CheckpointStore) -> Result<Self> {
        let device = super::select_device(config.device)?;
        Ok(Self {
            config,
            store,
            device,
        })
    }

    fn build_model(
        &self,
        vocab_size: usize,
        num_classes: usize,
    ) -> Result<(TextClassifier, VarMap)> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &self.device);
        let model = TextClassifier::new(
            &ClassifierConfig {
                vocab_size,
                embedding_dim: self.config.embedding_dim,
                hidden_dim: self.config.hidden_dim,
                num_classes,
            },
            vb,
        )?;
        Ok((model, varmap))
    }

    fn validate_request(request: &TrainRequest) -> Result<()> {
        if request.samples.is_empty() {
            return Err(Error::invalid_input("training requires at least one sample"));
        }
        if request.vocab_size < 2 {
            return Err(Error::invalid_input("vocabulary is missing its sentinels"));
        }
        if request.num_classes == 0 {
            return Err(Error::invalid_input("training requires at least one class"));
        }
        if request.initial_epoch >= request.config.epochs {
            return Err(Error::invalid_input(format!(
                "nothing left to train: {} of {} epochs already done",
                request.initial_epoch, request.config.epochs
            )));
        }
        if let Some(bad) = request
            .samples
            .iter()
            .find(|s| s.label as usize >= request.num_classes)
        {
            return Err(Error::invalid_input(format!(
                "label {} out of range for {} classes",
                bad.label, request.num_classes
            )));
        }
        Ok(())
    }

    /// Shared epoch loop behind `run` and `optimize` trials
    fn fit(
        &self,
        mut request: TrainRequest,
        sink: &EventSink,
        cancel: &CancelToken,
        write_checkpoints: bool,
    ) -> Result<RunOutcome> {
        Self::validate_request(&request)?;
        clamp_samples(&mut request.samples, request.vocab_size);

        let (model, mut varmap) = self.build_model(request.vocab_size, request.num_classes)?;
        if let Some(path) = &request.resume_from {
            info!(path = %path.display(), "restoring weights from checkpoint");
            self.store.load_into(&mut varmap, path)?;
        }

        let mut optimizer = AdamW::new(
            varmap.all_vars(),
            ParamsAdamW {
                lr: request.config.learning_rate,
                ..Default::default()
            },
        )?;

        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let mut indices: Vec<usize> = (0..request.samples.len()).collect();
        indices.shuffle(&mut rng);

        let val_len = (request.samples.len() as f32 * request.config.validation_split).round()
            as usize;
        // never let validation starve training
        let val_len = val_len.min(request.samples.len().saturating_sub(1));
        let (val_idx, train_idx) = indices.split_at(val_len);

        let val_tensors = if val_idx.is_empty() {
            None
        } else {
            let rows: Vec<Vec<u32>> = val_idx
                .iter()
                .map(|&i| request.samples[i].ids.clone())
                .collect();
            let labels: Vec<u32> = val_idx.iter().map(|&i| request.samples[i].label).collect();
            Some((
                ids_tensor(&rows, &self.device)?,
                labels_tensor(&labels, &self.device)?,
            ))
        };

        let total_epochs = request.config.epochs;
        let batch_size = request.config.batch_size.max(1);
        let mut train_order: Vec<usize> = train_idx.to_vec();

        let mut completed_epoch = request.initial_epoch;
        let mut last_metrics: Option<EpochMetrics> = None;
        let mut best_val_loss = f64::INFINITY;
        let mut epochs_without_improvement = 0usize;

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

            train_order.shuffle(&mut rng);
            let mut loss_sum = 0.0f64;
            let mut acc_sum = 0.0f64;
            for chunk in train_order.chunks(batch_size) {
                let rows: Vec<Vec<u32>> = chunk
                    .iter()
                    .map(|&i| request.samples[i].ids.clone())
                    .collect();
                let labels: Vec<u32> = chunk.iter().map(|&i| request.samples[i].label).collect();
                let ids = ids_tensor(&rows, &self.device)?;
                let targets = labels_tensor(&labels, &self.device)?;

                let logits = model.forward(&ids)?;
                let batch_loss = loss::cross_entropy(&logits, &targets)?;
                optimizer.backward_step(&batch_loss)?;

                let weight = chunk.len() as f64;
                loss_sum += batch_loss.to_scalar::<f32>()? as f64 * weight;
                acc_sum += accuracy(&logits, &targets)? * weight;
            }
            let train_len = train_order.len() as f64;
            let train_loss = loss_sum / train_len;
            let train_accuracy = acc_sum / train_len;

            let (val_loss, val_accuracy) = match &val_tensors {
                Some((ids, targets)) => {
                    let logits = model.forward(ids)?;
                    let vl = loss::cross_entropy(&logits, targets)?.to_scalar::<f32>()? as f64;
                    let va = accuracy(&logits, targets)?;
                    (Some(vl), Some(va))
                }
                None => (None, None),
            };

            completed_epoch = epoch;
            let metrics = EpochMetrics {
                epoch,
                loss: train_loss,
                accuracy: train_accuracy,
                val_loss,
                val_accuracy,
            };
            last_metrics = Some(metrics);
            debug!(
                epoch,
                loss = train_loss,
                accuracy = train_accuracy,
                "epoch finished"
            );
            sink.emit(RunEvent::Epoch(metrics));

            let early_stop = if request.config.early_stopping {
                match val_loss {
                    Some(vl) if vl + 1e-9 < best_val_loss => {
                        best_val_loss = vl;
                        epochs_without_improvement = 0;
                        false
                    }
                    Some(_) => {
                        epochs_without_improvement += 1;
                        epochs_without_improvement >= request.config.patience.max(1)
                    }
                    None => false,
                }
            } else {
                false
            };

            if write_checkpoints && (self.store.is_due(epoch, total_epochs) || early_stop) {
                let path =
                    self.store
                        .save_weights(&varmap, request.model_id, epoch, &metrics)?;
                sink.emit(RunEvent::Checkpoint { epoch, path });
            }

            if early_stop {
                info!(
                    epoch,
                    patience = request.config.patience,
                    "validation loss stopped improving, ending run early"
                );
                break;
            }
        }

        let final_metrics =
            last_metrics.ok_or_else(|| Error::compute("epoch loop produced no metrics"))?;
        Ok(RunOutcome::Completed { final_metrics })
    }

    fn restore_model(
        &self,
        vocab_size: usize,
        num_classes: usize,
        checkpoint_path: &std::path::Path,
    ) -> Result<TextClassifier> {
        let (model, mut varmap) = self.build_model(vocab_size, num_classes)?;
        self.store.load_into(&mut varmap, checkpoint_path)?;
        Ok(model)
    }
}

impl TrainingEngine for RecurrentEngine {
    fn name(&self) -> &'static str {
        "recurrent"
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
            vocab_size = request.vocab_size,
            classes = request.num_classes,
            epochs = request.config.epochs,
            initial_epoch = request.initial_epoch,
            "starting training run"
        );
        self.fit(request, &sink, &cancel, true)
    }

    fn evaluate(&self, mut request: EvalRequest) -> Result<EpochMetrics> {
        if request.samples.is_empty() {
            return Err(Error::invalid_input("evaluation requires samples"));
        }
        clamp_samples(&mut request.samples, request.vocab_size);
        let model =
            self.restore_model(request.vocab_size, request.num_classes, &request.checkpoint_path)?;

        let rows: Vec<Vec<u32>> = request.samples.iter().map(|s| s.ids.clone()).collect();
        let labels: Vec<u32> = request.samples.iter().map(|s| s.label).collect();
        let ids = ids_tensor(&rows, &self.device)?;
        let targets = labels_tensor(&labels, &self.device)?;

        let logits = model.forward(&ids)?;
        let eval_loss = loss::cross_entropy(&logits, &targets)?.to_scalar::<f32>()? as f64;
        let eval_accuracy = accuracy(&logits, &targets)?;

        // standalone evaluation carries no epoch of its own
        Ok(EpochMetrics {
            epoch: 0,
            loss: eval_loss,
            accuracy: eval_accuracy,
            val_loss: None,
            val_accuracy: None,
        })
    }

    fn predict(&self, mut request: PredictRequest) -> Result<Vec<u32>> {
        if request.sequences.is_empty() {
            return Ok(Vec::new());
        }
        clamp_rows(&mut request.sequences, request.vocab_size);
        let model =
            self.restore_model(request.vocab_size, request.num_classes, &request.checkpoint_path)?;
        let ids = ids_tensor(&request.sequences, &self.device)?;
        let predicted = model.predict(&ids)?;
        Ok(predicted.to_vec1::<u32>()?)
    }

    fn optimize(&self, request: OptimizeRequest) -> Result<OptimizeReport> {
        if request.candidates.is_empty() {
            return Err(Error::invalid_input("no learning rates to try"));
        }
        if request.trial_epochs == 0 {
            return Err(Error::invalid_input("trials need at least one epoch"));
        }

        let mut trials = Vec::with_capacity(request.candidates.len());
        for &learning_rate in &request.candidates {
            let mut config = request.base.clone();
            config.learning_rate = learning_rate;
            config.epochs = request.trial_epochs;
            config.validation_split = 0.0;
            config.early_stopping = false;

            let trial_request = TrainRequest {
                model_id: crate::session::types::ModelId(0),
                session_id: crate::session::types::SessionId::new(),
                samples: request.samples.clone(),
                vocab_size: request.vocab_size,
                num_classes: request.num_classes,
                config,
                initial_epoch: 0,
                resume_from: None,
            };

            // throwaway sink: trial events go nowhere
            let (sink, rx) = EventSink::new();
            drop(rx);
            let outcome = self.fit(trial_request, &sink, &CancelToken::new(), false)?;
            let final_loss = match outcome {
                RunOutcome::Completed { final_metrics } => final_metrics.loss,
                _ => return Err(Error::compute("optimization trial was interrupted")),
            };
            debug!(learning_rate, loss = final_loss, "trial finished");
            trials.push(TrialResult {
                learning_rate,
                loss: final_loss,
            });
        }

        let best_trial = trials
            .iter()
            .min_by(|a, b| a.loss.total_cmp(&b.loss))
            .ok_or_else(|| Error::compute("no trials finished"))?;
        let mut best = request.base.clone();
        best.learning_rate = best_trial.learning_rate;
        info!(
            learning_rate = best_trial.learning_rate,
            loss = best_trial.loss,
            "hyperparameter search finished"
        );
        Ok(OptimizeReport { best, trials })
    }
}

/// Clamp out-of-range ids instead of failing the run; the mismatch is
/// logged so vocabulary/model drift stays visible to operators.
fn clamp_samples(samples: &mut [EncodedSample], vocab_size: usize) {
    let mut clamped = 0usize;
    let mut first_offender = None;
    let limit = vocab_size.saturating_sub(1) as u32;
    for sample in samples.iter_mut() {
        for id in sample.ids.iter_mut() {
            if *id as usize >= vocab_size {
                first_offender.get_or_insert(*id);
                *id = limit;
                clamped += 1;
            }
        }
    }
    if let Some(id) = first_offender {
        let err = Error::EncodingOverflow { id, vocab_size };
        warn!(count = clamped, error = %err, "clamped out-of-range token ids");
    }
}

fn clamp_rows(rows: &mut [Vec<u32>], vocab_size: usize) {
    let mut clamped = 0usize;
    let mut first_offender = None;
    let limit = vocab_size.saturating_sub(1) as u32;
    for row in rows.iter_mut() {
        for id in row.iter_mut() {
            if *id as usize >= vocab_size {
                first_offender.get_or_insert(*id);
                *id = limit;
                clamped += 1;
            }
        }
    }
    if let Some(id) = first_offender {
        let err = Error::EncodingOverflow { id, vocab_size };
        warn!(count = clamped, error = %err, "clamped out-of-range token ids");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeviceType, EngineKind};
    use crate::session::types::{ModelId, SessionConfig, SessionId};
    use std::path::PathBuf;

    fn engine(dir: &std::path::Path) -> RecurrentEngine {
        let config = EngineConfig {
            kind: EngineKind::Recurrent,
            device: DeviceType::Cpu,
            embedding_dim: 8,
            hidden_dim: 8,
            synthetic_epoch_millis: 0,
            seed: 7,
        };
        let store = CheckpointStore::new(dir.to_path_buf(), 2);
        RecurrentEngine::new(config, store).unwrap()
    }

    fn toy_samples() -> Vec<EncodedSample> {
        // two separable classes over a tiny vocabulary
        let mut samples = Vec::new();
        for i in 0..8u32 {
            samples.push(EncodedSample {
                ids: vec![2 + i % 2, 3, 2, 0, 0],
                label: 0,
            });
            samples.push(EncodedSample {
                ids: vec![6 + i % 2, 7, 6, 0, 0],
                label: 1,
            });
        }
        samples
    }

    fn request(samples: Vec<EncodedSample>, epochs: usize) -> TrainRequest {
        TrainRequest {
            model_id: ModelId(1),
            session_id: SessionId::new(),
            samples,
            vocab_size: 10,
            num_classes: 2,
            config: SessionConfig {
                epochs,
                batch_size: 4,
                learning_rate: 5e-2,
                validation_split: 0.0,
                early_stopping: false,
                patience: 3,
            },
            initial_epoch: 0,
            resume_from: None,
        }
    }

    #[test]
    fn run_emits_every_epoch_and_completes() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let (sink, mut rx) = EventSink::new();

        let outcome = engine
            .run(request(toy_samples(), 3), sink, CancelToken::new())
            .unwrap();

        let final_metrics = match outcome {
            RunOutcome::Completed { final_metrics } => final_metrics,
            other => panic!("expected completion, got {other:?}"),
        };
        assert_eq!(final_metrics.epoch, 3);

        let mut epochs = Vec::new();
        let mut checkpoints = Vec::new();
        while let Ok(event) = rx.try_recv() {
            match event {
                RunEvent::Epoch(m) => epochs.push(m.epoch),
                RunEvent::Checkpoint { epoch, .. } => checkpoints.push(epoch),
            }
        }
        assert_eq!(epochs, vec![1, 2, 3]);
        // cadence 2 plus the final epoch
        assert_eq!(checkpoints, vec![2, 3]);
    }

    #[test]
    fn stop_before_first_epoch_reports_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let (sink, _rx) = EventSink::new();
        let cancel = CancelToken::new();
        cancel.request_stop();

        let outcome = engine.run(request(toy_samples(), 3), sink, cancel).unwrap();
        match outcome {
            RunOutcome::Stopped { epoch } => assert_eq!(epoch, 0),
            other => panic!("expected stop, got {other:?}"),
        }
    }

    #[test]
    fn out_of_range_ids_are_clamped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let (sink, _rx) = EventSink::new();

        let mut samples = toy_samples();
        samples[0].ids[0] = 999;
        let outcome = engine
            .run(request(samples, 1), sink, CancelToken::new())
            .unwrap();
        assert!(matches!(outcome, RunOutcome::Completed { .. }));
    }

    #[test]
    fn empty_dataset_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let (sink, _rx) = EventSink::new();
        let err = engine
            .run(request(Vec::new(), 1), sink, CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn checkpoint_restores_for_evaluation_and_prediction() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let (sink, mut rx) = EventSink::new();

        engine
            .run(request(toy_samples(), 2), sink, CancelToken::new())
            .unwrap();

        let mut checkpoint_path = None;
        while let Ok(event) = rx.try_recv() {
            if let RunEvent::Checkpoint { path, .. } = event {
                checkpoint_path = Some(path);
            }
        }
        let checkpoint_path = checkpoint_path.expect("run should have checkpointed");

        let report = engine
            .evaluate(EvalRequest {
                model_id: ModelId(1),
                checkpoint_path: checkpoint_path.clone(),
                samples: toy_samples(),
                vocab_size: 10,
                num_classes: 2,
            })
            .unwrap();
        assert!(report.loss.is_finite());
        assert!((0.0..=1.0).contains(&report.accuracy));

        let predictions = engine
            .predict(PredictRequest {
                model_id: ModelId(1),
                checkpoint_path,
                sequences: vec![vec![2, 3, 2, 0, 0], vec![6, 7, 6, 0, 0]],
                vocab_size: 10,
                num_classes: 2,
            })
            .unwrap();
        assert_eq!(predictions.len(), 2);
        assert!(predictions.iter().all(|&p| p < 2));
    }

    #[test]
    fn missing_checkpoint_fails_evaluation() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let err = engine
            .evaluate(EvalRequest {
                model_id: ModelId(1),
                checkpoint_path: PathBuf::from("does/not/exist.safetensors"),
                samples: toy_samples(),
                vocab_size: 10,
                num_classes: 2,
            })
            .unwrap_err();
        assert!(matches!(err, Error::Persistence(_)));
    }

    #[test]
    fn optimize_picks_lowest_loss_candidate() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let report = engine
            .optimize(OptimizeRequest {
                base: SessionConfig::default(),
                candidates: vec![1e-1, 1e-3],
                trial_epochs: 2,
                samples: toy_samples(),
                vocab_size: 10,
                num_classes: 2,
            })
            .unwrap();
        assert_eq!(report.trials.len(), 2);
        let winner = report
            .trials
            .iter()
            .min_by(|a, b| a.loss.total_cmp(&b.loss))
            .unwrap();
        assert_eq!(report.best.learning_rate, winner.learning_rate);
    }
}
