//! Training session lifecycle.
//!
//! The orchestrator is the single entry point for job commands. It enforces
//! one active session per model, dispatches the epoch loop per the configured
//! execution strategy, relays run events to the bus, and drives every session
//! row to a terminal state under success, stop, pause, and failure alike.
//!
//! # Components
//!
//! - [`Orchestrator`]: command surface (start/stop/pause/resume/status)
//! - [`SessionRegistry`]: atomic per-model session slots
//! - [`types`]: ids, statuses, session and model records
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use trainyard::config::Config;
//! use trainyard::session::{ModelId, Orchestrator};
//! use trainyard::storage::create_storage;
//!
//! let config = Config::from_file("config.json")?;
//! let storage = create_storage(&config.storage)?;
//! let orchestrator = Arc::new(Orchestrator::new(config, storage)?);
//!
//! let session_id = orchestrator
//!     .start_training(ModelId(1), "sentiment-v1", None, 1)
//!     .await?;
//! orchestrator.stop_training(ModelId(1)).await?;
//! ```

pub mod registry;
pub mod types;

pub use registry::{ActiveSession, SessionRegistry};
pub use types::{
    EpochMetrics, ModelId, ModelRecord, ModelStatus, SessionConfig, SessionId, SessionStatus,
    StatusView, TrainingSession,
};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::config::{Config, ExecutionStrategy};
use crate::engine::{
    create_engine, CancelToken, EncodedSample, EventSink, RunEvent, RunOutcome, TrainRequest,
    TrainingEngine,
};
use crate::error::{Error, Result};
use crate::events::{Event, EventBus};
use crate::storage::{CheckpointRow, DatasetRecord, LogLevel, Storage, TrainingLogRow};
use crate::tokenizer::Tokenizer;
use crate::tokenizer::Vocabulary;
use crate::worker::{WorkerMetric, WorkerPool};

/// Where epoch loops run, fixed at construction
enum Dispatch {
    /// Cooperative blocking task sharing the process
    Inline(Arc<dyn TrainingEngine>),
    /// Isolated worker threads behind a task queue
    Pooled(Arc<WorkerPool>),
}

/// Coordinates training sessions from admission to terminal outcome.
///
/// Commands return synchronously once the decision is durable; the epoch
/// loop itself runs in the background and reports through the event bus
/// and the model row. Post-dispatch errors never reach the original caller.
pub struct Orchestrator {
    config: Config,
    storage: Arc<dyn Storage>,
    bus: EventBus,
    registry: SessionRegistry,
    tokenizer: Arc<Mutex<Tokenizer>>,
    /// Serializes encode phases so sessions never grow the vocabulary
    /// concurrently, in either execution strategy
    encode_gate: tokio::sync::Mutex<()>,
    dispatch: Dispatch,
}

impl Orchestrator {
    /// Build the orchestrator, its engine or pool, and the shared tokenizer
    pub fn new(config: Config, storage: Arc<dyn Storage>) -> Result<Self> {
        config.validate()?;
        let vocab = Vocabulary::load_or_seed(&config.tokenizer.vocab_path);
        let tokenizer = Arc::new(Mutex::new(Tokenizer::with_vocabulary(
            vocab,
            config.tokenizer.max_len,
        )));
        let dispatch = match config.execution.strategy {
            ExecutionStrategy::Inline => {
                Dispatch::Inline(create_engine(&config.engine, &config.checkpoint)?)
            }
            ExecutionStrategy::Pooled => Dispatch::Pooled(Arc::new(WorkerPool::new(
                config.execution.workers,
                &config.engine,
                &config.checkpoint,
            )?)),
        };
        info!(
            strategy = ?config.execution.strategy,
            engine = ?config.engine.kind,
            "orchestrator ready"
        );
        Ok(Self {
            config,
            storage,
            bus: EventBus::default(),
            registry: SessionRegistry::new(),
            tokenizer,
            encode_gate: tokio::sync::Mutex::new(()),
            dispatch,
        })
    }

    /// Bus the orchestrator publishes lifecycle events on
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Open a subscription to lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.bus.subscribe()
    }

    /// Admit and dispatch a training session for `model_id`.
    ///
    /// Fails synchronously with `ModelNotFound`, `DatasetNotFound`,
    /// `AlreadyTraining`, or `InvalidInput`; anything after dispatch is
    /// reported through rows and events instead. `config` falls back to the
    /// deployment's training defaults.
    pub async fn start_training(
        self: &Arc<Self>,
        model_id: ModelId,
        dataset_id: &str,
        config: Option<SessionConfig>,
        user_id: i64,
    ) -> Result<SessionId> {
        let config = config.unwrap_or_else(|| self.config.training.clone());
        self.start_internal(model_id, dataset_id, config, user_id, 0, None)
            .await
    }

    async fn start_internal(
        self: &Arc<Self>,
        model_id: ModelId,
        dataset_id: &str,
        config: SessionConfig,
        user_id: i64,
        initial_epoch: usize,
        resume_from: Option<PathBuf>,
    ) -> Result<SessionId> {
        check_hyperparameters(&config)?;
        let mut model = self
            .storage
            .fetch_model(model_id)
            .await?
            .ok_or(Error::ModelNotFound(model_id))?;
        let dataset = self
            .storage
            .fetch_dataset(dataset_id)
            .await?
            .ok_or_else(|| Error::DatasetNotFound(dataset_id.to_string()))?;
        if dataset.samples.is_empty() {
            return Err(Error::invalid_input(format!(
                "dataset {dataset_id} has no samples"
            )));
        }
        if initial_epoch >= config.epochs {
            return Err(Error::invalid_input(format!(
                "nothing to run: {initial_epoch} of {} epochs already done",
                config.epochs
            )));
        }

        let mut session = TrainingSession::new(model_id, dataset_id, config.clone(), user_id);
        session.current_epoch = initial_epoch;
        let session_id = session.session_id;
        let cancel = self.registry.claim(model_id, session_id)?;

        // queued row + model flip are the durable admission record; if either
        // write fails the claim is rolled back and the caller sees the error
        if let Err(err) = self.storage.upsert_session(session.clone()).await {
            self.registry.take_if_current(model_id, session_id);
            return Err(err);
        }
        model.status = ModelStatus::Training;
        model.epochs = config.epochs;
        model.current_epoch = initial_epoch;
        model.updated_at = Utc::now();
        if let Err(err) = self.storage.upsert_model(model.clone()).await {
            self.registry.take_if_current(model_id, session_id);
            return Err(err);
        }

        session.status = SessionStatus::Running;
        self.try_upsert_session(&session).await;
        info!(
            %model_id,
            %session_id,
            dataset_id,
            epochs = config.epochs,
            initial_epoch,
            "training session dispatched"
        );

        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.run_session(session, model, dataset, cancel, initial_epoch, resume_from)
                .await;
        });
        Ok(session_id)
    }

    /// Background half of a session: encode, run the loop, finalize.
    async fn run_session(
        self: Arc<Self>,
        session: TrainingSession,
        model: ModelRecord,
        dataset: DatasetRecord,
        cancel: CancelToken,
        initial_epoch: usize,
        resume_from: Option<PathBuf>,
    ) {
        let model_id = session.model_id;
        let session_id = session.session_id;

        let (samples, vocab_size) = match self.encode_dataset(&dataset).await {
            Ok(encoded) => encoded,
            Err(err) => {
                self.finish_failed(session, model, err).await;
                return;
            }
        };

        let request = TrainRequest {
            model_id,
            session_id,
            samples,
            vocab_size,
            num_classes: dataset.num_classes(),
            config: session.config.clone(),
            initial_epoch,
            resume_from,
        };

        let (sink, rx) = EventSink::new();
        let relay = tokio::spawn(Arc::clone(&self).relay_events(
            session.clone(),
            model.clone(),
            rx,
            initial_epoch,
        ));

        let outcome = self.dispatch_run(request, sink, cancel).await;

        // the sink dropped with the run, so the relay drains and exits
        let (session, model) = match relay.await {
            Ok(state) => state,
            Err(err) => {
                error!(%model_id, %session_id, error = %err, "progress relay task failed");
                (session, model)
            }
        };

        match outcome {
            Ok(RunOutcome::Completed { final_metrics }) => {
                self.finish_completed(session, model, final_metrics).await;
            }
            Ok(RunOutcome::Stopped { epoch }) => {
                // rows and the stop event were written when the stop command
                // was acknowledged
                debug!(%model_id, %session_id, epoch, "epoch loop observed the stop request");
            }
            Ok(RunOutcome::Paused { epoch }) => {
                self.finish_paused(session, model, epoch).await;
            }
            Err(err) => {
                self.finish_failed(session, model, err).await;
            }
        }
    }

    /// Encode the dataset under the vocabulary growth gate.
    ///
    /// Inline execution grows the shared tokenizer directly on a blocking
    /// thread; pooled execution sends a snapshot to a preprocess task and
    /// adopts the grown vocabulary it returns. Either way the vocabulary
    /// artifact is rewritten before any model is built against it.
    async fn encode_dataset(&self, dataset: &DatasetRecord) -> Result<(Vec<EncodedSample>, usize)> {
        let texts: Vec<String> = dataset.samples.iter().map(|s| s.text.clone()).collect();
        let labels: Vec<u32> = dataset.samples.iter().map(|s| s.label).collect();
        let _growth = self.encode_gate.lock().await;

        let (sequences, vocab_size) = match &self.dispatch {
            Dispatch::Inline(_) => {
                let tokenizer = Arc::clone(&self.tokenizer);
                let vocab_path = self.config.tokenizer.vocab_path.clone();
                tokio::task::spawn_blocking(move || {
                    let mut tok = tokenizer.lock();
                    let sequences = tok.encode_corpus(&texts);
                    if let Err(err) = tok.save(&vocab_path) {
                        warn!(error = %err, "vocabulary artifact write failed");
                    }
                    let vocab_size = tok.vocab_size();
                    (sequences, vocab_size)
                })
                .await
                .map_err(|err| Error::compute(format!("encode task aborted: {err}")))?
            }
            Dispatch::Pooled(pool) => {
                let (snapshot, max_len) = {
                    let tok = self.tokenizer.lock();
                    (tok.snapshot(), tok.max_len())
                };
                let output = pool.run_preprocessing(texts, snapshot, max_len).await?;
                let vocab_size = output.vocabulary.len();
                {
                    let mut tok = self.tokenizer.lock();
                    *tok = Tokenizer::with_vocabulary(output.vocabulary, max_len);
                    if let Err(err) = tok.save(&self.config.tokenizer.vocab_path) {
                        warn!(error = %err, "vocabulary artifact write failed");
                    }
                }
                (output.sequences, vocab_size)
            }
        };

        let samples = sequences
            .into_iter()
            .zip(labels)
            .map(|(ids, label)| EncodedSample { ids, label })
            .collect();
        Ok((samples, vocab_size))
    }

    async fn dispatch_run(
        &self,
        request: TrainRequest,
        sink: EventSink,
        cancel: CancelToken,
    ) -> Result<RunOutcome> {
        match &self.dispatch {
            Dispatch::Inline(engine) => {
                let engine = Arc::clone(engine);
                tokio::task::spawn_blocking(move || engine.run(request, sink, cancel))
                    .await
                    .map_err(|err| Error::compute(format!("training task aborted: {err}")))?
            }
            Dispatch::Pooled(pool) => pool.run_training(request, sink, cancel).await,
        }
    }

    /// Drain run events until the sink closes, returning the rows as last
    /// written. Epoch numbers must advance by exactly one; anything else is
    /// logged and clamped so subscribers always see a contiguous stream.
    async fn relay_events(
        self: Arc<Self>,
        mut session: TrainingSession,
        mut model: ModelRecord,
        mut rx: mpsc::UnboundedReceiver<RunEvent>,
        initial_epoch: usize,
    ) -> (TrainingSession, ModelRecord) {
        let mut last_epoch = initial_epoch;
        let mut last_metrics: Option<EpochMetrics> = None;
        while let Some(event) = rx.recv().await {
            match event {
                RunEvent::Epoch(mut metrics) => {
                    let expected = last_epoch + 1;
                    if metrics.epoch != expected {
                        warn!(
                            model_id = %session.model_id,
                            observed = metrics.epoch,
                            expected,
                            "epoch sequence out of order, clamping"
                        );
                        metrics.epoch = expected;
                    }
                    last_epoch = metrics.epoch;
                    last_metrics = Some(metrics);
                    self.on_progress(&mut session, &mut model, metrics).await;
                }
                RunEvent::Checkpoint { epoch, path } => {
                    let row = CheckpointRow {
                        model_id: session.model_id,
                        epoch,
                        file_path: path,
                        metrics: last_metrics.filter(|m| m.epoch == epoch),
                        created_at: Utc::now(),
                    };
                    if let Err(err) = self.storage.insert_checkpoint(row).await {
                        warn!(
                            model_id = %session.model_id,
                            epoch,
                            error = %err,
                            "checkpoint row write failed"
                        );
                    }
                }
            }
        }
        (session, model)
    }

    /// Persist one epoch of progress and publish it.
    ///
    /// Skipped once the session no longer holds its registry slot; row-write
    /// failures are logged and never interrupt the run.
    async fn on_progress(
        &self,
        session: &mut TrainingSession,
        model: &mut ModelRecord,
        metrics: EpochMetrics,
    ) {
        if !self.registry.is_current(session.model_id, session.session_id) {
            debug!(
                model_id = %session.model_id,
                epoch = metrics.epoch,
                "progress after finalization discarded"
            );
            return;
        }
        session.current_epoch = metrics.epoch;
        model.current_epoch = metrics.epoch;
        model.loss = Some(metrics.loss);
        model.accuracy = Some(metrics.accuracy);
        model.updated_at = Utc::now();
        self.try_upsert_session(session).await;
        self.try_upsert_model(model).await;
        self.try_append_log(log_row(
            session.model_id,
            LogLevel::Info,
            format!(
                "epoch {}: loss {:.4}, accuracy {:.4}",
                metrics.epoch, metrics.loss, metrics.accuracy
            ),
            Some(&metrics),
        ))
        .await;
        self.bus.publish(Event::TrainingProgress {
            model_id: session.model_id,
            session_id: session.session_id,
            epoch: metrics.epoch,
            loss: metrics.loss,
            accuracy: metrics.accuracy,
            val_loss: metrics.val_loss,
            val_accuracy: metrics.val_accuracy,
        });
    }

    async fn finish_completed(
        &self,
        mut session: TrainingSession,
        mut model: ModelRecord,
        final_metrics: EpochMetrics,
    ) {
        let model_id = session.model_id;
        let session_id = session.session_id;
        if !self.registry.take_if_current(model_id, session_id) {
            // a stop during the final epoch wins over the completion
            info!(%model_id, %session_id, "late completion discarded");
            return;
        }
        session.status = SessionStatus::Completed;
        session.ended_at = Some(Utc::now());
        session.current_epoch = final_metrics.epoch;
        session.final_metrics = Some(final_metrics);
        model.status = ModelStatus::Completed;
        model.current_epoch = final_metrics.epoch;
        model.loss = Some(final_metrics.loss);
        model.accuracy = Some(final_metrics.accuracy);
        model.updated_at = Utc::now();
        self.try_upsert_session(&session).await;
        self.try_upsert_model(&model).await;
        self.try_append_log(log_row(
            model_id,
            LogLevel::Info,
            format!("training completed at epoch {}", final_metrics.epoch),
            Some(&final_metrics),
        ))
        .await;
        self.bus.publish(Event::TrainingCompleted {
            model_id,
            session_id,
        });
        info!(%model_id, %session_id, epoch = final_metrics.epoch, "training completed");
    }

    async fn finish_paused(&self, mut session: TrainingSession, mut model: ModelRecord, epoch: usize) {
        let model_id = session.model_id;
        let session_id = session.session_id;
        if !self.registry.mark_paused(model_id, session_id) {
            info!(%model_id, %session_id, "pause outcome after finalization discarded");
            return;
        }
        session.status = SessionStatus::Paused;
        session.current_epoch = epoch;
        model.status = ModelStatus::Paused;
        model.current_epoch = epoch;
        model.updated_at = Utc::now();
        self.try_upsert_session(&session).await;
        self.try_upsert_model(&model).await;
        self.try_append_log(log_row(
            model_id,
            LogLevel::Info,
            format!("training paused at epoch {epoch}"),
            None,
        ))
        .await;
        // pause has no bus topic; consumers poll status or the model row
        info!(%model_id, %session_id, epoch, "training paused");
    }

    async fn finish_failed(&self, mut session: TrainingSession, mut model: ModelRecord, err: Error) {
        let model_id = session.model_id;
        let session_id = session.session_id;
        if !self.registry.take_if_current(model_id, session_id) {
            warn!(%model_id, %session_id, error = %err, "late failure discarded");
            return;
        }
        error!(%model_id, %session_id, error = %err, "training failed");
        session.status = SessionStatus::Failed;
        session.ended_at = Some(Utc::now());
        model.status = ModelStatus::Failed;
        model.updated_at = Utc::now();
        self.try_upsert_session(&session).await;
        self.try_upsert_model(&model).await;
        self.try_append_log(log_row(
            model_id,
            LogLevel::Error,
            format!("training failed: {err}"),
            None,
        ))
        .await;
        self.bus.publish(Event::TrainingFailed {
            model_id,
            session_id,
            error: err.to_string(),
        });
    }

    /// Request a cooperative stop and finalize the session immediately.
    ///
    /// The acknowledgment does not wait for the epoch loop: the in-flight
    /// epoch finishes in the background and its late outcome is discarded.
    pub async fn stop_training(&self, model_id: ModelId) -> Result<()> {
        let entry = self
            .registry
            .get(model_id)
            .ok_or(Error::NoActiveSession(model_id))?;
        entry.cancel.request_stop();
        // the slot is released before any row writes so late progress from
        // the loop sees a stale registry and stops persisting
        if !self.registry.take_if_current(model_id, entry.session_id) {
            return Err(Error::NoActiveSession(model_id));
        }

        if let Some(mut session) = self.fetch_session_row(entry.session_id).await {
            session.status = SessionStatus::Stopped;
            session.ended_at = Some(Utc::now());
            self.try_upsert_session(&session).await;
        }
        if let Some(mut model) = self.fetch_model_row(model_id).await {
            model.status = ModelStatus::Stopped;
            model.updated_at = Utc::now();
            self.try_upsert_model(&model).await;
        }
        self.try_append_log(log_row(
            model_id,
            LogLevel::Warn,
            "training stopped by request".to_string(),
            None,
        ))
        .await;
        self.bus.publish(Event::TrainingStopped { model_id });
        info!(%model_id, session_id = %entry.session_id, "training stop acknowledged");
        Ok(())
    }

    /// Request a pause at the next epoch boundary.
    ///
    /// The session keeps its registry slot, so new starts for the model keep
    /// failing with `AlreadyTraining` until a resume or stop. Rows flip to
    /// paused when the loop actually parks.
    pub async fn pause_training(&self, model_id: ModelId) -> Result<()> {
        let entry = self
            .registry
            .get(model_id)
            .ok_or(Error::NoActiveSession(model_id))?;
        if entry.status == SessionStatus::Paused {
            return Err(Error::invalid_input(format!(
                "model {model_id} is already paused"
            )));
        }
        entry.cancel.request_pause();
        info!(%model_id, session_id = %entry.session_id, "training pause requested");
        Ok(())
    }

    /// Resume a paused model as a fresh session.
    ///
    /// The paused row is closed as the historical record and a new session
    /// starts from the model's latest checkpoint epoch with the same dataset
    /// and hyperparameters.
    pub async fn resume_training(self: &Arc<Self>, model_id: ModelId) -> Result<SessionId> {
        let entry = self
            .registry
            .get(model_id)
            .ok_or(Error::NoActiveSession(model_id))?;
        if entry.status != SessionStatus::Paused {
            return Err(Error::AlreadyTraining(model_id));
        }
        let old = self
            .storage
            .fetch_session(entry.session_id)
            .await?
            .ok_or_else(|| {
                Error::persistence(format!("paused session {} has no row", entry.session_id))
            })?;
        if !self.registry.take_if_current(model_id, entry.session_id) {
            return Err(Error::NoActiveSession(model_id));
        }

        let mut finalized = old.clone();
        finalized.ended_at = Some(Utc::now());
        self.try_upsert_session(&finalized).await;

        let checkpoint = match self.storage.latest_checkpoint(model_id).await {
            Ok(row) => row,
            Err(err) => {
                warn!(%model_id, error = %err, "checkpoint lookup failed, resuming from scratch");
                None
            }
        };
        let (initial_epoch, resume_from) = match checkpoint {
            Some(row) => (row.epoch, Some(row.file_path)),
            None => (0, None),
        };
        info!(
            %model_id,
            old_session = %old.session_id,
            initial_epoch,
            "resuming training as a fresh session"
        );
        self.start_internal(
            model_id,
            &old.dataset_id,
            old.config.clone(),
            old.owner_user_id,
            initial_epoch,
            resume_from,
        )
        .await
    }

    /// Live answer from the registry, falling back to the model row
    pub async fn status(&self, model_id: ModelId) -> Result<StatusView> {
        if let Some(entry) = self.registry.get(model_id) {
            let status = match entry.status {
                SessionStatus::Paused => ModelStatus::Paused,
                _ => ModelStatus::Training,
            };
            return Ok(StatusView {
                is_training: true,
                status,
            });
        }
        let model = self
            .storage
            .fetch_model(model_id)
            .await?
            .ok_or(Error::ModelNotFound(model_id))?;
        Ok(StatusView {
            is_training: false,
            status: model.status,
        })
    }

    /// Models with a live session
    pub fn active_sessions(&self) -> Vec<ModelId> {
        self.registry.active_models()
    }

    /// Per-worker snapshots; empty under inline execution
    pub fn worker_metrics(&self) -> Vec<WorkerMetric> {
        match &self.dispatch {
            Dispatch::Pooled(pool) => pool.metrics().workers,
            Dispatch::Inline(_) => Vec::new(),
        }
    }

    /// Checkpoint artifacts recorded for a model, oldest first
    pub async fn checkpoints(&self, model_id: ModelId) -> Result<Vec<CheckpointRow>> {
        self.storage.checkpoints_for_model(model_id).await
    }

    /// Publish aggregate worker metrics on a fixed interval.
    ///
    /// Returns `None` under inline execution, which has no pool to sample.
    pub fn start_metrics_publisher(self: &Arc<Self>) -> Option<tokio::task::JoinHandle<()>> {
        let Dispatch::Pooled(pool) = &self.dispatch else {
            return None;
        };
        let pool = Arc::clone(pool);
        let bus = self.bus.clone();
        let period = Duration::from_secs(self.config.execution.metrics_interval_secs);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let snapshot = pool.metrics();
                bus.publish(Event::WorkerMetrics {
                    memory_usage: snapshot.memory_usage,
                    cpu_usage: snapshot.cpu_usage,
                    active_workers: snapshot.active_workers,
                    total_workers: snapshot.total_workers,
                });
            }
        }))
    }

    /// Tear down the worker pool, draining queued tasks first
    pub async fn shutdown(&self) {
        if let Dispatch::Pooled(pool) = &self.dispatch {
            let pool = Arc::clone(pool);
            if tokio::task::spawn_blocking(move || pool.terminate())
                .await
                .is_err()
            {
                error!("worker pool termination task failed");
            }
        }
    }

    async fn try_upsert_session(&self, session: &TrainingSession) {
        if let Err(err) = self.storage.upsert_session(session.clone()).await {
            warn!(
                session_id = %session.session_id,
                error = %err,
                "session row write failed"
            );
        }
    }

    async fn try_upsert_model(&self, model: &ModelRecord) {
        if let Err(err) = self.storage.upsert_model(model.clone()).await {
            warn!(model_id = %model.id, error = %err, "model row write failed");
        }
    }

    async fn try_append_log(&self, row: TrainingLogRow) {
        if let Err(err) = self.storage.append_log(row).await {
            warn!(error = %err, "training log write failed");
        }
    }

    async fn fetch_session_row(&self, id: SessionId) -> Option<TrainingSession> {
        match self.storage.fetch_session(id).await {
            Ok(row) => row,
            Err(err) => {
                warn!(session_id = %id, error = %err, "session row read failed");
                None
            }
        }
    }

    async fn fetch_model_row(&self, id: ModelId) -> Option<ModelRecord> {
        match self.storage.fetch_model(id).await {
            Ok(row) => row,
            Err(err) => {
                warn!(model_id = %id, error = %err, "model row read failed");
                None
            }
        }
    }
}

fn check_hyperparameters(config: &SessionConfig) -> Result<()> {
    if config.epochs == 0 {
        return Err(Error::invalid_input("epochs must be > 0"));
    }
    if config.batch_size == 0 {
        return Err(Error::invalid_input("batch size must be > 0"));
    }
    if config.learning_rate <= 0.0 || !config.learning_rate.is_finite() {
        return Err(Error::invalid_input("learning rate must be positive and finite"));
    }
    if !(0.0..1.0).contains(&config.validation_split) {
        return Err(Error::invalid_input("validation split must be in [0, 1)"));
    }
    Ok(())
}

fn log_row(
    model_id: ModelId,
    level: LogLevel,
    message: String,
    metrics: Option<&EpochMetrics>,
) -> TrainingLogRow {
    TrainingLogRow {
        model_id,
        level,
        message,
        epoch: metrics.map(|m| m.epoch),
        loss: metrics.map(|m| m.loss),
        accuracy: metrics.map(|m| m.accuracy),
        timestamp: Utc::now(),
    }
}
