//! Fixed-size pool of OS worker threads for off-runtime task execution.
//!
//! Each worker owns its own engine instance and drains a shared FIFO queue,
//! one task at a time. Callers submit a task and await a oneshot ticket for
//! the result; progress from long-running training tasks flows through the
//! same [`EventSink`] channel used by inline execution, so the orchestrator
//! streams epochs identically for both strategies.
//!
//! A task that fails (or panics) is reported on that task only; the worker
//! stays alive and pulls the next one.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use chrono::{DateTime, Utc};
use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::config::{CheckpointConfig, EngineConfig};
use crate::engine::{
    create_engine, CancelToken, EvalRequest, EventSink, OptimizeReport, OptimizeRequest,
    PredictRequest, RunOutcome, TrainRequest, TrainingEngine,
};
use crate::error::{Error, Result};
use crate::session::types::EpochMetrics;
use crate::tokenizer::{Tokenizer, Vocabulary};

/// Work accepted by the pool
pub enum TaskPayload {
    /// Full training run; progress flows through the sink
    Train {
        request: TrainRequest,
        sink: EventSink,
        cancel: CancelToken,
    },
    /// Score a checkpoint against labeled samples
    Evaluate { request: EvalRequest },
    /// Label unseen sequences with a checkpoint
    Predict { request: PredictRequest },
    /// Learning-rate search over short trials
    Optimize { request: OptimizeRequest },
    /// Encode a raw corpus, growing the given vocabulary
    Preprocess {
        texts: Vec<String>,
        vocabulary: Vocabulary,
        max_len: usize,
    },
}

impl TaskPayload {
    fn kind(&self) -> &'static str {
        match self {
            TaskPayload::Train { .. } => "train",
            TaskPayload::Evaluate { .. } => "evaluate",
            TaskPayload::Predict { .. } => "predict",
            TaskPayload::Optimize { .. } => "optimize",
            TaskPayload::Preprocess { .. } => "preprocess",
        }
    }
}

/// Successful result of a pool task
pub enum TaskOutput {
    /// Terminal outcome of a training run
    Trained(RunOutcome),
    /// Metrics of an evaluation pass
    Evaluated(EpochMetrics),
    /// Predicted labels, one per input sequence
    Predicted(Vec<u32>),
    /// Outcome of a learning-rate search
    Optimized(OptimizeReport),
    /// Encoded corpus and grown vocabulary
    Preprocessed(PreprocessOutput),
}

/// Encoded corpus plus the vocabulary as grown by the pass
pub struct PreprocessOutput {
    /// One padded id sequence per input text
    pub sequences: Vec<Vec<u32>>,
    /// Vocabulary after any growth during encoding
    pub vocabulary: Vocabulary,
}

struct TaskEnvelope {
    payload: TaskPayload,
    reply: oneshot::Sender<Result<TaskOutput>>,
}

/// Point-in-time snapshot of one worker.
///
/// Workers are threads in a shared address space, so `memory_usage` reports
/// the process resident set rather than a per-thread figure.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerMetric {
    /// Index of the worker within the pool
    pub worker_id: usize,
    /// Process resident set in bytes
    pub memory_usage: u64,
    /// Process share of machine CPU since the previous sample, in percent
    pub cpu_usage: f64,
    /// 1 while the worker is inside a task, else 0
    pub active_tasks: usize,
    /// Tasks finished successfully since pool start
    pub completed_tasks: usize,
    /// Tasks that returned an error or panicked
    pub failed_tasks: usize,
    /// When the snapshot was taken
    pub observed_at: DateTime<Utc>,
}

/// Aggregate snapshot across the pool
#[derive(Debug, Clone, Serialize)]
pub struct PoolMetrics {
    /// Process resident set in bytes
    pub memory_usage: u64,
    /// Process share of machine CPU since the previous sample, in percent
    pub cpu_usage: f64,
    /// Workers currently inside a task
    pub active_workers: usize,
    /// Pool size
    pub total_workers: usize,
    /// Per-worker snapshots
    pub workers: Vec<WorkerMetric>,
}

/// Counters shared between a worker thread and the pool handle
struct WorkerState {
    id: usize,
    active: AtomicUsize,
    completed: AtomicUsize,
    failed: AtomicUsize,
}

impl WorkerState {
    fn new(id: usize) -> Self {
        Self {
            id,
            active: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
        }
    }
}

/// Fixed-size worker pool over a shared FIFO task queue.
pub struct WorkerPool {
    queue: Mutex<Option<Sender<TaskEnvelope>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    states: Vec<Arc<WorkerState>>,
    cpu_baseline: Mutex<Option<(u64, u64)>>,
}

impl WorkerPool {
    /// Spawn `workers` threads, each with its own engine instance.
    ///
    /// Engine construction happens up front so a misconfigured device fails
    /// the pool instead of its first task.
    pub fn new(
        workers: usize,
        engine: &EngineConfig,
        checkpoint: &CheckpointConfig,
    ) -> Result<Self> {
        let workers = workers.max(1);
        let (tx, rx) = unbounded::<TaskEnvelope>();

        let mut states = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);
        for id in 0..workers {
            let engine = create_engine(engine, checkpoint)?;
            let state = Arc::new(WorkerState::new(id));
            states.push(Arc::clone(&state));
            let rx = rx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("trainyard-worker-{id}"))
                .spawn(move || worker_loop(engine, rx, state))?;
            handles.push(handle);
        }
        info!(workers, "worker pool started");

        Ok(Self {
            queue: Mutex::new(Some(tx)),
            handles: Mutex::new(handles),
            states,
            cpu_baseline: Mutex::new(None),
        })
    }

    fn submit(&self, payload: TaskPayload) -> Result<oneshot::Receiver<Result<TaskOutput>>> {
        let sender = self
            .queue
            .lock()
            .as_ref()
            .cloned()
            .ok_or_else(|| Error::worker("worker pool is terminated"))?;
        let (reply, ticket) = oneshot::channel();
        sender
            .send(TaskEnvelope { payload, reply })
            .map_err(|_| Error::worker("worker pool queue is closed"))?;
        Ok(ticket)
    }

    async fn run(&self, payload: TaskPayload) -> Result<TaskOutput> {
        let kind = payload.kind();
        let ticket = self.submit(payload)?;
        ticket
            .await
            .map_err(|_| Error::worker(format!("worker abandoned {kind} task")))?
    }

    /// Dispatch a training run and wait for its terminal outcome
    pub async fn run_training(
        &self,
        request: TrainRequest,
        sink: EventSink,
        cancel: CancelToken,
    ) -> Result<RunOutcome> {
        match self.run(TaskPayload::Train { request, sink, cancel }).await? {
            TaskOutput::Trained(outcome) => Ok(outcome),
            _ => Err(Error::worker("train task returned a mismatched result")),
        }
    }

    /// Score a checkpoint against labeled samples on a worker
    pub async fn run_evaluation(&self, request: EvalRequest) -> Result<EpochMetrics> {
        match self.run(TaskPayload::Evaluate { request }).await? {
            TaskOutput::Evaluated(metrics) => Ok(metrics),
            _ => Err(Error::worker("evaluate task returned a mismatched result")),
        }
    }

    /// Label unseen sequences with a checkpoint on a worker
    pub async fn run_prediction(&self, request: PredictRequest) -> Result<Vec<u32>> {
        match self.run(TaskPayload::Predict { request }).await? {
            TaskOutput::Predicted(labels) => Ok(labels),
            _ => Err(Error::worker("predict task returned a mismatched result")),
        }
    }

    /// Run a learning-rate search on a worker
    pub async fn run_optimization(&self, request: OptimizeRequest) -> Result<OptimizeReport> {
        match self.run(TaskPayload::Optimize { request }).await? {
            TaskOutput::Optimized(report) => Ok(report),
            _ => Err(Error::worker("optimize task returned a mismatched result")),
        }
    }

    /// Encode a corpus off the runtime, returning sequences and the grown vocabulary
    pub async fn run_preprocessing(
        &self,
        texts: Vec<String>,
        vocabulary: Vocabulary,
        max_len: usize,
    ) -> Result<PreprocessOutput> {
        let payload = TaskPayload::Preprocess {
            texts,
            vocabulary,
            max_len,
        };
        match self.run(payload).await? {
            TaskOutput::Preprocessed(output) => Ok(output),
            _ => Err(Error::worker("preprocess task returned a mismatched result")),
        }
    }

    /// Sample per-worker counters plus process memory and CPU.
    ///
    /// CPU is the share of machine time the process consumed since the
    /// previous call; the first call reports zero.
    pub fn metrics(&self) -> PoolMetrics {
        let memory_usage = sample_rss_bytes();
        let cpu_usage = self.sample_cpu_percent();
        let observed_at = Utc::now();

        let workers: Vec<WorkerMetric> = self
            .states
            .iter()
            .map(|state| WorkerMetric {
                worker_id: state.id,
                memory_usage,
                cpu_usage,
                active_tasks: state.active.load(Ordering::SeqCst),
                completed_tasks: state.completed.load(Ordering::SeqCst),
                failed_tasks: state.failed.load(Ordering::SeqCst),
                observed_at,
            })
            .collect();
        let active_workers = workers.iter().filter(|w| w.active_tasks > 0).count();

        PoolMetrics {
            memory_usage,
            cpu_usage,
            active_workers,
            total_workers: self.states.len(),
            workers,
        }
    }

    fn sample_cpu_percent(&self) -> f64 {
        let (Some(process), Some(machine)) = (read_process_jiffies(), read_machine_jiffies())
        else {
            return 0.0;
        };
        let mut baseline = self.cpu_baseline.lock();
        let percent = match *baseline {
            Some((last_process, last_machine)) => {
                let dp = process.saturating_sub(last_process);
                let dm = machine.saturating_sub(last_machine);
                if dm > 0 {
                    (dp as f64 / dm as f64) * 100.0
                } else {
                    0.0
                }
            }
            None => 0.0,
        };
        *baseline = Some((process, machine));
        percent
    }

    /// Close the queue and wait for workers to drain queued tasks and exit.
    ///
    /// Blocks the calling thread; run it under `spawn_blocking` from async
    /// contexts. Idempotent.
    pub fn terminate(&self) {
        let closed = self.queue.lock().take().is_some();
        if !closed {
            return;
        }
        info!("worker pool terminating, draining queued tasks");
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if handle.join().is_err() {
                error!("worker thread ended in a panic outside task execution");
            }
        }
    }
}

fn worker_loop(
    engine: Arc<dyn TrainingEngine>,
    rx: Receiver<TaskEnvelope>,
    state: Arc<WorkerState>,
) {
    debug!(worker_id = state.id, engine = engine.name(), "worker ready");
    while let Ok(TaskEnvelope { payload, reply }) = rx.recv() {
        let kind = payload.kind();
        state.active.store(1, Ordering::SeqCst);

        let result = match catch_unwind(AssertUnwindSafe(|| run_task(engine.as_ref(), payload))) {
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(worker_id = state.id, kind, "task panicked: {message}");
                Err(Error::compute(format!("{kind} task panicked: {message}")))
            }
        };
        if result.is_ok() {
            state.completed.fetch_add(1, Ordering::SeqCst);
        } else {
            state.failed.fetch_add(1, Ordering::SeqCst);
        }

        state.active.store(0, Ordering::SeqCst);
        if reply.send(result).is_err() {
            // caller gave up on the ticket; nothing left to deliver
            warn!(worker_id = state.id, kind, "task result had no receiver");
        }
    }
    debug!(worker_id = state.id, "worker exiting");
}

fn run_task(engine: &dyn TrainingEngine, payload: TaskPayload) -> Result<TaskOutput> {
    match payload {
        TaskPayload::Train {
            request,
            sink,
            cancel,
        } => engine.run(request, sink, cancel).map(TaskOutput::Trained),
        TaskPayload::Evaluate { request } => {
            engine.evaluate(request).map(TaskOutput::Evaluated)
        }
        TaskPayload::Predict { request } => engine.predict(request).map(TaskOutput::Predicted),
        TaskPayload::Optimize { request } => {
            engine.optimize(request).map(TaskOutput::Optimized)
        }
        TaskPayload::Preprocess {
            texts,
            vocabulary,
            max_len,
        } => {
            let mut tokenizer = Tokenizer::with_vocabulary(vocabulary, max_len);
            let sequences = tokenizer.encode_corpus(&texts);
            Ok(TaskOutput::Preprocessed(PreprocessOutput {
                sequences,
                vocabulary: tokenizer.snapshot(),
            }))
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic payload"
    }
}

#[cfg(target_os = "linux")]
fn sample_rss_bytes() -> u64 {
    let Ok(status) = std::fs::read_to_string("/proc/self/status") else {
        return 0;
    };
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            if let Some(kb) = rest.split_whitespace().next() {
                if let Ok(kb) = kb.parse::<u64>() {
                    return kb * 1024;
                }
            }
        }
    }
    0
}

#[cfg(not(target_os = "linux"))]
fn sample_rss_bytes() -> u64 {
    0
}

/// Cumulative jiffies this process has spent on-CPU, from /proc/self/stat
#[cfg(target_os = "linux")]
fn read_process_jiffies() -> Option<u64> {
    let stat = std::fs::read_to_string("/proc/self/stat").ok()?;
    // comm can contain spaces, so field counting starts after the ')'
    let (_, rest) = stat.rsplit_once(')')?;
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some(utime + stime)
}

#[cfg(not(target_os = "linux"))]
fn read_process_jiffies() -> Option<u64> {
    None
}

/// Cumulative machine jiffies from the aggregate cpu line of /proc/stat
#[cfg(target_os = "linux")]
fn read_machine_jiffies() -> Option<u64> {
    let stat = std::fs::read_to_string("/proc/stat").ok()?;
    let cpu_line = stat.lines().next()?;
    let fields: Vec<u64> = cpu_line
        .split_whitespace()
        .skip(1)
        .take(4)
        .filter_map(|f| f.parse().ok())
        .collect();
    if fields.len() < 4 {
        return None;
    }
    Some(fields.iter().sum())
}

#[cfg(not(target_os = "linux"))]
fn read_machine_jiffies() -> Option<u64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeviceType, EngineKind};
    use crate::engine::EncodedSample;
    use crate::session::types::{ModelId, SessionConfig, SessionId};

    fn engine_config(epoch_millis: u64) -> EngineConfig {
        EngineConfig {
            kind: EngineKind::Synthetic,
            device: DeviceType::Cpu,
            embedding_dim: 8,
            hidden_dim: 8,
            synthetic_epoch_millis: epoch_millis,
            seed: 5,
        }
    }

    fn checkpoint_config(dir: &std::path::Path) -> CheckpointConfig {
        CheckpointConfig {
            dir: dir.to_path_buf(),
            every_epochs: 0,
        }
    }

    fn train_request(model_id: i64) -> TrainRequest {
        TrainRequest {
            model_id: ModelId(model_id),
            session_id: SessionId::new(),
            samples: vec![EncodedSample {
                ids: vec![2, 3, 0],
                label: 0,
            }],
            vocab_size: 8,
            num_classes: 2,
            config: SessionConfig {
                epochs: 3,
                ..SessionConfig::default()
            },
            initial_epoch: 0,
            resume_from: None,
        }
    }

    #[tokio::test]
    async fn training_task_completes_through_the_pool() {
        let dir = tempfile::tempdir().unwrap();
        let pool = WorkerPool::new(1, &engine_config(0), &checkpoint_config(dir.path())).unwrap();

        let (sink, mut rx) = EventSink::new();
        let outcome = pool
            .run_training(train_request(1), sink, CancelToken::new())
            .await
            .unwrap();
        assert!(matches!(outcome, RunOutcome::Completed { .. }));

        let mut epochs = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, crate::engine::RunEvent::Epoch(_)) {
                epochs += 1;
            }
        }
        assert_eq!(epochs, 3);

        let metrics = pool.metrics();
        assert_eq!(metrics.total_workers, 1);
        assert_eq!(metrics.workers[0].completed_tasks, 1);
        assert_eq!(metrics.workers[0].failed_tasks, 0);
    }

    #[tokio::test]
    async fn ten_tasks_across_four_workers_all_complete() {
        let dir = tempfile::tempdir().unwrap();
        let pool = Arc::new(
            WorkerPool::new(4, &engine_config(2), &checkpoint_config(dir.path())).unwrap(),
        );

        let mut joins = Vec::new();
        for i in 0..10 {
            let pool = Arc::clone(&pool);
            joins.push(tokio::spawn(async move {
                let (sink, _rx) = EventSink::new();
                pool.run_training(train_request(i), sink, CancelToken::new())
                    .await
            }));
        }
        for join in joins {
            let outcome = join.await.unwrap().unwrap();
            assert!(matches!(outcome, RunOutcome::Completed { .. }));
        }

        let metrics = pool.metrics();
        assert_eq!(metrics.total_workers, 4);
        let completed: usize = metrics.workers.iter().map(|w| w.completed_tasks).sum();
        assert_eq!(completed, 10);
        let active: usize = metrics.workers.iter().map(|w| w.active_tasks).sum();
        assert_eq!(active, 0);
    }

    #[tokio::test]
    async fn failed_task_leaves_the_worker_available() {
        let dir = tempfile::tempdir().unwrap();
        let pool = WorkerPool::new(1, &engine_config(0), &checkpoint_config(dir.path())).unwrap();

        let mut bad = train_request(1);
        bad.samples.clear();
        let (sink, _rx) = EventSink::new();
        let err = pool
            .run_training(bad, sink, CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));

        let (sink, _rx) = EventSink::new();
        let outcome = pool
            .run_training(train_request(1), sink, CancelToken::new())
            .await
            .unwrap();
        assert!(matches!(outcome, RunOutcome::Completed { .. }));

        let metrics = pool.metrics();
        assert_eq!(metrics.workers[0].failed_tasks, 1);
        assert_eq!(metrics.workers[0].completed_tasks, 1);
    }

    #[tokio::test]
    async fn preprocessing_grows_the_vocabulary() {
        let dir = tempfile::tempdir().unwrap();
        let pool = WorkerPool::new(2, &engine_config(0), &checkpoint_config(dir.path())).unwrap();

        let texts = vec!["alpha beta".to_string(), "beta gamma".to_string()];
        let output = pool
            .run_preprocessing(texts, Vocabulary::seeded(), 4)
            .await
            .unwrap();

        assert_eq!(output.sequences.len(), 2);
        assert!(output.sequences.iter().all(|seq| seq.len() == 4));
        // pad, unk, alpha, beta, gamma
        assert_eq!(output.vocabulary.len(), 5);
    }

    #[tokio::test]
    async fn terminate_rejects_new_work_but_keeps_counters() {
        let dir = tempfile::tempdir().unwrap();
        let pool = Arc::new(
            WorkerPool::new(1, &engine_config(0), &checkpoint_config(dir.path())).unwrap(),
        );

        let (sink, _rx) = EventSink::new();
        pool.run_training(train_request(1), sink, CancelToken::new())
            .await
            .unwrap();

        let handle = Arc::clone(&pool);
        tokio::task::spawn_blocking(move || handle.terminate())
            .await
            .unwrap();

        let (sink, _rx) = EventSink::new();
        let err = pool
            .run_training(train_request(2), sink, CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::WorkerUnavailable(_)));
        assert_eq!(pool.metrics().workers[0].completed_tasks, 1);
    }

    #[test]
    fn panic_payloads_render_as_text() {
        let boxed: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let boxed: Box<dyn std::any::Any + Send> = Box::new(String::from("kapow"));
        assert_eq!(panic_message(boxed.as_ref()), "kapow");
        let boxed: Box<dyn std::any::Any + Send> = Box::new(17usize);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic payload");
    }
}
