use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use trainyard::session::{ModelId, ModelRecord, SessionConfig};
use trainyard::storage::DatasetRecord;
use trainyard::{create_storage, Config, Event, Orchestrator, Storage};

#[derive(Parser)]
#[command(name = "trainyard")]
#[command(about = "Training session orchestrator for text classifiers", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a model on a dataset file and follow it to completion
    Run {
        /// Dataset JSON file: {"id", "name", "samples": [{"text", "label"}]}
        #[arg(short, long)]
        input: PathBuf,

        /// Model row to train; created when absent
        #[arg(short, long, default_value_t = 1)]
        model_id: i64,

        /// Epoch count override
        #[arg(short, long)]
        epochs: Option<usize>,

        /// Configuration file path; defaults apply when omitted
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Validate configuration file
    Config {
        /// Configuration file to validate
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Show system information
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            input,
            model_id,
            epochs,
            config,
        } => {
            run_training(input, ModelId(model_id), epochs, config).await?;
        }

        Commands::Config { file } => {
            validate_config(file)?;
        }

        Commands::Info => {
            show_system_info();
        }
    }

    Ok(())
}

async fn run_training(
    input: PathBuf,
    model_id: ModelId,
    epochs: Option<usize>,
    config_path: Option<PathBuf>,
) -> Result<()> {
    let config = match config_path {
        Some(path) => Config::from_file(&path).context("Failed to load configuration file")?,
        None => Config::default(),
    };

    let dataset: DatasetRecord =
        serde_json::from_str(&fs::read_to_string(&input).context("Failed to read dataset file")?)
            .context("Failed to parse dataset file")?;
    info!(
        dataset_id = %dataset.id,
        samples = dataset.samples.len(),
        classes = dataset.num_classes(),
        "Dataset loaded"
    );

    let storage = create_storage(&config.storage).context("Failed to open storage")?;
    let dataset_id = dataset.id.clone();
    storage
        .insert_dataset(dataset)
        .await
        .context("Failed to store dataset")?;
    if storage.fetch_model(model_id).await?.is_none() {
        storage
            .upsert_model(ModelRecord::new(model_id, format!("model-{}", model_id.0)))
            .await
            .context("Failed to create model row")?;
    }

    let session_config = epochs.map(|epochs| SessionConfig {
        epochs,
        ..config.training.clone()
    });

    let orchestrator =
        Arc::new(Orchestrator::new(config, storage).context("Failed to initialize orchestrator")?);
    let mut events = orchestrator.subscribe();
    let metrics_task = orchestrator.start_metrics_publisher();

    let session_id = orchestrator
        .start_training(model_id, &dataset_id, session_config, 0)
        .await
        .context("Failed to start training")?;
    info!(%session_id, "Training started, press Ctrl-C to stop");

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(Event::TrainingProgress { model_id: id, epoch, loss, accuracy, .. })
                    if id == model_id =>
                {
                    info!(epoch, loss, accuracy, "progress");
                }
                Ok(Event::TrainingCompleted { model_id: id, .. }) if id == model_id => {
                    info!("Training completed");
                    break;
                }
                Ok(Event::TrainingFailed { model_id: id, error, .. }) if id == model_id => {
                    warn!(%error, "Training failed");
                    break;
                }
                Ok(Event::TrainingStopped { model_id: id }) if id == model_id => {
                    info!("Training stopped");
                    break;
                }
                Ok(Event::WorkerMetrics {
                    memory_usage,
                    cpu_usage,
                    active_workers,
                    total_workers,
                }) => {
                    info!(memory_usage, cpu_usage, active_workers, total_workers, "workers");
                }
                Ok(_) => {}
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "event subscriber lagged");
                }
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Stop requested");
                if orchestrator.stop_training(model_id).await.is_err() {
                    break;
                }
            }
        }
    }

    if let Some(task) = metrics_task {
        task.abort();
    }
    orchestrator.shutdown().await;

    for row in orchestrator.checkpoints(model_id).await? {
        info!(epoch = row.epoch, path = %row.file_path.display(), "checkpoint");
    }

    Ok(())
}

fn validate_config(config_path: PathBuf) -> Result<()> {
    info!("Validating configuration file: {}", config_path.display());

    let config = Config::from_file(&config_path).context("Failed to load configuration file")?;

    // Config::from_file already ran validate()
    info!("✅ Configuration is valid!");
    info!("Configuration summary:");
    info!(
        "  - Engine: {:?} on {:?}",
        config.engine.kind, config.engine.device
    );
    info!(
        "  - Execution: {:?} ({} workers)",
        config.execution.strategy, config.execution.workers
    );
    info!(
        "  - Tokenizer: max_len {} at {}",
        config.tokenizer.max_len,
        config.tokenizer.vocab_path.display()
    );
    info!(
        "  - Checkpoints: every {} epochs under {}",
        config.checkpoint.every_epochs,
        config.checkpoint.dir.display()
    );
    info!("  - Storage: {:?} backend", config.storage.backend);

    Ok(())
}

fn show_system_info() {
    println!("🚂 Trainyard - Training Session Orchestrator");
    println!();
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Features:");
    println!("  ✅ Recurrent text classifier training (candle)");
    println!("  ✅ Deterministic synthetic engine for offline demos");
    println!("  ✅ Cooperative stop / pause / resume");
    println!("  ✅ Epoch checkpoints as safetensors artifacts");
    println!("  ✅ Inline or pooled execution with worker metrics");
    println!();
    println!("Hardware support:");

    #[cfg(feature = "cuda")]
    println!("  ✅ NVIDIA CUDA GPU acceleration");
    #[cfg(not(feature = "cuda"))]
    println!("  ❌ CUDA support (not compiled)");

    #[cfg(feature = "metal")]
    println!("  ✅ Apple Metal GPU acceleration");
    #[cfg(not(feature = "metal"))]
    println!("  ❌ Metal support (not compiled)");

    #[cfg(feature = "accelerate")]
    println!("  ✅ Apple Accelerate framework");
    #[cfg(not(feature = "accelerate"))]
    println!("  ❌ Accelerate support (not compiled)");

    println!("  ✅ CPU training");
    println!();
    println!("Usage:");
    println!("  trainyard run -i dataset.json -m 1   # Train model 1 on a dataset file");
    println!("  trainyard config -f config.json      # Validate configuration");
    println!("  trainyard info                       # Show this information");
}
