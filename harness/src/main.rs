//! Gym CLI
//!
//! Runs grid searches, cross validation and nested cross validation over a
//! pool of workers, and inspects or resets the run ledger.

use std::{path::PathBuf, sync::Arc};

use clap::{Parser, Subcommand};
use gym_config::{Device, EpochList, RunMode};
use gym_harness::{
    GymStarter, Ledger, ProgressBoard, ScheduleSummary, StarterArgs, starter::LEDGER_FILE,
};
use gym_training::{JobStatus, StatusSink, TracingStatusSink};
use indicatif::MultiProgress;
use tracing_appender::non_blocking::NonBlocking;
use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "gym", about = "Model training gym")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a grid search
    Run {
        /// Registered blueprint (component factory) name
        #[arg(short, long, default_value = "quadratic")]
        blueprint: String,

        /// train or re_eval
        #[arg(long, default_value = "train")]
        run_mode: RunMode,

        /// grid_search, cross_validation or nested_cv
        #[arg(long, default_value = "grid_search")]
        validation_mode: String,

        /// Epoch budget per job
        #[arg(short = 'n', long, default_value_t = 10)]
        num_epochs: u64,

        /// Path to the grid search TOML file
        #[arg(short, long)]
        gs_config: PathBuf,

        /// Path to the evaluation (fold) TOML file
        #[arg(short, long)]
        evaluation_config: Option<PathBuf>,

        /// Number of worker slots
        #[arg(short, long, default_value_t = 1)]
        workers: usize,

        /// Devices, e.g. `cpu` or `cuda:0,cuda:1` (default: cpu)
        #[arg(short, long, value_delimiter = ',')]
        devices: Vec<Device>,

        /// Also write logs to a daily rolling file in --log-dir
        #[arg(long)]
        log_to_file: bool,

        #[arg(long, default_value = "./logs")]
        log_dir: PathBuf,

        /// Checkpoints, config copies and the run ledger
        #[arg(long, default_value = "./gym_state")]
        state_dir: PathBuf,

        /// Epochs to re-evaluate, e.g. `1,3,5` or `1..=10` (default: all)
        #[arg(long)]
        epochs: Option<EpochList>,

        /// Run jobs one at a time in submission order
        #[arg(long)]
        sequential: bool,
    },

    /// Show status of jobs in the ledger
    Status {
        #[arg(long, default_value = "./gym_state")]
        state_dir: PathBuf,
    },

    /// Reset specific jobs to pending
    Reset {
        #[arg(long, default_value = "./gym_state")]
        state_dir: PathBuf,

        /// Experiment ids to reset
        ids: Vec<String>,
    },
}

fn init_tracing(file_writer: Option<NonBlocking>) {
    // tracing needs to be initialized with indicatif_layer to not clobber progress bars
    let indicatif_layer = IndicatifLayer::new();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(indicatif_layer.get_stderr_writer()))
        .with(file_writer.map(|writer| {
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
        }))
        .with(
            EnvFilter::builder()
                .with_default_directive(tracing::Level::INFO.into())
                .from_env_lossy(),
        )
        .with(indicatif_layer)
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            blueprint,
            run_mode,
            validation_mode,
            num_epochs,
            gs_config,
            evaluation_config,
            workers,
            devices,
            log_to_file,
            log_dir,
            state_dir,
            epochs,
            sequential,
        } => {
            let starter = GymStarter::new(StarterArgs {
                blueprint,
                run_mode,
                validation_mode,
                num_epochs,
                gs_config,
                evaluation_config,
                num_workers: workers,
                devices,
                log_to_file,
                log_dir,
                state_dir,
                epochs: epochs.map(|e| e.0).unwrap_or_default(),
                sequential,
            })?;

            // Flushes the log file when dropped
            let (file_writer, _guard) = starter.log_writer().unzip();
            init_tracing(file_writer);

            println!(
                "Starting {} ({}, {})",
                starter.grid_search_id(),
                starter.validation_mode(),
                run_mode
            );

            let subscribers: Vec<Arc<dyn StatusSink>> = vec![
                Arc::new(ProgressBoard::new(MultiProgress::new())),
                Arc::new(TracingStatusSink),
            ];
            let results = starter.start(subscribers).await?;
            let summary = ScheduleSummary::from_results(&results);

            println!();
            println!("=== Gym Complete ===");
            println!("Total: {}", summary.total);
            println!("Done: {}", summary.done);
            println!("Early stopped: {}", summary.early_stopped);
            println!("Failed: {}", summary.failed);

            for result in results.iter().filter(|r| r.status == JobStatus::Failed) {
                if let Some(failure) = &result.failure {
                    println!("  {}: {failure}", result.experiment_id);
                }
            }
        }

        Commands::Status { state_dir } => {
            init_tracing(None);
            let ledger = Ledger::new(state_dir.join(LEDGER_FILE));
            let state = ledger.load()?;

            if state.jobs.is_empty() {
                println!("No jobs in ledger.");
                return Ok(());
            }

            println!("=== Job Status ===");
            println!();

            for (id, job) in &state.jobs {
                print!("{id}: {}", job.status.to_string().to_uppercase());

                if let (Some(worker), Some(device)) = (job.worker, job.device) {
                    print!(" [worker {worker}, {device}]");
                }

                if let Some(pid) = job.pid {
                    print!(" (PID: {pid})");
                }

                if let Some(epoch) = job.epoch {
                    print!(" [epoch {epoch}]");
                }

                if job.attempts > 1 {
                    print!(" [attempts: {}]", job.attempts);
                }

                println!();

                for error in &job.errors {
                    println!("  Error: {error}");
                }
            }
        }

        Commands::Reset { state_dir, ids } => {
            init_tracing(None);
            let ledger = Ledger::new(state_dir.join(LEDGER_FILE));

            for id in &ids {
                match ledger.reset_job(id) {
                    Ok(true) => println!("Reset: {id}"),
                    Ok(false) => println!("Not found: {id}"),
                    Err(e) => eprintln!("Error resetting {id}: {e}"),
                }
            }
        }
    }

    Ok(())
}
