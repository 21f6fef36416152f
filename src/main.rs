//! Sumi-Pipeline main entry point
//!
//! Command-line interface for starting, cancelling and working crawl
//! pipelines.

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use sumi_pipeline::pipeline::PipelineManager;
use sumi_pipeline::{OperationRegistry, PipelineLoader, Services, Settings, Worker};
use tracing_subscriber::EnvFilter;

/// Sumi-Pipeline: a crawl-pipeline execution engine
///
/// Pipelines are TOML files describing stages that fetch, parse and store
/// documents. `run` queues the first stage of a pipeline, `worker` executes
/// queued stages until told to stop.
#[derive(Parser, Debug)]
#[command(name = "sumi-pipeline")]
#[command(version)]
#[command(about = "A crawl-pipeline execution engine", long_about = None)]
struct Cli {
    /// Path to a TOML settings file
    #[arg(long, value_name = "FILE", global = true)]
    settings: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a new run of a pipeline
    Run {
        name: String,

        /// Ignore incremental markers and process everything again
        #[arg(long)]
        no_incremental: bool,

        /// Log stage errors instead of failing the job
        #[arg(long)]
        continue_on_error: bool,

        /// Work the queue in this process until it is empty
        #[arg(long)]
        wait: bool,

        /// Concurrent jobs when waiting
        #[arg(long, default_value_t = 4)]
        concurrency: usize,
    },

    /// Remove all pending jobs of a pipeline
    Cancel { name: String },

    /// Cancel a pipeline and delete its stored tags
    Flush { name: String },

    /// List the configured pipelines
    List,

    /// Execute queued jobs
    Worker {
        #[arg(long, default_value_t = 4)]
        concurrency: usize,

        /// Exit once no job is ready or delayed
        #[arg(long)]
        until_idle: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let settings = match Settings::load(cli.settings.as_deref()) {
        Ok(settings) => Arc::new(settings),
        Err(e) => {
            tracing::error!("Failed to load settings: {}", e);
            return Err(e.into());
        }
    };

    let services = Services::open(settings.clone())?;
    let loader = Arc::new(PipelineLoader::new(
        Arc::new(OperationRegistry::with_builtins()),
        &settings,
    ));

    match cli.command {
        Command::Run {
            name,
            no_incremental,
            continue_on_error,
            wait,
            concurrency,
        } => {
            let manager = load_pipelines(&loader, &settings)?;
            handle_run(
                &manager,
                &services,
                &name,
                !no_incremental,
                continue_on_error,
            )?;
            if wait {
                handle_worker(loader, services, concurrency, true).await?;
            }
        }
        Command::Cancel { name } => {
            let manager = load_pipelines(&loader, &settings)?;
            let removed = find(&manager, &name)?.cancel(&services)?;
            println!("Removed {} pending jobs of {}", removed, name);
        }
        Command::Flush { name } => {
            let manager = load_pipelines(&loader, &settings)?;
            find(&manager, &name)?.flush(&services)?;
            println!("Flushed {}", name);
        }
        Command::List => {
            let manager = load_pipelines(&loader, &settings)?;
            handle_list(&manager, &services)?;
        }
        Command::Worker {
            concurrency,
            until_idle,
        } => {
            handle_worker(loader, services, concurrency, until_idle).await?;
        }
    }

    Ok(())
}

/// Sets up the tracing subscriber
///
/// `RUST_LOG` takes precedence over the verbosity flag.
fn setup_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("sumi_pipeline=debug,info")
        } else {
            EnvFilter::new("sumi_pipeline=info,warn")
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .init();
}

fn load_pipelines(
    loader: &PipelineLoader,
    settings: &Settings,
) -> Result<PipelineManager, Box<dyn std::error::Error>> {
    let dir = settings
        .config_path
        .as_deref()
        .unwrap_or_else(|| Path::new("."));
    tracing::info!("Loading pipelines from: {}", dir.display());
    Ok(PipelineManager::load_path(loader, dir)?)
}

fn find(
    manager: &PipelineManager,
    name: &str,
) -> Result<Arc<sumi_pipeline::Pipeline>, Box<dyn std::error::Error>> {
    manager
        .get(name)
        .ok_or_else(|| format!("Unknown pipeline: {}", name).into())
}

/// Handles `run`: queues the init stage of a pipeline
fn handle_run(
    manager: &PipelineManager,
    services: &Services,
    name: &str,
    incremental: bool,
    continue_on_error: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let pipeline = find(manager, name)?;
    let continue_on_error = continue_on_error.then_some(true);
    let run_id = pipeline.run(services, Some(incremental), continue_on_error)?;
    println!("Started run {} of {}", run_id, name);
    Ok(())
}

/// Handles `list`: prints every pipeline with its pending job count
fn handle_list(
    manager: &PipelineManager,
    services: &Services,
) -> Result<(), Box<dyn std::error::Error>> {
    if manager.is_empty() {
        println!("No pipelines configured");
        return Ok(());
    }

    println!("{:<32} {:>8}  DESCRIPTION", "NAME", "PENDING");
    for pipeline in manager.iter() {
        println!(
            "{:<32} {:>8}  {}",
            pipeline.name,
            pipeline.pending(services)?,
            pipeline.description.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

/// Handles `worker` and `run --wait`
async fn handle_worker(
    loader: Arc<PipelineLoader>,
    services: Services,
    concurrency: usize,
    until_idle: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let worker = Arc::new(Worker::new(loader, services));
    let processed = worker.run(concurrency.max(1), until_idle).await?;
    println!("Processed {} jobs", processed);
    Ok(())
}
