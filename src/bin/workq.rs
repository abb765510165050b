//! workq CLI: run workers, enqueue jobs, inspect the store.

use clap::{Parser, Subcommand};
use secrecy::ExposeSecret;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use workq::config::{Config, parse_queues};
use workq::engine::dispatch::{self, CommandSpawner};
use workq::engine::{Worker, perform_job, registry};
use workq::hooks::HookRegistry;
use workq::job::Job;
use workq::model::JobId;
use workq::stat;
use workq::store::PgStore;
use workq::telemetry::{TelemetryConfig, init_telemetry};

#[derive(Parser)]
#[command(name = "workq", about = "Queue worker with process-isolated jobs")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a worker until signalled to stop
    Work {
        /// Comma-separated queues in priority order; `*` means all
        #[arg(long)]
        queues: Option<String>,
        /// Seconds between polls; 0 drains the queues and exits
        #[arg(long)]
        interval: Option<u64>,
        /// Use one blocking pop instead of polling
        #[arg(long)]
        blocking: bool,
        /// Directory containing handler TOML configs
        #[arg(long)]
        handlers: Option<PathBuf>,
    },
    /// Push a job onto a queue
    Enqueue {
        queue: String,
        /// Job class (selects the handler)
        class: String,
        /// JSON arguments
        #[arg(long)]
        args: Option<String>,
    },
    /// List registered workers
    Workers,
    /// Show a job's status
    Status { id: String },
    /// Perform the job in WORKQ_JOB (used as the isolated child)
    #[command(hide = true)]
    Perform {
        #[arg(long, default_value = "handlers")]
        handlers: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "workq".to_string(),
        log_level: config.log_level.clone(),
    })?;

    let store = PgStore::connect(config.database_url.expose_secret()).await?;
    store.migrate().await?;

    match cli.command {
        Command::Work {
            queues,
            interval,
            blocking,
            handlers,
        } => cmd_work(config, store, queues, interval, blocking, handlers).await,
        Command::Enqueue { queue, class, args } => cmd_enqueue(&store, queue, class, args).await,
        Command::Workers => cmd_workers(&store).await,
        Command::Status { id } => cmd_status(&store, id).await,
        Command::Perform { handlers } => cmd_perform(&store, handlers).await,
    }
}

async fn cmd_work(
    config: Config,
    store: PgStore,
    queues: Option<String>,
    interval: Option<u64>,
    blocking: bool,
    handlers: Option<PathBuf>,
) -> anyhow::Result<()> {
    let queues = match queues {
        Some(raw) => parse_queues(&raw)?,
        None => config.queues.clone(),
    };
    let interval = interval.map(Duration::from_secs).unwrap_or(config.interval);
    let handlers = handlers.unwrap_or_else(|| config.handlers_dir.clone());

    let mut options = config.worker_options();
    options.blocking |= blocking;

    let registry = HookRegistry::load_from_dir(&handlers)?;
    tracing::info!(handlers = registry.len(), dir = %handlers.display(), "loaded handlers");

    let mut worker = Worker::new(queues, Arc::new(store), Arc::new(registry))
        .with_spawner(Arc::new(CommandSpawner::current_exe(&handlers)));
    worker.set_options(options)?;
    worker.work(interval).await?;
    Ok(())
}

async fn cmd_perform(store: &PgStore, handlers: PathBuf) -> anyhow::Result<()> {
    let job = dispatch::job_from_env()?;
    let registry = HookRegistry::load_from_dir(&handlers)?;
    // Exiting nonzero makes the parent record a dirty exit.
    perform_job(store, &registry, &job).await?;
    Ok(())
}

async fn cmd_enqueue(
    store: &PgStore,
    queue: String,
    class: String,
    args: Option<String>,
) -> anyhow::Result<()> {
    let args: serde_json::Value = match args {
        Some(json) => serde_json::from_str(&json)?,
        None => serde_json::json!({}),
    };
    let id = Job::create(store, &queue, &class, args).await?;
    println!("Enqueued: {id} on {queue}");
    Ok(())
}

async fn cmd_workers(store: &PgStore) -> anyhow::Result<()> {
    let workers = registry::all(store).await?;
    if workers.is_empty() {
        println!("No workers registered.");
        return Ok(());
    }

    println!(
        "{:<40}  {:<25}  {:<9}  {:<6}  WORKING ON",
        "WORKER", "STARTED", "PROCESSED", "FAILED"
    );
    println!("{}", "-".repeat(100));

    for worker in &workers {
        let started = registry::started_at(store, worker).await?;
        let processed = stat::get(store, &format!("processed:{worker}")).await?;
        let failed = stat::get(store, &format!("failed:{worker}")).await?;
        let working_on = match registry::working_on(store, worker).await? {
            Some(job) => format!("{} ({})", job.payload.class, job.queue),
            None => "-".to_string(),
        };
        println!(
            "{:<40}  {:<25}  {:<9}  {:<6}  {}",
            worker.to_string(),
            started.as_deref().unwrap_or("-"),
            processed,
            failed,
            working_on
        );
    }

    println!(
        "\n{} worker(s), {} processed, {} failed",
        workers.len(),
        stat::get(store, "processed").await?,
        stat::get(store, "failed").await?
    );
    Ok(())
}

async fn cmd_status(store: &PgStore, id: String) -> anyhow::Result<()> {
    let id = JobId(id);
    let Some(status) = Job::status(store, &id).await? else {
        anyhow::bail!("no job with id '{id}'");
    };

    println!("ID:       {id}");
    println!("Status:   {status}");
    if let Some(failure) = Job::failure(store, &id).await? {
        println!("---");
        println!("Queue:    {}", failure.queue);
        println!("Class:    {}", failure.payload.class);
        println!("Failed:   {}", failure.failed_at);
        println!("Kind:     {:?}", failure.kind);
        println!("Error:    {}", failure.error);
        println!("Worker:   {}", failure.worker.as_deref().unwrap_or("-"));
    }
    Ok(())
}
