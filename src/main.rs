use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use registry_importer::clock::SystemClock;
use registry_importer::config::{HostConfig, LeaseConfig, SchedulerConfig};
use registry_importer::db;
use registry_importer::host::{Host, ProgressReportJob};
use registry_importer::lease::{LeaseRecord, LeaseStore, SqliteLeaseStore};
use registry_importer::progress::{
    ImportJobStatus, ProcessedStatus, ProgressTracker, QueueStatus, SqliteImportJobStore,
    TrackOutcome,
};
use registry_importer::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "registry-importer")]
#[command(version)]
#[command(about = "Lease-coordinated registry import host")]
#[command(propagate_version = true)]
struct Args {
    /// Database URL
    #[arg(
        long,
        env = "DATABASE_URL",
        default_value = "sqlite://registry.db",
        global = true
    )]
    database_url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the host until SIGINT or SIGTERM
    Serve(ServeArgs),

    /// Create the database schema and exit
    Migrate,

    /// Lease inspection commands
    Lease {
        #[command(subcommand)]
        command: LeaseCommands,
    },

    /// Show the watermarks of an import job
    Status {
        /// The import job ID
        job_id: String,

        #[command(flatten)]
        output: OutputArgs,
    },

    /// Record import progress by hand
    Track {
        #[command(subcommand)]
        command: TrackCommands,
    },
}

// =============================================================================
// Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServeArgs {
    /// Lease duration in seconds (30..=900)
    #[arg(long, default_value = "60")]
    lease_duration_secs: u64,

    /// Seconds before expiry at which a held lease is renewed
    #[arg(long, default_value = "20")]
    renew_margin_secs: u64,

    /// Upper bound of the random delay added to leased scheduled runs, in seconds
    #[arg(long, default_value = "5")]
    jitter_secs: u64,

    /// Import job IDs whose progress is reported periodically (comma-separated)
    #[arg(long, value_delimiter = ',')]
    report_job: Vec<String>,

    /// Seconds between progress reports
    #[arg(long, default_value = "300")]
    report_interval_secs: u64,
}

#[derive(Parser, Debug)]
struct OutputArgs {
    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(clap::Subcommand, Debug)]
enum LeaseCommands {
    /// Show the history of a lease
    Show {
        /// The lease name
        name: String,

        #[command(flatten)]
        output: OutputArgs,
    },
}

#[derive(clap::Subcommand, Debug)]
enum TrackCommands {
    /// Raise the enqueued and source watermarks
    Queue {
        job_id: String,
        #[arg(long)]
        enqueued: u64,
        #[arg(long)]
        source: u64,
        #[command(flatten)]
        output: OutputArgs,
    },
    /// Raise the processed watermark
    Processed {
        job_id: String,
        #[arg(long)]
        processed: u64,
        #[command(flatten)]
        output: OutputArgs,
    },
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct StatusOutput<'a> {
    job_id: &'a str,
    found: bool,
    #[serde(flatten)]
    status: ImportJobStatus,
    backlog: u64,
}

#[derive(Serialize)]
struct TrackOutput<'a> {
    job_id: &'a str,
    #[serde(flatten)]
    outcome: TrackOutcome,
}

// =============================================================================
// Command Handlers
// =============================================================================

async fn run_server(database_url: String, args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = HostConfig::new(database_url)
        .with_lease(LeaseConfig {
            duration: Duration::from_secs(args.lease_duration_secs),
            renew_margin: Duration::from_secs(args.renew_margin_secs),
            ..LeaseConfig::default()
        })
        .with_scheduler(SchedulerConfig {
            jitter: Duration::from_secs(args.jitter_secs),
        });

    tracing::info!(
        database_url = %config.database_url,
        lease_duration = ?config.lease.duration,
        report_jobs = ?args.report_job,
        "Starting registry importer"
    );

    let shutdown = install_shutdown_handler()?;
    let host = Host::connect(config, shutdown).await?;

    if !args.report_job.is_empty() {
        host.scheduler()
            .register(ProgressReportJob::registration(
                host.tracker().clone(),
                args.report_job,
                Duration::from_secs(args.report_interval_secs),
            ))
            .await?;
    }

    host.run().await?;
    Ok(())
}

async fn handle_migrate(database_url: &str) -> Result<(), Box<dyn std::error::Error>> {
    let pool = db::connect(database_url).await?;
    db::ensure_schema(&pool).await?;
    pool.close().await;
    println!("Schema is up to date.");
    Ok(())
}

async fn handle_lease_show(
    database_url: &str,
    name: &str,
    output: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let pool = db::connect(database_url).await?;
    let store = SqliteLeaseStore::new(pool.clone(), Arc::new(SystemClock));
    let record = store.describe(name).await?;
    pool.close().await;

    match output {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        OutputFormat::Table => match record {
            Some(record) => print_lease(&record),
            None => println!("Lease '{}' has never been acquired.", name),
        },
    }
    Ok(())
}

fn print_lease(record: &LeaseRecord) {
    let optional = |t: Option<chrono::DateTime<chrono::Utc>>| {
        t.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".to_string())
    };
    println!("Lease:    {}", record.id);
    println!("Held:     {}", if record.held { "yes" } else { "no" });
    println!("Expires:  {}", record.expires.to_rfc3339());
    println!("Acquired: {}", optional(record.acquired_at));
    println!("Released: {}", optional(record.released_at));
}

/// Runs `f` against a short-lived tracker over the configured database.
async fn with_tracker<T, F, Fut>(database_url: &str, f: F) -> Result<T, Box<dyn std::error::Error>>
where
    F: FnOnce(ProgressTracker) -> Fut,
    Fut: std::future::Future<Output = registry_importer::error::Result<T>>,
{
    let pool = db::connect(database_url).await?;
    let shutdown = CancellationToken::new();
    let tracker = ProgressTracker::spawn(
        Arc::new(SqliteImportJobStore::new(pool.clone())),
        Default::default(),
        &shutdown,
    );
    let result = f(tracker.clone()).await;
    tracker.stop().await;
    pool.close().await;
    Ok(result?)
}

async fn handle_status(
    database_url: &str,
    job_id: &str,
    output: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let owned_id = job_id.to_string();
    let status = with_tracker(database_url, |tracker| async move {
        tracker.get_status(&owned_id).await
    })
    .await?;

    match output {
        OutputFormat::Json => {
            let out = StatusOutput {
                job_id,
                found: status.is_some(),
                status: status.unwrap_or_default(),
                backlog: status.map(|s| s.backlog()).unwrap_or_default(),
            };
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        OutputFormat::Table => match status {
            Some(status) => {
                println!("Import Job: {}", job_id);
                println!("{}", "=".repeat(40));
                println!("Source max:    {}", status.source_max);
                println!("Enqueued max:  {}", status.enqueued_max);
                println!("Processed max: {}", status.processed_max);
                println!("Backlog:       {}", status.backlog());
            }
            None => println!("Import job '{}' not found.", job_id),
        },
    }
    Ok(())
}

fn print_track(job_id: &str, outcome: TrackOutcome, output: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    match output {
        OutputFormat::Json => {
            let out = TrackOutput { job_id, outcome };
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        OutputFormat::Table => {
            if outcome.changed {
                println!("Progress advanced for '{}'.", job_id);
            } else {
                println!("No change for '{}'; the store was already at or past it.", job_id);
            }
            println!(
                "source_max={} enqueued_max={} processed_max={}",
                outcome.status.source_max, outcome.status.enqueued_max, outcome.status.processed_max
            );
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let database_url = args.database_url;
    match args.command {
        Commands::Serve(serve_args) => {
            run_server(database_url, serve_args).await?;
        }
        Commands::Migrate => {
            handle_migrate(&database_url).await?;
        }
        Commands::Lease { command } => match command {
            LeaseCommands::Show { name, output } => {
                handle_lease_show(&database_url, &name, &output.output).await?;
            }
        },
        Commands::Status { job_id, output } => {
            handle_status(&database_url, &job_id, &output.output).await?;
        }
        Commands::Track { command } => match command {
            TrackCommands::Queue {
                job_id,
                enqueued,
                source,
                output,
            } => {
                let id = job_id.clone();
                let outcome = with_tracker(&database_url, |tracker| async move {
                    tracker
                        .track_queue_status(
                            &id,
                            QueueStatus {
                                enqueued_max: enqueued,
                                source_max: source,
                            },
                        )
                        .await
                })
                .await?;
                print_track(&job_id, outcome, &output.output)?;
            }
            TrackCommands::Processed {
                job_id,
                processed,
                output,
            } => {
                let id = job_id.clone();
                let outcome = with_tracker(&database_url, |tracker| async move {
                    tracker
                        .track_processed_status(
                            &id,
                            ProcessedStatus {
                                processed_max: processed,
                            },
                        )
                        .await
                })
                .await?;
                print_track(&job_id, outcome, &output.output)?;
            }
        },
    }

    Ok(())
}
