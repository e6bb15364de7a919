//! `philocrawl-maintenance` - the maintenance CLI for the crawler's
//! persistence core: schema migrations, retention sweeps, and alert
//! escalation. Not a crawler driver; fetching and parsing live elsewhere.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use philocrawl_core::config::{detect_environment, ConfigHolder, LoadSources};
use philocrawl_core::repository::{migrations, FsArchiveSink, Repositories};
use philocrawl_core::DbPool;

fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

#[derive(Parser)]
#[command(name = "philocrawl-maintenance")]
#[command(about = "Maintenance driver for the philocrawl persistence core")]
#[command(version)]
struct Cli {
    /// Directory holding base.yaml / <env>.yaml configuration documents
    #[arg(long, global = true, default_value = "config")]
    config_dir: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending schema migrations
    Migrate,
    /// Retention engine operations
    Retention {
        #[command(subcommand)]
        command: RetentionCommands,
    },
    /// Alert operations
    Alerts {
        #[command(subcommand)]
        command: AlertCommands,
    },
}

#[derive(Subcommand)]
enum RetentionCommands {
    /// Report totals, near-expiry counts, and TTL index state per collection
    Status,
    /// Run the full maintenance sweep: TTL indexes, archival, expiry deletes
    Run {
        /// Directory archived batches are written under
        #[arg(long, default_value = "archives")]
        archive_dir: PathBuf,
    },
}

#[derive(Subcommand)]
enum AlertCommands {
    /// Escalate unresolved critical/high alerts older than the threshold
    Escalate {
        #[arg(long, default_value = "24")]
        hours: i64,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();

    let default_filter = if is_verbose() {
        "philocrawl_core=info,philocrawl_maintenance=info"
    } else {
        "philocrawl_core=warn,philocrawl_maintenance=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(%err, "maintenance command failed");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let environment = detect_environment();
    let sources = LoadSources::standard(&cli.config_dir, environment);
    let holder = ConfigHolder::install(sources, environment)?;
    let config = holder.current();

    let db_path = config
        .database
        .url
        .strip_prefix("sqlite://")
        .unwrap_or(&config.database.url);
    let pool = DbPool::open(std::path::Path::new(db_path), config.database.pool_size)?;

    match cli.command {
        Commands::Migrate => {
            let applied = migrations::migrate(&pool).await?;
            if applied.is_empty() {
                tracing::info!("schema already up to date");
            } else {
                tracing::info!(?applied, "applied migrations");
            }
        }
        Commands::Retention { command } => {
            let repos = Repositories::new(pool, config.retention.clone());
            match command {
                RetentionCommands::Status => {
                    let statuses = repos.retention.get_retention_status().await?;
                    for status in statuses {
                        tracing::info!(
                            collection = %status.collection,
                            total = status.total,
                            nearing_expiry = status.nearing_expiry,
                            ttl_index_exists = status.ttl_index_exists,
                            "retention status"
                        );
                    }
                }
                RetentionCommands::Run { archive_dir } => {
                    let sink = FsArchiveSink::new(archive_dir);
                    let report = repos.retention.run_maintenance(&sink).await?;
                    tracing::info!(archived = ?report.archived, expired = ?report.expired, "maintenance complete");
                }
            }
        }
        Commands::Alerts { command } => {
            let repos = Repositories::new(pool, config.retention.clone());
            match command {
                AlertCommands::Escalate { hours } => {
                    let escalated = repos.alerts.escalate_unresolved_alerts(hours).await?;
                    tracing::info!(count = escalated.len(), "escalated alerts");
                }
            }
        }
    }

    Ok(())
}
