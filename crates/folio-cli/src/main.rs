use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use folio_core::config::FolioConfig;
use folio_core::context::ServiceContext;
use folio_core::persistence::MigrationStore;
use folio_core::transform::PassthroughTransform;
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "folio")]
#[command(about = "Worker, maintenance and admin entrypoints for folio")]
#[command(version)]
struct Cli {
    /// TOML configuration file; FOLIO_* variables override it.
    #[arg(long, global = true, env = "FOLIO_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Apply pending schema migrations.
    Migrate,
    #[command(flatten)]
    Service(ServiceCommand),
}

/// Commands that run against an opened (and therefore migrated) service context.
#[derive(Debug, Subcommand)]
enum ServiceCommand {
    /// Run the worker pool until Ctrl-C, then drain in-flight jobs.
    Worker,
    /// Run the maintenance scheduler.
    Maintenance {
        /// Run a single pass and exit.
        #[arg(long)]
        once: bool,
    },
    /// Round-trip a ping job through the queue.
    Health,
    /// Delete artifacts at least this many hours old.
    Cleanup {
        #[arg(long)]
        max_age_hours: u64,
    },
    /// Storage usage and task counts.
    Usage,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "folio=info,folio_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = FolioConfig::load(cli.config.as_deref()).context("loading configuration")?;

    match cli.command {
        Command::Migrate => migrate(&config),
        Command::Service(command) => {
            let context = ServiceContext::open(config).context("opening service context")?;
            run(command, context).await
        }
    }
}

async fn run(command: ServiceCommand, context: ServiceContext) -> Result<()> {
    match command {
        ServiceCommand::Worker => {
            let pool = context.worker_pool(Arc::new(PassthroughTransform));
            let running = pool.spawn(context.shutdown_signal());
            tokio::signal::ctrl_c()
                .await
                .context("waiting for Ctrl-C")?;
            tracing::info!("shutdown requested; draining workers");
            context.close(running).await;
        }
        ServiceCommand::Maintenance { once: true } => {
            let report = context.maintenance().run_once().await;
            print_json(&report)?;
            context.close(Vec::new()).await;
        }
        ServiceCommand::Maintenance { once: false } => {
            let scheduler = context.maintenance();
            let shutdown = context.shutdown_signal();
            let running = vec![tokio::spawn(async move { scheduler.run(shutdown).await })];
            tokio::signal::ctrl_c()
                .await
                .context("waiting for Ctrl-C")?;
            context.close(running).await;
        }
        ServiceCommand::Health => {
            let report = context
                .queue()
                .health_check(context.config().health_timeout())
                .await;
            print_json(&report)?;
            let healthy = report.healthy;
            context.close(Vec::new()).await;
            if !healthy {
                anyhow::bail!("job queue is degraded");
            }
        }
        ServiceCommand::Cleanup { max_age_hours } => {
            let max_age = Duration::from_secs(max_age_hours.saturating_mul(3600));
            let report = context.gateway().admin_cleanup(max_age).await?;
            print_json(&report)?;
            context.close(Vec::new()).await;
        }
        ServiceCommand::Usage => {
            let report = context.gateway().admin_usage().await?;
            print_json(&report)?;
            context.close(Vec::new()).await;
        }
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct MigrationStatus {
    database: String,
    from_version: i64,
    to_version: i64,
}

fn migrate(config: &FolioConfig) -> Result<()> {
    let store = folio_core::sqlite::SqliteStore::new(&config.storage.database_path);
    let before = store.current_version()?;
    store.migrate_to_latest()?;
    let after = store.current_version()?;
    print_json(&MigrationStatus {
        database: config.storage.database_path.display().to_string(),
        from_version: before,
        to_version: after,
    })
}

fn print_json(value: &impl Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
