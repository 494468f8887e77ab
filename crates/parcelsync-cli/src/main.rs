use std::process::ExitCode;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use parcelsync_sync::{SourceRegistry, SyncConfig};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "parcelsync")]
#[command(about = "Mirror municipal parcel feature services into PostGIS", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Sync every enabled source, or only the named ones.
    Sync {
        /// Source id to sync; repeatable.
        #[arg(long = "source", value_name = "ID")]
        sources: Vec<String>,
        /// Merge into an in-memory store instead of the database.
        #[arg(long)]
        dry_run: bool,
        /// Print the run summary as JSON.
        #[arg(long)]
        json: bool,
    },
    /// List the configured sources.
    Sources,
    /// Apply database migrations.
    Migrate,
    /// Drop and recreate the target table.
    ResetSchema {
        #[arg(long)]
        yes: bool,
    },
    /// Run syncs on the configured cron schedule until interrupted.
    Schedule,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync {
        sources: Vec::new(),
        dry_run: false,
        json: false,
    }) {
        Commands::Sync {
            sources,
            dry_run,
            json,
        } => {
            let summary = parcelsync_sync::run_sync_once_from_env(&sources, dry_run).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                for report in &summary.sources {
                    println!("{}", report.summary_line());
                }
                println!(
                    "sync complete: run_id={} sources={} failed={}{}",
                    summary.run_id,
                    summary.sources.len(),
                    summary.failed_sources().len(),
                    if summary.dry_run { " (dry run)" } else { "" }
                );
            }
            if !summary.all_succeeded() {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Sources => {
            let config = SyncConfig::from_env()?;
            let registry = SourceRegistry::load(&config).await?;
            for profile in &registry.sources {
                println!(
                    "{:<12} {:<5} {:<36} {}",
                    profile.source_id,
                    if profile.enabled { "on" } else { "off" },
                    profile.display_name,
                    profile.query_url
                );
            }
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env()?;
            parcelsync_sync::migrate(config.require_database_url()?).await?;
            println!("migrations applied");
        }
        Commands::ResetSchema { yes } => {
            if !yes {
                bail!("reset-schema drops every stored parcel; rerun with --yes to confirm");
            }
            let config = SyncConfig::from_env()?;
            parcelsync_sync::reset_schema(config.require_database_url()?, &config.table).await?;
            println!("table {} recreated", config.table);
        }
        Commands::Schedule => {
            parcelsync_sync::run_scheduler_from_env().await?;
        }
    }

    Ok(ExitCode::SUCCESS)
}
