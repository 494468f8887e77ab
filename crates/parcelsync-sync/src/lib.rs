//! Sync pipeline orchestration: configuration, source registry, schema
//! management and the scheduled runner.

pub mod engine;
pub mod store;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parcelsync_adapters::{builtin_profiles, FeatureServiceClient, SourceProfile};
use parcelsync_core::{SyncError, TARGET_SRID};
use parcelsync_storage::{HttpClientConfig, HttpFetcher};
use serde::{Deserialize, Serialize};
use sqlx::{Connection, PgConnection};
use tokio::fs;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

pub use engine::{SourceSyncReport, SyncCounters, SyncEngine};
pub use store::{
    create_table_sql, drop_table_sql, validate_table_name, MemoryPropertyStore, PgPropertyStore,
    PropertyStore,
};

pub const CRATE_NAME: &str = "parcelsync-sync";

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: Option<String>,
    pub table: String,
    pub sources_file: Option<PathBuf>,
    pub source_filter: Vec<String>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, SyncError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from any key lookup. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, SyncError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let parse_num = |key: &str, default: u64| -> Result<u64, SyncError> {
            match get(key) {
                Some(raw) => raw.parse().map_err(|_| {
                    SyncError::InvalidConfiguration(format!(
                        "{key} must be a non-negative integer, got {raw:?}"
                    ))
                }),
                None => Ok(default),
            }
        };

        let table = get("PARCELSYNC_TABLE").unwrap_or_else(|| "properties".to_string());
        validate_table_name(&table)?;

        let http_timeout_secs = parse_num("PARCELSYNC_HTTP_TIMEOUT_SECS", 120)?;
        if http_timeout_secs == 0 {
            return Err(SyncError::InvalidConfiguration(
                "PARCELSYNC_HTTP_TIMEOUT_SECS must be positive".to_string(),
            ));
        }

        Ok(Self {
            database_url: get("DATABASE_URL"),
            table,
            sources_file: get("PARCELSYNC_SOURCES_FILE").map(PathBuf::from),
            source_filter: get("PARCELSYNC_SOURCES")
                .map(|v| split_source_list(&v))
                .unwrap_or_default(),
            user_agent: get("PARCELSYNC_USER_AGENT")
                .unwrap_or_else(|| format!("parcelsync/{}", env!("CARGO_PKG_VERSION"))),
            http_timeout_secs,
            scheduler_enabled: get("PARCELSYNC_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True" | "yes"))
                .unwrap_or(false),
            sync_cron: get("PARCELSYNC_SYNC_CRON").unwrap_or_else(|| "0 0 3 * * *".to_string()),
        })
    }

    pub fn require_database_url(&self) -> Result<&str, SyncError> {
        self.database_url
            .as_deref()
            .ok_or_else(|| SyncError::ConfigurationMissing("DATABASE_URL".to_string()))
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
        }
    }
}

fn split_source_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Ordered set of source profiles a run walks through.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceProfile>,
}

impl SourceRegistry {
    pub fn builtin() -> Self {
        Self {
            sources: builtin_profiles(),
        }
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, SyncError> {
        let registry: Self = serde_yaml::from_str(text).map_err(|err| {
            SyncError::InvalidConfiguration(format!("parsing source registry: {err}"))
        })?;
        registry.validate(TARGET_SRID)?;
        Ok(registry)
    }

    /// The configured registry file if one is set, else the built-in profiles.
    pub async fn load(config: &SyncConfig) -> Result<Self, SyncError> {
        let Some(path) = &config.sources_file else {
            let registry = Self::builtin();
            registry.validate(TARGET_SRID)?;
            return Ok(registry);
        };
        let text = fs::read_to_string(path).await.map_err(|err| {
            SyncError::InvalidConfiguration(format!("reading {}: {err}", path.display()))
        })?;
        Self::from_yaml_str(&text)
    }

    pub fn validate(&self, store_srid: i32) -> Result<(), SyncError> {
        let mut ids = HashSet::new();
        for profile in &self.sources {
            profile.validate(store_srid)?;
            if !ids.insert(profile.source_id.as_str()) {
                return Err(SyncError::InvalidConfiguration(format!(
                    "duplicate source id {}",
                    profile.source_id
                )));
            }
        }
        Ok(())
    }

    /// Profiles to run, in registry order. An empty `ids` selects every
    /// enabled profile; named profiles run even when disabled.
    pub fn select(&self, ids: &[String]) -> Result<Vec<&SourceProfile>, SyncError> {
        if ids.is_empty() {
            return Ok(self.sources.iter().filter(|p| p.enabled).collect());
        }
        if let Some(unknown) = ids
            .iter()
            .find(|id| !self.sources.iter().any(|p| &p.source_id == *id))
        {
            return Err(SyncError::InvalidConfiguration(format!(
                "unknown source {unknown}"
            )));
        }
        Ok(self
            .sources
            .iter()
            .filter(|p| ids.contains(&p.source_id))
            .collect())
    }
}

#[derive(Debug, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    pub sources: Vec<SourceSyncReport>,
}

impl SyncRunSummary {
    pub fn failed_sources(&self) -> Vec<&str> {
        self.sources
            .iter()
            .filter(|r| !r.succeeded())
            .map(|r| r.source_id.as_str())
            .collect()
    }

    pub fn all_succeeded(&self) -> bool {
        self.sources.iter().all(SourceSyncReport::succeeded)
    }
}

pub struct SyncPipeline {
    config: SyncConfig,
    http: HttpFetcher,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let http = HttpFetcher::new(config.http_client_config())?;
        Ok(Self { config, http })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Syncs the selected sources one after another. A failing source is
    /// reported and the run moves on to the next one.
    pub async fn run_once(&self, source_ids: &[String], dry_run: bool) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();

        let database_url = if dry_run {
            None
        } else {
            Some(self.config.require_database_url()?.to_string())
        };
        let registry = SourceRegistry::load(&self.config).await?;
        let filter = if source_ids.is_empty() {
            self.config.source_filter.as_slice()
        } else {
            source_ids
        };
        let profiles = registry.select(filter)?;
        info!(%run_id, sources = profiles.len(), dry_run, "sync run started");

        let client = FeatureServiceClient::new(self.http.clone()).with_run_id(run_id);
        let engine = SyncEngine::new(&client, run_id);

        let mut reports = Vec::with_capacity(profiles.len());
        for profile in profiles {
            let mut store: Box<dyn PropertyStore> = match &database_url {
                None => Box::new(MemoryPropertyStore::new()),
                Some(url) => match PgPropertyStore::connect(url, &self.config.table).await {
                    Ok(store) => Box::new(store),
                    Err(err) => {
                        error!(source_id = %profile.source_id, error = %err, "store unavailable");
                        reports.push(SourceSyncReport::failed(&profile.source_id, err));
                        continue;
                    }
                },
            };
            reports.push(engine.run(profile, store.as_mut()).await);
        }

        Ok(SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            dry_run,
            sources: reports,
        })
    }

    /// A scheduler that runs the full registry on the configured cron
    /// expression, or `None` when scheduling is disabled. Ticks that fire
    /// while a run is still in progress are skipped.
    pub async fn maybe_build_scheduler(self: Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let gate = Arc::new(Mutex::new(()));
        let cron = self.config.sync_cron.clone();
        let pipeline = Arc::clone(&self);
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            let gate = Arc::clone(&gate);
            Box::pin(async move {
                let Ok(_running) = gate.try_lock() else {
                    warn!("previous scheduled sync still running; skipping tick");
                    return;
                };
                match pipeline.run_once(&[], false).await {
                    Ok(summary) => info!(
                        run_id = %summary.run_id,
                        failed = summary.failed_sources().len(),
                        "scheduled sync finished"
                    ),
                    Err(err) => error!(error = %err, "scheduled sync aborted"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}

/// Applies the bundled migrations.
pub async fn migrate(database_url: &str) -> Result<()> {
    let mut conn = PgConnection::connect(database_url)
        .await
        .context("connecting to database")?;
    MIGRATOR.run(&mut conn).await.context("running migrations")?;
    conn.close().await.context("closing connection")?;
    Ok(())
}

/// Drops `table`, along with any views or constraints that depend on it,
/// and recreates it empty.
pub async fn reset_schema(database_url: &str, table: &str) -> Result<()> {
    validate_table_name(table)?;
    let mut conn = PgConnection::connect(database_url)
        .await
        .context("connecting to database")?;
    let mut tx = conn.begin().await.context("beginning reset")?;
    sqlx::query("CREATE EXTENSION IF NOT EXISTS postgis")
        .execute(&mut *tx)
        .await
        .context("enabling postgis")?;
    sqlx::query(&drop_table_sql(table))
        .execute(&mut *tx)
        .await
        .with_context(|| format!("dropping {table}"))?;
    sqlx::query(&create_table_sql(table, TARGET_SRID))
        .execute(&mut *tx)
        .await
        .with_context(|| format!("creating {table}"))?;
    tx.commit().await.context("committing reset")?;
    conn.close().await.context("closing connection")?;
    warn!(table, "table dropped and recreated");
    Ok(())
}

pub async fn run_sync_once_from_env(
    source_ids: &[String],
    dry_run: bool,
) -> Result<SyncRunSummary> {
    let config = SyncConfig::from_env()?;
    let pipeline = SyncPipeline::new(config)?;
    pipeline.run_once(source_ids, dry_run).await
}

/// Runs the scheduler until Ctrl-C.
pub async fn run_scheduler_from_env() -> Result<()> {
    let config = SyncConfig::from_env()?;
    config.require_database_url()?;
    let cron = config.sync_cron.clone();
    let pipeline = Arc::new(SyncPipeline::new(config)?);
    let Some(mut sched) = pipeline.maybe_build_scheduler().await? else {
        anyhow::bail!("scheduler disabled; set PARCELSYNC_SCHEDULER_ENABLED=true");
    };
    sched.start().await.context("starting scheduler")?;
    info!(%cron, "scheduler started");
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    sched.shutdown().await.context("stopping scheduler")?;
    info!("scheduler stopped");
    Ok(())
}
