//! IngestKeeper -- scheduled data ingestion into SCD2-historized SQLite tables.
//!
//! This crate provides the schedule clock, the SCD2 upsert engine, the
//! append-only history ledger, and the orchestrator that runs registered jobs
//! on their recurrence rules with `depends_on` ordering.

pub mod clients;
pub mod config;
pub mod context;
pub mod error;
pub mod jobs;
pub mod scheduler;
pub mod secrets;
pub mod storage;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::watch;

use clients::{HttpJsonClient, MockClient, SourceClient};
use config::{IngestConfig, SourceConfig};
use context::ManagerContext;
use scheduler::{CycleReport, DryRunReport, LoopSummary, Orchestrator, SchedulePlan};
use secrets::{KeyProvider, KeyStore};

pub use error::{IngestError, PersistenceError};

/// How the manager should run, after CLI flags have been applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Validate and describe the schedule; execute nothing.
    DryRun,
    /// Execute whatever is due now, then exit.
    Once,
    /// Poll until shut down.
    Forever,
}

/// What a run produced.
#[derive(Debug)]
pub enum RunOutcome {
    DryRun(DryRunReport),
    Cycle(CycleReport),
    /// The polling loop was shut down.
    Stopped(LoopSummary),
}

/// Build the key store described by `config`.
pub fn build_keys(config: &IngestConfig) -> Result<KeyStore> {
    let store = match &config.secrets.path {
        Some(path) => KeyStore::from_file(path)?,
        None => KeyStore::new(),
    };
    Ok(store.with_env_prefix(config.secrets.env_prefix.clone()))
}

/// Build the source client selected by `config`.
pub fn build_client(config: &IngestConfig, keys: &dyn KeyProvider) -> Result<Arc<dyn SourceClient>> {
    match &config.clients.source {
        SourceConfig::Mock => Ok(Arc::new(MockClient::new())),
        SourceConfig::Http { base_url, api_key } => {
            let token = match api_key {
                Some(name) => Some(
                    keys.lookup(name)
                        .map(|v| v.as_str().to_owned())
                        .ok_or_else(|| IngestError::KeyLookup(name.clone()))?,
                ),
                None => None,
            };
            Ok(Arc::new(HttpJsonClient::new(base_url.clone(), token)?))
        }
    }
}

/// Open (creating parent directories) the SQLite database at `path`.
pub fn open_database(path: &Path) -> Result<storage::Pool> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create database directory: {}", parent.display()))?;
    }
    let path_str = path
        .to_str()
        .with_context(|| format!("database path is not valid UTF-8: {}", path.display()))?;
    storage::open_pool(path_str)
        .with_context(|| format!("failed to open database: {}", path.display()))
}

/// Load the schedule, wire the manager together, and run it.
///
/// Schedule, dependency, and registration problems are returned before any
/// job runs. Once running, job failures are contained and only reported.
pub async fn run(config: &IngestConfig, mode: RunMode, shutdown: watch::Receiver<bool>) -> Result<RunOutcome> {
    let now = Utc::now();
    let plan = SchedulePlan::load(&config.schedule_file, now)?;

    let keys = build_keys(config)?;
    let client = build_client(config, &keys)?;
    let registry = jobs::default_registry(client);

    if mode == RunMode::DryRun {
        let report = scheduler::dry_run(&plan, &registry, now)?;
        tracing::info!(jobs = report.jobs.len(), "schedule validated");
        return Ok(RunOutcome::DryRun(report));
    }

    tracing::info!(db_path = %config.database.path.display(), "initializing database");
    let pool = open_database(&config.database.path)?;
    let ctx = Arc::new(ManagerContext::new(pool, Arc::new(keys)));
    let mut orchestrator = Orchestrator::new(ctx, registry, plan, config.execution_mode())?
        .with_reload_from(&config.schedule_file);

    match mode {
        RunMode::Once => Ok(RunOutcome::Cycle(orchestrator.run_once().await)),
        _ => {
            let poll = Duration::from_secs(config.runner.poll_interval_secs.max(1));
            Ok(RunOutcome::Stopped(orchestrator.run_forever(poll, shutdown).await))
        }
    }
}
