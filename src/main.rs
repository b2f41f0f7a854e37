use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use zeroize::Zeroizing;

use ingestkeeper::config::IngestConfig;
use ingestkeeper::scheduler::HistoryLedger;
use ingestkeeper::secrets::KeyStore;
use ingestkeeper::{RunMode, RunOutcome};

#[derive(Parser)]
#[command(
    name = "ingestkeeper",
    about = "Scheduled data ingestion into SCD2-historized SQLite tables",
    version,
    long_about = None
)]
struct Cli {
    /// Configuration file (TOML, or JSON by extension)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Schedule file, overriding the configured one
    #[arg(long)]
    schedule: Option<PathBuf>,

    /// SQLite database, overriding the configured one
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Run the jobs due now, then exit
    #[arg(long, conflicts_with = "dry_run")]
    once: bool,

    /// Seconds between poll cycles
    #[arg(long, value_name = "SECS")]
    poll: Option<u64>,

    /// Run independent jobs concurrently
    #[arg(long = "async")]
    async_mode: bool,

    /// Concurrent job limit in async mode
    #[arg(long)]
    workers: Option<usize>,

    /// Validate the schedule and print what would run, without executing
    #[arg(long)]
    dry_run: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show recent entries of the ingestion history ledger
    History {
        /// Maximum number of entries
        #[arg(long, default_value = "20")]
        limit: usize,

        /// Only entries for this job
        #[arg(long)]
        job: Option<String>,
    },

    /// Manage API keys in the configured key file
    Keys {
        #[command(subcommand)]
        action: KeyAction,
    },
}

#[derive(Subcommand)]
enum KeyAction {
    /// Store a key; the value is read from stdin when omitted
    Add {
        name: String,
        value: Option<String>,
    },
    /// List stored key names (values are never printed)
    List,
    /// Delete a key
    Remove { name: String },
}

impl Cli {
    /// Fold command-line overrides into the loaded configuration.
    fn apply(&self, config: &mut IngestConfig) {
        if let Some(schedule) = &self.schedule {
            config.schedule_file = schedule.clone();
        }
        if let Some(db) = &self.db {
            config.database.path = db.clone();
        }
        if let Some(poll) = self.poll {
            config.runner.poll_interval_secs = poll;
        }
        if self.async_mode {
            config.runner.async_mode = true;
        }
        if let Some(workers) = self.workers {
            config.runner.max_workers = workers;
        }
        if self.log_json {
            config.logging.json = true;
        }
    }

    fn mode(&self) -> RunMode {
        if self.dry_run {
            RunMode::DryRun
        } else if self.once {
            RunMode::Once
        } else {
            RunMode::Forever
        }
    }
}

fn init_tracing(config: &IngestConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if config.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn manage_keys(config: &IngestConfig, action: &KeyAction) -> Result<()> {
    let path = config
        .secrets
        .path
        .as_deref()
        .context("no key file configured; set `path` under [secrets]")?;
    let mut store = KeyStore::open_or_empty(path)?;

    match action {
        KeyAction::Add { name, value } => {
            let value = match value {
                Some(v) => Zeroizing::new(v.clone()),
                None => read_secret()?,
            };
            store.insert(name.as_str(), value.as_str());
            store.save(path)?;
            println!("stored key '{name}'");
        }
        KeyAction::List => {
            for name in store.names() {
                println!("{name}");
            }
        }
        KeyAction::Remove { name } => {
            if !store.remove(name) {
                anyhow::bail!("no key named '{name}' in {}", path.display());
            }
            store.save(path)?;
            println!("removed key '{name}'");
        }
    }
    Ok(())
}

/// One line from stdin, without the line ending.
fn read_secret() -> Result<Zeroizing<String>> {
    let mut line = Zeroizing::new(String::new());
    std::io::stdin()
        .read_line(&mut line)
        .context("failed to read key value from stdin")?;
    let value = Zeroizing::new(line.trim_end_matches(['\r', '\n']).to_owned());
    anyhow::ensure!(!value.is_empty(), "empty key value");
    Ok(value)
}

/// Flip the returned receiver to `true` on Ctrl-C.
fn shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("interrupt received, finishing running jobs");
                let _ = tx.send(true);
            }
            Err(e) => {
                tracing::warn!(error = %e, "could not listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        }
    });
    rx
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (mut config, warnings) = IngestConfig::resolve(cli.config.as_deref())?;
    cli.apply(&mut config);
    init_tracing(&config);
    for warning in &warnings {
        tracing::warn!("{warning}");
    }

    match &cli.command {
        Some(Commands::History { limit, job }) => {
            let pool = ingestkeeper::open_database(&config.database.path)?;
            let ledger = HistoryLedger::new(pool);
            let records = match job {
                Some(name) => ledger.for_job(name, *limit)?,
                None => ledger.fetch_recent(*limit)?,
            };
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
        Some(Commands::Keys { action }) => manage_keys(&config, action)?,
        None => {
            let mode = cli.mode();
            tracing::info!(?mode, schedule = %config.schedule_file.display(), "starting ingestion manager");
            match ingestkeeper::run(&config, mode, shutdown_signal()).await? {
                RunOutcome::DryRun(report) => {
                    println!("{}", serde_json::to_string_pretty(&report)?);
                }
                RunOutcome::Cycle(report) => {
                    println!("{}", serde_json::to_string_pretty(&report)?);
                    if !report.failed.is_empty() {
                        tracing::warn!(failed = ?report.failed, "some jobs failed; see ingestion history");
                    }
                }
                RunOutcome::Stopped(summary) => {
                    if summary.failed > 0 {
                        tracing::warn!(failed = summary.failed, "some runs failed; see ingestion history");
                    }
                }
            }
        }
    }

    Ok(())
}
