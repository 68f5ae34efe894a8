use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use log::info;
use serde::Serialize;

use crate::{
    config::LoggerConfig,
    db::SensorStore,
    guard::{self, LockState},
    ingest::IngestLoop,
};

#[derive(Debug, Parser)]
#[command(name = "rtl433-logger", version, about = "Log rtl_433 sensor readings to SQLite")]
pub struct Cli {
    /// JSON config file; flags override its values
    #[arg(long, short, global = true, env = "RTL433_LOGGER_CONFIG")]
    pub config: Option<PathBuf>,

    /// SQLite database file
    #[arg(long, global = true, env = "RTL433_LOGGER_DB")]
    pub db: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(long, short, global = true)]
    pub verbose: bool,

    #[command(flatten)]
    pub run: RunArgs,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Clone, Copy, Subcommand)]
pub enum Command {
    /// Run the decoder and store its readings (default)
    Run,
    /// Print the latest stored readings as JSON lines
    Recent {
        #[arg(long, short = 'n', default_value_t = 10)]
        limit: u64,
    },
    /// Show the next record id and lock file state
    Status,
}

/// Decoder and lock settings. Global so they apply with or without an
/// explicit `run`, and so `status` inspects the same lock files.
#[derive(Debug, Default, Args)]
pub struct RunArgs {
    /// Decoder executable
    #[arg(long, global = true, env = "RTL433_LOGGER_DECODER")]
    pub decoder: Option<String>,

    /// Decoder argument, repeatable; replaces the default `-R 39 -F json`
    #[arg(long = "decoder-arg", global = true, allow_hyphen_values = true)]
    pub decoder_args: Vec<String>,

    #[arg(long, global = true, env = "RTL433_LOGGER_LOCK_FILE")]
    pub lock_file: Option<PathBuf>,

    #[arg(long, global = true, env = "RTL433_LOGGER_DECODER_LOCK_FILE")]
    pub decoder_lock_file: Option<PathBuf>,

    #[arg(long, global = true)]
    pub poll_interval_ms: Option<u64>,

    /// File holding the most recent decoder stdout line
    #[arg(long, global = true)]
    pub stdout_mirror: Option<PathBuf>,

    /// File holding the most recent decoder stderr line
    #[arg(long, global = true)]
    pub stderr_mirror: Option<PathBuf>,

    /// Remove lock files whose recorded process is gone
    #[arg(long, global = true)]
    pub reclaim_stale_lock: bool,
}

impl RunArgs {
    fn apply(self, config: &mut LoggerConfig) {
        if let Some(decoder) = self.decoder {
            config.decoder_program = decoder;
        }
        if !self.decoder_args.is_empty() {
            config.decoder_args = self.decoder_args;
        }
        if let Some(path) = self.lock_file {
            config.lock_path = path;
        }
        if let Some(path) = self.decoder_lock_file {
            config.decoder_lock_path = path;
        }
        if let Some(ms) = self.poll_interval_ms {
            config.poll_interval_ms = ms;
        }
        if self.stdout_mirror.is_some() {
            config.stdout_mirror = self.stdout_mirror;
        }
        if self.stderr_mirror.is_some() {
            config.stderr_mirror = self.stderr_mirror;
        }
        config.reclaim_stale_locks |= self.reclaim_stale_lock;
    }
}

impl Cli {
    /// Config file (or defaults), then env vars and flags, checked once merged.
    pub fn resolve_config(&mut self) -> Result<LoggerConfig> {
        let mut config = LoggerConfig::load_or_default(self.config.as_deref())?;
        if let Some(db) = self.db.take() {
            config.db_path = db;
        }
        std::mem::take(&mut self.run).apply(&mut config);

        let source = self
            .config
            .clone()
            .unwrap_or_else(|| PathBuf::from("<command line>"));
        Ok(config.validated(&source)?)
    }
}

pub async fn execute(mut cli: Cli) -> Result<()> {
    let config = cli.resolve_config()?;
    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run_logger(config).await,
        Command::Recent { limit } => print_recent(&config, limit).await,
        Command::Status => print_status(&config).await,
    }
}

async fn run_logger(config: LoggerConfig) -> Result<()> {
    let store = SensorStore::initialize(&config.db_path)?;
    let ingest = IngestLoop::new(config, store);

    let shutdown = ingest.shutdown_token();
    tokio::spawn(async move {
        shutdown_signal().await;
        shutdown.cancel();
    });

    let summary = ingest.run().await?;
    info!(
        "Closing down: {} readings stored, {} malformed lines, {} write failures",
        summary.stats.accepted, summary.stats.malformed, summary.stats.write_failures
    );
    Ok(())
}

fn open_existing(config: &LoggerConfig) -> Result<SensorStore> {
    if !config.db_path.exists() {
        bail!("no database at {}", config.db_path.display());
    }
    SensorStore::initialize(&config.db_path).context("failed to open database")
}

async fn print_recent(config: &LoggerConfig, limit: u64) -> Result<()> {
    let store = open_existing(config)?;
    let readings = store.recent_readings(limit).await?;
    store.close()?;

    for reading in readings.iter().rev() {
        println!("{}", serde_json::to_string(reading)?);
    }
    Ok(())
}

#[derive(Serialize)]
struct StatusReport {
    db_path: PathBuf,
    next_id: u64,
    readings: u64,
    logger_lock: LockState,
    decoder_lock: LockState,
}

async fn print_status(config: &LoggerConfig) -> Result<()> {
    let store = open_existing(config)?;
    let report = StatusReport {
        db_path: config.db_path.clone(),
        next_id: store.next_id().await?,
        readings: store.reading_count().await?,
        logger_lock: guard::inspect(&config.lock_path),
        decoder_lock: guard::inspect(&config.decoder_lock_path),
    };
    store.close()?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = term.recv() => {},
                }
            }
            Err(err) => {
                log::warn!("Failed to install SIGTERM handler: {err}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("Shutdown signal received, stopping decoder");
}
