mod cli;
pub mod config;
pub mod db;
pub mod decoder;
pub mod error;
pub mod guard;
pub mod ingest;
mod utils;

use std::process::ExitCode;

use clap::Parser;

pub use config::LoggerConfig;
pub use db::{SensorReading, SensorStore};
pub use error::{LoggerError, Result};
pub use guard::PidLock;
pub use ingest::{IngestLoop, IngestState, IngestSummary};

pub fn run() -> ExitCode {
    let cli = cli::Cli::parse();

    // RUST_LOG still wins over --verbose
    let default_level = if cli.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_level(default_level)
        .parse_default_env()
        .init();

    log::info!("rtl433-logger starting up...");

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("error: failed to start async runtime: {err}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(cli::execute(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{err:#}");
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}
