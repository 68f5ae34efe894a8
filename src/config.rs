use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::{LoggerError, Result};

pub const DEFAULT_DB_PATH: &str = "/var/lib/temperaturedb/tempdb.sqlite";
pub const DEFAULT_DECODER: &str = "rtl_433";
pub const DEFAULT_LOCK_PATH: &str = "/tmp/rtl_433_2sqlite.pid";
pub const DEFAULT_DECODER_LOCK_PATH: &str = "/tmp/rtl_433.pid";

/// Protocol 39 (WG-PB12V1) with JSON output on stdout.
pub fn default_decoder_args() -> Vec<String> {
    ["-R", "39", "-F", "json"]
        .iter()
        .map(|arg| arg.to_string())
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggerConfig {
    pub db_path: PathBuf,
    pub decoder_program: String,
    pub decoder_args: Vec<String>,
    pub lock_path: PathBuf,
    pub decoder_lock_path: PathBuf,
    pub poll_interval_ms: u64,
    pub reader_join_timeout_ms: u64,
    /// Receives only the most recent stdout line.
    pub stdout_mirror: Option<PathBuf>,
    /// Receives only the most recent stderr line.
    pub stderr_mirror: Option<PathBuf>,
    pub reclaim_stale_locks: bool,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            decoder_program: DEFAULT_DECODER.into(),
            decoder_args: default_decoder_args(),
            lock_path: PathBuf::from(DEFAULT_LOCK_PATH),
            decoder_lock_path: PathBuf::from(DEFAULT_DECODER_LOCK_PATH),
            poll_interval_ms: 1_000,
            reader_join_timeout_ms: 1_000,
            stdout_mirror: None,
            stderr_mirror: None,
            reclaim_stale_locks: false,
        }
    }
}

impl LoggerConfig {
    /// Reads a JSON config file. Missing keys fall back to defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))
            .map_err(|source| LoggerError::Config {
                path: path.to_path_buf(),
                source,
            })?;
        let config: LoggerConfig = serde_json::from_str(&contents)
            .context("config is not valid JSON")
            .map_err(|source| LoggerError::Config {
                path: path.to_path_buf(),
                source,
            })?;
        config.validated(path)
    }

    /// Loads `path` when given, otherwise the defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    /// Rejects settings the logger cannot run with. `path` names where they
    /// came from in the error.
    pub(crate) fn validated(self, path: &Path) -> Result<Self> {
        let problem = if self.poll_interval_ms == 0 {
            Some("poll_interval_ms must be greater than zero")
        } else if self.decoder_program.trim().is_empty() {
            Some("decoder_program must not be empty")
        } else if self.lock_path == self.decoder_lock_path {
            Some("lock_path and decoder_lock_path must differ")
        } else {
            None
        };

        match problem {
            Some(message) => Err(LoggerError::Config {
                path: path.to_path_buf(),
                source: anyhow::anyhow!(message),
            }),
            None => Ok(self),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn reader_join_timeout(&self) -> Duration {
        Duration::from_millis(self.reader_join_timeout_ms)
    }
}
