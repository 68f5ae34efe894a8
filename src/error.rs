use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, LoggerError>;

#[derive(Debug, Error)]
pub enum LoggerError {
    #[error("already running: lock file {} exists{}", path.display(), owner_suffix(*pid))]
    AlreadyRunning { path: PathBuf, pid: Option<u32> },

    #[error("failed to initialise sensor store at {}", path.display())]
    StorageInit {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to persist sensor reading")]
    Write(#[source] anyhow::Error),

    #[error("failed to query sensor store")]
    Query(#[source] anyhow::Error),

    #[error("sensor store is closed")]
    StoreClosed,

    #[error("failed to close sensor store")]
    Close(#[source] anyhow::Error),

    #[error("malformed decoder record")]
    MalformedRecord(#[from] serde_json::Error),

    #[error("failed to read decoder {stream}")]
    SubprocessIo {
        stream: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to launch decoder `{program}`")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("lock file {} could not be updated", path.display())]
    Lock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration in {}", path.display())]
    Config {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },
}

fn owner_suffix(pid: Option<u32>) -> String {
    match pid {
        Some(pid) => format!(" (held by pid {pid})"),
        None => String::new(),
    }
}

impl LoggerError {
    /// Errors that abort the run before any reading is processed.
    pub fn is_startup_failure(&self) -> bool {
        matches!(
            self,
            LoggerError::AlreadyRunning { .. }
                | LoggerError::StorageInit { .. }
                | LoggerError::Spawn { .. }
                | LoggerError::Config { .. }
        )
    }
}
