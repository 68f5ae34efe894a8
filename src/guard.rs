use std::{
    fs::{self, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
};

use log::{error, info, warn};
use serde::Serialize;
use sysinfo::{Pid, ProcessesToUpdate, System};

use crate::error::{LoggerError, Result};

/// A PID file held for the lifetime of a process.
///
/// The file is created with `create_new`, so two loggers racing for the same
/// path cannot both succeed. Dropping an unreleased lock removes the file.
#[derive(Debug)]
pub struct PidLock {
    path: PathBuf,
    pid: u32,
    released: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "pid")]
pub enum LockState {
    Free,
    Held(u32),
    Stale(u32),
    Unreadable,
}

impl PidLock {
    /// Locks `path` for the current process.
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self> {
        Self::acquire_for(path, std::process::id(), false)
    }

    /// Locks `path` on behalf of `pid`. With `reclaim_stale`, a file whose
    /// recorded process no longer exists is removed and the lock retried.
    pub fn acquire_for(path: impl Into<PathBuf>, pid: u32, reclaim_stale: bool) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| LoggerError::Lock {
                path: path.clone(),
                source,
            })?;
        }

        match write_new(&path, pid) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                let state = inspect(&path);
                match state {
                    LockState::Stale(owner) if reclaim_stale => {
                        warn!(
                            "Removing stale lock {} left by dead pid {owner}",
                            path.display()
                        );
                        remove_if_present(&path).map_err(|source| LoggerError::Lock {
                            path: path.clone(),
                            source,
                        })?;
                        write_new(&path, pid).map_err(|err| already_running_or(&path, err))?;
                    }
                    _ => {
                        return Err(LoggerError::AlreadyRunning {
                            pid: state.owner(),
                            path,
                        })
                    }
                }
            }
            Err(source) => return Err(LoggerError::Lock { path, source }),
        }

        info!("Acquired lock {} for pid {pid}", path.display());
        Ok(Self {
            path,
            pid,
            released: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Removes the lock file. A file that is already gone is not an error,
    /// and calling this twice is harmless.
    pub fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        remove_if_present(&self.path).map_err(|source| LoggerError::Lock {
            path: self.path.clone(),
            source,
        })?;
        self.released = true;
        info!("Released lock {}", self.path.display());
        Ok(())
    }
}

impl Drop for PidLock {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            error!("Failed to release lock on drop: {err:?}");
        }
    }
}

impl LockState {
    pub fn owner(&self) -> Option<u32> {
        match self {
            LockState::Held(pid) | LockState::Stale(pid) => Some(*pid),
            LockState::Free | LockState::Unreadable => None,
        }
    }
}

/// Reports who holds `path`, checking whether the recorded pid is alive.
pub fn inspect(path: &Path) -> LockState {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return LockState::Free,
        Err(_) => return LockState::Unreadable,
    };

    match contents.trim().parse::<u32>() {
        Ok(pid) if process_alive(pid) => LockState::Held(pid),
        Ok(pid) => LockState::Stale(pid),
        Err(_) => LockState::Unreadable,
    }
}

pub fn process_alive(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]));
    system.process(pid).is_some()
}

fn write_new(path: &Path, pid: u32) -> io::Result<()> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    let written = file
        .write_all(pid.to_string().as_bytes())
        .and_then(|()| file.sync_all());
    if let Err(err) = written {
        let _ = fs::remove_file(path);
        return Err(err);
    }
    Ok(())
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

fn already_running_or(path: &Path, err: io::Error) -> LoggerError {
    if err.kind() == io::ErrorKind::AlreadyExists {
        LoggerError::AlreadyRunning {
            path: path.to_path_buf(),
            pid: inspect(path).owner(),
        }
    } else {
        LoggerError::Lock {
            path: path.to_path_buf(),
            source: err,
        }
    }
}
