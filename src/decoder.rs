use std::process::{ExitStatus, Stdio};

use log::{info, warn};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio_util::sync::CancellationToken;

use crate::error::{LoggerError, Result};

/// A running decoder with its output pipes detached from the `Child`.
pub struct DecoderProcess {
    pub child: Child,
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
    pub pid: u32,
}

impl DecoderProcess {
    pub fn spawn(program: &str, args: &[String]) -> Result<Self> {
        let spawn_error = |source: std::io::Error| LoggerError::Spawn {
            program: program.to_string(),
            source,
        };

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(spawn_error)?;

        let pid = child
            .id()
            .ok_or_else(|| spawn_error(std::io::Error::other("decoder exited before reporting a pid")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_error(std::io::Error::other("decoder stdout was not piped")))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| spawn_error(std::io::Error::other("decoder stderr was not piped")))?;

        info!("Started decoder `{program} {}` as pid {pid}", args.join(" "));

        Ok(Self {
            child,
            stdout,
            stderr,
            pid,
        })
    }
}

/// Waits for the decoder to exit, killing it first if `kill` is cancelled.
pub async fn supervise(mut child: Child, kill: CancellationToken) -> Option<ExitStatus> {
    let exited = tokio::select! {
        status = child.wait() => Some(status),
        _ = kill.cancelled() => None,
    };

    let status = match exited {
        Some(status) => status,
        None => {
            info!("Stopping decoder");
            if let Err(err) = child.start_kill() {
                warn!("Failed to signal decoder: {err}");
            }
            child.wait().await
        }
    };

    match status {
        Ok(status) => {
            info!("Decoder exited with {status}");
            Some(status)
        }
        Err(err) => {
            warn!("Failed to reap decoder: {err}");
            None
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::time::Duration;

    #[tokio::test]
    async fn pipes_both_streams() {
        let args = vec!["-c".to_string(), "echo out; echo err 1>&2".to_string()];
        let mut decoder = DecoderProcess::spawn("sh", &args).unwrap();
        assert!(decoder.pid > 0);

        let mut out = String::new();
        decoder.stdout.read_to_string(&mut out).await.unwrap();
        let mut err = String::new();
        decoder.stderr.read_to_string(&mut err).await.unwrap();
        assert_eq!(out, "out\n");
        assert_eq!(err, "err\n");

        let status = supervise(decoder.child, CancellationToken::new()).await.unwrap();
        assert!(status.success());
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let err = DecoderProcess::spawn("/nonexistent/rtl_433", &[]).err().unwrap();
        assert!(matches!(err, LoggerError::Spawn { .. }));
    }

    #[tokio::test]
    async fn cancelling_kills_a_running_decoder() {
        let args = vec!["-c".to_string(), "sleep 30".to_string()];
        let decoder = DecoderProcess::spawn("sh", &args).unwrap();
        let kill = CancellationToken::new();
        let supervisor = tokio::spawn(supervise(decoder.child, kill.clone()));

        kill.cancel();
        let status = tokio::time::timeout(Duration::from_secs(5), supervisor)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(!status.success());
    }
}
