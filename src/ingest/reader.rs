use std::path::PathBuf;

use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    sync::mpsc,
    task::JoinHandle,
    time::Duration,
};
use tokio_util::sync::CancellationToken;

use crate::error::LoggerError;

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_error, log_info, log_warn};

/// Reads one decoder output stream on its own task and queues every line.
///
/// Stopping is cooperative: `signal_stop` is only observed after the read in
/// flight returns, and the line that read produced is dropped.
pub struct StreamReader {
    label: &'static str,
    queue: mpsc::UnboundedReceiver<String>,
    stop: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl StreamReader {
    /// `mirror`, when set, is overwritten with each line as it is read.
    pub fn spawn<R>(label: &'static str, source: R, mirror: Option<PathBuf>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let stop = CancellationToken::new();
        let handle = tokio::spawn(read_lines(label, source, queue_tx, stop.clone(), mirror));

        Self {
            label,
            queue: queue_rx,
            stop,
            handle: Some(handle),
        }
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn signal_stop(&self) {
        self.stop.cancel();
    }

    /// Next queued line, without waiting.
    pub fn try_next(&mut self) -> Option<String> {
        self.queue.try_recv().ok()
    }

    /// True once the reading task has ended and every queued line has been
    /// taken. Callers poll this; it can be false briefly before the task
    /// has run at all.
    pub fn is_exhausted(&self) -> bool {
        let finished = self
            .handle
            .as_ref()
            .map_or(true, |handle| handle.is_finished());
        finished && self.queue.is_empty()
    }

    /// Waits up to `timeout` for the task to end, aborting it otherwise.
    /// Returns whether it ended on its own.
    pub async fn join(&mut self, timeout: Duration) -> bool {
        let Some(handle) = self.handle.take() else {
            return true;
        };

        let abort = handle.abort_handle();
        match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(())) => true,
            Ok(Err(err)) => {
                log_error!("{} reader task failed: {err}", self.label);
                true
            }
            Err(_) => {
                log_warn!(
                    "{} reader still blocked after {}ms, aborting",
                    self.label,
                    timeout.as_millis()
                );
                abort.abort();
                false
            }
        }
    }
}

async fn read_lines<R>(
    label: &'static str,
    source: R,
    queue: mpsc::UnboundedSender<String>,
    stop: CancellationToken,
    mirror: Option<PathBuf>,
) where
    R: AsyncRead + Unpin,
{
    let mut segments = BufReader::new(source).split(b'\n');

    loop {
        let segment = match segments.next_segment().await {
            Ok(Some(segment)) => segment,
            Ok(None) => {
                log_info!("{label} reached end of stream");
                break;
            }
            Err(source) => {
                let err = LoggerError::SubprocessIo {
                    stream: label,
                    source,
                };
                log_warn!("{err}, treating as end of stream: {err:?}");
                break;
            }
        };

        let line = decode_line(segment);

        if let Some(path) = &mirror {
            let mut contents = line.clone();
            contents.push('\n');
            if let Err(err) = tokio::fs::write(path, contents).await {
                log_warn!("failed to mirror {label} line to {}: {err}", path.display());
            }
        }

        if stop.is_cancelled() {
            log_info!("{label} reader stop flag set, discarding line");
            break;
        }

        if queue.send(line).is_err() {
            log_debug!("{label} queue receiver dropped");
            break;
        }
    }
}

fn decode_line(mut segment: Vec<u8>) -> String {
    if segment.last() == Some(&b'\r') {
        segment.pop();
    }
    match String::from_utf8(segment) {
        Ok(line) => line,
        Err(err) => String::from_utf8_lossy(err.as_bytes()).into_owned(),
    }
}
