use std::process::ExitStatus;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::LoggerConfig;
use crate::db::SensorStore;
use crate::decoder::{supervise, DecoderProcess};
use crate::error::Result;
use crate::guard::PidLock;

use super::loop_worker::{ingest_until_exhausted, IngestStats};
use super::reader::StreamReader;

const ENABLE_LOGS: bool = true;

use crate::{log_error, log_info, log_warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestState {
    Starting,
    Running,
    Draining,
    Stopped,
}

#[derive(Debug)]
pub struct IngestSummary {
    pub stats: IngestStats,
    pub decoder_status: Option<ExitStatus>,
}

/// Runs the decoder and feeds its stdout into the store until the decoder's
/// output ends, then tears everything down in order.
pub struct IngestLoop {
    config: LoggerConfig,
    store: SensorStore,
    state_tx: watch::Sender<IngestState>,
    shutdown: CancellationToken,
}

impl IngestLoop {
    pub fn new(config: LoggerConfig, store: SensorStore) -> Self {
        let (state_tx, _) = watch::channel(IngestState::Starting);
        Self {
            config,
            store,
            state_tx,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> IngestState {
        *self.state_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<IngestState> {
        self.state_tx.subscribe()
    }

    /// Cancelling this token kills the decoder; queued output is still
    /// stored before the loop stops.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    fn set_state(&self, state: IngestState) {
        log_info!("ingest loop {:?} -> {:?}", self.state(), state);
        self.state_tx.send_replace(state);
    }

    pub async fn run(self) -> Result<IngestSummary> {
        let mut instance_lock = match PidLock::acquire_for(
            &self.config.lock_path,
            std::process::id(),
            self.config.reclaim_stale_locks,
        ) {
            Ok(lock) => lock,
            Err(err) => {
                self.abort_startup(None);
                return Err(err);
            }
        };

        let decoder = match DecoderProcess::spawn(&self.config.decoder_program, &self.config.decoder_args) {
            Ok(decoder) => decoder,
            Err(err) => {
                self.abort_startup(Some(&mut instance_lock));
                return Err(err);
            }
        };

        let DecoderProcess {
            child,
            stdout,
            stderr,
            pid,
        } = decoder;

        let mut decoder_lock = match PidLock::acquire_for(
            &self.config.decoder_lock_path,
            pid,
            self.config.reclaim_stale_locks,
        ) {
            Ok(lock) => lock,
            Err(err) => {
                // Dropping the child kills it.
                drop(child);
                self.abort_startup(Some(&mut instance_lock));
                return Err(err);
            }
        };

        let mut primary = StreamReader::spawn("stdout", stdout, self.config.stdout_mirror.clone());
        let mut diagnostic =
            StreamReader::spawn("stderr", stderr, self.config.stderr_mirror.clone());

        let reap = self.shutdown.child_token();
        let supervisor = tokio::spawn(supervise(child, reap.clone()));

        self.set_state(IngestState::Running);
        let stats = ingest_until_exhausted(
            &self.store,
            &mut primary,
            &mut diagnostic,
            self.config.poll_interval(),
        )
        .await;

        self.set_state(IngestState::Draining);
        let decoder_status = self
            .drain(
                primary,
                diagnostic,
                supervisor,
                reap,
                &mut decoder_lock,
                &mut instance_lock,
            )
            .await;
        self.set_state(IngestState::Stopped);

        Ok(IngestSummary {
            stats,
            decoder_status,
        })
    }

    /// Each step runs even when an earlier one fails.
    async fn drain(
        &self,
        mut primary: StreamReader,
        mut diagnostic: StreamReader,
        supervisor: JoinHandle<Option<ExitStatus>>,
        reap: CancellationToken,
        decoder_lock: &mut PidLock,
        instance_lock: &mut PidLock,
    ) -> Option<ExitStatus> {
        let join_timeout = self.config.reader_join_timeout();

        primary.signal_stop();
        diagnostic.signal_stop();
        for reader in [&mut primary, &mut diagnostic] {
            if !reader.join(join_timeout).await {
                log_warn!("{} reader did not stop in time", reader.label());
            }
        }

        if let Err(err) = self.store.close() {
            log_error!("failed to close sensor store: {err:?}");
        }

        // Drops the pipe handles.
        drop(primary);
        drop(diagnostic);

        let decoder_status = reap_decoder(supervisor, reap, join_timeout).await;

        if let Err(err) = decoder_lock.release() {
            log_error!("failed to release decoder lock: {err:?}");
        }
        if let Err(err) = instance_lock.release() {
            log_error!("failed to release instance lock: {err:?}");
        }

        decoder_status
    }

    fn abort_startup(&self, instance_lock: Option<&mut PidLock>) {
        if let Err(err) = self.store.close() {
            log_error!("failed to close sensor store: {err:?}");
        }
        if let Some(lock) = instance_lock {
            if let Err(err) = lock.release() {
                log_error!("failed to release instance lock: {err:?}");
            }
        }
        self.set_state(IngestState::Stopped);
    }
}

async fn reap_decoder(
    mut supervisor: JoinHandle<Option<ExitStatus>>,
    reap: CancellationToken,
    grace: tokio::time::Duration,
) -> Option<ExitStatus> {
    let joined = match tokio::time::timeout(grace, &mut supervisor).await {
        Ok(joined) => joined,
        Err(_) => {
            log_warn!("decoder still running after its output closed, killing it");
            reap.cancel();
            supervisor.await
        }
    };

    match joined {
        Ok(status) => status,
        Err(err) => {
            log_error!("decoder supervisor failed: {err}");
            None
        }
    }
}
