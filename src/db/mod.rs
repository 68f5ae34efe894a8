use std::{
    path::{Path, PathBuf},
    sync::{mpsc, Arc, Mutex, MutexGuard},
    thread::{self, JoinHandle},
};

use anyhow::{anyhow, Context};
use log::{error, info};
use rusqlite::Connection;
use tokio::sync::oneshot;

mod helpers;
pub mod models;
mod repositories;
mod schema;

pub use models::SensorReading;

use crate::error::{LoggerError, Result};
use schema::ensure_schema;

type DbTask = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

enum DbCommand {
    Execute(DbTask),
    Shutdown,
}

struct StoreInner {
    sender: Mutex<Option<mpsc::Sender<DbCommand>>>,
    worker: Mutex<Option<JoinHandle<anyhow::Result<()>>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl StoreInner {
    fn shutdown(&self) -> anyhow::Result<()> {
        let sender = lock(&self.sender).take();
        let worker = lock(&self.worker).take();

        let Some(handle) = worker else {
            return Ok(());
        };

        if let Some(sender) = sender {
            // A send failure means the worker already exited; joining still reports why.
            let _ = sender.send(DbCommand::Shutdown);
        }

        match handle.join() {
            Ok(result) => result,
            Err(panic) => Err(anyhow!("database worker panicked: {panic:?}")),
        }
    }
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            error!("Failed to shut down sensor store: {err:?}");
        }
    }
}

/// Handle to the readings database.
///
/// The connection lives on a dedicated thread; every operation is shipped to
/// it as a closure, so all writes are serialised no matter how many clones of
/// the handle exist.
#[derive(Clone)]
pub struct SensorStore {
    inner: Arc<StoreInner>,
    db_path: Arc<PathBuf>,
}

impl SensorStore {
    /// Opens or creates the database at `db_path`, creating the readings and
    /// counter tables if the readings table is absent. Existing data is never
    /// touched.
    pub fn initialize(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();
        Self::spawn_worker(&db_path).map_err(|source| LoggerError::StorageInit {
            path: db_path.clone(),
            source,
        })
    }

    fn spawn_worker(db_path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create database directory {}", parent.display())
            })?;
        }

        let (command_tx, command_rx) = mpsc::channel::<DbCommand>();
        let (ready_tx, ready_rx) = mpsc::channel();
        let path_for_thread = db_path.to_path_buf();

        let worker = thread::Builder::new()
            .name("rtl433-db".into())
            .spawn(move || -> anyhow::Result<()> {
                let mut conn = match Connection::open(&path_for_thread) {
                    Ok(connection) => connection,
                    Err(err) => {
                        let _ = ready_tx.send(Err(anyhow::Error::new(err)
                            .context("failed to open SQLite database")));
                        return Ok(());
                    }
                };

                if let Err(err) = conn.pragma_update(None, "journal_mode", "WAL") {
                    error!("Failed to enable WAL mode: {err}");
                }

                let init_result = ensure_schema(&mut conn).map(|created| {
                    if created {
                        info!("Created sensor tables in {}", path_for_thread.display());
                    }
                });
                let init_failed = init_result.is_err();
                if ready_tx.send(init_result).is_err() {
                    error!("Store initialization receiver dropped before ready signal");
                    return Ok(());
                }
                if init_failed {
                    return Ok(());
                }

                while let Ok(command) = command_rx.recv() {
                    match command {
                        DbCommand::Execute(task) => task(&mut conn),
                        DbCommand::Shutdown => break,
                    }
                }

                info!("Sensor store thread shutting down");
                conn.close()
                    .map_err(|(_, err)| anyhow::Error::new(err).context("failed to close SQLite connection"))
            })
            .context("failed to spawn database worker thread")?;

        ready_rx
            .recv()
            .context("database worker exited before signaling readiness")??;

        info!("Sensor store initialized at {}", db_path.display());

        Ok(Self {
            inner: Arc::new(StoreInner {
                sender: Mutex::new(Some(command_tx)),
                worker: Mutex::new(Some(worker)),
            }),
            db_path: Arc::new(db_path.to_path_buf()),
        })
    }

    pub fn path(&self) -> &Path {
        self.db_path.as_path()
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.inner.sender).is_none()
    }

    /// Flushes queued work and releases the connection. Safe to call more
    /// than once; later calls are no-ops.
    pub fn close(&self) -> Result<()> {
        self.inner.shutdown().map_err(LoggerError::Close)
    }

    pub(crate) async fn execute<F, T>(&self, task: F) -> anyhow::Result<T>
    where
        F: FnOnce(&mut Connection) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let sender = lock(&self.inner.sender)
            .clone()
            .ok_or(LoggerError::StoreClosed)?;
        let (reply_tx, reply_rx) = oneshot::channel();

        let command = DbCommand::Execute(Box::new(move |conn| {
            let result = task(conn);
            if reply_tx.send(result).is_err() {
                error!("Store caller dropped before receiving result");
            }
        }));

        sender
            .send(command)
            .map_err(|_| LoggerError::StoreClosed)?;

        reply_rx
            .await
            .map_err(|_| anyhow!("database thread terminated unexpectedly"))?
    }
}

/// Keeps `StoreClosed` recognisable after it has travelled through `anyhow`.
fn write_error(err: anyhow::Error) -> LoggerError {
    typed_or(err, LoggerError::Write)
}

fn query_error(err: anyhow::Error) -> LoggerError {
    typed_or(err, LoggerError::Query)
}

fn typed_or(err: anyhow::Error, wrap: fn(anyhow::Error) -> LoggerError) -> LoggerError {
    match err.downcast::<LoggerError>() {
        Ok(typed) => typed,
        Err(err) => wrap(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn reading(sensor_id: i64, temperature_c: f64, io_field: &str) -> SensorReading {
        SensorReading::new(Utc::now(), sensor_id, temperature_c, io_field)
    }

    fn table_names(path: &Path) -> Vec<String> {
        let conn = Connection::open(path).unwrap();
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
            .unwrap();
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .unwrap()
            .collect::<rusqlite::Result<Vec<_>>>()
            .unwrap();
        names
    }

    #[tokio::test]
    async fn initialize_creates_both_tables_with_zero_counter() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("sensors.sqlite");

        let store = SensorStore::initialize(&path).unwrap();
        assert_eq!(store.next_id().await.unwrap(), 0);
        store.close().unwrap();

        assert_eq!(table_names(&path), vec!["current_id", "sensor_data"]);

        let conn = Connection::open(&path).unwrap();
        let columns: Vec<String> = conn
            .prepare("PRAGMA table_info('sensor_data')")
            .unwrap()
            .query_map([], |row| row.get::<_, String>(1))
            .unwrap()
            .collect::<rusqlite::Result<_>>()
            .unwrap();
        assert_eq!(columns, vec!["id", "date", "sensorID", "temperature_C", "io"]);
    }

    #[tokio::test]
    async fn reinitialize_preserves_rows_and_counter() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sensors.sqlite");

        let store = SensorStore::initialize(&path).unwrap();
        store.append(&reading(8, 20.9, "1100")).await.unwrap();
        store.append(&reading(3, 18.25, "0011")).await.unwrap();
        store.close().unwrap();

        let reopened = SensorStore::initialize(&path).unwrap();
        assert_eq!(reopened.next_id().await.unwrap(), 2);
        assert_eq!(reopened.reading_count().await.unwrap(), 2);
        assert_eq!(reopened.append(&reading(1, 1.0, "1")).await.unwrap(), 2);
        reopened.close().unwrap();
    }

    #[tokio::test]
    async fn ids_are_gap_free_and_counter_matches_row_count() {
        let dir = tempfile::tempdir().unwrap();
        let store = SensorStore::initialize(dir.path().join("sensors.sqlite")).unwrap();

        for expected in 0..25u64 {
            let assigned = store
                .append(&reading(expected as i64, 10.0 + expected as f64, "01"))
                .await
                .unwrap();
            assert_eq!(assigned, expected);
        }

        assert_eq!(store.next_id().await.unwrap(), 25);
        assert_eq!(store.reading_count().await.unwrap(), 25);
        let ids: Vec<u64> = store
            .recent_readings(100)
            .await
            .unwrap()
            .into_iter()
            .rev()
            .filter_map(|r| r.record_id)
            .collect();
        assert_eq!(ids, (0..25).collect::<Vec<_>>());
        store.close().unwrap();
    }

    #[tokio::test]
    async fn values_are_stored_exactly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sensors.sqlite");
        let store = SensorStore::initialize(&path).unwrap();

        store.append(&reading(8, 20.9, "1100")).await.unwrap();
        store.append(&reading(3, 18.25, "0011")).await.unwrap();
        store.close().unwrap();

        let conn = Connection::open(&path).unwrap();
        let rows: Vec<(i64, i64, f64, String)> = conn
            .prepare("SELECT id, sensorID, temperature_C, io FROM sensor_data ORDER BY id")
            .unwrap()
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)))
            .unwrap()
            .collect::<rusqlite::Result<_>>()
            .unwrap();
        assert_eq!(
            rows,
            vec![
                (0, 8, 20.9, "1100".to_string()),
                (1, 3, 18.25, "0011".to_string()),
            ]
        );

        let counters: Vec<i64> = conn
            .prepare("SELECT max_id FROM current_id")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<rusqlite::Result<_>>()
            .unwrap();
        assert_eq!(counters, vec![2]);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_blocks_further_writes() {
        let dir = tempfile::tempdir().unwrap();
        let store = SensorStore::initialize(dir.path().join("sensors.sqlite")).unwrap();
        let clone = store.clone();

        store.close().unwrap();
        store.close().unwrap();
        assert!(clone.is_closed());

        let err = clone.append(&reading(8, 20.9, "1100")).await.unwrap_err();
        assert!(matches!(err, LoggerError::StoreClosed));
        assert!(matches!(clone.next_id().await, Err(LoggerError::StoreClosed)));
    }

    #[test]
    fn garbage_file_is_a_storage_init_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not-a-db.sqlite");
        std::fs::write(&path, vec![0x42u8; 4096]).unwrap();

        let err = SensorStore::initialize(&path).err().unwrap();
        assert!(matches!(err, LoggerError::StorageInit { .. }));
    }

    #[test]
    fn unwritable_location_is_a_storage_init_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"x").unwrap();

        let err = SensorStore::initialize(blocker.join("sensors.sqlite")).err().unwrap();
        assert!(matches!(err, LoggerError::StorageInit { .. }));
    }
}
