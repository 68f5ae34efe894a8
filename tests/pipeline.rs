#![cfg(unix)]

use std::path::Path;
use std::time::Duration;

use rtl433_logger::{IngestLoop, IngestState, LoggerConfig, LoggerError, PidLock, SensorStore};
use rusqlite::Connection;

fn simulated_decoder(dir: &Path, stdout_lines: &[&str], stderr_lines: &[&str]) -> LoggerConfig {
    let stdout_file = dir.join("decoder.stdout");
    let stderr_file = dir.join("decoder.stderr");
    std::fs::write(&stdout_file, lines(stdout_lines)).unwrap();
    std::fs::write(&stderr_file, lines(stderr_lines)).unwrap();

    let script = format!(
        "cat '{}' 1>&2; cat '{}'",
        stderr_file.display(),
        stdout_file.display()
    );

    LoggerConfig {
        db_path: dir.join("db").join("tempdb.sqlite"),
        decoder_program: "sh".into(),
        decoder_args: vec!["-c".into(), script],
        lock_path: dir.join("rtl_433_2sqlite.pid"),
        decoder_lock_path: dir.join("rtl_433.pid"),
        poll_interval_ms: 20,
        reader_join_timeout_ms: 500,
        stdout_mirror: Some(dir.join("last_stdout.log")),
        stderr_mirror: None,
        reclaim_stale_locks: false,
    }
}

fn lines(lines: &[&str]) -> String {
    lines.iter().map(|line| format!("{line}\n")).collect()
}

async fn run(config: &LoggerConfig) -> rtl433_logger::IngestSummary {
    let store = SensorStore::initialize(&config.db_path).unwrap();
    let ingest = IngestLoop::new(config.clone(), store.clone());
    let states = ingest.subscribe();

    let summary = tokio::time::timeout(Duration::from_secs(10), ingest.run())
        .await
        .expect("pipeline should stop once the decoder exits")
        .unwrap();

    assert_eq!(*states.borrow(), IngestState::Stopped);
    assert!(store.is_closed());
    summary
}

fn stored_rows(db_path: &Path) -> Vec<(i64, i64, f64, String)> {
    let conn = Connection::open(db_path).unwrap();
    let mut stmt = conn
        .prepare("SELECT id, sensorID, temperature_C, io FROM sensor_data ORDER BY id")
        .unwrap();
    let rows = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)))
        .unwrap()
        .collect::<rusqlite::Result<Vec<_>>>()
        .unwrap();
    rows
}

fn max_id(db_path: &Path) -> i64 {
    let conn = Connection::open(db_path).unwrap();
    conn.query_row("SELECT max_id FROM current_id", [], |row| row.get(0))
        .unwrap()
}

#[tokio::test]
async fn two_readings_get_ids_zero_and_one() {
    let dir = tempfile::tempdir().unwrap();
    let config = simulated_decoder(
        dir.path(),
        &[
            r#"{"id":8,"temperature_C":20.9,"io":"1100"}"#,
            r#"{"id":3,"temperature_C":18.25,"io":"0011"}"#,
        ],
        &["Registering protocol [39] \"WG-PB12V1\""],
    );

    let summary = run(&config).await;

    assert_eq!(summary.stats.accepted, 2);
    assert_eq!(
        stored_rows(&config.db_path),
        vec![
            (0, 8, 20.9, "1100".to_string()),
            (1, 3, 18.25, "0011".to_string()),
        ]
    );
    assert_eq!(max_id(&config.db_path), 2);
    assert!(!config.lock_path.exists());
    assert!(!config.decoder_lock_path.exists());
    assert_eq!(
        std::fs::read_to_string(dir.path().join("last_stdout.log")).unwrap(),
        "{\"id\":3,\"temperature_C\":18.25,\"io\":\"0011\"}\n"
    );
}

#[tokio::test]
async fn garbage_between_readings_is_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let config = simulated_decoder(
        dir.path(),
        &["", "not json", r#"{"id":8,"temperature_C":20.9,"io":"1100"}"#],
        &[r#"{"id":1,"temperature_C":99.0,"io":"1"}"#],
    );

    let summary = run(&config).await;

    assert_eq!(summary.stats.accepted, 1);
    assert_eq!(summary.stats.malformed, 2);
    assert_eq!(summary.stats.diagnostic_lines, 1);
    assert_eq!(
        stored_rows(&config.db_path),
        vec![(0, 8, 20.9, "1100".to_string())]
    );
    assert_eq!(max_id(&config.db_path), 1);
}

#[tokio::test]
async fn counter_continues_across_runs() {
    let dir = tempfile::tempdir().unwrap();
    let config = simulated_decoder(
        dir.path(),
        &[
            r#"{"id":8,"temperature_C":20.9,"io":"1100"}"#,
            r#"{"id":8,"temperature_C":21.0,"io":"1100"}"#,
            r#"{"id":8,"temperature_C":21.1,"io":"1100"}"#,
        ],
        &[],
    );

    run(&config).await;
    run(&config).await;

    let ids: Vec<i64> = stored_rows(&config.db_path).into_iter().map(|row| row.0).collect();
    assert_eq!(ids, (0..6).collect::<Vec<_>>());
    assert_eq!(max_id(&config.db_path), 6);
}

#[tokio::test]
async fn second_instance_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let config = simulated_decoder(dir.path(), &[], &[]);
    let mut running = PidLock::acquire(&config.lock_path).unwrap();

    let store = SensorStore::initialize(&config.db_path).unwrap();
    let err = IngestLoop::new(config.clone(), store).run().await.unwrap_err();
    assert!(matches!(err, LoggerError::AlreadyRunning { .. }));
    assert!(err.is_startup_failure());

    running.release().unwrap();
    let summary = run(&config).await;
    assert_eq!(summary.stats.accepted, 0);
    assert!(!config.lock_path.exists());
}
