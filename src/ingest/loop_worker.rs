use chrono::Utc;
use tokio::time::{Duration, MissedTickBehavior};

use crate::db::SensorStore;

use super::frame::DecodedFrame;
use super::reader::StreamReader;

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_error, log_info, log_warn};

/// Counters for one pass of the ingest loop.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub accepted: u64,
    pub malformed: u64,
    pub write_failures: u64,
    pub diagnostic_lines: u64,
    pub last_record_id: Option<u64>,
    pub polls: u64,
}

/// Drains both readers into `store` until both are exhausted, waiting
/// `poll_interval` between passes. Only `primary` lines are stored.
pub async fn ingest_until_exhausted(
    store: &SensorStore,
    primary: &mut StreamReader,
    diagnostic: &mut StreamReader,
    poll_interval: Duration,
) -> IngestStats {
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut stats = IngestStats::default();

    loop {
        ticker.tick().await;
        stats.polls += 1;

        while let Some(line) = primary.try_next() {
            ingest_line(store, &line, &mut stats).await;
        }

        while let Some(line) = diagnostic.try_next() {
            stats.diagnostic_lines += 1;
            log_debug!("[{}] {}", diagnostic.label(), line);
        }

        if primary.is_exhausted() && diagnostic.is_exhausted() {
            break;
        }
    }

    log_info!(
        "ingest finished after {} polls: {} stored, {} malformed, {} write failures",
        stats.polls,
        stats.accepted,
        stats.malformed,
        stats.write_failures
    );
    stats
}

async fn ingest_line(store: &SensorStore, line: &str, stats: &mut IngestStats) {
    let frame = match DecodedFrame::parse(line) {
        Ok(frame) => frame,
        Err(err) => {
            stats.malformed += 1;
            if line.trim().is_empty() {
                log_debug!("skipping blank decoder line");
            } else {
                log_warn!("discarding garbled decoder line {line:?}: {err:?}");
            }
            return;
        }
    };

    let sensor_id = frame.id;
    let reading = frame.into_reading(Utc::now());
    match store.append(&reading).await {
        Ok(record_id) => {
            stats.accepted += 1;
            stats.last_record_id = Some(record_id);
            log_debug!(
                "stored record {record_id}: sensor {sensor_id} at {}C",
                reading.temperature_c
            );
        }
        Err(err) => {
            stats.write_failures += 1;
            log_error!("failed to store reading from sensor {sensor_id}: {err:?}");
        }
    }
}
