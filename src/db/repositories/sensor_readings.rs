use anyhow::{bail, Context};
use rusqlite::params;

use crate::db::{
    helpers::{parse_datetime, to_i64, to_u64},
    models::SensorReading,
    query_error, write_error, SensorStore,
};
use crate::error::Result;

impl SensorStore {
    /// Current value of the persisted counter, i.e. the id the next append
    /// will receive.
    pub async fn next_id(&self) -> Result<u64> {
        self.execute(|conn| {
            let max_id: i64 = conn
                .query_row("SELECT max_id FROM current_id", [], |row| row.get(0))
                .context("failed to read current_id")?;
            to_u64(max_id, "max_id")
        })
        .await
        .map_err(query_error)
    }

    /// Inserts `reading` under the current counter value and advances the
    /// counter, all in one transaction. Returns the id that was assigned.
    pub async fn append(&self, reading: &SensorReading) -> Result<u64> {
        let record = reading.clone();
        self.execute(move |conn| {
            let tx = conn
                .transaction()
                .context("failed to open append transaction")?;

            let record_id: i64 = tx
                .query_row("SELECT max_id FROM current_id", [], |row| row.get(0))
                .context("failed to read current_id")?;

            tx.execute(
                "INSERT INTO sensor_data (id, date, sensorID, temperature_C, io)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    record_id,
                    record.captured_at.to_rfc3339(),
                    record.sensor_id,
                    record.temperature_c,
                    record.io_field,
                ],
            )
            .context("failed to insert sensor reading")?;

            // Counter is replaced rather than updated to keep the table layout
            // other tools already read.
            let removed = tx
                .execute(
                    "DELETE FROM current_id WHERE max_id = ?1",
                    params![record_id],
                )
                .context("failed to clear current_id")?;
            if removed != 1 {
                bail!("expected one current_id row for {record_id}, removed {removed}");
            }
            tx.execute(
                "INSERT INTO current_id (max_id) VALUES (?1)",
                params![record_id + 1],
            )
            .context("failed to advance current_id")?;

            tx.commit().context("failed to commit sensor reading")?;
            to_u64(record_id, "max_id")
        })
        .await
        .map_err(write_error)
    }

    pub async fn reading_count(&self) -> Result<u64> {
        self.execute(|conn| {
            let count: i64 = conn
                .query_row("SELECT COUNT(*) FROM sensor_data", [], |row| row.get(0))
                .context("failed to count sensor_data")?;
            to_u64(count, "count")
        })
        .await
        .map_err(query_error)
    }

    /// Latest readings, newest first.
    pub async fn recent_readings(&self, limit: u64) -> Result<Vec<SensorReading>> {
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, date, sensorID, temperature_C, io
                 FROM sensor_data
                 ORDER BY id DESC
                 LIMIT ?1",
            )?;

            let mut rows = stmt.query(params![to_i64(limit)?])?;
            let mut readings = Vec::new();
            while let Some(row) = rows.next()? {
                let date: String = row.get(1)?;
                readings.push(SensorReading {
                    record_id: Some(to_u64(row.get(0)?, "id")?),
                    captured_at: parse_datetime(&date, "date")?,
                    sensor_id: row.get(2)?,
                    temperature_c: row.get(3)?,
                    io_field: row.get(4)?,
                });
            }

            Ok(readings)
        })
        .await
        .map_err(query_error)
    }
}
