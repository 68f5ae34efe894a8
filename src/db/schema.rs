use anyhow::{bail, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

/// Creates the tables when `sensor_data` is missing and checks the counter.
/// Returns whether the tables were created.
pub fn ensure_schema(conn: &mut Connection) -> Result<bool> {
    let created = if table_exists(conn, "sensor_data")? {
        false
    } else {
        let tx = conn
            .transaction()
            .context("failed to open schema transaction")?;
        tx.execute_batch(include_str!("schemas/sensor_data.sql"))
            .context("failed to execute sensor_data.sql")?;

        let counters: i64 = tx
            .query_row("SELECT COUNT(*) FROM current_id", [], |row| row.get(0))
            .context("failed to inspect current_id")?;
        if counters == 0 {
            tx.execute("INSERT INTO current_id (max_id) VALUES (?1)", params![0i64])
                .context("failed to seed current_id")?;
        }
        tx.commit().context("failed to commit schema")?;
        true
    };

    verify_counter(conn)?;
    Ok(created)
}

fn table_exists(conn: &Connection, name: &str) -> Result<bool> {
    let found: Option<String> = conn
        .query_row(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![name],
            |row| row.get(0),
        )
        .optional()
        .with_context(|| format!("failed to look up table {name}"))?;
    Ok(found.is_some())
}

fn verify_counter(conn: &Connection) -> Result<()> {
    if !table_exists(conn, "current_id")? {
        bail!("sensor_data exists but current_id table is missing");
    }

    let rows: i64 = conn
        .query_row("SELECT COUNT(*) FROM current_id", [], |row| row.get(0))
        .context("failed to count current_id rows")?;
    if rows != 1 {
        bail!("current_id must hold exactly one row, found {rows}");
    }

    let max_id: Option<i64> = conn
        .query_row("SELECT max_id FROM current_id", [], |row| row.get(0))
        .context("failed to read current_id")?;
    match max_id {
        Some(value) if value >= 0 => Ok(()),
        Some(value) => bail!("current_id holds negative value {value}"),
        None => bail!("current_id holds NULL"),
    }
}
