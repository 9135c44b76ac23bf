//! `swap_areas` table: per-device/file swap usage time series. Current-state
//! identity is `(host, swapfile)`, but rows are append-only like the other
//! time-series tables so historical trend queries stay possible.

use anyhow::{Context, Result};
use rusqlite::{params, Connection};

use crate::store::migration::{Migration, SqlMigration};
use shared::metrics::SwapArea;

pub fn migrations() -> Vec<Box<dyn Migration>> {
    vec![Box::new(SqlMigration {
        id: "swap_areas_0001_create",
        sql: "
            CREATE TABLE IF NOT EXISTS swap_areas (
                host TEXT NOT NULL,
                swapfile TEXT NOT NULL,
                total_bytes INTEGER NOT NULL,
                free_bytes INTEGER NOT NULL,
                scan_timestamp INTEGER NOT NULL,
                PRIMARY KEY (host, swapfile, scan_timestamp)
            );
            CREATE INDEX IF NOT EXISTS idx_swap_areas_scan ON swap_areas (scan_timestamp);
        ",
    })]
}

pub fn insert_samples(conn: &Connection, rows: &[SwapArea]) -> Result<()> {
    for row in rows {
        conn.execute(
            "INSERT INTO swap_areas (host, swapfile, total_bytes, free_bytes, scan_timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (host, swapfile, scan_timestamp) DO NOTHING",
            params![row.host, row.swapfile, row.total_bytes as i64, row.free_bytes as i64, row.scan_timestamp],
        )
        .context("inserting swap area sample")?;
    }
    Ok(())
}

pub fn latest_samples(conn: &Connection, host: &str) -> Result<Vec<SwapArea>> {
    let latest_ts: Option<i64> = conn.query_row(
        "SELECT MAX(scan_timestamp) FROM swap_areas WHERE host = ?1",
        params![host],
        |row| row.get(0),
    )?;
    let Some(ts) = latest_ts else { return Ok(vec![]) };

    let mut stmt = conn.prepare(
        "SELECT host, swapfile, total_bytes, free_bytes, scan_timestamp
         FROM swap_areas WHERE host = ?1 AND scan_timestamp = ?2 ORDER BY swapfile ASC",
    )?;
    let rows = stmt
        .query_map(params![host, ts], |row| {
            Ok(SwapArea {
                host: row.get(0)?,
                swapfile: row.get(1)?,
                total_bytes: row.get::<_, i64>(2)? as u64,
                free_bytes: row.get::<_, i64>(3)? as u64,
                scan_timestamp: row.get(4)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub fn cleanup_older_than(conn: &Connection, cutoff: i64) -> Result<u64> {
    Ok(conn.execute("DELETE FROM swap_areas WHERE scan_timestamp < ?1", params![cutoff])? as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::migration::MigrationRunner;

    fn test_conn() -> Connection {
        let mut conn = Connection::open_in_memory().unwrap();
        let mut runner = MigrationRunner::new();
        for m in migrations() {
            runner = runner.register(m);
        }
        runner.run(&mut conn).unwrap();
        conn
    }

    #[test]
    fn latest_samples_groups_by_newest_scan() {
        let conn = test_conn();
        insert_samples(
            &conn,
            &[SwapArea {
                host: "hv01".into(),
                swapfile: "/dev/zvol/dsk/rpool/swap".into(),
                total_bytes: 2_000_000,
                free_bytes: 2_000_000,
                scan_timestamp: 100,
            }],
        )
        .unwrap();
        insert_samples(
            &conn,
            &[SwapArea {
                host: "hv01".into(),
                swapfile: "/dev/zvol/dsk/rpool/swap".into(),
                total_bytes: 2_000_000,
                free_bytes: 1_500_000,
                scan_timestamp: 200,
            }],
        )
        .unwrap();

        let latest = latest_samples(&conn, "hv01").unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].free_bytes, 1_500_000);
    }
}
