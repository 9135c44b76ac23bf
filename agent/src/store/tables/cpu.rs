//! `cpu_stats` table: append-only per-core utilization time series.

use anyhow::{Context, Result};
use rusqlite::{params, Connection};

use crate::store::migration::{Migration, SqlMigration};
use shared::metrics::CpuStats;

pub fn migrations() -> Vec<Box<dyn Migration>> {
    vec![Box::new(SqlMigration {
        id: "cpu_stats_0001_create",
        sql: "
            CREATE TABLE IF NOT EXISTS cpu_stats (
                host TEXT NOT NULL,
                core_id INTEGER NOT NULL,
                user_pct REAL NOT NULL,
                system_pct REAL NOT NULL,
                idle_pct REAL NOT NULL,
                scan_timestamp INTEGER NOT NULL,
                PRIMARY KEY (host, core_id, scan_timestamp)
            );
            CREATE INDEX IF NOT EXISTS idx_cpu_stats_scan ON cpu_stats (scan_timestamp);
        ",
    })]
}

pub fn insert_samples(conn: &Connection, rows: &[CpuStats]) -> Result<()> {
    for row in rows {
        conn.execute(
            "INSERT INTO cpu_stats (host, core_id, user_pct, system_pct, idle_pct, scan_timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (host, core_id, scan_timestamp) DO NOTHING",
            params![row.host, row.core_id, row.user_pct, row.system_pct, row.idle_pct, row.scan_timestamp],
        )
        .context("inserting cpu stats sample")?;
    }
    Ok(())
}

pub fn latest_samples(conn: &Connection, host: &str) -> Result<Vec<CpuStats>> {
    // `MAX()` over zero rows still yields exactly one row with a NULL
    // column, so this is a plain `query_row`, not `.optional()`.
    let latest_ts: Option<i64> = conn
        .query_row(
            "SELECT MAX(scan_timestamp) FROM cpu_stats WHERE host = ?1",
            params![host],
            |row| row.get(0),
        )
        .context("fetching latest cpu scan timestamp")?;
    let Some(ts) = latest_ts else { return Ok(vec![]) };

    let mut stmt = conn.prepare(
        "SELECT host, core_id, user_pct, system_pct, idle_pct, scan_timestamp
         FROM cpu_stats WHERE host = ?1 AND scan_timestamp = ?2 ORDER BY core_id ASC",
    )?;
    let rows = stmt
        .query_map(params![host, ts], |row| {
            Ok(CpuStats {
                host: row.get(0)?,
                core_id: row.get(1)?,
                user_pct: row.get(2)?,
                system_pct: row.get(3)?,
                idle_pct: row.get(4)?,
                scan_timestamp: row.get(5)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub fn cleanup_older_than(conn: &Connection, cutoff: i64) -> Result<u64> {
    Ok(conn.execute("DELETE FROM cpu_stats WHERE scan_timestamp < ?1", params![cutoff])? as u64)
}
