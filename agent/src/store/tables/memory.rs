//! `memory_stats` table: append-only host memory usage time series.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

use crate::store::migration::{Migration, SqlMigration};
use shared::metrics::MemoryStats;

pub fn migrations() -> Vec<Box<dyn Migration>> {
    vec![Box::new(SqlMigration {
        id: "memory_stats_0001_create",
        sql: "
            CREATE TABLE IF NOT EXISTS memory_stats (
                host TEXT NOT NULL,
                total_bytes INTEGER NOT NULL,
                free_bytes INTEGER NOT NULL,
                used_bytes INTEGER NOT NULL,
                cached_bytes INTEGER,
                scan_timestamp INTEGER NOT NULL,
                PRIMARY KEY (host, scan_timestamp)
            );
            CREATE INDEX IF NOT EXISTS idx_memory_stats_scan ON memory_stats (scan_timestamp);
        ",
    })]
}

pub fn insert_sample(conn: &Connection, row: &MemoryStats) -> Result<()> {
    conn.execute(
        "INSERT INTO memory_stats (host, total_bytes, free_bytes, used_bytes, cached_bytes, scan_timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT (host, scan_timestamp) DO NOTHING",
        params![
            row.host,
            row.total_bytes as i64,
            row.free_bytes as i64,
            row.used_bytes as i64,
            row.cached_bytes.map(|v| v as i64),
            row.scan_timestamp,
        ],
    )
    .context("inserting memory stats sample")?;
    Ok(())
}

pub fn latest_sample(conn: &Connection, host: &str) -> Result<Option<MemoryStats>> {
    conn.query_row(
        "SELECT host, total_bytes, free_bytes, used_bytes, cached_bytes, scan_timestamp
         FROM memory_stats WHERE host = ?1 ORDER BY scan_timestamp DESC LIMIT 1",
        params![host],
        |row| {
            Ok(MemoryStats {
                host: row.get(0)?,
                total_bytes: row.get::<_, i64>(1)? as u64,
                free_bytes: row.get::<_, i64>(2)? as u64,
                used_bytes: row.get::<_, i64>(3)? as u64,
                cached_bytes: row.get::<_, Option<i64>>(4)?.map(|v| v as u64),
                scan_timestamp: row.get(5)?,
            })
        },
    )
    .optional()
    .context("fetching latest memory stats sample")
}

pub fn cleanup_older_than(conn: &Connection, cutoff: i64) -> Result<u64> {
    Ok(conn.execute("DELETE FROM memory_stats WHERE scan_timestamp < ?1", params![cutoff])? as u64)
}
