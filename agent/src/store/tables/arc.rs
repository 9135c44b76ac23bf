//! `arc_stats` table: ZFS ARC size/hit-ratio time series.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

use crate::store::migration::{Migration, SqlMigration};
use shared::metrics::ArcStats;

pub fn migrations() -> Vec<Box<dyn Migration>> {
    vec![Box::new(SqlMigration {
        id: "arc_stats_0001_create",
        sql: "
            CREATE TABLE IF NOT EXISTS arc_stats (
                host TEXT NOT NULL,
                arc_size_bytes INTEGER NOT NULL,
                target_size_bytes INTEGER NOT NULL,
                hit_ratio_pct REAL,
                scan_timestamp INTEGER NOT NULL,
                PRIMARY KEY (host, scan_timestamp)
            );
            CREATE INDEX IF NOT EXISTS idx_arc_stats_scan ON arc_stats (scan_timestamp);
        ",
    })]
}

pub fn insert_sample(conn: &Connection, row: &ArcStats) -> Result<()> {
    conn.execute(
        "INSERT INTO arc_stats (host, arc_size_bytes, target_size_bytes, hit_ratio_pct, scan_timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT (host, scan_timestamp) DO NOTHING",
        params![row.host, row.arc_size_bytes as i64, row.target_size_bytes as i64, row.hit_ratio_pct, row.scan_timestamp],
    )
    .context("inserting arc stats sample")?;
    Ok(())
}

pub fn latest_sample(conn: &Connection, host: &str) -> Result<Option<ArcStats>> {
    conn.query_row(
        "SELECT host, arc_size_bytes, target_size_bytes, hit_ratio_pct, scan_timestamp
         FROM arc_stats WHERE host = ?1 ORDER BY scan_timestamp DESC LIMIT 1",
        params![host],
        |row| {
            Ok(ArcStats {
                host: row.get(0)?,
                arc_size_bytes: row.get::<_, i64>(1)? as u64,
                target_size_bytes: row.get::<_, i64>(2)? as u64,
                hit_ratio_pct: row.get(3)?,
                scan_timestamp: row.get(4)?,
            })
        },
    )
    .optional()
    .context("fetching latest arc stats sample")
}

pub fn cleanup_older_than(conn: &Connection, cutoff: i64) -> Result<u64> {
    Ok(conn.execute("DELETE FROM arc_stats WHERE scan_timestamp < ?1", params![cutoff])? as u64)
}
