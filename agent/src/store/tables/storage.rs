//! Storage domain tables: `disks` and `zfs_datasets` (current-state),
//! `disk_io_stats` and `pool_io_stats` (append-only throughput time series).

use anyhow::{Context, Result};
use rusqlite::{params, Connection};

use crate::store::migration::{Migration, SqlMigration};
use shared::metrics::{Disk, DiskIoStats, PoolIoStats, ZfsDataset};

pub fn migrations() -> Vec<Box<dyn Migration>> {
    vec![Box::new(SqlMigration {
        id: "storage_0001_create",
        sql: "
            CREATE TABLE IF NOT EXISTS disks (
                host TEXT NOT NULL,
                device TEXT NOT NULL,
                vendor TEXT,
                size_bytes INTEGER,
                media_type TEXT,
                scan_timestamp INTEGER NOT NULL,
                PRIMARY KEY (host, device)
            );
            CREATE TABLE IF NOT EXISTS zfs_datasets (
                host TEXT NOT NULL,
                dataset TEXT NOT NULL,
                used_bytes INTEGER,
                available_bytes INTEGER,
                mountpoint TEXT,
                scan_timestamp INTEGER NOT NULL,
                PRIMARY KEY (host, dataset)
            );
            CREATE TABLE IF NOT EXISTS disk_io_stats (
                host TEXT NOT NULL,
                device TEXT NOT NULL,
                reads_per_sec REAL NOT NULL,
                writes_per_sec REAL NOT NULL,
                read_bytes_per_sec REAL NOT NULL,
                write_bytes_per_sec REAL NOT NULL,
                wait_queue_depth REAL,
                scan_timestamp INTEGER NOT NULL,
                PRIMARY KEY (host, device, scan_timestamp)
            );
            CREATE TABLE IF NOT EXISTS pool_io_stats (
                host TEXT NOT NULL,
                pool TEXT NOT NULL,
                reads_per_sec REAL NOT NULL,
                writes_per_sec REAL NOT NULL,
                read_bytes_per_sec REAL NOT NULL,
                write_bytes_per_sec REAL NOT NULL,
                scan_timestamp INTEGER NOT NULL,
                PRIMARY KEY (host, pool, scan_timestamp)
            );
            CREATE INDEX IF NOT EXISTS idx_disk_io_stats_scan ON disk_io_stats (scan_timestamp);
            CREATE INDEX IF NOT EXISTS idx_pool_io_stats_scan ON pool_io_stats (scan_timestamp);
        ",
    })]
}

pub fn replace_disks(conn: &Connection, host: &str, rows: &[Disk]) -> Result<()> {
    conn.execute("DELETE FROM disks WHERE host = ?1", params![host])?;
    for row in rows {
        conn.execute(
            "INSERT INTO disks (host, device, vendor, size_bytes, media_type, scan_timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![row.host, row.device, row.vendor, row.size_bytes.map(|v| v as i64), row.media_type, row.scan_timestamp],
        )
        .context("inserting disk")?;
    }
    Ok(())
}

pub fn replace_zfs_datasets(conn: &Connection, host: &str, rows: &[ZfsDataset]) -> Result<()> {
    conn.execute("DELETE FROM zfs_datasets WHERE host = ?1", params![host])?;
    for row in rows {
        conn.execute(
            "INSERT INTO zfs_datasets (host, dataset, used_bytes, available_bytes, mountpoint, scan_timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                row.host, row.dataset, row.used_bytes.map(|v| v as i64),
                row.available_bytes.map(|v| v as i64), row.mountpoint, row.scan_timestamp
            ],
        )
        .context("inserting zfs dataset")?;
    }
    Ok(())
}

pub fn insert_disk_io_samples(conn: &Connection, rows: &[DiskIoStats]) -> Result<()> {
    for row in rows {
        conn.execute(
            "INSERT INTO disk_io_stats (host, device, reads_per_sec, writes_per_sec,
                read_bytes_per_sec, write_bytes_per_sec, wait_queue_depth, scan_timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT (host, device, scan_timestamp) DO NOTHING",
            params![
                row.host, row.device, row.reads_per_sec, row.writes_per_sec,
                row.read_bytes_per_sec, row.write_bytes_per_sec, row.wait_queue_depth, row.scan_timestamp
            ],
        )
        .context("inserting disk io sample")?;
    }
    Ok(())
}

pub fn insert_pool_io_samples(conn: &Connection, rows: &[PoolIoStats]) -> Result<()> {
    for row in rows {
        conn.execute(
            "INSERT INTO pool_io_stats (host, pool, reads_per_sec, writes_per_sec,
                read_bytes_per_sec, write_bytes_per_sec, scan_timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT (host, pool, scan_timestamp) DO NOTHING",
            params![
                row.host, row.pool, row.reads_per_sec, row.writes_per_sec,
                row.read_bytes_per_sec, row.write_bytes_per_sec, row.scan_timestamp
            ],
        )
        .context("inserting pool io sample")?;
    }
    Ok(())
}

pub fn list_disks(conn: &Connection, host: &str) -> Result<Vec<Disk>> {
    let mut stmt = conn.prepare(
        "SELECT host, device, vendor, size_bytes, media_type, scan_timestamp
         FROM disks WHERE host = ?1 ORDER BY device ASC",
    )?;
    let rows = stmt
        .query_map(params![host], |row| {
            Ok(Disk {
                host: row.get(0)?,
                device: row.get(1)?,
                vendor: row.get(2)?,
                size_bytes: row.get::<_, Option<i64>>(3)?.map(|v| v as u64),
                media_type: row.get(4)?,
                scan_timestamp: row.get(5)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub fn list_zfs_datasets(conn: &Connection, host: &str) -> Result<Vec<ZfsDataset>> {
    let mut stmt = conn.prepare(
        "SELECT host, dataset, used_bytes, available_bytes, mountpoint, scan_timestamp
         FROM zfs_datasets WHERE host = ?1 ORDER BY dataset ASC",
    )?;
    let rows = stmt
        .query_map(params![host], |row| {
            Ok(ZfsDataset {
                host: row.get(0)?,
                dataset: row.get(1)?,
                used_bytes: row.get::<_, Option<i64>>(2)?.map(|v| v as u64),
                available_bytes: row.get::<_, Option<i64>>(3)?.map(|v| v as u64),
                mountpoint: row.get(4)?,
                scan_timestamp: row.get(5)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub fn cleanup_older_than(conn: &Connection, cutoff: i64) -> Result<u64> {
    let disk_io = conn.execute("DELETE FROM disk_io_stats WHERE scan_timestamp < ?1", params![cutoff])?;
    let pool_io = conn.execute("DELETE FROM pool_io_stats WHERE scan_timestamp < ?1", params![cutoff])?;
    Ok((disk_io + pool_io) as u64)
}
