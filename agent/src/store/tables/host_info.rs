//! `host_info` table: single-row-per-host rollup updated by every collector
//! on each successful run, used to serve `GET /stats` without joining
//! across every metric table.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

use crate::store::migration::{Migration, SqlMigration};
use shared::metrics::HostInfo;

pub fn migrations() -> Vec<Box<dyn Migration>> {
    vec![Box::new(SqlMigration {
        id: "host_info_0001_create",
        sql: "
            CREATE TABLE IF NOT EXISTS host_info (
                host TEXT PRIMARY KEY,
                cpu_count INTEGER,
                total_memory_bytes INTEGER,
                network_accounting_enabled INTEGER NOT NULL DEFAULT 0,
                last_network_config_scan INTEGER,
                last_network_usage_scan INTEGER,
                last_cpu_scan INTEGER,
                last_memory_scan INTEGER,
                last_swap_scan INTEGER,
                last_storage_scan INTEGER,
                last_arc_scan INTEGER,
                last_error TEXT
            );
        ",
    })]
}

fn row_to_host_info(row: &rusqlite::Row<'_>) -> rusqlite::Result<HostInfo> {
    Ok(HostInfo {
        host: row.get("host")?,
        cpu_count: row.get::<_, Option<i64>>("cpu_count")?.map(|v| v as u32),
        total_memory_bytes: row.get::<_, Option<i64>>("total_memory_bytes")?.map(|v| v as u64),
        network_accounting_enabled: row.get::<_, i64>("network_accounting_enabled")? != 0,
        last_network_config_scan: row.get("last_network_config_scan")?,
        last_network_usage_scan: row.get("last_network_usage_scan")?,
        last_cpu_scan: row.get("last_cpu_scan")?,
        last_memory_scan: row.get("last_memory_scan")?,
        last_swap_scan: row.get("last_swap_scan")?,
        last_storage_scan: row.get("last_storage_scan")?,
        last_arc_scan: row.get("last_arc_scan")?,
        last_error: row.get("last_error")?,
    })
}

pub fn get(conn: &Connection, host: &str) -> Result<Option<HostInfo>> {
    conn.query_row("SELECT * FROM host_info WHERE host = ?1", params![host], row_to_host_info)
        .optional()
        .context("fetching host info")
}

pub fn upsert(conn: &Connection, info: &HostInfo) -> Result<()> {
    conn.execute(
        "INSERT INTO host_info (
            host, cpu_count, total_memory_bytes, network_accounting_enabled,
            last_network_config_scan, last_network_usage_scan, last_cpu_scan,
            last_memory_scan, last_swap_scan, last_storage_scan, last_arc_scan, last_error
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
        ON CONFLICT(host) DO UPDATE SET
            cpu_count = excluded.cpu_count,
            total_memory_bytes = excluded.total_memory_bytes,
            network_accounting_enabled = excluded.network_accounting_enabled,
            last_network_config_scan = excluded.last_network_config_scan,
            last_network_usage_scan = excluded.last_network_usage_scan,
            last_cpu_scan = excluded.last_cpu_scan,
            last_memory_scan = excluded.last_memory_scan,
            last_swap_scan = excluded.last_swap_scan,
            last_storage_scan = excluded.last_storage_scan,
            last_arc_scan = excluded.last_arc_scan,
            last_error = excluded.last_error",
        params![
            info.host,
            info.cpu_count,
            info.total_memory_bytes.map(|v| v as i64),
            info.network_accounting_enabled as i64,
            info.last_network_config_scan,
            info.last_network_usage_scan,
            info.last_cpu_scan,
            info.last_memory_scan,
            info.last_swap_scan,
            info.last_storage_scan,
            info.last_arc_scan,
            info.last_error,
        ],
    )
    .context("upserting host info")?;
    Ok(())
}

/// Mark a collection attempt's outcome: bump the relevant `last_*_scan`
/// timestamp on success, or record `last_error` without touching the scan
/// timestamps on failure (so a stats consumer can tell staleness from error).
pub fn record_scan_outcome(
    conn: &Connection,
    host: &str,
    column: &str,
    now: i64,
    error: Option<&str>,
) -> Result<()> {
    upsert_if_missing(conn, host)?;

    if let Some(error) = error {
        conn.execute(
            "UPDATE host_info SET last_error = ?2 WHERE host = ?1",
            params![host, error],
        )?;
        return Ok(());
    }

    let sql = format!("UPDATE host_info SET {column} = ?2, last_error = NULL WHERE host = ?1");
    conn.execute(&sql, params![host, now])
        .with_context(|| format!("recording scan outcome for column {column}"))?;
    Ok(())
}

fn upsert_if_missing(conn: &Connection, host: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO host_info (host, network_accounting_enabled) VALUES (?1, 0)
         ON CONFLICT(host) DO NOTHING",
        params![host],
    )
    .context("ensuring host_info row exists")?;
    Ok(())
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
    fn upsert_then_get_round_trips() {
        let conn = test_conn();
        let info = HostInfo {
            cpu_count: Some(16),
            total_memory_bytes: Some(64 * 1024 * 1024 * 1024),
            ..HostInfo::new("hv01")
        };
        upsert(&conn, &info).unwrap();
        let fetched = get(&conn, "hv01").unwrap().unwrap();
        assert_eq!(fetched.cpu_count, Some(16));
    }

    #[test]
    fn record_scan_outcome_bumps_only_named_column() {
        let conn = test_conn();
        record_scan_outcome(&conn, "hv01", "last_cpu_scan", 1000, None).unwrap();
        let info = get(&conn, "hv01").unwrap().unwrap();
        assert_eq!(info.last_cpu_scan, Some(1000));
        assert_eq!(info.last_memory_scan, None);
    }

    #[test]
    fn record_scan_outcome_with_error_leaves_timestamp_untouched() {
        let conn = test_conn();
        record_scan_outcome(&conn, "hv01", "last_cpu_scan", 1000, None).unwrap();
        record_scan_outcome(&conn, "hv01", "last_cpu_scan", 2000, Some("dladm timed out")).unwrap();
        let info = get(&conn, "hv01").unwrap().unwrap();
        assert_eq!(info.last_cpu_scan, Some(1000));
        assert_eq!(info.last_error.as_deref(), Some("dladm timed out"));
    }
}
