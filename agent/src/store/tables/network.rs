//! Network domain tables: `network_interfaces`, `ip_addresses` and
//! `routing_table` (current-state, replaced wholesale each scan) plus
//! `network_usage` (append-only time series with §4.6.2 deltas).

use anyhow::{Context, Result};
use rusqlite::{params, Connection, Row};

use crate::store::migration::{Migration, SqlMigration};
use shared::metrics::{IpAddress, NetworkInterface, NetworkUsage, RoutingTableEntry};

pub fn migrations() -> Vec<Box<dyn Migration>> {
    vec![Box::new(SqlMigration {
        id: "network_0001_create",
        sql: "
            CREATE TABLE IF NOT EXISTS network_interfaces (
                host TEXT NOT NULL,
                link TEXT NOT NULL,
                class TEXT NOT NULL,
                state TEXT NOT NULL,
                over TEXT,
                speed_mbps REAL,
                mtu INTEGER,
                mac_address TEXT,
                scan_timestamp INTEGER NOT NULL,
                PRIMARY KEY (host, link)
            );
            CREATE TABLE IF NOT EXISTS ip_addresses (
                host TEXT NOT NULL,
                interface TEXT NOT NULL,
                address TEXT NOT NULL,
                address_type TEXT NOT NULL,
                state TEXT NOT NULL,
                scan_timestamp INTEGER NOT NULL,
                PRIMARY KEY (host, interface, address)
            );
            CREATE TABLE IF NOT EXISTS routing_table (
                host TEXT NOT NULL,
                destination TEXT NOT NULL,
                gateway TEXT NOT NULL,
                interface TEXT,
                flags TEXT,
                scan_timestamp INTEGER NOT NULL,
                PRIMARY KEY (host, destination, gateway)
            );
            CREATE TABLE IF NOT EXISTS network_usage (
                host TEXT NOT NULL,
                link TEXT NOT NULL,
                rbytes INTEGER NOT NULL,
                obytes INTEGER NOT NULL,
                ipackets INTEGER NOT NULL,
                opackets INTEGER NOT NULL,
                ierrors INTEGER NOT NULL,
                oerrors INTEGER NOT NULL,
                rbytes_delta INTEGER,
                obytes_delta INTEGER,
                rx_bps REAL,
                tx_bps REAL,
                rx_mbps REAL,
                tx_mbps REAL,
                rx_utilization_pct REAL,
                tx_utilization_pct REAL,
                scan_timestamp INTEGER NOT NULL,
                PRIMARY KEY (host, link, scan_timestamp)
            );
            CREATE INDEX IF NOT EXISTS idx_network_usage_scan ON network_usage (scan_timestamp);
        ",
    })]
}

pub fn replace_interfaces(conn: &Connection, host: &str, rows: &[NetworkInterface]) -> Result<()> {
    conn.execute("DELETE FROM network_interfaces WHERE host = ?1", params![host])?;
    for row in rows {
        conn.execute(
            "INSERT INTO network_interfaces
                (host, link, class, state, over, speed_mbps, mtu, mac_address, scan_timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                row.host, row.link, row.class, row.state, row.over, row.speed_mbps, row.mtu,
                row.mac_address, row.scan_timestamp
            ],
        )
        .context("inserting network interface")?;
    }
    Ok(())
}

pub fn replace_ip_addresses(conn: &Connection, host: &str, rows: &[IpAddress]) -> Result<()> {
    conn.execute("DELETE FROM ip_addresses WHERE host = ?1", params![host])?;
    for row in rows {
        conn.execute(
            "INSERT INTO ip_addresses (host, interface, address, address_type, state, scan_timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![row.host, row.interface, row.address, row.address_type, row.state, row.scan_timestamp],
        )
        .context("inserting ip address")?;
    }
    Ok(())
}

pub fn replace_routing_table(conn: &Connection, host: &str, rows: &[RoutingTableEntry]) -> Result<()> {
    conn.execute("DELETE FROM routing_table WHERE host = ?1", params![host])?;
    for row in rows {
        conn.execute(
            "INSERT INTO routing_table (host, destination, gateway, interface, flags, scan_timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![row.host, row.destination, row.gateway, row.interface, row.flags, row.scan_timestamp],
        )
        .context("inserting routing table entry")?;
    }
    Ok(())
}

pub fn list_interfaces(conn: &Connection, host: &str) -> Result<Vec<NetworkInterface>> {
    let mut stmt = conn.prepare(
        "SELECT host, link, class, state, over, speed_mbps, mtu, mac_address, scan_timestamp
         FROM network_interfaces WHERE host = ?1 ORDER BY link ASC",
    )?;
    let rows = stmt
        .query_map(params![host], |row: &Row<'_>| {
            Ok(NetworkInterface {
                host: row.get(0)?,
                link: row.get(1)?,
                class: row.get(2)?,
                state: row.get(3)?,
                over: row.get(4)?,
                speed_mbps: row.get(5)?,
                mtu: row.get(6)?,
                mac_address: row.get(7)?,
                scan_timestamp: row.get(8)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Latest two rx/tx counter samples for `(host, link)`, newest first —
/// exactly what `compute_network_delta` needs as `current`/`previous`.
pub fn latest_counters(
    conn: &Connection,
    host: &str,
    link: &str,
) -> Result<Vec<(u64, u64, i64)>> {
    let mut stmt = conn.prepare(
        "SELECT rbytes, obytes, scan_timestamp FROM network_usage
         WHERE host = ?1 AND link = ?2 ORDER BY scan_timestamp DESC LIMIT 2",
    )?;
    let rows = stmt
        .query_map(params![host, link], |row| {
            Ok((
                row.get::<_, i64>(0)? as u64,
                row.get::<_, i64>(1)? as u64,
                row.get::<_, i64>(2)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

#[allow(clippy::too_many_arguments)]
pub fn insert_usage_sample(conn: &Connection, row: &NetworkUsage) -> Result<()> {
    conn.execute(
        "INSERT INTO network_usage (
            host, link, rbytes, obytes, ipackets, opackets, ierrors, oerrors,
            rbytes_delta, obytes_delta, rx_bps, tx_bps, rx_mbps, tx_mbps,
            rx_utilization_pct, tx_utilization_pct, scan_timestamp
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
        ON CONFLICT (host, link, scan_timestamp) DO NOTHING",
        params![
            row.host,
            row.link,
            row.rbytes as i64,
            row.obytes as i64,
            row.ipackets as i64,
            row.opackets as i64,
            row.ierrors as i64,
            row.oerrors as i64,
            row.rbytes_delta.map(|v| v as i64),
            row.obytes_delta.map(|v| v as i64),
            row.rx_bps,
            row.tx_bps,
            row.rx_mbps,
            row.tx_mbps,
            row.rx_utilization_pct,
            row.tx_utilization_pct,
            row.scan_timestamp,
        ],
    )
    .context("inserting network usage sample")?;
    Ok(())
}

pub fn cleanup_usage_older_than(conn: &Connection, cutoff: i64) -> Result<u64> {
    let deleted = conn.execute("DELETE FROM network_usage WHERE scan_timestamp < ?1", params![cutoff])?;
    Ok(deleted as u64)
}
