//! `zones` table: last-observed state of every illumos branded/bhyve zone.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use shared::zone::{Zone, ZoneBrand, ZoneStatus};

use crate::store::migration::{Migration, SqlMigration};

pub fn migrations() -> Vec<Box<dyn Migration>> {
    vec![Box::new(SqlMigration {
        id: "zones_0001_create",
        sql: "
            CREATE TABLE IF NOT EXISTS zones (
                name TEXT PRIMARY KEY,
                zone_id TEXT NOT NULL,
                host TEXT NOT NULL,
                brand TEXT NOT NULL,
                status TEXT NOT NULL,
                zonepath TEXT NOT NULL,
                configuration TEXT NOT NULL,
                is_orphaned INTEGER NOT NULL DEFAULT 0,
                auto_discovered INTEGER NOT NULL DEFAULT 0,
                last_seen INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_zones_host ON zones (host);
        ",
    })]
}

fn row_to_zone(row: &Row<'_>) -> rusqlite::Result<Zone> {
    let brand: String = row.get("brand")?;
    let status: String = row.get("status")?;
    let configuration: String = row.get("configuration")?;

    Ok(Zone {
        name: row.get("name")?,
        zone_id: row.get("zone_id")?,
        host: row.get("host")?,
        brand: ZoneBrand::from_str(&brand),
        status: ZoneStatus::from_str(&status)
            .map_err(|e| rusqlite::Error::InvalidColumnType(0, e.to_string(), rusqlite::types::Type::Text))?,
        zonepath: row.get("zonepath")?,
        configuration: serde_json::from_str(&configuration)
            .map_err(|e| rusqlite::Error::InvalidColumnType(0, e.to_string(), rusqlite::types::Type::Text))?,
        is_orphaned: row.get::<_, i64>("is_orphaned")? != 0,
        auto_discovered: row.get::<_, i64>("auto_discovered")? != 0,
        last_seen: row.get("last_seen")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

pub fn upsert_zone(conn: &Connection, zone: &Zone) -> Result<()> {
    let configuration =
        serde_json::to_string(&zone.configuration).context("serializing zone configuration")?;

    conn.execute(
        "INSERT INTO zones (
            name, zone_id, host, brand, status, zonepath, configuration,
            is_orphaned, auto_discovered, last_seen, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)
        ON CONFLICT(name) DO UPDATE SET
            zone_id = excluded.zone_id,
            host = excluded.host,
            brand = excluded.brand,
            status = excluded.status,
            zonepath = excluded.zonepath,
            configuration = excluded.configuration,
            is_orphaned = excluded.is_orphaned,
            auto_discovered = excluded.auto_discovered,
            last_seen = excluded.last_seen,
            updated_at = excluded.last_seen",
        params![
            zone.name,
            zone.zone_id,
            zone.host,
            zone.brand.as_str(),
            zone.status.as_str(),
            zone.zonepath,
            configuration,
            zone.is_orphaned as i64,
            zone.auto_discovered as i64,
            zone.last_seen,
            zone.created_at,
        ],
    )
    .context("upserting zone")?;
    Ok(())
}

pub fn get_zone(conn: &Connection, name: &str) -> Result<Option<Zone>> {
    conn.query_row("SELECT * FROM zones WHERE name = ?1", params![name], row_to_zone)
        .optional()
        .context("fetching zone by name")
}

pub fn list_zones(conn: &Connection) -> Result<Vec<Zone>> {
    let mut stmt = conn.prepare("SELECT * FROM zones ORDER BY name ASC")?;
    let rows = stmt
        .query_map([], row_to_zone)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .context("listing zones")?;
    Ok(rows)
}

/// Patch `configuration` and/or `status`/`last_seen` without touching the
/// rest of the row. Used by `PUT /zones/{name}` (I6: a bare `provisioning`
/// replacement never queues a task) and by the discovery scan's status
/// refresh (I5).
pub fn update_zone_fields(
    conn: &Connection,
    name: &str,
    configuration: Option<&serde_json::Value>,
    status: Option<ZoneStatus>,
    now: i64,
) -> Result<()> {
    if let Some(configuration) = configuration {
        let json = serde_json::to_string(configuration)?;
        conn.execute(
            "UPDATE zones SET configuration = ?2, updated_at = ?3 WHERE name = ?1",
            params![name, json, now],
        )?;
    }
    if let Some(status) = status {
        conn.execute(
            "UPDATE zones SET status = ?2, last_seen = ?3, updated_at = ?3 WHERE name = ?1",
            params![name, status.as_str(), now],
        )?;
    }
    Ok(())
}

/// Mark every zone not present in `seen_names` as orphaned (I5): the host no
/// longer reports it, but the audit record persists.
pub fn mark_missing_as_orphaned(conn: &Connection, seen_names: &[String], now: i64) -> Result<u64> {
    let mut stmt = conn.prepare("SELECT name FROM zones WHERE is_orphaned = 0")?;
    let known: Vec<String> = stmt
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut marked = 0u64;
    for name in known {
        if !seen_names.contains(&name) {
            conn.execute(
                "UPDATE zones SET is_orphaned = 1, updated_at = ?2 WHERE name = ?1",
                params![name, now],
            )?;
            marked += 1;
        }
    }
    Ok(marked)
}

pub fn delete_zone(conn: &Connection, name: &str) -> Result<()> {
    conn.execute("DELETE FROM zones WHERE name = ?1", params![name])
        .context("deleting zone")?;
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

    fn sample_zone() -> Zone {
        Zone {
            name: "vm-a".to_string(),
            zone_id: "5".to_string(),
            host: "hv01".to_string(),
            brand: ZoneBrand::Bhyve,
            status: ZoneStatus::Installed,
            zonepath: "/zones/vm-a".to_string(),
            configuration: serde_json::json!({}),
            is_orphaned: false,
            auto_discovered: false,
            last_seen: 1000,
            created_at: 1000,
            updated_at: 1000,
        }
    }

    #[test]
    fn upsert_then_get_round_trips() {
        let conn = test_conn();
        upsert_zone(&conn, &sample_zone()).unwrap();
        let zone = get_zone(&conn, "vm-a").unwrap().unwrap();
        assert_eq!(zone.brand, ZoneBrand::Bhyve);
        assert_eq!(zone.status, ZoneStatus::Installed);
    }

    #[test]
    fn upsert_is_idempotent_and_updates_fields() {
        let conn = test_conn();
        let mut zone = sample_zone();
        upsert_zone(&conn, &zone).unwrap();
        zone.status = ZoneStatus::Running;
        zone.last_seen = 2000;
        upsert_zone(&conn, &zone).unwrap();

        assert_eq!(list_zones(&conn).unwrap().len(), 1);
        let zone = get_zone(&conn, "vm-a").unwrap().unwrap();
        assert_eq!(zone.status, ZoneStatus::Running);
    }

    #[test]
    fn missing_zones_are_marked_orphaned_not_deleted() {
        let conn = test_conn();
        upsert_zone(&conn, &sample_zone()).unwrap();
        let marked = mark_missing_as_orphaned(&conn, &[], 2000).unwrap();
        assert_eq!(marked, 1);
        let zone = get_zone(&conn, "vm-a").unwrap().unwrap();
        assert!(zone.is_orphaned);
    }

    #[test]
    fn seen_zones_are_not_marked_orphaned() {
        let conn = test_conn();
        upsert_zone(&conn, &sample_zone()).unwrap();
        mark_missing_as_orphaned(&conn, &["vm-a".to_string()], 2000).unwrap();
        let zone = get_zone(&conn, "vm-a").unwrap().unwrap();
        assert!(!zone.is_orphaned);
    }
}
