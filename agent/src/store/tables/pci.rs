//! `pci_devices` table: current-state PCI device inventory.

use anyhow::{Context, Result};
use rusqlite::{params, Connection};

use crate::store::migration::{Migration, SqlMigration};
use shared::metrics::PciDevice;

pub fn migrations() -> Vec<Box<dyn Migration>> {
    vec![Box::new(SqlMigration {
        id: "pci_devices_0001_create",
        sql: "
            CREATE TABLE IF NOT EXISTS pci_devices (
                host TEXT NOT NULL,
                slot TEXT NOT NULL,
                vendor_id TEXT,
                device_id TEXT,
                description TEXT,
                scan_timestamp INTEGER NOT NULL,
                PRIMARY KEY (host, slot)
            );
        ",
    })]
}

pub fn replace_devices(conn: &Connection, host: &str, rows: &[PciDevice]) -> Result<()> {
    conn.execute("DELETE FROM pci_devices WHERE host = ?1", params![host])?;
    for row in rows {
        conn.execute(
            "INSERT INTO pci_devices (host, slot, vendor_id, device_id, description, scan_timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![row.host, row.slot, row.vendor_id, row.device_id, row.description, row.scan_timestamp],
        )
        .context("inserting pci device")?;
    }
    Ok(())
}

pub fn list_devices(conn: &Connection, host: &str) -> Result<Vec<PciDevice>> {
    let mut stmt = conn.prepare(
        "SELECT host, slot, vendor_id, device_id, description, scan_timestamp
         FROM pci_devices WHERE host = ?1 ORDER BY slot ASC",
    )?;
    let rows = stmt
        .query_map(params![host], |row| {
            Ok(PciDevice {
                host: row.get(0)?,
                slot: row.get(1)?,
                vendor_id: row.get(2)?,
                device_id: row.get(3)?,
                description: row.get(4)?,
                scan_timestamp: row.get(5)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
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
    fn devices_replaced_wholesale_per_host() {
        let conn = test_conn();
        replace_devices(
            &conn,
            "hv01",
            &[PciDevice {
                host: "hv01".into(),
                slot: "0/0/0".into(),
                vendor_id: Some("8086".into()),
                device_id: Some("1533".into()),
                description: Some("I210 Gigabit".into()),
                scan_timestamp: 1000,
            }],
        )
        .unwrap();
        assert_eq!(list_devices(&conn, "hv01").unwrap().len(), 1);
        replace_devices(&conn, "hv01", &[]).unwrap();
        assert!(list_devices(&conn, "hv01").unwrap().is_empty());
    }
}
