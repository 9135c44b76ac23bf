//! `console_sessions` table: one row per zone's `zlogin -C` PTY session.
//!
//! `session_buffer` persists the last `console.persisted_lines` bytes of
//! output so a subscriber reconnecting after an agent restart still gets
//! scrollback (see the Console Multiplexer design notes).

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use shared::console::{ConsoleSession, ConsoleSessionStatus};

use crate::store::migration::{Migration, SqlMigration};

pub fn migrations() -> Vec<Box<dyn Migration>> {
    vec![Box::new(SqlMigration {
        id: "console_sessions_0001_create",
        sql: "
            CREATE TABLE IF NOT EXISTS console_sessions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                zone_name TEXT NOT NULL,
                status TEXT NOT NULL,
                pid INTEGER,
                session_buffer BLOB NOT NULL DEFAULT '',
                started_at INTEGER NOT NULL,
                ended_at INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_console_sessions_zone
                ON console_sessions (zone_name, status);
        ",
    })]
}

fn row_to_session(row: &Row<'_>) -> rusqlite::Result<ConsoleSession> {
    let status: String = row.get("status")?;
    Ok(ConsoleSession {
        id: row.get("id")?,
        zone_name: row.get("zone_name")?,
        status: ConsoleSessionStatus::from_str(&status),
        pid: row.get::<_, Option<i64>>("pid")?.map(|p| p as u32),
        started_at: row.get("started_at")?,
        ended_at: row.get("ended_at")?,
    })
}

pub fn start_session(conn: &Connection, zone_name: &str, now: i64) -> Result<i64> {
    conn.execute(
        "INSERT INTO console_sessions (zone_name, status, started_at) VALUES (?1, 'starting', ?2)",
        params![zone_name, now],
    )
    .context("creating console session")?;
    Ok(conn.last_insert_rowid())
}

pub fn mark_active(conn: &Connection, id: i64, pid: u32) -> Result<()> {
    conn.execute(
        "UPDATE console_sessions SET status = 'active', pid = ?2 WHERE id = ?1",
        params![id, pid as i64],
    )
    .context("marking console session active")?;
    Ok(())
}

pub fn mark_stopped(conn: &Connection, id: i64, now: i64) -> Result<()> {
    conn.execute(
        "UPDATE console_sessions SET status = 'stopped', ended_at = ?2 WHERE id = ?1",
        params![id, now],
    )
    .context("marking console session stopped")?;
    Ok(())
}

pub fn mark_failed(conn: &Connection, id: i64, now: i64) -> Result<()> {
    conn.execute(
        "UPDATE console_sessions SET status = 'failed', ended_at = ?2 WHERE id = ?1",
        params![id, now],
    )
    .context("marking console session failed")?;
    Ok(())
}

/// Append to the persisted scrollback buffer, truncating from the front to
/// keep it under `max_bytes` (approximating `console.persisted_lines`).
pub fn append_buffer(conn: &Connection, id: i64, chunk: &[u8], max_bytes: usize) -> Result<()> {
    let existing: Vec<u8> = conn
        .query_row(
            "SELECT session_buffer FROM console_sessions WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .context("reading console session buffer")?;

    let mut buffer = existing;
    buffer.extend_from_slice(chunk);
    if buffer.len() > max_bytes {
        let excess = buffer.len() - max_bytes;
        buffer.drain(0..excess);
    }

    conn.execute(
        "UPDATE console_sessions SET session_buffer = ?2 WHERE id = ?1",
        params![id, buffer],
    )
    .context("updating console session buffer")?;
    Ok(())
}

pub fn get_buffer(conn: &Connection, id: i64) -> Result<Vec<u8>> {
    conn.query_row(
        "SELECT session_buffer FROM console_sessions WHERE id = ?1",
        params![id],
        |row| row.get(0),
    )
    .context("reading console session buffer")
}

pub fn get_session(conn: &Connection, id: i64) -> Result<Option<ConsoleSession>> {
    conn.query_row(
        "SELECT * FROM console_sessions WHERE id = ?1",
        params![id],
        row_to_session,
    )
    .optional()
    .context("fetching console session")
}

pub fn active_session_for_zone(conn: &Connection, zone_name: &str) -> Result<Option<ConsoleSession>> {
    conn.query_row(
        "SELECT * FROM console_sessions
         WHERE zone_name = ?1 AND status IN ('starting', 'active')
         ORDER BY started_at DESC LIMIT 1",
        params![zone_name],
        row_to_session,
    )
    .optional()
    .context("fetching active console session for zone")
}

pub fn list_sessions(conn: &Connection) -> Result<Vec<ConsoleSession>> {
    let mut stmt = conn.prepare("SELECT * FROM console_sessions ORDER BY started_at DESC")?;
    let rows = stmt
        .query_map([], row_to_session)?
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
    fn session_lifecycle() {
        let conn = test_conn();
        let id = start_session(&conn, "vm-a", 1000).unwrap();
        assert_eq!(
            get_session(&conn, id).unwrap().unwrap().status,
            ConsoleSessionStatus::Starting
        );

        mark_active(&conn, id, 4242).unwrap();
        let session = get_session(&conn, id).unwrap().unwrap();
        assert_eq!(session.status, ConsoleSessionStatus::Active);
        assert_eq!(session.pid, Some(4242));

        mark_stopped(&conn, id, 2000).unwrap();
        let session = get_session(&conn, id).unwrap().unwrap();
        assert_eq!(session.status, ConsoleSessionStatus::Stopped);
        assert_eq!(session.ended_at, Some(2000));
    }

    #[test]
    fn buffer_truncates_from_front_when_over_cap() {
        let conn = test_conn();
        let id = start_session(&conn, "vm-a", 1000).unwrap();
        append_buffer(&conn, id, b"0123456789", 5).unwrap();
        assert_eq!(get_buffer(&conn, id).unwrap(), b"56789".to_vec());
        append_buffer(&conn, id, b"AB", 5).unwrap();
        assert_eq!(get_buffer(&conn, id).unwrap(), b"89AB".to_vec());
    }

    #[test]
    fn active_session_lookup_ignores_stopped_sessions() {
        let conn = test_conn();
        let id = start_session(&conn, "vm-a", 1000).unwrap();
        mark_stopped(&conn, id, 1100).unwrap();
        assert!(active_session_for_zone(&conn, "vm-a").unwrap().is_none());

        let id2 = start_session(&conn, "vm-a", 1200).unwrap();
        let active = active_session_for_zone(&conn, "vm-a").unwrap().unwrap();
        assert_eq!(active.id, id2);
    }
}
