//! Schema migration framework
//!
//! Unlike a snapshot-versioned migration (transforming a JSON document), the
//! Store's schema evolves via idempotent `ALTER TABLE`/index statements run
//! against the live SQLite file on every startup. Each [`Migration`] is one
//! step; [`MigrationRunner::run`] applies every step whose `id` isn't yet
//! recorded in `schema_migrations`, in order, inside one transaction each.
//!
//! This mirrors the registry shape used for the JSON snapshot migrations
//! elsewhere in the wider codebase (source version -> target version,
//! chained until there's no more path) adapted to SQL: here the "version" is
//! just the migration's unique id, and "no path" can't happen because every
//! migration is unconditionally applicable to a schema at or before it.

use rusqlite::Connection;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("migration '{id}' failed: {reason}")]
    Failed { id: &'static str, reason: String },
}

impl From<rusqlite::Error> for MigrationErrorContext {
    fn from(err: rusqlite::Error) -> Self {
        MigrationErrorContext(err.to_string())
    }
}

/// Helper so `?` inside a migration's `apply` can carry a plain string
/// reason without every migration writing its own `map_err`.
pub struct MigrationErrorContext(String);

/// One forward-only schema step. `id` must be stable and unique forever —
/// it's the primary key of `schema_migrations`, so renaming it re-runs the
/// migration.
pub trait Migration: Send + Sync {
    fn id(&self) -> &'static str;
    fn apply(&self, conn: &Connection) -> Result<(), MigrationErrorContext>;
}

/// Ensures `schema_migrations` exists, then applies every registered
/// migration not yet recorded there, each inside its own transaction.
pub struct MigrationRunner {
    migrations: Vec<Box<dyn Migration>>,
}

impl MigrationRunner {
    pub fn new() -> Self {
        Self {
            migrations: Vec::new(),
        }
    }

    pub fn register(mut self, migration: Box<dyn Migration>) -> Self {
        self.migrations.push(migration);
        self
    }

    pub fn run(&self, conn: &mut Connection) -> Result<(), MigrationError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                id TEXT PRIMARY KEY,
                applied_at INTEGER NOT NULL
            )",
        )
        .map_err(|e| MigrationError::Failed {
            id: "schema_migrations_bootstrap",
            reason: e.to_string(),
        })?;

        for migration in &self.migrations {
            let already_applied: bool = conn
                .query_row(
                    "SELECT EXISTS(SELECT 1 FROM schema_migrations WHERE id = ?1)",
                    [migration.id()],
                    |row| row.get(0),
                )
                .map_err(|e| MigrationError::Failed {
                    id: migration.id(),
                    reason: e.to_string(),
                })?;

            if already_applied {
                continue;
            }

            let tx = conn.transaction().map_err(|e| MigrationError::Failed {
                id: migration.id(),
                reason: e.to_string(),
            })?;

            migration.apply(&tx).map_err(|e| MigrationError::Failed {
                id: migration.id(),
                reason: e.0,
            })?;

            tx.execute(
                "INSERT INTO schema_migrations (id, applied_at) VALUES (?1, strftime('%s','now'))",
                [migration.id()],
            )
            .map_err(|e| MigrationError::Failed {
                id: migration.id(),
                reason: e.to_string(),
            })?;

            tx.commit().map_err(|e| MigrationError::Failed {
                id: migration.id(),
                reason: e.to_string(),
            })?;

            tracing::info!(migration = migration.id(), "applied schema migration");
        }

        Ok(())
    }
}

impl Default for MigrationRunner {
    fn default() -> Self {
        Self::new()
    }
}

/// A plain SQL-batch migration — the common case, used for every additive
/// `CREATE TABLE IF NOT EXISTS` / `CREATE INDEX IF NOT EXISTS` step.
pub struct SqlMigration {
    pub id: &'static str,
    pub sql: &'static str,
}

impl Migration for SqlMigration {
    fn id(&self) -> &'static str {
        self.id
    }

    fn apply(&self, conn: &Connection) -> Result<(), MigrationErrorContext> {
        conn.execute_batch(self.sql)
            .map_err(|e| MigrationErrorContext(e.to_string()))
    }
}
