//! SQLite-backed storage for the control-plane agent.
//!
//! One [`Store`] owns a single lazily-opened [`Connection`] shared across
//! every table module under [`tables`]. The connection is opened in WAL
//! mode with a bounded auto-checkpoint and a busy timeout, the same
//! arrangement the file-per-domain `db_*` modules in the wider codebase use,
//! just collapsed onto this crate's single-file-per-entity `tables/`
//! layout instead of one module per original task type.

pub mod migration;
pub mod tables;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::Connection;
use tracing::{debug, info, warn};

use migration::MigrationRunner;
use shared::config::CollectorsConfig;
use shared::task::{Task, TaskId};

const DATABASE_FILE: &str = "agent.db";

/// Outcome of [`Store::insert_task`]: whether a new row was created or an
/// existing mutex-set task was returned instead (I4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskInsertOutcome {
    Created(TaskId),
    Existing(TaskId),
}

impl TaskInsertOutcome {
    pub fn task_id(&self) -> TaskId {
        match self {
            TaskInsertOutcome::Created(id) | TaskInsertOutcome::Existing(id) => *id,
        }
    }
}

/// Rows deleted by [`Store::cleanup_old_data`], broken down by domain so the
/// retention sweeper can log something more useful than a single total.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupReport {
    pub network_usage: u64,
    pub cpu: u64,
    pub memory: u64,
    pub swap: u64,
    pub storage: u64,
    pub arc: u64,
}

impl CleanupReport {
    pub fn total(&self) -> u64 {
        self.network_usage + self.cpu + self.memory + self.swap + self.storage + self.arc
    }
}

pub struct Store {
    db_path: PathBuf,
    busy_timeout: Duration,
    connection: Option<Connection>,
}

impl Store {
    /// Build a store for a given data directory, creating it if missing.
    /// The connection itself is not opened until first use.
    pub fn new<P: AsRef<Path>>(data_dir: P, busy_timeout_seconds: u64) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        if !data_dir.exists() {
            std::fs::create_dir_all(data_dir)
                .with_context(|| format!("creating data directory {}", data_dir.display()))?;
        }

        Ok(Self {
            db_path: data_dir.join(DATABASE_FILE),
            busy_timeout: Duration::from_secs(busy_timeout_seconds),
            connection: None,
        })
    }

    /// Open the connection (if not already open), apply pragmas, and run
    /// every registered migration. Safe to call repeatedly; migrations are
    /// idempotent and only the first call actually opens the file.
    pub fn initialize(&mut self) -> Result<()> {
        info!(path = %self.db_path.display(), "opening store");
        {
            let conn = self.get_connection()?;
            let mut runner = MigrationRunner::new();
            for migrations in [
                tables::tasks::migrations(),
                tables::zones::migrations(),
                tables::provisioning::migrations(),
                tables::console::migrations(),
                tables::network::migrations(),
                tables::cpu::migrations(),
                tables::memory::migrations(),
                tables::swap::migrations(),
                tables::storage::migrations(),
                tables::arc::migrations(),
                tables::pci::migrations(),
                tables::host_info::migrations(),
            ] {
                for migration in migrations {
                    runner = runner.register(migration);
                }
            }
            runner.run(conn).context("running schema migrations")?;
        }
        info!("store initialization complete");
        Ok(())
    }

    /// Lazily open and configure the connection, returning a mutable
    /// reference to it. Encapsulates WAL setup so every table module just
    /// takes a `&Connection` without worrying about pragmas.
    pub fn get_connection(&mut self) -> Result<&mut Connection> {
        if self.connection.is_none() {
            let conn = Connection::open(&self.db_path)
                .with_context(|| format!("opening database {}", self.db_path.display()))?;

            conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))
                .context("enabling WAL mode")?;
            conn.query_row("PRAGMA wal_autocheckpoint=1000", [], |_| Ok(()))
                .context("setting WAL auto-checkpoint")?;
            conn.busy_timeout(self.busy_timeout)
                .context("setting busy timeout")?;

            self.connection = Some(conn);
        }

        Ok(self.connection.as_mut().unwrap())
    }

    /// Delete rows older than each domain's configured retention horizon,
    /// then reclaim the freed space. Current-state tables (zones, disks,
    /// network interfaces, ...) carry no retention horizon; they're
    /// replaced wholesale on every collection pass instead.
    pub fn cleanup_old_data(&mut self, now: i64, retention: &CollectorsConfig) -> Result<CleanupReport> {
        let days_to_cutoff = |days: u32| now - (days as i64) * 24 * 60 * 60;

        let conn = self.get_connection()?;
        let report = CleanupReport {
            network_usage: tables::network::cleanup_usage_older_than(
                conn,
                days_to_cutoff(retention.retention_network_usage_days),
            )?,
            cpu: tables::cpu::cleanup_older_than(conn, days_to_cutoff(retention.retention_cpu_days))?,
            memory: tables::memory::cleanup_older_than(conn, days_to_cutoff(retention.retention_memory_days))?,
            swap: tables::swap::cleanup_older_than(conn, days_to_cutoff(retention.retention_swap_days))?,
            storage: tables::storage::cleanup_older_than(conn, days_to_cutoff(retention.retention_storage_days))?,
            arc: tables::arc::cleanup_older_than(conn, days_to_cutoff(retention.retention_arc_days))?,
        };

        info!(total = report.total(), "retention sweep complete");

        conn.execute("VACUUM", []).context("running VACUUM")?;
        conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))
            .context("checkpointing WAL")?;
        debug!("vacuum and WAL checkpoint complete");

        Ok(report)
    }

    /// Merge the WAL back into the main database file without a full
    /// vacuum. Cheaper than [`Store::cleanup_old_data`]; suitable for a
    /// periodic background tick rather than only after a retention sweep.
    pub fn checkpoint_wal(&mut self) -> Result<i64> {
        let conn = self.get_connection()?;
        let checkpointed: i64 = conn
            .query_row("PRAGMA wal_checkpoint(PASSIVE)", [], |row| row.get(2))
            .context("checkpointing WAL")?;
        Ok(checkpointed)
    }

    /// Insert a new task, applying (I2) cycle rejection and (I4) mutex-set
    /// deduplication before touching the table. Returns the existing task's
    /// id without inserting anything when a mutex-set duplicate is pending
    /// or running for the same `(zone_name, operation)`.
    pub fn insert_task(
        &mut self,
        new_task: tables::tasks::NewTask,
        now: i64,
    ) -> Result<TaskInsertOutcome> {
        let conn = self.get_connection()?;

        if new_task.operation.is_mutex() {
            if let Some(existing) =
                tables::tasks::find_active_by_zone_operation(conn, &new_task.zone_name, new_task.operation)?
            {
                return Ok(TaskInsertOutcome::Existing(existing));
            }
        }

        if let Some(depends_on) = new_task.depends_on {
            if tables::tasks::get_task(conn, depends_on)?.is_none() {
                anyhow::bail!("depends_on task {depends_on} does not exist");
            }
            if tables::tasks::would_create_cycle(conn, depends_on)? {
                anyhow::bail!("inserting this task would create a dependency cycle");
            }
        }

        let id = tables::tasks::insert_task(conn, &new_task, now)?;
        Ok(TaskInsertOutcome::Created(id))
    }

    /// Cascade a `failed`/`cancelled` transition to every direct and
    /// transitive dependent of `task_id` (I3). Dependents are never moved
    /// to `running` on the way to `cancelled` — they're only ever claimed
    /// out of `pending` by the dispatcher, and this runs before that claim
    /// can happen for a task gated on the now-dead dependency.
    pub fn cancel_dependents_of(&mut self, task_id: TaskId, now: i64) -> Result<Vec<TaskId>> {
        let conn = self.get_connection()?;
        let mut cancelled = Vec::new();
        let mut frontier = vec![task_id];

        while let Some(id) = frontier.pop() {
            for dependent in tables::tasks::find_pending_dependents(conn, id)? {
                tables::tasks::mark_cancelled(conn, dependent, now)?;
                cancelled.push(dependent);
                frontier.push(dependent);
            }
        }

        Ok(cancelled)
    }

    pub fn get_task(&mut self, id: TaskId) -> Result<Option<Task>> {
        let conn = self.get_connection()?;
        tables::tasks::get_task(conn, id)
    }

    /// Tasks the dispatcher can claim right now: pending, dependency
    /// satisfied, backoff window elapsed, not aggregate-only.
    pub fn fetch_ready_tasks(&mut self, now: i64, limit: usize) -> Result<Vec<Task>> {
        let conn = self.get_connection()?;
        tables::tasks::fetch_ready_tasks(conn, now, limit)
    }

    pub fn mark_task_running(&mut self, id: TaskId, now: i64) -> Result<()> {
        let conn = self.get_connection()?;
        tables::tasks::mark_running(conn, id, now)
    }

    pub fn mark_task_completed(&mut self, id: TaskId, now: i64) -> Result<()> {
        let conn = self.get_connection()?;
        tables::tasks::mark_completed(conn, id, now)
    }

    pub fn mark_task_failed(&mut self, id: TaskId, now: i64, message: &str) -> Result<()> {
        let conn = self.get_connection()?;
        tables::tasks::mark_failed(conn, id, now, message)
    }

    pub fn schedule_task_retry(
        &mut self,
        id: TaskId,
        now: i64,
        backoff_ms: u64,
        message: &str,
    ) -> Result<()> {
        let conn = self.get_connection()?;
        tables::tasks::schedule_retry(conn, id, now, backoff_ms, message)
    }

    pub fn recompute_parent_status(&mut self, parent_id: TaskId, now: i64) -> Result<()> {
        let conn = self.get_connection()?;
        tables::tasks::recompute_parent_status(conn, parent_id, now)
    }

    pub fn start_console_session(&mut self, zone_name: &str, now: i64) -> Result<i64> {
        let conn = self.get_connection()?;
        tables::console::start_session(conn, zone_name, now)
    }

    pub fn mark_console_session_active(&mut self, id: i64, pid: u32) -> Result<()> {
        let conn = self.get_connection()?;
        tables::console::mark_active(conn, id, pid)
    }

    pub fn mark_console_session_stopped(&mut self, id: i64, now: i64) -> Result<()> {
        let conn = self.get_connection()?;
        tables::console::mark_stopped(conn, id, now)
    }

    pub fn append_console_buffer(&mut self, id: i64, chunk: &[u8], max_bytes: usize) -> Result<()> {
        let conn = self.get_connection()?;
        tables::console::append_buffer(conn, id, chunk, max_bytes)
    }

    pub fn get_console_buffer(&mut self, id: i64) -> Result<Vec<u8>> {
        let conn = self.get_connection()?;
        tables::console::get_buffer(conn, id)
    }

    pub fn list_console_sessions(&mut self) -> Result<Vec<shared::console::ConsoleSession>> {
        let conn = self.get_connection()?;
        tables::console::list_sessions(conn)
    }

    pub fn active_console_session_for_zone(
        &mut self,
        zone_name: &str,
    ) -> Result<Option<shared::console::ConsoleSession>> {
        let conn = self.get_connection()?;
        tables::console::active_session_for_zone(conn, zone_name)
    }

    /// Close the connection gracefully. Safe to call even if never opened.
    pub fn close(&mut self) {
        if let Some(conn) = self.connection.take() {
            if let Err((_, e)) = conn.close() {
                warn!(error = %e, "error closing store connection");
            } else {
                debug!("store connection closed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::zone::{Zone, ZoneBrand, ZoneStatus};
    use tempfile::tempdir;

    #[test]
    fn initialize_creates_database_file() {
        let dir = tempdir().unwrap();
        let mut store = Store::new(dir.path(), 5).unwrap();
        store.initialize().unwrap();
        assert!(dir.path().join(DATABASE_FILE).exists());
    }

    #[test]
    fn initialize_is_idempotent() {
        let dir = tempdir().unwrap();
        let mut store = Store::new(dir.path(), 5).unwrap();
        store.initialize().unwrap();
        store.initialize().unwrap();
    }

    #[test]
    fn table_modules_are_usable_after_initialize() {
        let dir = tempdir().unwrap();
        let mut store = Store::new(dir.path(), 5).unwrap();
        store.initialize().unwrap();

        let conn = store.get_connection().unwrap();
        let zone = Zone {
            name: "vm-a".into(),
            zone_id: "3".into(),
            host: "hv01".into(),
            brand: ZoneBrand::Bhyve,
            status: ZoneStatus::Running,
            zonepath: "/zones/vm-a".into(),
            configuration: serde_json::json!({}),
            is_orphaned: false,
            auto_discovered: false,
            last_seen: 1000,
            created_at: 1000,
            updated_at: 1000,
        };
        tables::zones::upsert_zone(conn, &zone).unwrap();
        assert!(tables::zones::get_zone(conn, "vm-a").unwrap().is_some());
    }

    #[test]
    fn cleanup_old_data_sums_report_and_respects_retention() {
        let dir = tempdir().unwrap();
        let mut store = Store::new(dir.path(), 5).unwrap();
        store.initialize().unwrap();

        {
            let conn = store.get_connection().unwrap();
            tables::cpu::insert_samples(
                conn,
                &[shared::metrics::CpuStats {
                    host: "hv01".into(),
                    core_id: 0,
                    user_pct: 12.5,
                    system_pct: 2.0,
                    idle_pct: 85.5,
                    scan_timestamp: 0,
                }],
            )
            .unwrap();
        }

        let retention = CollectorsConfig {
            retention_cpu_days: 1,
            ..CollectorsConfig::default()
        };
        let report = store.cleanup_old_data(10 * 24 * 60 * 60, &retention).unwrap();
        assert_eq!(report.cpu, 1);
        assert_eq!(report.total(), 1);
    }

    fn sample_task(zone: &str, operation: shared::task::TaskOperation) -> tables::tasks::NewTask {
        tables::tasks::NewTask {
            zone_name: zone.into(),
            operation,
            priority: shared::task::TaskPriority::Normal,
            depends_on: None,
            parent_task_id: None,
            metadata: shared::task::TaskMetadata::Start,
            created_by: "test".into(),
        }
    }

    #[test]
    fn insert_task_returns_created_for_a_fresh_mutex_operation() {
        let dir = tempdir().unwrap();
        let mut store = Store::new(dir.path(), 5).unwrap();
        store.initialize().unwrap();

        let outcome = store
            .insert_task(sample_task("vm-a", shared::task::TaskOperation::Start), 1000)
            .unwrap();
        assert!(matches!(outcome, TaskInsertOutcome::Created(_)));
    }

    #[test]
    fn insert_task_dedupes_pending_mutex_operation_for_same_zone() {
        let dir = tempdir().unwrap();
        let mut store = Store::new(dir.path(), 5).unwrap();
        store.initialize().unwrap();

        let first = store
            .insert_task(sample_task("vm-a", shared::task::TaskOperation::Start), 1000)
            .unwrap();
        let second = store
            .insert_task(sample_task("vm-a", shared::task::TaskOperation::Start), 1001)
            .unwrap();

        assert_eq!(first.task_id(), second.task_id());
        assert!(matches!(second, TaskInsertOutcome::Existing(_)));
    }

    #[test]
    fn insert_task_rejects_unknown_dependency() {
        let dir = tempdir().unwrap();
        let mut store = Store::new(dir.path(), 5).unwrap();
        store.initialize().unwrap();

        let mut task = sample_task("vm-a", shared::task::TaskOperation::ZoneSync);
        task.depends_on = Some(9999);
        assert!(store.insert_task(task, 1000).is_err());
    }

    #[test]
    fn insert_task_rejects_a_dependency_chain_that_loops() {
        let dir = tempdir().unwrap();
        let mut store = Store::new(dir.path(), 5).unwrap();
        store.initialize().unwrap();

        let a = store
            .insert_task(sample_task("vm-a", shared::task::TaskOperation::ZoneSync), 1000)
            .unwrap()
            .task_id();
        {
            let conn = store.get_connection().unwrap();
            conn.execute("UPDATE tasks SET depends_on = ?1 WHERE id = ?1", rusqlite::params![a])
                .unwrap();
        }

        let mut task = sample_task("vm-b", shared::task::TaskOperation::ZoneProvision);
        task.depends_on = Some(a);
        assert!(store.insert_task(task, 1000).is_err());
    }

    #[test]
    fn cancel_dependents_of_cascades_transitively() {
        let dir = tempdir().unwrap();
        let mut store = Store::new(dir.path(), 5).unwrap();
        store.initialize().unwrap();

        let root = store
            .insert_task(sample_task("vm-a", shared::task::TaskOperation::ZoneCreate), 1000)
            .unwrap()
            .task_id();

        let mut child = sample_task("vm-a", shared::task::TaskOperation::ZoneSetup);
        child.depends_on = Some(root);
        let child_id = store.insert_task(child, 1000).unwrap().task_id();

        let mut grandchild = sample_task("vm-a", shared::task::TaskOperation::ZoneWaitSsh);
        grandchild.depends_on = Some(child_id);
        let grandchild_id = store.insert_task(grandchild, 1000).unwrap().task_id();

        let cancelled = store.cancel_dependents_of(root, 2000).unwrap();
        assert_eq!(cancelled.len(), 2);
        assert!(cancelled.contains(&child_id));
        assert!(cancelled.contains(&grandchild_id));

        let child_task = store.get_task(child_id).unwrap().unwrap();
        assert_eq!(child_task.status, shared::task::TaskStatus::Cancelled);
        let grandchild_task = store.get_task(grandchild_id).unwrap().unwrap();
        assert_eq!(grandchild_task.status, shared::task::TaskStatus::Cancelled);
    }
}
