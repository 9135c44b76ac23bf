//! `tasks` table: the Task Engine's work queue and audit log.
//!
//! One row per task, including aggregate-only orchestration/parent rows
//! (`is_aggregate_only()`), which never reach `running` themselves — their
//! status is recomputed from their children by [`recompute_parent_status`].

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use shared::task::{Task, TaskId, TaskMetadata, TaskOperation, TaskPriority, TaskStatus};

use crate::store::migration::{Migration, SqlMigration};

pub fn migrations() -> Vec<Box<dyn Migration>> {
    vec![Box::new(SqlMigration {
        id: "tasks_0001_create",
        sql: "
            CREATE TABLE IF NOT EXISTS tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                zone_name TEXT NOT NULL,
                operation TEXT NOT NULL,
                priority TEXT NOT NULL,
                status TEXT NOT NULL,
                depends_on INTEGER,
                parent_task_id INTEGER,
                metadata TEXT NOT NULL,
                created_by TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                started_at INTEGER,
                completed_at INTEGER,
                next_attempt_at INTEGER NOT NULL,
                error_message TEXT,
                attempt INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_status_priority
                ON tasks (status, priority, created_at);
            CREATE INDEX IF NOT EXISTS idx_tasks_zone_operation
                ON tasks (zone_name, operation, status);
            CREATE INDEX IF NOT EXISTS idx_tasks_parent
                ON tasks (parent_task_id);
        ",
    })]
}

/// Parameters for inserting a new task. `id`, `status`, `created_at`,
/// `started_at`, `completed_at` and `attempt` are assigned by the Store.
pub struct NewTask {
    pub zone_name: String,
    pub operation: TaskOperation,
    pub priority: TaskPriority,
    pub depends_on: Option<TaskId>,
    pub parent_task_id: Option<TaskId>,
    pub metadata: TaskMetadata,
    pub created_by: String,
}

fn row_to_task(row: &Row<'_>) -> rusqlite::Result<Task> {
    let operation: String = row.get("operation")?;
    let priority: String = row.get("priority")?;
    let status: String = row.get("status")?;
    let metadata_json: String = row.get("metadata")?;

    Ok(Task {
        id: row.get("id")?,
        zone_name: row.get("zone_name")?,
        operation: TaskOperation::from_str(&operation)
            .map_err(|e| rusqlite::Error::InvalidColumnType(0, e.to_string(), rusqlite::types::Type::Text))?,
        priority: TaskPriority::from_str(&priority)
            .map_err(|e| rusqlite::Error::InvalidColumnType(0, e.to_string(), rusqlite::types::Type::Text))?,
        status: TaskStatus::from_str(&status)
            .map_err(|e| rusqlite::Error::InvalidColumnType(0, e.to_string(), rusqlite::types::Type::Text))?,
        depends_on: row.get("depends_on")?,
        parent_task_id: row.get("parent_task_id")?,
        metadata: serde_json::from_str(&metadata_json)
            .map_err(|e| rusqlite::Error::InvalidColumnType(0, e.to_string(), rusqlite::types::Type::Text))?,
        created_by: row.get("created_by")?,
        created_at: row.get("created_at")?,
        started_at: row.get("started_at")?,
        completed_at: row.get("completed_at")?,
        error_message: row.get("error_message")?,
        attempt: row.get("attempt")?,
    })
}

/// Insert a new task, returning its assigned id.
pub fn insert_task(conn: &Connection, task: &NewTask, now: i64) -> Result<TaskId> {
    let metadata_json =
        serde_json::to_string(&task.metadata).context("serializing task metadata")?;

    conn.execute(
        "INSERT INTO tasks (
            zone_name, operation, priority, status, depends_on, parent_task_id,
            metadata, created_by, created_at, next_attempt_at, attempt
        ) VALUES (?1, ?2, ?3, 'pending', ?4, ?5, ?6, ?7, ?8, ?8, 0)",
        params![
            task.zone_name,
            task.operation.as_str(),
            task.priority.as_str(),
            task.depends_on,
            task.parent_task_id,
            metadata_json,
            task.created_by,
            now,
        ],
    )
    .context("inserting task")?;

    Ok(conn.last_insert_rowid())
}

/// Find an existing pending/running task for the same `(zone_name, operation)`
/// pair, used at insert time to fold duplicate mutex-operation requests (I4).
pub fn find_active_by_zone_operation(
    conn: &Connection,
    zone_name: &str,
    operation: TaskOperation,
) -> Result<Option<TaskId>> {
    conn.query_row(
        "SELECT id FROM tasks
         WHERE zone_name = ?1 AND operation = ?2 AND status IN ('pending', 'running')
         ORDER BY created_at ASC LIMIT 1",
        params![zone_name, operation.as_str()],
        |row| row.get(0),
    )
    .optional()
    .context("looking up active task by zone/operation")
}

pub fn get_task(conn: &Connection, id: TaskId) -> Result<Option<Task>> {
    conn.query_row("SELECT * FROM tasks WHERE id = ?1", params![id], row_to_task)
        .optional()
        .context("fetching task by id")
}

/// Tasks with `status = 'pending'`, whose dependency (if any) has completed,
/// whose backoff window has elapsed, and which aren't aggregate-only
/// orchestration rows (those are never individually dispatched). Ordered by
/// priority descending then insertion order, the dispatcher's scan order.
pub fn fetch_ready_tasks(conn: &Connection, now: i64, limit: usize) -> Result<Vec<Task>> {
    let mut stmt = conn.prepare(
        "SELECT t.* FROM tasks t
         WHERE t.status = 'pending'
           AND t.next_attempt_at <= ?1
           AND (
               t.depends_on IS NULL
               OR EXISTS (SELECT 1 FROM tasks d WHERE d.id = t.depends_on AND d.status = 'completed')
           )
         ORDER BY
            CASE t.priority
                WHEN 'critical' THEN 4
                WHEN 'high' THEN 3
                WHEN 'normal' THEN 2
                WHEN 'medium' THEN 1
                ELSE 0
            END DESC,
            t.created_at ASC
         LIMIT ?2",
    )?;

    let rows = stmt
        .query_map(params![now, limit as i64], row_to_task)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .context("collecting ready tasks")?;

    // Aggregate-only rows have no handler; filter in Rust since their
    // dispatch-eligibility depends on a property of TaskOperation, not a
    // column the SQL query can see cheaply.
    Ok(rows
        .into_iter()
        .filter(|t| !t.operation.is_aggregate_only())
        .collect())
}

pub fn mark_running(conn: &Connection, id: TaskId, now: i64) -> Result<()> {
    conn.execute(
        "UPDATE tasks SET status = 'running', started_at = ?2 WHERE id = ?1",
        params![id, now],
    )
    .context("marking task running")?;
    Ok(())
}

pub fn mark_completed(conn: &Connection, id: TaskId, now: i64) -> Result<()> {
    conn.execute(
        "UPDATE tasks SET status = 'completed', completed_at = ?2, error_message = NULL WHERE id = ?1",
        params![id, now],
    )
    .context("marking task completed")?;
    Ok(())
}

/// Record a terminal failure, counting the failing run as an attempt (so
/// `attempt` always reflects the total number of times the handler ran,
/// whether it failed outright or exhausted its retry budget).
pub fn mark_failed(conn: &Connection, id: TaskId, now: i64, message: &str) -> Result<()> {
    conn.execute(
        "UPDATE tasks SET status = 'failed', completed_at = ?2, attempt = attempt + 1,
            error_message = ?3 WHERE id = ?1",
        params![id, now, message],
    )
    .context("marking task failed")?;
    Ok(())
}

/// Record a retryable failure: increment `attempt`, push `next_attempt_at`
/// out by `backoff_ms`, and leave the task `pending` so it's picked up again.
pub fn schedule_retry(
    conn: &Connection,
    id: TaskId,
    now: i64,
    backoff_ms: u64,
    message: &str,
) -> Result<()> {
    let next_attempt_at = now + (backoff_ms / 1000) as i64;
    conn.execute(
        "UPDATE tasks SET status = 'pending', attempt = attempt + 1,
            next_attempt_at = ?2, error_message = ?3 WHERE id = ?1",
        params![id, next_attempt_at, message],
    )
    .context("scheduling task retry")?;
    Ok(())
}

pub fn mark_cancelled(conn: &Connection, id: TaskId, now: i64) -> Result<()> {
    conn.execute(
        "UPDATE tasks SET status = 'cancelled', completed_at = ?2 WHERE id = ?1",
        params![id, now],
    )
    .context("marking task cancelled")?;
    Ok(())
}

/// Count of tasks currently in `status`, for the stats endpoint.
pub fn count_by_status(conn: &Connection, status: TaskStatus) -> Result<u64> {
    conn.query_row(
        "SELECT COUNT(*) FROM tasks WHERE status = ?1",
        params![status.as_str()],
        |row| row.get(0),
    )
    .context("counting tasks by status")
}

/// Most recently created task for a `(zone_name, operation)` pair,
/// regardless of status. Used by the provisioning status endpoint to find
/// the latest orchestration parent for a zone without the mutex-set's
/// active-only restriction (an orchestration row isn't in the mutex set at
/// all, and a completed one is exactly what a status poll wants to find).
pub fn latest_by_zone_operation(
    conn: &Connection,
    zone_name: &str,
    operation: TaskOperation,
) -> Result<Option<Task>> {
    conn.query_row(
        "SELECT * FROM tasks WHERE zone_name = ?1 AND operation = ?2
         ORDER BY created_at DESC LIMIT 1",
        params![zone_name, operation.as_str()],
        row_to_task,
    )
    .optional()
    .context("looking up latest task by zone/operation")
}

pub fn children_of(conn: &Connection, parent_id: TaskId) -> Result<Vec<Task>> {
    let mut stmt = conn.prepare("SELECT * FROM tasks WHERE parent_task_id = ?1 ORDER BY id ASC")?;
    let rows = stmt
        .query_map(params![parent_id], row_to_task)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .context("collecting child tasks")?;
    Ok(rows)
}

/// Recompute an aggregate-only parent's status from its children: `failed`
/// if any child failed, `completed` once every child is completed, otherwise
/// left `pending`/`running` to reflect work still in flight.
pub fn recompute_parent_status(conn: &Connection, parent_id: TaskId, now: i64) -> Result<()> {
    let children = children_of(conn, parent_id)?;
    if children.is_empty() {
        return Ok(());
    }

    if children.iter().any(|c| c.status == TaskStatus::Failed) {
        mark_failed(conn, parent_id, now, "one or more child tasks failed")?;
    } else if children.iter().all(|c| c.status == TaskStatus::Completed) {
        mark_completed(conn, parent_id, now)?;
    } else if children.iter().any(|c| c.status == TaskStatus::Running) {
        conn.execute(
            "UPDATE tasks SET status = 'running', started_at = COALESCE(started_at, ?2) WHERE id = ?1",
            params![parent_id, now],
        )
        .context("marking parent running")?;
    }

    Ok(())
}

pub fn retry_count_exhausted(task: &Task, max_retries: u32) -> bool {
    task.attempt >= max_retries
}

/// Direct, non-terminal dependents of `task_id` — tasks whose `depends_on`
/// points at it and which haven't already been cancelled. Used to cascade
/// `failed`/`cancelled` transitions per I3.
pub fn find_pending_dependents(conn: &Connection, task_id: TaskId) -> Result<Vec<TaskId>> {
    let mut stmt = conn.prepare(
        "SELECT id FROM tasks WHERE depends_on = ?1 AND status IN ('pending', 'running')",
    )?;
    let rows = stmt
        .query_map(params![task_id], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .context("collecting pending dependents")?;
    Ok(rows)
}

/// Walk the `depends_on` chain starting at `start`, following each task's
/// predecessor. Every `depends_on` column points at an already-existing row
/// (ids are assigned on insert), so a new insert can never itself close a
/// loop — this guards against a corrupted chain among existing rows (I2),
/// which the dispatcher would otherwise spin on forever.
pub fn would_create_cycle(conn: &Connection, start: TaskId) -> Result<bool> {
    let mut seen = std::collections::HashSet::new();
    let mut current = Some(start);

    while let Some(id) = current {
        if !seen.insert(id) {
            return Ok(true);
        }
        current = conn
            .query_row("SELECT depends_on FROM tasks WHERE id = ?1", params![id], |row| row.get(0))
            .optional()
            .context("walking dependency chain")?
            .flatten();
    }
    Ok(false)
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

    fn sample_task() -> NewTask {
        NewTask {
            zone_name: "vm-a".to_string(),
            operation: TaskOperation::Start,
            priority: TaskPriority::Normal,
            depends_on: None,
            parent_task_id: None,
            metadata: TaskMetadata::Start,
            created_by: "api".to_string(),
        }
    }

    #[test]
    fn insert_and_fetch_round_trips() {
        let conn = test_conn();
        let id = insert_task(&conn, &sample_task(), 1000).unwrap();
        let task = get_task(&conn, id).unwrap().unwrap();
        assert_eq!(task.zone_name, "vm-a");
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.attempt, 0);
    }

    #[test]
    fn ready_tasks_respect_dependency_gate() {
        let conn = test_conn();
        let parent = insert_task(&conn, &sample_task(), 1000).unwrap();
        let mut child = sample_task();
        child.operation = TaskOperation::ZoneWaitSsh;
        child.metadata = TaskMetadata::ZoneWaitSsh {
            ip: "10.0.0.1".into(),
            port: 22,
            credentials: shared::task::SshCredentials {
                username: "root".into(),
                password: None,
                private_key: None,
            },
        };
        child.depends_on = Some(parent);
        insert_task(&conn, &child, 1000).unwrap();

        // Parent still pending: only the parent itself is ready.
        let ready = fetch_ready_tasks(&conn, 2000, 10).unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].zone_name, "vm-a");

        mark_completed(&conn, parent, 1500).unwrap();
        let ready = fetch_ready_tasks(&conn, 2000, 10).unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].operation, TaskOperation::ZoneWaitSsh);
    }

    #[test]
    fn ready_tasks_exclude_future_backoff_window() {
        let conn = test_conn();
        let id = insert_task(&conn, &sample_task(), 1000).unwrap();
        schedule_retry(&conn, id, 1000, 60_000, "transient failure").unwrap();

        assert!(fetch_ready_tasks(&conn, 1030, 10).unwrap().is_empty());
        assert_eq!(fetch_ready_tasks(&conn, 1100, 10).unwrap().len(), 1);
    }

    #[test]
    fn aggregate_only_tasks_never_appear_in_ready_queue() {
        let conn = test_conn();
        let mut parent = sample_task();
        parent.operation = TaskOperation::ZoneProvisionOrchestration;
        parent.metadata = TaskMetadata::ZoneProvisionOrchestration;
        insert_task(&conn, &parent, 1000).unwrap();

        assert!(fetch_ready_tasks(&conn, 1000, 10).unwrap().is_empty());
    }

    #[test]
    fn duplicate_mutex_operation_is_found_not_reinserted() {
        let conn = test_conn();
        let id = insert_task(&conn, &sample_task(), 1000).unwrap();
        let found = find_active_by_zone_operation(&conn, "vm-a", TaskOperation::Start)
            .unwrap()
            .unwrap();
        assert_eq!(found, id);
    }

    #[test]
    fn parent_status_follows_children() {
        let conn = test_conn();
        let mut parent = sample_task();
        parent.operation = TaskOperation::ZoneSyncParent;
        parent.metadata = TaskMetadata::ZoneSyncParent { total_folders: 2 };
        let parent_id = insert_task(&conn, &parent, 1000).unwrap();

        let mut c1 = sample_task();
        c1.operation = TaskOperation::ZoneSync;
        c1.parent_task_id = Some(parent_id);
        c1.metadata = TaskMetadata::ZoneSync {
            folder: shared::task::SyncFolder {
                local_path: "/a".into(),
                remote_path: "/b".into(),
                exclude: vec![],
            },
            ip: "10.0.0.1".into(),
            port: 22,
            credentials: shared::task::SshCredentials {
                username: "root".into(),
                password: None,
                private_key: None,
            },
        };
        let c1_id = insert_task(&conn, &c1, 1000).unwrap();
        let c2_id = insert_task(&conn, &c1, 1000).unwrap();

        mark_completed(&conn, c1_id, 1100).unwrap();
        recompute_parent_status(&conn, parent_id, 1100).unwrap();
        assert_eq!(
            get_task(&conn, parent_id).unwrap().unwrap().status,
            TaskStatus::Running
        );

        mark_completed(&conn, c2_id, 1200).unwrap();
        recompute_parent_status(&conn, parent_id, 1200).unwrap();
        assert_eq!(
            get_task(&conn, parent_id).unwrap().unwrap().status,
            TaskStatus::Completed
        );
    }

    #[test]
    fn parent_status_fails_if_any_child_fails() {
        let conn = test_conn();
        let mut parent = sample_task();
        parent.operation = TaskOperation::ZoneProvisionOrchestration;
        parent.metadata = TaskMetadata::ZoneProvisionOrchestration;
        let parent_id = insert_task(&conn, &parent, 1000).unwrap();

        let mut c1 = sample_task();
        c1.parent_task_id = Some(parent_id);
        let c1_id = insert_task(&conn, &c1, 1000).unwrap();
        let c2_id = insert_task(&conn, &c1, 1000).unwrap();

        mark_completed(&conn, c1_id, 1100).unwrap();
        mark_failed(&conn, c2_id, 1100, "boom").unwrap();
        recompute_parent_status(&conn, parent_id, 1100).unwrap();
        assert_eq!(
            get_task(&conn, parent_id).unwrap().unwrap().status,
            TaskStatus::Failed
        );
    }

    #[test]
    fn pending_dependents_are_found_by_depends_on() {
        let conn = test_conn();
        let parent_id = insert_task(&conn, &sample_task(), 1000).unwrap();
        let mut child = sample_task();
        child.depends_on = Some(parent_id);
        let child_id = insert_task(&conn, &child, 1000).unwrap();

        let dependents = find_pending_dependents(&conn, parent_id).unwrap();
        assert_eq!(dependents, vec![child_id]);
    }

    #[test]
    fn cycle_detection_finds_no_cycle_in_a_straight_chain() {
        let conn = test_conn();
        let a = insert_task(&conn, &sample_task(), 1000).unwrap();
        let mut b = sample_task();
        b.depends_on = Some(a);
        let b_id = insert_task(&conn, &b, 1000).unwrap();

        assert!(!would_create_cycle(&conn, b_id).unwrap());
    }

    #[test]
    fn latest_by_zone_operation_returns_the_most_recent_row() {
        let conn = test_conn();
        let mut parent = sample_task();
        parent.operation = TaskOperation::ZoneProvisionOrchestration;
        parent.metadata = TaskMetadata::ZoneProvisionOrchestration;
        let first = insert_task(&conn, &parent, 1000).unwrap();
        let second = insert_task(&conn, &parent, 2000).unwrap();

        let latest = latest_by_zone_operation(&conn, "vm-a", TaskOperation::ZoneProvisionOrchestration)
            .unwrap()
            .unwrap();
        assert_eq!(latest.id, second);
        assert_ne!(latest.id, first);
    }

    #[test]
    fn cycle_detection_catches_a_corrupted_loop() {
        let conn = test_conn();
        let a = insert_task(&conn, &sample_task(), 1000).unwrap();
        let b = insert_task(&conn, &sample_task(), 1000).unwrap();
        // Simulate a corrupted chain directly: a real insert can never
        // produce this, since `b`'s id didn't exist when `a` was written.
        conn.execute("UPDATE tasks SET depends_on = ?1 WHERE id = ?2", params![b, a])
            .unwrap();
        conn.execute("UPDATE tasks SET depends_on = ?1 WHERE id = ?2", params![a, b])
            .unwrap();

        assert!(would_create_cycle(&conn, a).unwrap());
    }

    #[test]
    fn count_by_status_reflects_only_matching_rows() {
        let conn = test_conn();
        insert_task(&conn, &sample_task(), 1000).unwrap();
        let id = insert_task(&conn, &sample_task(), 1000).unwrap();
        mark_running(&conn, id, 1500).unwrap();

        assert_eq!(count_by_status(&conn, TaskStatus::Pending).unwrap(), 1);
        assert_eq!(count_by_status(&conn, TaskStatus::Running).unwrap(), 1);
        assert_eq!(count_by_status(&conn, TaskStatus::Completed).unwrap(), 0);
    }
}
