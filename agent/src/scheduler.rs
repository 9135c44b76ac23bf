//! Task Engine dispatcher.
//!
//! One dispatcher, a bounded pool of workers. The dispatcher ticks on an
//! interval, claims as many runnable tasks as there is free worker capacity,
//! and hands each to a spawned worker that invokes the matching operation
//! handler. Workers report back over an `mpsc` channel; the dispatcher
//! applies the retry/terminal/cancellation-cascade policy from there. This
//! generalizes the ping/http/dns scheduler's tick-drain-spawn shape from "one
//! task per config entry, fixed interval" to "priority+FIFO dependency-aware
//! dequeue against the store."

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::Result;
use shared::config::TaskEngineConfig;
use shared::task::{Task, TaskId, TaskOutcome, TaskStatus};
use shared::utils::{backoff_with_jitter, current_timestamp};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::handlers::HandlerContext;
use crate::store::Store;

/// Shared cooperative-cancellation flag handed to a handler; flipped when the
/// engine cancels the task's in-flight run (a dependency failed while this
/// task was already running). Handlers check it at checkpoints between
/// external commands/SSH steps and bail out cleanly rather than racing the
/// dispatcher's own cancellation write.
pub type CancelFlag = Arc<AtomicBool>;

struct WorkerOutcome {
    task_id: TaskId,
    parent_task_id: Option<TaskId>,
    outcome: TaskOutcome,
}

/// Owns the dispatch loop. Cheap to construct; does no I/O until [`Self::run`]
/// is driven.
pub struct TaskEngine {
    store: Arc<Mutex<Store>>,
    config: TaskEngineConfig,
    handlers: Arc<HandlerContext>,
    cancel_flags: Arc<StdMutex<HashMap<TaskId, CancelFlag>>>,
    result_tx: mpsc::Sender<WorkerOutcome>,
    result_rx: mpsc::Receiver<WorkerOutcome>,
    in_flight: usize,
}

impl TaskEngine {
    pub fn new(store: Arc<Mutex<Store>>, config: TaskEngineConfig, handlers: Arc<HandlerContext>) -> Self {
        let (result_tx, result_rx) = mpsc::channel(config.worker_pool_size.max(1) * 4);
        Self {
            store,
            config,
            handlers,
            cancel_flags: Arc::new(StdMutex::new(HashMap::new())),
            result_tx,
            result_rx,
            in_flight: 0,
        }
    }

    /// Drive the dispatcher until `shutdown_rx` fires, then wait (bounded by
    /// the caller's own grace period) for in-flight workers to report back.
    pub async fn run(mut self, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut tick = tokio::time::interval(Duration::from_millis(self.config.dispatcher_tick_ms));
        info!(
            worker_pool_size = self.config.worker_pool_size,
            dispatcher_tick_ms = self.config.dispatcher_tick_ms,
            "task engine starting"
        );

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if let Err(e) = self.dispatch_tick().await {
                        error!(error = %e, "dispatcher tick failed");
                    }
                }
                Some(result) = self.result_rx.recv() => {
                    self.handle_result(result).await;
                }
                _ = shutdown_rx.recv() => {
                    info!("task engine received shutdown signal");
                    break;
                }
            }
        }

        self.drain_in_flight().await;
        info!("task engine stopped");
    }

    async fn drain_in_flight(&mut self) {
        if self.in_flight == 0 {
            return;
        }
        info!(in_flight = self.in_flight, "waiting for in-flight tasks to finish");
        let deadline = Instant::now() + Duration::from_secs(30);
        while self.in_flight > 0 && Instant::now() < deadline {
            if let Ok(Some(result)) =
                tokio::time::timeout(Duration::from_millis(200), self.result_rx.recv()).await
            {
                self.handle_result(result).await;
            }
        }
        if self.in_flight > 0 {
            warn!(in_flight = self.in_flight, "shutdown grace period elapsed with tasks still running");
        }
    }

    async fn dispatch_tick(&mut self) -> Result<()> {
        let capacity = self.config.worker_pool_size.saturating_sub(self.in_flight);
        if capacity == 0 {
            return Ok(());
        }

        let now = current_timestamp();
        let ready = {
            let mut store = self.store.lock().await;
            store.fetch_ready_tasks(now, capacity)?
        };

        for task in ready {
            self.claim_and_spawn(task, now).await?;
        }

        Ok(())
    }

    async fn claim_and_spawn(&mut self, task: Task, now: i64) -> Result<()> {
        {
            let mut store = self.store.lock().await;
            store.mark_task_running(task.id, now)?;
        }

        let cancel_flag: CancelFlag = Arc::new(AtomicBool::new(false));
        self.cancel_flags.lock().unwrap().insert(task.id, cancel_flag.clone());
        self.in_flight += 1;

        debug!(task_id = task.id, zone_name = %task.zone_name, operation = task.operation.as_str(), "claimed task");

        let handlers = self.handlers.clone();
        let tx = self.result_tx.clone();
        let parent_task_id = task.parent_task_id;
        let task_id = task.id;

        tokio::spawn(async move {
            let outcome = crate::handlers::dispatch(&handlers, &task, cancel_flag).await;
            let _ = tx
                .send(WorkerOutcome { task_id, parent_task_id, outcome })
                .await;
        });

        Ok(())
    }

    async fn handle_result(&mut self, result: WorkerOutcome) {
        self.in_flight = self.in_flight.saturating_sub(1);
        self.cancel_flags.lock().unwrap().remove(&result.task_id);

        let now = current_timestamp();
        let mut store = self.store.lock().await;

        let current = match store.get_task(result.task_id) {
            Ok(task) => task,
            Err(e) => {
                error!(task_id = result.task_id, error = %e, "failed to re-read task after execution");
                return;
            }
        };

        // A dependency failure can cancel a task while its handler is still
        // running (I3 permits cancelling out of `running`); don't clobber
        // that with our own terminal write.
        if matches!(current.as_ref().map(|t| t.status), Some(TaskStatus::Cancelled)) {
            debug!(task_id = result.task_id, "task was cancelled mid-run, ignoring its result");
            return;
        }

        let attempt = current.as_ref().map(|t| t.attempt).unwrap_or(0);

        let write_result = match result.outcome {
            TaskOutcome::Ok => store.mark_task_completed(result.task_id, now),
            TaskOutcome::Retryable(message) => {
                if attempt + 1 >= self.config.max_retries {
                    warn!(task_id = result.task_id, attempt, %message, "retry budget exhausted, failing task");
                    self.fail_and_cascade(&mut store, result.task_id, now, &message)
                } else {
                    let base_ms = (self.config.retry_backoff_seconds as u64) * 1000;
                    let backoff_ms = backoff_with_jitter(attempt, base_ms, base_ms.saturating_mul(20).max(60_000));
                    info!(task_id = result.task_id, attempt, backoff_ms, %message, "scheduling retry");
                    store.schedule_task_retry(result.task_id, now, backoff_ms, &message)
                }
            }
            TaskOutcome::Terminal(message) => {
                warn!(task_id = result.task_id, %message, "task failed terminally");
                self.fail_and_cascade(&mut store, result.task_id, now, &message)
            }
        };

        if let Err(e) = write_result {
            error!(task_id = result.task_id, error = %e, "failed to record task outcome");
        }

        if let Some(parent_id) = result.parent_task_id {
            if let Err(e) = store.recompute_parent_status(parent_id, now) {
                error!(parent_task_id = parent_id, error = %e, "failed to recompute parent status");
            }
        }
    }

    fn fail_and_cascade(&self, store: &mut Store, task_id: TaskId, now: i64, message: &str) -> Result<()> {
        store.mark_task_failed(task_id, now, message)?;
        let cancelled = store.cancel_dependents_of(task_id, now)?;
        if !cancelled.is_empty() {
            let flags = self.cancel_flags.lock().unwrap();
            for dependent_id in &cancelled {
                if let Some(flag) = flags.get(dependent_id) {
                    flag.store(true, Ordering::SeqCst);
                }
            }
            info!(task_id, cancelled = ?cancelled, "cascaded cancellation to dependents");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandRunner;
    use crate::console::ConsoleMultiplexer;
    use crate::ssh::SshClient;
    use shared::config::ConsoleConfig;
    use shared::task::{TaskMetadata, TaskOperation, TaskPriority};
    use std::time::Duration as StdDuration;
    use tempfile::tempdir;

    async fn test_engine() -> (TaskEngine, Arc<Mutex<Store>>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let mut store = Store::new(dir.path(), 5).unwrap();
        store.initialize().unwrap();
        let store = Arc::new(Mutex::new(store));

        let ctx = Arc::new(HandlerContext {
            store: store.clone(),
            command_runner: CommandRunner::new(StdDuration::from_secs(5)),
            console: ConsoleMultiplexer::new(store.clone(), ConsoleConfig::default()),
            ssh: SshClient::new(StdDuration::from_secs(3)),
        });

        let config = TaskEngineConfig {
            worker_pool_size: 2,
            max_retries: 3,
            retry_backoff_seconds: 1,
            dispatcher_tick_ms: 20,
        };

        let engine = TaskEngine::new(store.clone(), config, ctx);
        (engine, store, dir)
    }

    #[tokio::test]
    async fn dispatch_tick_claims_and_runs_a_ready_task() {
        let (mut engine, store, _dir) = test_engine().await;

        let task_id = {
            let mut s = store.lock().await;
            s.insert_task(
                crate::store::tables::tasks::NewTask {
                    zone_name: "system".into(),
                    operation: TaskOperation::CreateVnic,
                    priority: TaskPriority::Normal,
                    depends_on: None,
                    parent_task_id: None,
                    metadata: TaskMetadata::CreateVnic {
                        vnic_name: "vnic-test".into(),
                        link: "stub0".into(),
                        properties: Default::default(),
                    },
                    created_by: "test".into(),
                },
                current_timestamp(),
            )
            .unwrap()
            .task_id()
        };

        engine.dispatch_tick().await.unwrap();
        assert_eq!(engine.in_flight, 1);

        let result = tokio::time::timeout(StdDuration::from_secs(5), engine.result_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.task_id, task_id);
        engine.handle_result(result).await;
        assert_eq!(engine.in_flight, 0);
    }

    #[tokio::test]
    async fn retryable_outcome_reschedules_until_budget_exhausted() {
        let (engine, store, _dir) = test_engine().await;

        let task_id = {
            let mut s = store.lock().await;
            s.insert_task(
                crate::store::tables::tasks::NewTask {
                    zone_name: "system".into(),
                    operation: TaskOperation::PkgInstall,
                    priority: TaskPriority::Normal,
                    depends_on: None,
                    parent_task_id: None,
                    metadata: TaskMetadata::PkgInstall { package: "pkg:/nonexistent".into() },
                    created_by: "test".into(),
                },
                current_timestamp(),
            )
            .unwrap()
            .task_id()
        };

        for _ in 0..3 {
            engine
                .handle_result(WorkerOutcome {
                    task_id,
                    parent_task_id: None,
                    outcome: TaskOutcome::Retryable("transient".into()),
                })
                .await;
        }

        let mut s = store.lock().await;
        let task = s.get_task(task_id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.attempt, 3);
    }

    #[tokio::test]
    async fn terminal_outcome_cascades_to_dependent() {
        let (engine, store, _dir) = test_engine().await;

        let (root, dependent) = {
            let mut s = store.lock().await;
            let root = s
                .insert_task(
                    crate::store::tables::tasks::NewTask {
                        zone_name: "vm-a".into(),
                        operation: TaskOperation::ZoneCreate,
                        priority: TaskPriority::Normal,
                        depends_on: None,
                        parent_task_id: None,
                        metadata: TaskMetadata::ZoneCreate {
                            brand: "bhyve".into(),
                            zonepath: "/zones/vm-a".into(),
                            configuration: serde_json::json!({}),
                        },
                        created_by: "test".into(),
                    },
                    1000,
                )
                .unwrap()
                .task_id();
            let dependent = s
                .insert_task(
                    crate::store::tables::tasks::NewTask {
                        zone_name: "vm-a".into(),
                        operation: TaskOperation::Start,
                        priority: TaskPriority::Normal,
                        depends_on: Some(root),
                        parent_task_id: None,
                        metadata: TaskMetadata::Start,
                        created_by: "test".into(),
                    },
                    1000,
                )
                .unwrap()
                .task_id();
            s.mark_task_running(root, 1000).unwrap();
            (root, dependent)
        };

        engine
            .handle_result(WorkerOutcome {
                task_id: root,
                parent_task_id: None,
                outcome: TaskOutcome::Terminal("zoneadm create failed".into()),
            })
            .await;

        let mut s = store.lock().await;
        assert_eq!(s.get_task(root).unwrap().unwrap().status, TaskStatus::Failed);
        assert_eq!(s.get_task(dependent).unwrap().unwrap().status, TaskStatus::Cancelled);
    }
}
