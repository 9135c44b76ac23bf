//! `GET /stats`: a single host-level rollup combining zone counts, task
//! queue depth, active console sessions and the `host_info` hardware
//! summary, so a dashboard doesn't need to fan out to four endpoints.

use axum::extract::State;
use axum::Json;

use shared::api::StatsResponse;
use shared::console::ConsoleSessionStatus;
use shared::task::TaskStatus;
use shared::zone::ZoneStatus;

use crate::store::tables;

use super::{ApiError, AppState};

pub async fn get_stats(State(state): State<AppState>) -> Result<Json<StatsResponse>, ApiError> {
    let mut store = state.ctx.store.lock().await;
    let conn = store.get_connection()?;

    let zones = tables::zones::list_zones(conn)?;
    let zones_total = zones.len() as u64;
    let zones_running = zones.iter().filter(|z| z.status == ZoneStatus::Running).count() as u64;

    let tasks_pending = tables::tasks::count_by_status(conn, TaskStatus::Pending)?;
    let tasks_running = tables::tasks::count_by_status(conn, TaskStatus::Running)?;

    let active_console_sessions = tables::console::list_sessions(conn)?
        .iter()
        .filter(|s| s.status == ConsoleSessionStatus::Active)
        .count() as u64;

    let host_info = tables::host_info::get(conn, &state.config.host)?;

    Ok(Json(StatsResponse {
        host: state.config.host.clone(),
        zones_total,
        zones_running,
        tasks_pending,
        tasks_running,
        active_console_sessions,
        cpu_count: host_info.as_ref().and_then(|h| h.cpu_count),
        total_memory_bytes: host_info.as_ref().and_then(|h| h.total_memory_bytes),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandRunner;
    use crate::console::ConsoleMultiplexer;
    use crate::handlers::HandlerContext;
    use crate::orchestrator::ProvisioningOrchestrator;
    use crate::ssh::SshClient;
    use crate::store::Store;
    use shared::config::{AgentConfig, ConsoleConfig, SshConfig};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::tempdir;
    use tokio::sync::Mutex;

    async fn test_state() -> (AppState, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let mut store = Store::new(dir.path(), 5).unwrap();
        store.initialize().unwrap();
        let store = Arc::new(Mutex::new(store));

        let ctx = Arc::new(HandlerContext {
            store: store.clone(),
            command_runner: CommandRunner::new(Duration::from_secs(5)),
            console: ConsoleMultiplexer::new(store.clone(), ConsoleConfig::default()),
            ssh: SshClient::new(Duration::from_secs(3)),
        });

        let mut config = AgentConfig {
            host: "hv01".to_string(),
            data_dir: dir.path().to_string_lossy().to_string(),
            http_bind_address: "127.0.0.1:0".to_string(),
            api_key: "secret".to_string(),
            http_body_limit_mb: 10,
            task_engine: Default::default(),
            store: Default::default(),
            collectors: Default::default(),
            console: ConsoleConfig::default(),
            ssh: SshConfig::default(),
            graceful_shutdown_timeout_seconds: 5,
            channel_buffer_size: 16,
            command_timeout_seconds: 30,
        };
        config.validate().unwrap();

        let orchestrator = Arc::new(ProvisioningOrchestrator::new(store.clone(), config.ssh.clone()));
        let state = AppState::new(ctx, Arc::new(config), orchestrator);
        (state, dir)
    }

    #[tokio::test]
    async fn stats_reports_zero_on_an_empty_store() {
        let (state, _dir) = test_state().await;
        let Json(stats) = get_stats(State(state)).await.unwrap();
        assert_eq!(stats.zones_total, 0);
        assert_eq!(stats.tasks_pending, 0);
        assert_eq!(stats.active_console_sessions, 0);
        assert_eq!(stats.host, "hv01");
    }

    #[tokio::test]
    async fn stats_counts_running_zones_and_pending_tasks() {
        let (state, _dir) = test_state().await;
        {
            let mut store = state.ctx.store.lock().await;
            let conn = store.get_connection().unwrap();
            tables::zones::upsert_zone(
                conn,
                &shared::zone::Zone {
                    name: "vm-a".to_string(),
                    zone_id: "1".to_string(),
                    host: "hv01".to_string(),
                    brand: shared::zone::ZoneBrand::Bhyve,
                    status: ZoneStatus::Running,
                    zonepath: "/zones/vm-a".to_string(),
                    configuration: serde_json::json!({}),
                    is_orphaned: false,
                    auto_discovered: false,
                    last_seen: 1000,
                    created_at: 1000,
                    updated_at: 1000,
                },
            )
            .unwrap();
            store
                .insert_task(
                    tables::tasks::NewTask {
                        zone_name: "vm-a".to_string(),
                        operation: shared::task::TaskOperation::Start,
                        priority: shared::task::TaskPriority::Normal,
                        depends_on: None,
                        parent_task_id: None,
                        metadata: shared::task::TaskMetadata::Start,
                        created_by: "test".to_string(),
                    },
                    1000,
                )
                .unwrap();
        }

        let Json(stats) = get_stats(State(state)).await.unwrap();
        assert_eq!(stats.zones_total, 1);
        assert_eq!(stats.zones_running, 1);
        assert_eq!(stats.tasks_pending, 1);
    }
}
