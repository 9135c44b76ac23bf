//! `/zones/*` endpoints: CRUD, lifecycle transitions and provisioning
//! triggers. Every mutation here ends at `Store::insert_task`/the
//! Provisioning Orchestrator — handlers never touch `zoneadm`/`zonecfg`
//! directly (§4.7).

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;

use shared::api::{
    CreateZoneRequest, ModifyZoneRequest, ProvisionStatusResponse, TaskAccepted, TaskSummary,
    ZoneResponse,
};
use shared::error::AgentError;
use shared::task::{TaskMetadata, TaskOperation, TaskPriority};
use shared::utils::{current_timestamp, validate_zone_name};
use shared::zone::{Zone, ZoneBrand, ZoneStatus};

use crate::store::tables::tasks::NewTask;
use crate::store::tables::{self};
use crate::store::TaskInsertOutcome;

use super::{validate_api_key, ApiError, AppState};

fn zone_to_response(zone: &Zone) -> ZoneResponse {
    ZoneResponse {
        name: zone.name.clone(),
        zone_id: zone.zone_id.clone(),
        brand: zone.brand.as_str().to_string(),
        status: zone.status.as_str().to_string(),
        zonepath: zone.zonepath.clone(),
        is_orphaned: zone.is_orphaned,
        auto_discovered: zone.auto_discovered,
        last_seen: zone.last_seen,
    }
}

fn task_accepted(outcome: TaskInsertOutcome) -> TaskAccepted {
    match outcome {
        TaskInsertOutcome::Created(id) => TaskAccepted { task_id: id, status: "pending".to_string() },
        TaskInsertOutcome::Existing(id) => TaskAccepted { task_id: id, status: "existing".to_string() },
    }
}

/// `GET /zones`. I5 is satisfied by task-completion status writes, not a
/// live refresh here — the handler only ever projects the Store's
/// last-known state (§4.7 forbids a blocking host operation inline).
pub async fn list_zones(State(state): State<AppState>) -> Result<Json<Vec<ZoneResponse>>, ApiError> {
    let mut store = state.ctx.store.lock().await;
    let conn = store.get_connection()?;
    let zones = tables::zones::list_zones(conn)?;
    Ok(Json(zones.iter().map(zone_to_response).collect()))
}

pub async fn get_zone(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ZoneResponse>, ApiError> {
    let mut store = state.ctx.store.lock().await;
    let conn = store.get_connection()?;
    let zone = tables::zones::get_zone(conn, &name)?
        .ok_or_else(|| AgentError::not_found(format!("zone '{name}' not found")))?;
    Ok(Json(zone_to_response(&zone)))
}

/// `GET /zones/{name}/config`: the raw configuration document. Split out
/// from `GET /zones/{name}` because `ZoneResponse` deliberately omits it
/// (it can be arbitrarily large and most callers only need the summary).
pub async fn get_zone_config(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let mut store = state.ctx.store.lock().await;
    let conn = store.get_connection()?;
    let zone = tables::zones::get_zone(conn, &name)?
        .ok_or_else(|| AgentError::not_found(format!("zone '{name}' not found")))?;
    Ok(Json(zone.configuration))
}

/// `POST /zones`: queues `zone_create` and returns immediately. The zone
/// row itself is written by `handlers::zone::zone_create` once `zonecfg`/
/// `zoneadm install` succeed — it does not exist in the Store before that.
pub async fn create_zone(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreateZoneRequest>,
) -> Result<(StatusCode, Json<TaskAccepted>), ApiError> {
    validate_api_key(&headers, &state.config.api_key)?;
    validate_zone_name(&request.name).map_err(|e| AgentError::validation(e.to_string()))?;
    if request.zonepath.trim().is_empty() {
        return Err(AgentError::validation("zonepath must not be empty").into());
    }

    let mut configuration = request.configuration;
    if let Some(provisioning) = &request.provisioning {
        let value = serde_json::to_value(provisioning)
            .map_err(|e| AgentError::validation(format!("invalid provisioning spec: {e}")))?;
        configuration
            .as_object_mut()
            .ok_or_else(|| AgentError::validation("configuration must be a JSON object"))?
            .insert("provisioning".to_string(), value);
    }

    let now = current_timestamp();
    let mut store = state.ctx.store.lock().await;
    let conn = store.get_connection()?;
    if tables::zones::get_zone(conn, &request.name)?.is_some() {
        return Err(AgentError::conflict(format!("zone '{}' already exists", request.name)).into());
    }

    let outcome = store.insert_task(
        NewTask {
            zone_name: request.name.clone(),
            operation: TaskOperation::ZoneCreate,
            priority: TaskPriority::Normal,
            depends_on: None,
            parent_task_id: None,
            metadata: TaskMetadata::ZoneCreate {
                brand: request.brand.clone(),
                zonepath: request.zonepath.clone(),
                configuration,
            },
            created_by: "api".to_string(),
        },
        now,
    )?;

    Ok((StatusCode::ACCEPTED, Json(task_accepted(outcome))))
}

/// `PUT /zones/{name}`: a direct, synchronous configuration patch (I6).
/// Never queues a task, so the response is the updated resource rather
/// than a `TaskAccepted` envelope.
pub async fn modify_zone(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    Json(request): Json<ModifyZoneRequest>,
) -> Result<Json<ZoneResponse>, ApiError> {
    validate_api_key(&headers, &state.config.api_key)?;

    let now = current_timestamp();
    let mut store = state.ctx.store.lock().await;
    let conn = store.get_connection()?;
    let zone = tables::zones::get_zone(conn, &name)?
        .ok_or_else(|| AgentError::not_found(format!("zone '{name}' not found")))?;

    let merged = if request.configuration.is_some() || request.provisioning.is_some() {
        let mut merged = zone.configuration.clone();
        if let Some(patch) = request.configuration {
            let patch_obj = patch
                .as_object()
                .ok_or_else(|| AgentError::validation("configuration must be a JSON object"))?;
            let base_obj = merged
                .as_object_mut()
                .ok_or_else(|| AgentError::validation("stored configuration is not a JSON object"))?;
            for (key, value) in patch_obj {
                base_obj.insert(key.clone(), value.clone());
            }
        }
        if let Some(provisioning) = &request.provisioning {
            let value = serde_json::to_value(provisioning)
                .map_err(|e| AgentError::validation(format!("invalid provisioning spec: {e}")))?;
            merged
                .as_object_mut()
                .ok_or_else(|| AgentError::validation("stored configuration is not a JSON object"))?
                .insert("provisioning".to_string(), value);
        }
        Some(merged)
    } else {
        None
    };

    if let Some(merged) = &merged {
        tables::zones::update_zone_fields(conn, &name, Some(merged), None, now)?;
    }

    let zone = tables::zones::get_zone(conn, &name)?
        .ok_or_else(|| AgentError::not_found(format!("zone '{name}' not found")))?;
    Ok(Json(zone_to_response(&zone)))
}

pub async fn delete_zone(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Result<(StatusCode, Json<TaskAccepted>), ApiError> {
    validate_api_key(&headers, &state.config.api_key)?;
    let outcome = queue_simple_zone_task(&state, &name, TaskOperation::Delete, TaskMetadata::Delete).await?;
    Ok((StatusCode::ACCEPTED, Json(task_accepted(outcome))))
}

async fn queue_simple_zone_task(
    state: &AppState,
    zone_name: &str,
    operation: TaskOperation,
    metadata: TaskMetadata,
) -> Result<TaskInsertOutcome, ApiError> {
    let now = current_timestamp();
    let mut store = state.ctx.store.lock().await;
    {
        let conn = store.get_connection()?;
        if tables::zones::get_zone(conn, zone_name)?.is_none() {
            return Err(AgentError::not_found(format!("zone '{zone_name}' not found")).into());
        }
    }
    let outcome = store.insert_task(
        NewTask {
            zone_name: zone_name.to_string(),
            operation,
            priority: TaskPriority::Normal,
            depends_on: None,
            parent_task_id: None,
            metadata,
            created_by: "api".to_string(),
        },
        now,
    )?;
    Ok(outcome)
}

pub async fn start_zone(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Result<(StatusCode, Json<TaskAccepted>), ApiError> {
    validate_api_key(&headers, &state.config.api_key)?;
    let outcome = queue_simple_zone_task(&state, &name, TaskOperation::Start, TaskMetadata::Start).await?;
    Ok((StatusCode::ACCEPTED, Json(task_accepted(outcome))))
}

pub async fn stop_zone(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Result<(StatusCode, Json<TaskAccepted>), ApiError> {
    validate_api_key(&headers, &state.config.api_key)?;
    let outcome = queue_simple_zone_task(&state, &name, TaskOperation::Stop, TaskMetadata::Stop).await?;
    Ok((StatusCode::ACCEPTED, Json(task_accepted(outcome))))
}

/// `POST /zones/{name}/restart`: `stop` followed by `start`, wired with a
/// dependency edge rather than a dedicated `TaskOperation` — the vocabulary
/// in §6.2 has no `restart` entry, so this composes the two it does have.
pub async fn restart_zone(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Result<(StatusCode, Json<TaskAccepted>), ApiError> {
    validate_api_key(&headers, &state.config.api_key)?;

    let now = current_timestamp();
    let mut store = state.ctx.store.lock().await;
    {
        let conn = store.get_connection()?;
        if tables::zones::get_zone(conn, &name)?.is_none() {
            return Err(AgentError::not_found(format!("zone '{name}' not found")).into());
        }
    }

    let stop_outcome = store.insert_task(
        NewTask {
            zone_name: name.clone(),
            operation: TaskOperation::Stop,
            priority: TaskPriority::Normal,
            depends_on: None,
            parent_task_id: None,
            metadata: TaskMetadata::Stop,
            created_by: "api".to_string(),
        },
        now,
    )?;

    store.insert_task(
        NewTask {
            zone_name: name.clone(),
            operation: TaskOperation::Start,
            priority: TaskPriority::Normal,
            depends_on: Some(stop_outcome.task_id()),
            parent_task_id: None,
            metadata: TaskMetadata::Start,
            created_by: "api".to_string(),
        },
        now,
    )?;

    Ok((StatusCode::ACCEPTED, Json(task_accepted(stop_outcome))))
}

pub async fn provision_zone(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Result<(StatusCode, Json<TaskAccepted>), ApiError> {
    validate_api_key(&headers, &state.config.api_key)?;
    let task_id = state.orchestrator.queue(&name).await?;
    Ok((StatusCode::ACCEPTED, Json(TaskAccepted { task_id, status: "pending".to_string() })))
}

pub async fn sync_zone(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Result<(StatusCode, Json<TaskAccepted>), ApiError> {
    validate_api_key(&headers, &state.config.api_key)?;
    let task_id = state.orchestrator.queue_sync(&name).await?;
    Ok((StatusCode::ACCEPTED, Json(TaskAccepted { task_id, status: "pending".to_string() })))
}

pub async fn run_provisioners(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Result<(StatusCode, Json<TaskAccepted>), ApiError> {
    validate_api_key(&headers, &state.config.api_key)?;
    let task_id = state.orchestrator.queue_provisioners(&name).await?;
    Ok((StatusCode::ACCEPTED, Json(TaskAccepted { task_id, status: "pending".to_string() })))
}

pub async fn provision_status(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ProvisionStatusResponse>, ApiError> {
    let mut store = state.ctx.store.lock().await;
    let conn = store.get_connection()?;
    let parent = tables::tasks::latest_by_zone_operation(conn, &name, TaskOperation::ZoneProvisionOrchestration)?
        .ok_or_else(|| AgentError::not_found(format!("no provisioning run found for zone '{name}'")))?;
    let children = tables::tasks::children_of(conn, parent.id)?;

    Ok(Json(ProvisionStatusResponse {
        orchestration_task_id: parent.id,
        status: parent.status.as_str().to_string(),
        children: children
            .iter()
            .map(|t| TaskSummary {
                task_id: t.id,
                operation: t.operation.as_str().to_string(),
                status: t.status.as_str().to_string(),
                error_message: t.error_message.clone(),
            })
            .collect(),
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
    use shared::config::{ConsoleConfig, SshConfig};
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
            command_runner: CommandRunner::new(Duration::from_secs(2)),
            console: ConsoleMultiplexer::new(store.clone(), ConsoleConfig::default()),
            ssh: SshClient::new(Duration::from_secs(2)),
        });
        let config = Arc::new(shared::config::AgentConfig {
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
            graceful_shutdown_timeout_seconds: 30,
            channel_buffer_size: 64,
            command_timeout_seconds: 30,
        });
        let orchestrator = Arc::new(ProvisioningOrchestrator::new(store, SshConfig::default()));
        (AppState::new(ctx, config, orchestrator), dir)
    }

    fn auth_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(shared::api::headers::API_KEY, "secret".parse().unwrap());
        headers
    }

    #[tokio::test]
    async fn create_zone_rejects_duplicate_name() {
        let (state, _dir) = test_state().await;
        let request = CreateZoneRequest {
            name: "vm-a".to_string(),
            brand: "bhyve".to_string(),
            zonepath: "/zones/vm-a".to_string(),
            configuration: serde_json::json!({}),
            provisioning: None,
        };

        let (status, _) = create_zone(State(state.clone()), auth_headers(), Json(request.clone()))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::ACCEPTED);

        {
            let mut store = state.ctx.store.lock().await;
            let conn = store.get_connection().unwrap();
            tables::zones::upsert_zone(
                conn,
                &Zone {
                    name: "vm-a".to_string(),
                    zone_id: "1".to_string(),
                    host: "hv01".to_string(),
                    brand: ZoneBrand::Bhyve,
                    status: ZoneStatus::Installed,
                    zonepath: "/zones/vm-a".to_string(),
                    configuration: serde_json::json!({}),
                    is_orphaned: false,
                    auto_discovered: false,
                    last_seen: 0,
                    created_at: 0,
                    updated_at: 0,
                },
            )
            .unwrap();
        }

        let err = create_zone(State(state), auth_headers(), Json(request)).await.unwrap_err();
        assert!(matches!(err, ApiError::Agent(AgentError::Conflict(_))));
    }

    #[tokio::test]
    async fn start_zone_rejects_missing_zone() {
        let (state, _dir) = test_state().await;
        let err = start_zone(State(state), Path("vm-missing".to_string()), auth_headers())
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Agent(AgentError::NotFound(_))));
    }

    #[tokio::test]
    async fn modify_zone_merges_configuration_without_queueing_a_task() {
        let (state, _dir) = test_state().await;
        {
            let mut store = state.ctx.store.lock().await;
            let conn = store.get_connection().unwrap();
            tables::zones::upsert_zone(
                conn,
                &Zone {
                    name: "vm-a".to_string(),
                    zone_id: "1".to_string(),
                    host: "hv01".to_string(),
                    brand: ZoneBrand::Bhyve,
                    status: ZoneStatus::Installed,
                    zonepath: "/zones/vm-a".to_string(),
                    configuration: serde_json::json!({"memory": "2G"}),
                    is_orphaned: false,
                    auto_discovered: false,
                    last_seen: 0,
                    created_at: 0,
                    updated_at: 0,
                },
            )
            .unwrap();
        }

        let request = ModifyZoneRequest {
            configuration: Some(serde_json::json!({"cpus": 4})),
            provisioning: None,
        };
        let Json(response) =
            modify_zone(State(state.clone()), Path("vm-a".to_string()), auth_headers(), Json(request))
                .await
                .unwrap();
        assert_eq!(response.name, "vm-a");

        let mut store = state.ctx.store.lock().await;
        let conn = store.get_connection().unwrap();
        let zone = tables::zones::get_zone(conn, "vm-a").unwrap().unwrap();
        assert_eq!(zone.configuration.get("memory").unwrap(), "2G");
        assert_eq!(zone.configuration.get("cpus").unwrap(), 4);
        assert_eq!(tables::tasks::count_by_status(conn, shared::task::TaskStatus::Pending).unwrap(), 0);
    }

    #[tokio::test]
    async fn restart_zone_chains_start_after_stop() {
        let (state, _dir) = test_state().await;
        {
            let mut store = state.ctx.store.lock().await;
            let conn = store.get_connection().unwrap();
            tables::zones::upsert_zone(
                conn,
                &Zone {
                    name: "vm-a".to_string(),
                    zone_id: "1".to_string(),
                    host: "hv01".to_string(),
                    brand: ZoneBrand::Bhyve,
                    status: ZoneStatus::Running,
                    zonepath: "/zones/vm-a".to_string(),
                    configuration: serde_json::json!({}),
                    is_orphaned: false,
                    auto_discovered: false,
                    last_seen: 0,
                    created_at: 0,
                    updated_at: 0,
                },
            )
            .unwrap();
        }

        let (status, Json(accepted)) =
            restart_zone(State(state.clone()), Path("vm-a".to_string()), auth_headers()).await.unwrap();
        assert_eq!(status, StatusCode::ACCEPTED);

        let mut store = state.ctx.store.lock().await;
        let conn = store.get_connection().unwrap();
        let stop_task = tables::tasks::get_task(conn, accepted.task_id).unwrap().unwrap();
        assert_eq!(stop_task.operation, TaskOperation::Stop);

        let ready = tables::tasks::fetch_ready_tasks(conn, 100_000, 10).unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].operation, TaskOperation::Stop);
    }
}
