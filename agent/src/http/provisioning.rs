//! `/provisioning/profiles` CRUD. Profiles are reusable provisioning
//! templates referenced by id from `POST /zones`; they carry no task of
//! their own, so every handler here is a direct Store read/write.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;

use shared::api::ProvisioningProfileRequest;
use shared::error::AgentError;
use shared::utils::current_timestamp;
use shared::zone::{ProvisioningProfile, ProvisioningSpec};

use crate::store::tables;

use super::{validate_api_key, ApiError, AppState};

fn request_to_spec(request: &ProvisioningProfileRequest) -> ProvisioningSpec {
    ProvisioningSpec {
        artifact_id: request.artifact_id.clone(),
        recipe_id: request.recipe_id.clone(),
        skip_boot: request.skip_boot,
        skip_recipe: request.skip_recipe,
        credentials: Some(request.credentials.clone()),
        ip: None,
        networks: request.networks.clone(),
        folders: request.folders.clone(),
        provisioners: request.provisioners.clone(),
    }
}

fn new_profile_id() -> String {
    format!("{:016x}{:016x}", rand::random::<u64>(), rand::random::<u64>())
}

pub async fn list_profiles(
    State(state): State<AppState>,
) -> Result<Json<Vec<ProvisioningProfile>>, ApiError> {
    let mut store = state.ctx.store.lock().await;
    let conn = store.get_connection()?;
    Ok(Json(tables::provisioning::list_profiles(conn)?))
}

pub async fn get_profile(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ProvisioningProfile>, ApiError> {
    let mut store = state.ctx.store.lock().await;
    let conn = store.get_connection()?;
    let profile = tables::provisioning::get_profile(conn, &id)?
        .ok_or_else(|| AgentError::not_found(format!("provisioning profile '{id}' not found")))?;
    Ok(Json(profile))
}

pub async fn create_profile(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ProvisioningProfileRequest>,
) -> Result<(StatusCode, Json<ProvisioningProfile>), ApiError> {
    validate_api_key(&headers, &state.config.api_key)?;
    if request.name.trim().is_empty() {
        return Err(AgentError::validation("profile name must not be empty").into());
    }

    let now = current_timestamp();
    let mut store = state.ctx.store.lock().await;
    let conn = store.get_connection()?;

    let existing = tables::provisioning::list_profiles(conn)?;
    if existing.iter().any(|p| p.name == request.name) {
        return Err(AgentError::conflict(format!("provisioning profile '{}' already exists", request.name)).into());
    }

    let id = new_profile_id();
    let spec = request_to_spec(&request);
    tables::provisioning::upsert_profile(conn, &id, &request.name, &spec, now)?;
    let profile = tables::provisioning::get_profile(conn, &id)?
        .ok_or_else(|| AgentError::Internal("profile vanished immediately after insert".to_string()))?;
    Ok((StatusCode::CREATED, Json(profile)))
}

pub async fn update_profile(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<ProvisioningProfileRequest>,
) -> Result<Json<ProvisioningProfile>, ApiError> {
    validate_api_key(&headers, &state.config.api_key)?;

    let now = current_timestamp();
    let mut store = state.ctx.store.lock().await;
    let conn = store.get_connection()?;
    if tables::provisioning::get_profile(conn, &id)?.is_none() {
        return Err(AgentError::not_found(format!("provisioning profile '{id}' not found")).into());
    }

    let spec = request_to_spec(&request);
    tables::provisioning::upsert_profile(conn, &id, &request.name, &spec, now)?;
    let profile = tables::provisioning::get_profile(conn, &id)?
        .ok_or_else(|| AgentError::Internal("profile vanished immediately after update".to_string()))?;
    Ok(Json(profile))
}

pub async fn delete_profile(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    validate_api_key(&headers, &state.config.api_key)?;

    let mut store = state.ctx.store.lock().await;
    let conn = store.get_connection()?;
    if tables::provisioning::get_profile(conn, &id)?.is_none() {
        return Err(AgentError::not_found(format!("provisioning profile '{id}' not found")).into());
    }
    tables::provisioning::delete_profile(conn, &id)?;
    Ok(StatusCode::NO_CONTENT)
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
    use shared::task::SshCredentials;
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

    fn sample_request(name: &str) -> ProvisioningProfileRequest {
        ProvisioningProfileRequest {
            name: name.to_string(),
            artifact_id: Some("art-1".to_string()),
            recipe_id: None,
            skip_boot: false,
            skip_recipe: false,
            credentials: SshCredentials { username: "root".to_string(), password: None, private_key: None },
            networks: Vec::new(),
            folders: Vec::new(),
            provisioners: Vec::new(),
        }
    }

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let (state, _dir) = test_state().await;
        let (status, Json(created)) =
            create_profile(State(state.clone()), auth_headers(), Json(sample_request("default"))).await.unwrap();
        assert_eq!(status, StatusCode::CREATED);

        let Json(fetched) = get_profile(State(state), Path(created.id.clone())).await.unwrap();
        assert_eq!(fetched.name, "default");
        assert_eq!(fetched.spec.artifact_id.as_deref(), Some("art-1"));
    }

    #[tokio::test]
    async fn create_rejects_duplicate_name() {
        let (state, _dir) = test_state().await;
        create_profile(State(state.clone()), auth_headers(), Json(sample_request("default"))).await.unwrap();
        let err = create_profile(State(state), auth_headers(), Json(sample_request("default")))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Agent(AgentError::Conflict(_))));
    }

    #[tokio::test]
    async fn delete_missing_profile_is_not_found() {
        let (state, _dir) = test_state().await;
        let err = delete_profile(State(state), Path("missing".to_string()), auth_headers())
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Agent(AgentError::NotFound(_))));
    }
}
