//! HTTP / WebSocket surface
//!
//! Thin by design (§4.7): every mutating endpoint validates its input, then
//! inserts a [`shared::task::Task`] and returns immediately — it never
//! performs a blocking host operation inline. Read endpoints only ever
//! project from the [`Store`]. This generalizes the teacher's
//! `server/src/api.rs::AppState`/`create_router` pattern from metrics
//! ingestion to the zone/provisioning/console control surface.

mod provisioning;
mod stats;
mod zlogin;
mod zones;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use subtle::ConstantTimeEq;
use tracing::warn;

use shared::api::{endpoints, headers, ErrorBody};
use shared::config::AgentConfig;
use shared::error::AgentError;

use crate::handlers::HandlerContext;
use crate::orchestrator::ProvisioningOrchestrator;

/// Everything an HTTP handler needs. Wraps the same [`HandlerContext`] the
/// Task Engine hands to its operation handlers, so the Store/console/ssh
/// plumbing is defined in exactly one place, plus the pieces only the HTTP
/// surface needs: the agent's own config (API key, host) and the
/// Provisioning Orchestrator.
#[derive(Clone)]
pub struct AppState {
    pub ctx: Arc<HandlerContext>,
    pub config: Arc<AgentConfig>,
    pub orchestrator: Arc<ProvisioningOrchestrator>,
}

impl AppState {
    pub fn new(
        ctx: Arc<HandlerContext>,
        config: Arc<AgentConfig>,
        orchestrator: Arc<ProvisioningOrchestrator>,
    ) -> Self {
        Self { ctx, config, orchestrator }
    }
}

/// Build the router for every endpoint named in §6.3. Axum 0.8's `{param}`
/// path syntax is used throughout.
pub fn create_router(state: AppState) -> Router {
    let body_limit_bytes = (state.config.http_body_limit_mb as usize) * 1024 * 1024;

    let zones_router = Router::new()
        .route(endpoints::ZONES, get(zones::list_zones).post(zones::create_zone))
        .route(
            "/zones/{name}",
            get(zones::get_zone).put(zones::modify_zone).delete(zones::delete_zone),
        )
        .route("/zones/{name}/config", get(zones::get_zone_config))
        .route("/zones/{name}/start", post(zones::start_zone))
        .route("/zones/{name}/stop", post(zones::stop_zone))
        .route("/zones/{name}/restart", post(zones::restart_zone))
        .route("/zones/{name}/provision", post(zones::provision_zone))
        .route("/zones/{name}/sync", post(zones::sync_zone))
        .route("/zones/{name}/run-provisioners", post(zones::run_provisioners))
        .route("/zones/{name}/provision/status", get(zones::provision_status));

    let provisioning_router = Router::new()
        .route(
            endpoints::PROVISIONING_PROFILES,
            get(provisioning::list_profiles).post(provisioning::create_profile),
        )
        .route(
            "/provisioning/profiles/{id}",
            get(provisioning::get_profile)
                .put(provisioning::update_profile)
                .delete(provisioning::delete_profile),
        );

    let zlogin_router = Router::new()
        .route("/zones/{name}/zlogin/start", post(zlogin::start_session))
        .route(endpoints::ZLOGIN_SESSIONS, get(zlogin::list_sessions))
        .route("/zlogin/sessions/{id}/stop", delete(zlogin::stop_session))
        .route("/zlogin/sessions/{id}", get(zlogin::websocket));

    let stats_router = Router::new().route(endpoints::STATS, get(stats::get_stats));

    zones_router
        .merge(provisioning_router)
        .merge(zlogin_router)
        .merge(stats_router)
        .layer(DefaultBodyLimit::max(body_limit_bytes))
        .with_state(state)
}

/// Constant-time API key check (§4.7, X-API-Key header). There is no
/// `Unauthorized` kind in [`shared::api::ApiErrorKind`] — every endpoint is
/// authenticated the same way, so this maps straight to 401 rather than
/// forcing the shared validation-error shape onto an auth failure.
pub(crate) fn validate_api_key(headers: &HeaderMap, expected: &str) -> Result<(), ApiError> {
    let provided = headers
        .get(headers::API_KEY)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let matches = provided.len() == expected.len()
        && bool::from(provided.as_bytes().ct_eq(expected.as_bytes()));

    if matches && !provided.is_empty() {
        Ok(())
    } else {
        warn!("rejected request with missing or invalid API key");
        Err(ApiError::Unauthorized)
    }
}

/// HTTP-facing error type. Wraps [`AgentError`] for the four kinds named in
/// the error handling design plus the one HTTP-only concern (auth) that
/// has no Store/Task Engine equivalent.
#[derive(Debug)]
pub enum ApiError {
    Unauthorized,
    Agent(AgentError),
}

impl From<AgentError> for ApiError {
    fn from(e: AgentError) -> Self {
        ApiError::Agent(e)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError::Agent(AgentError::Internal(e.to_string()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::Unauthorized => {
                (StatusCode::UNAUTHORIZED, ErrorBody::new("unauthorized"))
            }
            ApiError::Agent(AgentError::Validation(msg)) => {
                (StatusCode::BAD_REQUEST, ErrorBody::with_details("validation_error", msg))
            }
            ApiError::Agent(AgentError::NotFound(msg)) => {
                (StatusCode::NOT_FOUND, ErrorBody::with_details("not_found", msg))
            }
            ApiError::Agent(AgentError::Conflict(msg)) => {
                (StatusCode::CONFLICT, ErrorBody::with_details("conflict", msg))
            }
            ApiError::Agent(AgentError::Store(msg)) | ApiError::Agent(AgentError::Internal(msg)) => {
                (StatusCode::INTERNAL_SERVER_ERROR, ErrorBody::with_details("internal_error", msg))
            }
        };
        (status, Json(body)).into_response()
    }
}

/// Map an orchestrator failure onto the same four-kind error vocabulary.
impl From<crate::orchestrator::OrchestratorError> for ApiError {
    fn from(e: crate::orchestrator::OrchestratorError) -> Self {
        use crate::orchestrator::OrchestratorError as E;
        match e {
            E::ZoneNotFound(name) => ApiError::Agent(AgentError::NotFound(format!("zone '{name}' not found"))),
            E::InvalidZoneName(err) => ApiError::Agent(AgentError::Validation(err.to_string())),
            E::NoProvisioningSpec
            | E::MissingCredentials
            | E::MissingTargetIp
            | E::NoSyncFolders
            | E::NoProvisioners => ApiError::Agent(AgentError::Validation(e.to_string())),
            E::Store(err) => ApiError::Agent(AgentError::Internal(err.to_string())),
        }
    }
}
