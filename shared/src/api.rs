//! HTTP/WebSocket surface contracts
//!
//! DTOs only — the axum router and its middleware live in the `agent`
//! crate. Keeping these request/response shapes here lets both the agent
//! and any future client share one definition of the wire format.

use serde::{Deserialize, Serialize};

use crate::task::{Provisioner, SshCredentials, SyncFolder};
use crate::zone::{NetworkSpec, ProvisioningSpec};

/// HTTP headers used for authentication.
pub mod headers {
    pub const API_KEY: &str = "X-API-Key";
}

/// API endpoint path prefixes.
pub mod endpoints {
    pub const ZONES: &str = "/zones";
    pub const PROVISIONING_PROFILES: &str = "/provisioning/profiles";
    pub const ZLOGIN_SESSIONS: &str = "/zlogin/sessions";
    pub const STATS: &str = "/stats";
}

/// Every mutating endpoint's 202 body: the created (or pre-existing, for
/// mutex-deduplicated inserts) task id and its current status.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskAccepted {
    pub task_id: i64,
    pub status: String,
}

/// A structured error body. Error kinds named in the error handling design
/// map onto HTTP status codes by `status_code()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiErrorKind {
    Validation,
    NotFound,
    Conflict,
    Internal,
}

impl ApiErrorKind {
    pub fn status_code(&self) -> u16 {
        match self {
            ApiErrorKind::Validation => 400,
            ApiErrorKind::NotFound => 404,
            ApiErrorKind::Conflict => 409,
            ApiErrorKind::Internal => 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorBody {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: None,
        }
    }

    pub fn with_details(error: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: Some(details.into()),
        }
    }
}

/// `POST /zones` request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateZoneRequest {
    pub name: String,
    pub brand: String,
    pub zonepath: String,
    #[serde(default)]
    pub configuration: serde_json::Value,
    #[serde(default)]
    pub provisioning: Option<ProvisioningSpec>,
}

/// `PUT /zones/{name}` request body. `configuration` patches merge into
/// the stored document; `provisioning`, when present, replaces the
/// `provisioning` key without queueing a task (I6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModifyZoneRequest {
    #[serde(default)]
    pub configuration: Option<serde_json::Value>,
    #[serde(default)]
    pub provisioning: Option<ProvisioningSpec>,
}

/// `GET /zones/{name}` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneResponse {
    pub name: String,
    pub zone_id: String,
    pub brand: String,
    pub status: String,
    pub zonepath: String,
    pub is_orphaned: bool,
    pub auto_discovered: bool,
    pub last_seen: i64,
}

/// `GET /zones/{name}/provision/status` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionStatusResponse {
    pub orchestration_task_id: i64,
    pub status: String,
    pub children: Vec<TaskSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSummary {
    pub task_id: i64,
    pub operation: String,
    pub status: String,
    pub error_message: Option<String>,
}

/// `POST/PUT /provisioning/profiles[/id]` request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisioningProfileRequest {
    pub name: String,
    pub artifact_id: Option<String>,
    pub recipe_id: Option<String>,
    #[serde(default)]
    pub skip_boot: bool,
    #[serde(default)]
    pub skip_recipe: bool,
    pub credentials: SshCredentials,
    #[serde(default)]
    pub networks: Vec<NetworkSpec>,
    #[serde(default)]
    pub folders: Vec<SyncFolder>,
    #[serde(default)]
    pub provisioners: Vec<Provisioner>,
}

/// `POST /zones/{name}/zlogin/start` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZloginSessionResponse {
    pub session_id: i64,
    pub zone_name: String,
    pub status: String,
    pub websocket_path: String,
}

/// `GET /zlogin/sessions` response entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZloginSessionSummary {
    pub session_id: i64,
    pub zone_name: String,
    pub status: String,
    pub started_at: i64,
}

/// `GET /stats` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsResponse {
    pub host: String,
    pub zones_total: u64,
    pub zones_running: u64,
    pub tasks_pending: u64,
    pub tasks_running: u64,
    pub active_console_sessions: u64,
    pub cpu_count: Option<u32>,
    pub total_memory_bytes: Option<u64>,
}
