//! Task Engine domain types
//!
//! A `Task` is the unit of work the dispatcher schedules against the host.
//! `TaskMetadata` is the tagged-variant-per-operation payload described in
//! the design notes: each operation gets its own typed struct, validated
//! once at insert time, and the whole enum round-trips through a single
//! opaque JSON column at the Store boundary (see `crate::config` for the
//! analogous pattern applied to task configuration in the teacher crate).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Opaque task identifier, assigned by the Store on insert.
pub type TaskId = i64;

/// Ordered scheduling priority. Declared low-to-high so the derived `Ord`
/// impl makes `Critical` sort greatest — the dispatcher selects the
/// highest-priority runnable task first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    Medium,
    Normal,
    High,
    Critical,
}

impl std::fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskPriority::Low => "low",
            TaskPriority::Medium => "medium",
            TaskPriority::Normal => "normal",
            TaskPriority::High => "high",
            TaskPriority::Critical => "critical",
        };
        write!(f, "{s}")
    }
}

impl TaskPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPriority::Low => "low",
            TaskPriority::Medium => "medium",
            TaskPriority::Normal => "normal",
            TaskPriority::High => "high",
            TaskPriority::Critical => "critical",
        }
    }

    pub fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "low" => Ok(TaskPriority::Low),
            "medium" => Ok(TaskPriority::Medium),
            "normal" => Ok(TaskPriority::Normal),
            "high" => Ok(TaskPriority::High),
            "critical" => Ok(TaskPriority::Critical),
            other => anyhow::bail!("unknown task priority: {other}"),
        }
    }
}

/// Task lifecycle state. Transitions are restricted to
/// `pending -> running -> {completed, failed}` or `pending -> cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => anyhow::bail!("unknown task status: {other}"),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// The full operation vocabulary from the task engine's point of view.
/// Stored as its own column so the dispatcher can query the mutex set and
/// the HTTP surface can filter by operation without decoding `metadata`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOperation {
    Start,
    Stop,
    Delete,
    ZoneCreate,
    ZoneModify,
    ZoneProvisioningExtract,
    ZoneSetup,
    ZoneWaitSsh,
    ZoneSync,
    ZoneSyncParent,
    ZoneProvision,
    ZoneProvisionParent,
    ZoneProvisionOrchestration,
    CreateVnic,
    DeleteVnic,
    SetVnicProperties,
    PkgInstall,
    PkgUninstall,
    UserCreate,
    UserModify,
    UserDelete,
    UserSetPassword,
    UserLock,
    UserUnlock,
    GroupCreate,
    GroupModify,
    GroupDelete,
    RoleCreate,
    RoleModify,
    RoleDelete,
}

impl TaskOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskOperation::Start => "start",
            TaskOperation::Stop => "stop",
            TaskOperation::Delete => "delete",
            TaskOperation::ZoneCreate => "zone_create",
            TaskOperation::ZoneModify => "zone_modify",
            TaskOperation::ZoneProvisioningExtract => "zone_provisioning_extract",
            TaskOperation::ZoneSetup => "zone_setup",
            TaskOperation::ZoneWaitSsh => "zone_wait_ssh",
            TaskOperation::ZoneSync => "zone_sync",
            TaskOperation::ZoneSyncParent => "zone_sync_parent",
            TaskOperation::ZoneProvision => "zone_provision",
            TaskOperation::ZoneProvisionParent => "zone_provision_parent",
            TaskOperation::ZoneProvisionOrchestration => "zone_provision_orchestration",
            TaskOperation::CreateVnic => "create_vnic",
            TaskOperation::DeleteVnic => "delete_vnic",
            TaskOperation::SetVnicProperties => "set_vnic_properties",
            TaskOperation::PkgInstall => "pkg_install",
            TaskOperation::PkgUninstall => "pkg_uninstall",
            TaskOperation::UserCreate => "user_create",
            TaskOperation::UserModify => "user_modify",
            TaskOperation::UserDelete => "user_delete",
            TaskOperation::UserSetPassword => "user_set_password",
            TaskOperation::UserLock => "user_lock",
            TaskOperation::UserUnlock => "user_unlock",
            TaskOperation::GroupCreate => "group_create",
            TaskOperation::GroupModify => "group_modify",
            TaskOperation::GroupDelete => "group_delete",
            TaskOperation::RoleCreate => "role_create",
            TaskOperation::RoleModify => "role_modify",
            TaskOperation::RoleDelete => "role_delete",
        }
    }

    pub fn from_str(s: &str) -> anyhow::Result<Self> {
        Ok(match s {
            "start" => TaskOperation::Start,
            "stop" => TaskOperation::Stop,
            "delete" => TaskOperation::Delete,
            "zone_create" => TaskOperation::ZoneCreate,
            "zone_modify" => TaskOperation::ZoneModify,
            "zone_provisioning_extract" => TaskOperation::ZoneProvisioningExtract,
            "zone_setup" => TaskOperation::ZoneSetup,
            "zone_wait_ssh" => TaskOperation::ZoneWaitSsh,
            "zone_sync" => TaskOperation::ZoneSync,
            "zone_sync_parent" => TaskOperation::ZoneSyncParent,
            "zone_provision" => TaskOperation::ZoneProvision,
            "zone_provision_parent" => TaskOperation::ZoneProvisionParent,
            "zone_provision_orchestration" => TaskOperation::ZoneProvisionOrchestration,
            "create_vnic" => TaskOperation::CreateVnic,
            "delete_vnic" => TaskOperation::DeleteVnic,
            "set_vnic_properties" => TaskOperation::SetVnicProperties,
            "pkg_install" => TaskOperation::PkgInstall,
            "pkg_uninstall" => TaskOperation::PkgUninstall,
            "user_create" => TaskOperation::UserCreate,
            "user_modify" => TaskOperation::UserModify,
            "user_delete" => TaskOperation::UserDelete,
            "user_set_password" => TaskOperation::UserSetPassword,
            "user_lock" => TaskOperation::UserLock,
            "user_unlock" => TaskOperation::UserUnlock,
            "group_create" => TaskOperation::GroupCreate,
            "group_modify" => TaskOperation::GroupModify,
            "group_delete" => TaskOperation::GroupDelete,
            "role_create" => TaskOperation::RoleCreate,
            "role_modify" => TaskOperation::RoleModify,
            "role_delete" => TaskOperation::RoleDelete,
            other => anyhow::bail!("unknown task operation: {other}"),
        })
    }

    /// Operations where concurrent execution against the same zone would
    /// corrupt host state. Duplicate `(zone_name, operation)` inserts while
    /// one is pending/running are folded into the existing task (I4).
    pub fn is_mutex(&self) -> bool {
        matches!(
            self,
            TaskOperation::Start
                | TaskOperation::Stop
                | TaskOperation::Delete
                | TaskOperation::ZoneCreate
                | TaskOperation::ZoneModify
                | TaskOperation::ZoneProvisioningExtract
                | TaskOperation::ZoneSetup
                | TaskOperation::ZoneSync
                | TaskOperation::ZoneProvision
        )
    }

    /// Orchestration/parent operations never have a registered handler;
    /// their status is purely the aggregate of their children's statuses.
    pub fn is_aggregate_only(&self) -> bool {
        matches!(
            self,
            TaskOperation::ZoneSyncParent
                | TaskOperation::ZoneProvisionParent
                | TaskOperation::ZoneProvisionOrchestration
        )
    }
}

/// Credentials copied down into every provisioning step's metadata so a
/// handler never has to re-read the zone row to authenticate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SshCredentials {
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub private_key: Option<String>,
}

/// One folder to synchronise into the zone over SFTP.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncFolder {
    pub local_path: String,
    pub remote_path: String,
    #[serde(default)]
    pub exclude: Vec<String>,
}

/// One remote-execution provisioner step (shell script or playbook).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Provisioner {
    pub name: String,
    pub kind: ProvisionerKind,
    /// Script body, playbook path, or command line, depending on `kind`.
    pub payload: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionerKind {
    Shell,
    Ansible,
}

/// Tagged-variant-per-operation metadata payload. Stored as a single JSON
/// column; the `operation` tag is internal to the serialized form so the
/// column round-trips without an external lookup table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum TaskMetadata {
    Start,
    Stop,
    Delete,
    ZoneCreate {
        brand: String,
        zonepath: String,
        configuration: serde_json::Value,
    },
    ZoneModify {
        configuration: serde_json::Value,
    },
    ZoneProvisioningExtract {
        artifact_id: String,
        dataset_path: String,
    },
    ZoneSetup {
        recipe_id: String,
        credentials: SshCredentials,
        ip: String,
    },
    ZoneWaitSsh {
        ip: String,
        #[serde(default = "crate::defaults::default_ssh_port")]
        port: u16,
        credentials: SshCredentials,
    },
    ZoneSync {
        folder: SyncFolder,
        ip: String,
        #[serde(default = "crate::defaults::default_ssh_port")]
        port: u16,
        credentials: SshCredentials,
    },
    ZoneSyncParent {
        total_folders: u32,
    },
    ZoneProvision {
        provisioner: Provisioner,
        ip: String,
        #[serde(default = "crate::defaults::default_ssh_port")]
        port: u16,
        credentials: SshCredentials,
    },
    ZoneProvisionParent {
        total_provisioners: u32,
    },
    ZoneProvisionOrchestration,
    CreateVnic {
        vnic_name: String,
        link: String,
        #[serde(default)]
        properties: HashMap<String, String>,
    },
    DeleteVnic {
        vnic_name: String,
    },
    SetVnicProperties {
        vnic_name: String,
        properties: HashMap<String, String>,
    },
    PkgInstall {
        package: String,
    },
    PkgUninstall {
        package: String,
    },
    UserCreate {
        username: String,
        #[serde(default)]
        fields: HashMap<String, String>,
    },
    UserModify {
        username: String,
        fields: HashMap<String, String>,
    },
    UserDelete {
        username: String,
    },
    UserSetPassword {
        username: String,
        password_hash: String,
    },
    UserLock {
        username: String,
    },
    UserUnlock {
        username: String,
    },
    GroupCreate {
        name: String,
    },
    GroupModify {
        name: String,
        fields: HashMap<String, String>,
    },
    GroupDelete {
        name: String,
    },
    RoleCreate {
        name: String,
    },
    RoleModify {
        name: String,
        fields: HashMap<String, String>,
    },
    RoleDelete {
        name: String,
    },
}

impl TaskMetadata {
    /// The operation this metadata payload belongs to. Used at insert time
    /// to check the caller-supplied `operation` column matches the payload.
    pub fn operation(&self) -> TaskOperation {
        match self {
            TaskMetadata::Start => TaskOperation::Start,
            TaskMetadata::Stop => TaskOperation::Stop,
            TaskMetadata::Delete => TaskOperation::Delete,
            TaskMetadata::ZoneCreate { .. } => TaskOperation::ZoneCreate,
            TaskMetadata::ZoneModify { .. } => TaskOperation::ZoneModify,
            TaskMetadata::ZoneProvisioningExtract { .. } => {
                TaskOperation::ZoneProvisioningExtract
            }
            TaskMetadata::ZoneSetup { .. } => TaskOperation::ZoneSetup,
            TaskMetadata::ZoneWaitSsh { .. } => TaskOperation::ZoneWaitSsh,
            TaskMetadata::ZoneSync { .. } => TaskOperation::ZoneSync,
            TaskMetadata::ZoneSyncParent { .. } => TaskOperation::ZoneSyncParent,
            TaskMetadata::ZoneProvision { .. } => TaskOperation::ZoneProvision,
            TaskMetadata::ZoneProvisionParent { .. } => TaskOperation::ZoneProvisionParent,
            TaskMetadata::ZoneProvisionOrchestration => TaskOperation::ZoneProvisionOrchestration,
            TaskMetadata::CreateVnic { .. } => TaskOperation::CreateVnic,
            TaskMetadata::DeleteVnic { .. } => TaskOperation::DeleteVnic,
            TaskMetadata::SetVnicProperties { .. } => TaskOperation::SetVnicProperties,
            TaskMetadata::PkgInstall { .. } => TaskOperation::PkgInstall,
            TaskMetadata::PkgUninstall { .. } => TaskOperation::PkgUninstall,
            TaskMetadata::UserCreate { .. } => TaskOperation::UserCreate,
            TaskMetadata::UserModify { .. } => TaskOperation::UserModify,
            TaskMetadata::UserDelete { .. } => TaskOperation::UserDelete,
            TaskMetadata::UserSetPassword { .. } => TaskOperation::UserSetPassword,
            TaskMetadata::UserLock { .. } => TaskOperation::UserLock,
            TaskMetadata::UserUnlock { .. } => TaskOperation::UserUnlock,
            TaskMetadata::GroupCreate { .. } => TaskOperation::GroupCreate,
            TaskMetadata::GroupModify { .. } => TaskOperation::GroupModify,
            TaskMetadata::GroupDelete { .. } => TaskOperation::GroupDelete,
            TaskMetadata::RoleCreate { .. } => TaskOperation::RoleCreate,
            TaskMetadata::RoleModify { .. } => TaskOperation::RoleModify,
            TaskMetadata::RoleDelete { .. } => TaskOperation::RoleDelete,
        }
    }
}

/// The literal zone name used for host-scope tasks that don't target a
/// specific zone (e.g. a future host-wide package operation).
pub const HOST_SCOPE_ZONE: &str = "system";

/// A unit of work tracked by the Task Engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub zone_name: String,
    pub operation: TaskOperation,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    pub depends_on: Option<TaskId>,
    pub parent_task_id: Option<TaskId>,
    pub metadata: TaskMetadata,
    pub created_by: String,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub error_message: Option<String>,
    pub attempt: u32,
}

/// Outcome a handler reports back to the dispatcher. Distinguishing
/// retryable from terminal failures lets the dispatcher apply backoff
/// without string-sniffing the error message.
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    Ok,
    Retryable(String),
    Terminal(String),
}
