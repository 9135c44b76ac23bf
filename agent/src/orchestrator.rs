//! Provisioning Orchestrator
//!
//! Reads a zone's stored `provisioning` document (parsed out of `configuration`)
//! and lays down the linear task chain the Task Engine executes one step at a
//! time: extract the artifact, boot the zone, run the console recipe, wait
//! for SSH, sync folders, run provisioners. All validation happens once,
//! here, before a single row is written (§4.4's validation-before-insert
//! contract) — `queue` either writes the whole chain or writes nothing.
//!
//! Child steps are inserted via `tables::tasks::insert_task` directly rather
//! than through `Store::insert_task`, bypassing its mutex-set dedup: that
//! dedup exists to fold duplicate *external* requests for the same
//! `(zone, operation)` pair, not an orchestrator-built chain that
//! intentionally creates several same-operation siblings (two `zone_sync`
//! children for two folders both legitimately carry the operation
//! `zone_sync`, and would otherwise collapse into one row).

use std::sync::Arc;
use std::time::Duration;

use rusqlite::Connection;
use thiserror::Error;
use tokio::sync::Mutex;

use shared::config::SshConfig;
use shared::task::{TaskId, TaskMetadata, TaskOperation, TaskPriority};
use shared::utils::{current_timestamp, validate_zone_name};
use shared::zone::ZoneStatus;

use crate::ssh::SshClient;
use crate::store::tables::{self, tasks::NewTask};
use crate::store::Store;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("zone '{0}' not found")]
    ZoneNotFound(String),
    #[error("invalid zone name: {0}")]
    InvalidZoneName(#[source] anyhow::Error),
    #[error("zone has no provisioning configuration")]
    NoProvisioningSpec,
    #[error("provisioning configuration requires credentials with a username")]
    MissingCredentials,
    #[error("provisioning configuration has no resolvable target IP")]
    MissingTargetIp,
    #[error("provisioning configuration has no folders to sync")]
    NoSyncFolders,
    #[error("provisioning configuration has no provisioners to run")]
    NoProvisioners,
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Fields common to every queue path: the zone's provisioning document,
/// resolved down to the credentials/target IP/port the remaining steps act
/// against, plus whether a pre-flight probe already found SSH reachable.
struct ResolvedTarget {
    zone: shared::zone::Zone,
    spec: shared::zone::ProvisioningSpec,
    credentials: shared::task::SshCredentials,
    target_ip: String,
    port: u16,
    ssh_already_reachable: bool,
}

pub struct ProvisioningOrchestrator {
    store: Arc<Mutex<Store>>,
    ssh: SshClient,
    ssh_config: SshConfig,
}

impl ProvisioningOrchestrator {
    pub fn new(store: Arc<Mutex<Store>>, ssh_config: SshConfig) -> Self {
        let ssh = SshClient::new(Duration::from_secs(ssh_config.probe_timeout_seconds));
        Self { store, ssh, ssh_config }
    }

    /// Validate `zone_name` and resolve its provisioning document down to
    /// the fields every queue path needs, probing SSH reachability once.
    async fn resolve(&self, zone_name: &str) -> Result<ResolvedTarget, OrchestratorError> {
        validate_zone_name(zone_name).map_err(OrchestratorError::InvalidZoneName)?;

        let zone = {
            let mut store = self.store.lock().await;
            let conn = store.get_connection()?;
            tables::zones::get_zone(conn, zone_name)?
        }
        .ok_or_else(|| OrchestratorError::ZoneNotFound(zone_name.to_string()))?;

        let spec = zone.provisioning()?.ok_or(OrchestratorError::NoProvisioningSpec)?;

        let credentials = spec.credentials.clone().ok_or(OrchestratorError::MissingCredentials)?;
        if credentials.username.trim().is_empty() {
            return Err(OrchestratorError::MissingCredentials);
        }
        let target_ip = spec
            .target_ip()
            .ok_or(OrchestratorError::MissingTargetIp)?
            .to_string();
        let port = self.ssh_config.default_port;

        // A quick pre-flight probe decides whether the console recipe and
        // the wait-for-ssh step are still needed (§4.4 step 3/4).
        let ssh_already_reachable = self.ssh.probe(&target_ip, port, &credentials).await;

        Ok(ResolvedTarget { zone, spec, credentials, target_ip, port, ssh_already_reachable })
    }

    /// Validate the zone's provisioning document and queue its task chain,
    /// returning the aggregate orchestration task's id.
    pub async fn queue(&self, zone_name: &str) -> Result<TaskId, OrchestratorError> {
        let ResolvedTarget { zone, spec, credentials, target_ip, port, ssh_already_reachable } =
            self.resolve(zone_name).await?;

        let now = current_timestamp();
        let mut store = self.store.lock().await;
        let conn = store.get_connection()?;

        let orchestration_id = insert_step(
            conn,
            zone_name,
            TaskOperation::ZoneProvisionOrchestration,
            TaskMetadata::ZoneProvisionOrchestration,
            None,
            None,
            now,
        )?;

        let mut previous: Option<TaskId> = None;

        if let Some(artifact_id) = spec.artifact_id.clone() {
            let dataset_path = format!("{}/artifact", zone.zonepath.trim_end_matches('/'));
            previous = Some(insert_step(
                conn,
                zone_name,
                TaskOperation::ZoneProvisioningExtract,
                TaskMetadata::ZoneProvisioningExtract { artifact_id, dataset_path },
                previous,
                Some(orchestration_id),
                now,
            )?);
        }

        if !spec.skip_boot && zone.status != ZoneStatus::Running {
            previous = Some(insert_step(
                conn,
                zone_name,
                TaskOperation::Start,
                TaskMetadata::Start,
                previous,
                Some(orchestration_id),
                now,
            )?);
        }

        if spec.recipe_id.is_some() && !spec.skip_recipe && !ssh_already_reachable {
            previous = Some(insert_step(
                conn,
                zone_name,
                TaskOperation::ZoneSetup,
                TaskMetadata::ZoneSetup {
                    recipe_id: spec.recipe_id.clone().unwrap(),
                    credentials: credentials.clone(),
                    ip: target_ip.clone(),
                },
                previous,
                Some(orchestration_id),
                now,
            )?);
        }

        // Always queued: the pre-flight probe only gates the console-recipe
        // step above (§4.4 step 3), not this one. Only a prior *task step*
        // confirming SSH may suppress it (§4.4 step 4), and no earlier step
        // in this chain does that.
        previous = Some(insert_step(
            conn,
            zone_name,
            TaskOperation::ZoneWaitSsh,
            TaskMetadata::ZoneWaitSsh { ip: target_ip.clone(), port, credentials: credentials.clone() },
            previous,
            Some(orchestration_id),
            now,
        )?);

        if !spec.folders.is_empty() {
            let sync_parent_id = insert_step(
                conn,
                zone_name,
                TaskOperation::ZoneSyncParent,
                TaskMetadata::ZoneSyncParent { total_folders: spec.folders.len() as u32 },
                None,
                Some(orchestration_id),
                now,
            )?;

            for folder in &spec.folders {
                previous = Some(insert_step(
                    conn,
                    zone_name,
                    TaskOperation::ZoneSync,
                    TaskMetadata::ZoneSync {
                        folder: folder.clone(),
                        ip: target_ip.clone(),
                        port,
                        credentials: credentials.clone(),
                    },
                    previous,
                    Some(sync_parent_id),
                    now,
                )?);
            }
        }

        if !spec.provisioners.is_empty() {
            let provision_parent_id = insert_step(
                conn,
                zone_name,
                TaskOperation::ZoneProvisionParent,
                TaskMetadata::ZoneProvisionParent { total_provisioners: spec.provisioners.len() as u32 },
                None,
                Some(orchestration_id),
                now,
            )?;

            for provisioner in &spec.provisioners {
                previous = Some(insert_step(
                    conn,
                    zone_name,
                    TaskOperation::ZoneProvision,
                    TaskMetadata::ZoneProvision {
                        provisioner: provisioner.clone(),
                        ip: target_ip.clone(),
                        port,
                        credentials: credentials.clone(),
                    },
                    previous,
                    Some(provision_parent_id),
                    now,
                )?);
            }
        }

        let _ = previous;
        Ok(orchestration_id)
    }

    /// Queue only the folder-sync chain, for a zone that's already running
    /// and reachable rather than mid-provision. Inserts a leading
    /// `zone_wait_ssh` step only if the pre-flight probe found SSH down.
    pub async fn queue_sync(&self, zone_name: &str) -> Result<TaskId, OrchestratorError> {
        let ResolvedTarget { spec, credentials, target_ip, port, ssh_already_reachable, .. } =
            self.resolve(zone_name).await?;
        if spec.folders.is_empty() {
            return Err(OrchestratorError::NoSyncFolders);
        }

        let now = current_timestamp();
        let mut store = self.store.lock().await;
        let conn = store.get_connection()?;

        let wait_ssh_id = if ssh_already_reachable {
            None
        } else {
            Some(insert_step(
                conn,
                zone_name,
                TaskOperation::ZoneWaitSsh,
                TaskMetadata::ZoneWaitSsh { ip: target_ip.clone(), port, credentials: credentials.clone() },
                None,
                None,
                now,
            )?)
        };

        let sync_parent_id = insert_step(
            conn,
            zone_name,
            TaskOperation::ZoneSyncParent,
            TaskMetadata::ZoneSyncParent { total_folders: spec.folders.len() as u32 },
            wait_ssh_id,
            None,
            now,
        )?;

        let mut previous: Option<TaskId> = None;
        for folder in &spec.folders {
            previous = Some(insert_step(
                conn,
                zone_name,
                TaskOperation::ZoneSync,
                TaskMetadata::ZoneSync {
                    folder: folder.clone(),
                    ip: target_ip.clone(),
                    port,
                    credentials: credentials.clone(),
                },
                previous,
                Some(sync_parent_id),
                now,
            )?);
        }

        Ok(sync_parent_id)
    }

    /// Queue only the provisioner chain, the standalone counterpart to the
    /// provisioning step of [`Self::queue`].
    pub async fn queue_provisioners(&self, zone_name: &str) -> Result<TaskId, OrchestratorError> {
        let ResolvedTarget { spec, credentials, target_ip, port, ssh_already_reachable, .. } =
            self.resolve(zone_name).await?;
        if spec.provisioners.is_empty() {
            return Err(OrchestratorError::NoProvisioners);
        }

        let now = current_timestamp();
        let mut store = self.store.lock().await;
        let conn = store.get_connection()?;

        let wait_ssh_id = if ssh_already_reachable {
            None
        } else {
            Some(insert_step(
                conn,
                zone_name,
                TaskOperation::ZoneWaitSsh,
                TaskMetadata::ZoneWaitSsh { ip: target_ip.clone(), port, credentials: credentials.clone() },
                None,
                None,
                now,
            )?)
        };

        let provision_parent_id = insert_step(
            conn,
            zone_name,
            TaskOperation::ZoneProvisionParent,
            TaskMetadata::ZoneProvisionParent { total_provisioners: spec.provisioners.len() as u32 },
            wait_ssh_id,
            None,
            now,
        )?;

        let mut previous: Option<TaskId> = None;
        for provisioner in &spec.provisioners {
            previous = Some(insert_step(
                conn,
                zone_name,
                TaskOperation::ZoneProvision,
                TaskMetadata::ZoneProvision {
                    provisioner: provisioner.clone(),
                    ip: target_ip.clone(),
                    port,
                    credentials: credentials.clone(),
                },
                previous,
                Some(provision_parent_id),
                now,
            )?);
        }

        Ok(provision_parent_id)
    }
}

#[allow(clippy::too_many_arguments)]
fn insert_step(
    conn: &Connection,
    zone_name: &str,
    operation: TaskOperation,
    metadata: TaskMetadata,
    depends_on: Option<TaskId>,
    parent_task_id: Option<TaskId>,
    now: i64,
) -> anyhow::Result<TaskId> {
    tables::tasks::insert_task(
        conn,
        &NewTask {
            zone_name: zone_name.to_string(),
            operation,
            priority: TaskPriority::Normal,
            depends_on,
            parent_task_id,
            metadata,
            created_by: "api".to_string(),
        },
        now,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::zone::{Zone, ZoneBrand};
    use tempfile::tempdir;

    async fn test_orchestrator() -> (ProvisioningOrchestrator, Arc<Mutex<Store>>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let mut store = Store::new(dir.path(), 5).unwrap();
        store.initialize().unwrap();
        let store = Arc::new(Mutex::new(store));
        let ssh_config = SshConfig { probe_timeout_seconds: 1, ..SshConfig::default() };
        (ProvisioningOrchestrator::new(store.clone(), ssh_config), store, dir)
    }

    async fn seed_zone(store: &Arc<Mutex<Store>>, zone_name: &str, status: ZoneStatus, configuration: serde_json::Value) {
        let mut store = store.lock().await;
        let conn = store.get_connection().unwrap();
        tables::zones::upsert_zone(
            conn,
            &Zone {
                name: zone_name.to_string(),
                zone_id: "1".to_string(),
                host: "hv01".to_string(),
                brand: ZoneBrand::Bhyve,
                status,
                zonepath: "/zones/vm-a".to_string(),
                configuration,
                is_orphaned: false,
                auto_discovered: false,
                last_seen: 0,
                created_at: 0,
                updated_at: 0,
            },
        )
        .unwrap();
    }

    fn happy_path_configuration() -> serde_json::Value {
        serde_json::json!({
            "provisioning": {
                "artifact_id": "art-1",
                "recipe_id": "r-1",
                "credentials": { "username": "root", "password": "hunter2" },
                "ip": "10.0.0.5",
                "folders": [
                    { "local_path": "/a", "remote_path": "/b", "exclude": [] },
                    { "local_path": "/c", "remote_path": "/d", "exclude": [] }
                ],
                "provisioners": [
                    { "name": "base", "kind": "shell", "payload": "echo hi" }
                ]
            }
        })
    }

    #[tokio::test]
    async fn rejects_unknown_zone_name_characters() {
        let (orchestrator, _store, _dir) = test_orchestrator().await;
        let err = orchestrator.queue("bad name").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidZoneName(_)));
    }

    #[tokio::test]
    async fn rejects_missing_zone() {
        let (orchestrator, _store, _dir) = test_orchestrator().await;
        let err = orchestrator.queue("vm-a").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::ZoneNotFound(_)));
    }

    #[tokio::test]
    async fn rejects_configuration_without_credentials() {
        let (orchestrator, store, _dir) = test_orchestrator().await;
        seed_zone(
            &store,
            "vm-a",
            ZoneStatus::Installed,
            serde_json::json!({ "provisioning": { "ip": "10.0.0.5" } }),
        )
        .await;
        let err = orchestrator.queue("vm-a").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::MissingCredentials));
    }

    #[tokio::test]
    async fn rejects_configuration_without_target_ip() {
        let (orchestrator, store, _dir) = test_orchestrator().await;
        seed_zone(
            &store,
            "vm-a",
            ZoneStatus::Installed,
            serde_json::json!({ "provisioning": { "credentials": { "username": "root" } } }),
        )
        .await;
        let err = orchestrator.queue("vm-a").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::MissingTargetIp));
    }

    #[tokio::test]
    async fn happy_path_builds_full_chain_with_parent_wrapped_folders_and_provisioners() {
        let (orchestrator, store, _dir) = test_orchestrator().await;
        seed_zone(&store, "vm-a", ZoneStatus::Installed, happy_path_configuration()).await;

        let orchestration_id = orchestrator.queue("vm-a").await.unwrap();

        let mut store = store.lock().await;
        let conn = store.get_connection().unwrap();
        let children = tables::tasks::children_of(conn, orchestration_id).unwrap();

        // Direct children of the orchestration row: extract, start, zone_setup,
        // zone_wait_ssh, zone_sync_parent, zone_provision_parent.
        assert_eq!(children.len(), 6);
        let ops: Vec<_> = children.iter().map(|t| t.operation).collect();
        assert_eq!(
            ops,
            vec![
                TaskOperation::ZoneProvisioningExtract,
                TaskOperation::Start,
                TaskOperation::ZoneSetup,
                TaskOperation::ZoneWaitSsh,
                TaskOperation::ZoneSyncParent,
                TaskOperation::ZoneProvisionParent,
            ]
        );

        let sync_parent = children.iter().find(|t| t.operation == TaskOperation::ZoneSyncParent).unwrap();
        let sync_children = tables::tasks::children_of(conn, sync_parent.id).unwrap();
        assert_eq!(sync_children.len(), 2);
        assert_eq!(sync_children[1].depends_on, Some(sync_children[0].id));

        let provision_parent = children.iter().find(|t| t.operation == TaskOperation::ZoneProvisionParent).unwrap();
        let provision_children = tables::tasks::children_of(conn, provision_parent.id).unwrap();
        assert_eq!(provision_children.len(), 1);
        assert_eq!(provision_children[0].depends_on, Some(sync_children[1].id));
    }

    #[tokio::test]
    async fn running_zone_omits_the_start_step() {
        let (orchestrator, store, _dir) = test_orchestrator().await;
        seed_zone(&store, "vm-a", ZoneStatus::Running, happy_path_configuration()).await;

        let orchestration_id = orchestrator.queue("vm-a").await.unwrap();

        let mut store = store.lock().await;
        let conn = store.get_connection().unwrap();
        let children = tables::tasks::children_of(conn, orchestration_id).unwrap();
        assert!(!children.iter().any(|t| t.operation == TaskOperation::Start));
    }

    #[tokio::test]
    async fn minimal_configuration_with_no_folders_or_provisioners_skips_parent_rows() {
        let (orchestrator, store, _dir) = test_orchestrator().await;
        seed_zone(
            &store,
            "vm-a",
            ZoneStatus::Installed,
            serde_json::json!({
                "provisioning": {
                    "credentials": { "username": "root", "password": "x" },
                    "ip": "10.0.0.5",
                    "skip_recipe": true
                }
            }),
        )
        .await;

        let orchestration_id = orchestrator.queue("vm-a").await.unwrap();

        let mut store = store.lock().await;
        let conn = store.get_connection().unwrap();
        let children = tables::tasks::children_of(conn, orchestration_id).unwrap();
        let ops: Vec<_> = children.iter().map(|t| t.operation).collect();
        assert_eq!(ops, vec![TaskOperation::Start, TaskOperation::ZoneWaitSsh]);
    }

    #[tokio::test]
    async fn queue_sync_rejects_spec_with_no_folders() {
        let (orchestrator, store, _dir) = test_orchestrator().await;
        seed_zone(
            &store,
            "vm-a",
            ZoneStatus::Running,
            serde_json::json!({
                "provisioning": {
                    "credentials": { "username": "root", "password": "x" },
                    "ip": "10.0.0.5"
                }
            }),
        )
        .await;
        let err = orchestrator.queue_sync("vm-a").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::NoSyncFolders));
    }

    #[tokio::test]
    async fn queue_sync_builds_standalone_chain() {
        let (orchestrator, store, _dir) = test_orchestrator().await;
        seed_zone(&store, "vm-a", ZoneStatus::Running, happy_path_configuration()).await;

        let sync_parent_id = orchestrator.queue_sync("vm-a").await.unwrap();

        let mut store = store.lock().await;
        let conn = store.get_connection().unwrap();
        let children = tables::tasks::children_of(conn, sync_parent_id).unwrap();
        assert_eq!(children.len(), 2);
        assert!(children.iter().all(|t| t.operation == TaskOperation::ZoneSync));
    }

    #[tokio::test]
    async fn queue_provisioners_rejects_spec_with_no_provisioners() {
        let (orchestrator, store, _dir) = test_orchestrator().await;
        seed_zone(
            &store,
            "vm-a",
            ZoneStatus::Running,
            serde_json::json!({
                "provisioning": {
                    "credentials": { "username": "root", "password": "x" },
                    "ip": "10.0.0.5"
                }
            }),
        )
        .await;
        let err = orchestrator.queue_provisioners("vm-a").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::NoProvisioners));
    }

    #[tokio::test]
    async fn queue_provisioners_builds_standalone_chain() {
        let (orchestrator, store, _dir) = test_orchestrator().await;
        seed_zone(&store, "vm-a", ZoneStatus::Running, happy_path_configuration()).await;

        let provision_parent_id = orchestrator.queue_provisioners("vm-a").await.unwrap();

        let mut store = store.lock().await;
        let conn = store.get_connection().unwrap();
        let children = tables::tasks::children_of(conn, provision_parent_id).unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].operation, TaskOperation::ZoneProvision);
    }
}
