//! Provisioning-chain handlers: `zone_provisioning_extract`, `zone_setup`,
//! `zone_wait_ssh`, `zone_sync`, `zone_provision`. These are the leaf
//! operations the Provisioning Orchestrator chains together; none of them
//! know about the chain itself; they each just do their one step and report
//! ok/retryable/terminal.

use std::time::Duration;

use shared::task::{ProvisionerKind, Task, TaskMetadata, TaskOutcome};

use crate::command::CommandSpec;
use crate::scheduler::CancelFlag;
use crate::store::tables;

use super::{check_cancelled, run_and_classify, HandlerContext};

pub async fn extract(ctx: &HandlerContext, task: &Task) -> TaskOutcome {
    let (artifact_id, dataset_path) = match &task.metadata {
        TaskMetadata::ZoneProvisioningExtract { artifact_id, dataset_path } => (artifact_id, dataset_path),
        other => return TaskOutcome::Terminal(format!("zone_provisioning_extract given mismatched metadata: {other:?}")),
    };

    let spec = CommandSpec::new("zfs", &["clone", artifact_id, dataset_path])
        .with_timeout(Duration::from_secs(300));
    match run_and_classify(&ctx.command_runner, &spec).await {
        Ok(_) => TaskOutcome::Ok,
        Err(outcome) => outcome,
    }
}

/// Runs a named [`shared::zone::Recipe`]'s script line-by-line through the
/// zone's `zlogin -C` console, checking cancellation between lines — the
/// "between SSH/console steps" checkpoint §4.3.4 requires. Skips entirely
/// (returns `Ok`) if a quick SSH probe already succeeds, per the
/// Provisioning Orchestrator's own skip logic — this handler just trusts
/// the orchestrator already decided to queue it, so it always runs the
/// recipe once invoked.
pub async fn setup(ctx: &HandlerContext, task: &Task, cancel: &CancelFlag) -> TaskOutcome {
    let recipe_id = match &task.metadata {
        TaskMetadata::ZoneSetup { recipe_id, .. } => recipe_id,
        other => return TaskOutcome::Terminal(format!("zone_setup given mismatched metadata: {other:?}")),
    };

    let recipe = {
        let mut store = ctx.store.lock().await;
        let conn = match store.get_connection() {
            Ok(conn) => conn,
            Err(e) => return TaskOutcome::Terminal(format!("opening store connection: {e}")),
        };
        match tables::provisioning::get_recipe(conn, recipe_id) {
            Ok(Some(recipe)) => recipe,
            Ok(None) => return TaskOutcome::Terminal(format!("recipe {recipe_id} not found")),
            Err(e) => return TaskOutcome::Terminal(format!("loading recipe {recipe_id}: {e}")),
        }
    };

    let handle = match ctx.console.get_or_create(&task.zone_name).await {
        Ok(handle) => handle,
        Err(e) => return TaskOutcome::Retryable(format!("opening console for {}: {e}", task.zone_name)),
    };

    ctx.console.set_automation_active(&task.zone_name, true);

    for line in recipe.script.lines() {
        if let Err(outcome) = check_cancelled(cancel) {
            ctx.console.set_automation_active(&task.zone_name, false);
            return outcome;
        }
        if line.trim().is_empty() {
            continue;
        }
        if let Err(e) = handle.write_input(format!("{line}\n").as_bytes()) {
            ctx.console.set_automation_active(&task.zone_name, false);
            return TaskOutcome::Retryable(format!("writing recipe line to console: {e}"));
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    ctx.console.set_automation_active(&task.zone_name, false);
    TaskOutcome::Ok
}

/// Polled by the dispatcher's retry loop until it succeeds or the task's
/// retry budget is exhausted (per §4.4 step 4 / the orchestrator design
/// note on `zone_wait_ssh`).
pub async fn wait_ssh(ctx: &HandlerContext, task: &Task) -> TaskOutcome {
    let (ip, port, credentials) = match &task.metadata {
        TaskMetadata::ZoneWaitSsh { ip, port, credentials } => (ip, *port, credentials),
        other => return TaskOutcome::Terminal(format!("zone_wait_ssh given mismatched metadata: {other:?}")),
    };

    if ctx.ssh.probe(ip, port, credentials).await {
        TaskOutcome::Ok
    } else {
        TaskOutcome::Retryable(format!("ssh not yet reachable at {ip}:{port}"))
    }
}

pub async fn sync(ctx: &HandlerContext, task: &Task) -> TaskOutcome {
    let (folder, ip, port, credentials) = match &task.metadata {
        TaskMetadata::ZoneSync { folder, ip, port, credentials } => (folder, ip, *port, credentials),
        other => return TaskOutcome::Terminal(format!("zone_sync given mismatched metadata: {other:?}")),
    };

    match ctx
        .ssh
        .sync_folder(ip, port, credentials, &folder.local_path, &folder.remote_path, &folder.exclude)
        .await
    {
        Ok(()) => TaskOutcome::Ok,
        Err(e) => TaskOutcome::Retryable(format!("syncing {} to {}: {e}", folder.local_path, folder.remote_path)),
    }
}

pub async fn provision(ctx: &HandlerContext, task: &Task) -> TaskOutcome {
    let (provisioner, ip, port, credentials) = match &task.metadata {
        TaskMetadata::ZoneProvision { provisioner, ip, port, credentials } => (provisioner, ip, *port, credentials),
        other => return TaskOutcome::Terminal(format!("zone_provision given mismatched metadata: {other:?}")),
    };

    match provisioner.kind {
        ProvisionerKind::Shell => match ctx.ssh.run_command(ip, port, credentials, &provisioner.payload).await {
            Ok(_) => TaskOutcome::Ok,
            Err(e) => TaskOutcome::Terminal(format!("provisioner {} failed: {e}", provisioner.name)),
        },
        ProvisionerKind::Ansible => {
            let inventory = format!("{ip},");
            let spec = CommandSpec::new(
                "ansible-playbook",
                &["-i", &inventory, "-u", &credentials.username, &provisioner.payload],
            )
            .with_timeout(Duration::from_secs(1800));
            match run_and_classify(&ctx.command_runner, &spec).await {
                Ok(_) => TaskOutcome::Ok,
                Err(outcome) => outcome,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandRunner;
    use crate::console::ConsoleMultiplexer;
    use crate::ssh::SshClient;
    use crate::store::Store;
    use shared::config::ConsoleConfig;
    use shared::task::{SshCredentials, TaskPriority, TaskStatus};
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use tempfile::tempdir;
    use tokio::sync::Mutex;

    async fn test_ctx() -> (HandlerContext, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let mut store = Store::new(dir.path(), 5).unwrap();
        store.initialize().unwrap();
        let store = Arc::new(Mutex::new(store));
        let ctx = HandlerContext {
            store: store.clone(),
            command_runner: CommandRunner::new(Duration::from_secs(2)),
            console: ConsoleMultiplexer::new(store, ConsoleConfig::default()),
            ssh: SshClient::new(Duration::from_millis(200)),
        };
        (ctx, dir)
    }

    fn sample_task(zone_name: &str, metadata: TaskMetadata) -> Task {
        Task {
            id: 1,
            zone_name: zone_name.to_string(),
            operation: metadata.operation(),
            priority: TaskPriority::Normal,
            status: TaskStatus::Running,
            depends_on: None,
            parent_task_id: None,
            metadata,
            created_by: "test".to_string(),
            created_at: 0,
            started_at: Some(0),
            completed_at: None,
            error_message: None,
            attempt: 0,
        }
    }

    #[tokio::test]
    async fn wait_ssh_is_retryable_when_unreachable() {
        let (ctx, _dir) = test_ctx().await;
        let task = sample_task(
            "vm-a",
            TaskMetadata::ZoneWaitSsh {
                ip: "198.51.100.1".to_string(),
                port: 22,
                credentials: SshCredentials { username: "root".to_string(), password: None, private_key: None },
            },
        );
        let outcome = wait_ssh(&ctx, &task).await;
        assert!(matches!(outcome, TaskOutcome::Retryable(_)));
    }

    #[tokio::test]
    async fn setup_fails_terminally_on_unknown_recipe() {
        let (ctx, _dir) = test_ctx().await;
        let task = sample_task(
            "vm-a",
            TaskMetadata::ZoneSetup {
                recipe_id: "missing".to_string(),
                credentials: SshCredentials { username: "root".to_string(), password: None, private_key: None },
                ip: "10.0.0.5".to_string(),
            },
        );
        let cancel: CancelFlag = Arc::new(AtomicBool::new(false));
        let outcome = setup(&ctx, &task, &cancel).await;
        match outcome {
            TaskOutcome::Terminal(msg) => assert!(msg.contains("not found")),
            other => panic!("expected Terminal, got {other:?}"),
        }
    }
}
