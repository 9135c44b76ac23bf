//! Operation handlers
//!
//! One handler per non-aggregate `TaskOperation`. A handler gets the
//! immutable [`Task`] plus a shared [`HandlerContext`] and returns a
//! [`TaskOutcome`] the dispatcher applies retry/terminal/cascade policy to.
//! This generalizes `agent/src/tasks.rs::TaskExecutor::execute_task`'s
//! per-`TaskType` match from a fixed set of network probes to the zone
//! lifecycle, provisioning, VNIC and host-identity operation vocabulary.

mod provisioning;
mod system;
mod zone;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use shared::task::{Task, TaskOperation, TaskOutcome};
use tokio::sync::Mutex;
use tracing::warn;

use crate::command::CommandRunner;
use crate::console::ConsoleMultiplexer;
use crate::scheduler::CancelFlag;
use crate::ssh::SshClient;
use crate::store::Store;

/// Everything a handler needs to do its work. Cheap to clone (every field is
/// already `Arc`-backed or `Copy`), so it can be shared across every spawned
/// worker without re-threading individual dependencies through `dispatch`.
pub struct HandlerContext {
    pub store: Arc<Mutex<Store>>,
    pub command_runner: CommandRunner,
    pub console: ConsoleMultiplexer,
    pub ssh: SshClient,
}

/// Checked between external steps inside a handler (per §4.3.4's cooperative
/// cancellation checkpoint contract). Returns `Terminal` so the dispatcher
/// records a clear reason instead of silently leaving the task `running`.
fn check_cancelled(flag: &CancelFlag) -> Result<(), TaskOutcome> {
    if flag.load(Ordering::SeqCst) {
        Err(TaskOutcome::Terminal("cancelled".to_string()))
    } else {
        Ok(())
    }
}

/// Route a claimed task to its registered handler. Aggregate-only operations
/// never reach here (the dispatcher only spawns workers for runnable,
/// non-aggregate tasks), so they're asserted against rather than handled.
pub async fn dispatch(ctx: &HandlerContext, task: &Task, cancel: CancelFlag) -> TaskOutcome {
    if task.operation.is_aggregate_only() {
        warn!(task_id = task.id, operation = task.operation.as_str(), "dispatch called on an aggregate-only operation");
        return TaskOutcome::Terminal("aggregate-only operation has no handler".to_string());
    }

    let result = match task.operation {
        TaskOperation::Start => zone::start(ctx, task).await,
        TaskOperation::Stop => zone::stop(ctx, task).await,
        TaskOperation::Delete => zone::delete(ctx, task).await,
        TaskOperation::ZoneCreate => zone::zone_create(ctx, task).await,
        TaskOperation::ZoneModify => zone::zone_modify(ctx, task).await,
        TaskOperation::ZoneProvisioningExtract => provisioning::extract(ctx, task).await,
        TaskOperation::ZoneSetup => provisioning::setup(ctx, task, &cancel).await,
        TaskOperation::ZoneWaitSsh => provisioning::wait_ssh(ctx, task).await,
        TaskOperation::ZoneSync => provisioning::sync(ctx, task).await,
        TaskOperation::ZoneProvision => provisioning::provision(ctx, task).await,
        TaskOperation::CreateVnic => system::create_vnic(ctx, task).await,
        TaskOperation::DeleteVnic => system::delete_vnic(ctx, task).await,
        TaskOperation::SetVnicProperties => system::set_vnic_properties(ctx, task).await,
        TaskOperation::PkgInstall => system::pkg_install(ctx, task).await,
        TaskOperation::PkgUninstall => system::pkg_uninstall(ctx, task).await,
        TaskOperation::UserCreate => system::user_create(ctx, task).await,
        TaskOperation::UserModify => system::user_modify(ctx, task).await,
        TaskOperation::UserDelete => system::user_delete(ctx, task).await,
        TaskOperation::UserSetPassword => system::user_set_password(ctx, task).await,
        TaskOperation::UserLock => system::user_lock(ctx, task).await,
        TaskOperation::UserUnlock => system::user_unlock(ctx, task).await,
        TaskOperation::GroupCreate => system::group_create(ctx, task).await,
        TaskOperation::GroupModify => system::group_modify(ctx, task).await,
        TaskOperation::GroupDelete => system::group_delete(ctx, task).await,
        TaskOperation::RoleCreate => system::role_create(ctx, task).await,
        TaskOperation::RoleModify => system::role_modify(ctx, task).await,
        TaskOperation::RoleDelete => system::role_delete(ctx, task).await,
        TaskOperation::ZoneSyncParent
        | TaskOperation::ZoneProvisionParent
        | TaskOperation::ZoneProvisionOrchestration => unreachable!("filtered above"),
    };

    result
}

/// Shared plumbing: run a host command, map its [`CommandResult`] onto a
/// [`TaskOutcome`]. A timeout is retryable (the host utility may just be
/// under load); a non-zero exit with no timeout is terminal (the operation
/// itself failed, retrying won't help without operator intervention).
async fn run_and_classify(
    runner: &CommandRunner,
    spec: &crate::command::CommandSpec,
) -> Result<String, TaskOutcome> {
    let result = runner.run(spec).await;
    if result.timed_out {
        return Err(TaskOutcome::Retryable(format!(
            "{} {} timed out",
            spec.program,
            spec.args.join(" ")
        )));
    }
    if !result.ok {
        return Err(TaskOutcome::Terminal(format!(
            "{} {} failed (exit {:?}): {}",
            spec.program,
            spec.args.join(" "),
            result.exit_code,
            result.stderr.trim()
        )));
    }
    Ok(result.stdout)
}
