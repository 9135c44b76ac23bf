//! Zone lifecycle handlers: `start`, `stop`, `delete`, `zone_create`,
//! `zone_modify`. Each shells out to `zoneadm`/`zonecfg` via the Command
//! Runner, then refreshes the zone's stored `status` (I5).

use shared::task::{Task, TaskMetadata, TaskOutcome};
use shared::utils::current_timestamp;
use shared::zone::ZoneStatus;

use crate::command::CommandSpec;
use crate::store::tables;

use super::{run_and_classify, HandlerContext};

async fn set_status(ctx: &HandlerContext, zone_name: &str, status: ZoneStatus) -> Result<(), TaskOutcome> {
    let now = current_timestamp();
    let mut store = ctx.store.lock().await;
    let conn = store
        .get_connection()
        .map_err(|e| TaskOutcome::Terminal(format!("opening store connection: {e}")))?;
    tables::zones::update_zone_fields(conn, zone_name, None, Some(status), now)
        .map_err(|e| TaskOutcome::Terminal(format!("updating zone status: {e}")))
}

pub async fn start(ctx: &HandlerContext, task: &Task) -> TaskOutcome {
    let spec = CommandSpec::new("zoneadm", &["-z", &task.zone_name, "boot"]);
    if let Err(outcome) = run_and_classify(&ctx.command_runner, &spec).await {
        return outcome;
    }
    if let Err(outcome) = set_status(ctx, &task.zone_name, ZoneStatus::Running).await {
        return outcome;
    }
    TaskOutcome::Ok
}

pub async fn stop(ctx: &HandlerContext, task: &Task) -> TaskOutcome {
    let spec = CommandSpec::new("zoneadm", &["-z", &task.zone_name, "shutdown"]);
    if let Err(outcome) = run_and_classify(&ctx.command_runner, &spec).await {
        return outcome;
    }
    let _ = ctx.console.destroy(&task.zone_name).await;
    if let Err(outcome) = set_status(ctx, &task.zone_name, ZoneStatus::Down).await {
        return outcome;
    }
    TaskOutcome::Ok
}

pub async fn delete(ctx: &HandlerContext, task: &Task) -> TaskOutcome {
    let uninstall = CommandSpec::new("zoneadm", &["-z", &task.zone_name, "uninstall", "-F"]);
    if let Err(outcome) = run_and_classify(&ctx.command_runner, &uninstall).await {
        return outcome;
    }
    let unconfigure = CommandSpec::new("zonecfg", &["-z", &task.zone_name, "delete", "-F"]);
    if let Err(outcome) = run_and_classify(&ctx.command_runner, &unconfigure).await {
        return outcome;
    }
    let _ = ctx.console.destroy(&task.zone_name).await;

    let mut store = ctx.store.lock().await;
    match store.get_connection() {
        Ok(conn) => match tables::zones::delete_zone(conn, &task.zone_name) {
            Ok(()) => TaskOutcome::Ok,
            Err(e) => TaskOutcome::Terminal(format!("deleting zone row: {e}")),
        },
        Err(e) => TaskOutcome::Terminal(format!("opening store connection: {e}")),
    }
}

pub async fn zone_create(ctx: &HandlerContext, task: &Task) -> TaskOutcome {
    let (brand, zonepath, configuration) = match &task.metadata {
        TaskMetadata::ZoneCreate { brand, zonepath, configuration } => (brand, zonepath, configuration),
        other => return TaskOutcome::Terminal(format!("zone_create given mismatched metadata: {other:?}")),
    };

    let create_cmd = format!(
        "create -b; set zonepath={zonepath}; set brand={brand}; set autoboot=false; commit"
    );
    let spec = CommandSpec::new("zonecfg", &["-z", &task.zone_name, &create_cmd]);
    if let Err(outcome) = run_and_classify(&ctx.command_runner, &spec).await {
        return outcome;
    }

    let install = CommandSpec::new("zoneadm", &["-z", &task.zone_name, "install"]);
    if let Err(outcome) = run_and_classify(&ctx.command_runner, &install).await {
        return outcome;
    }

    let now = current_timestamp();
    let zone = shared::zone::Zone {
        name: task.zone_name.clone(),
        zone_id: "0".to_string(),
        host: shared::task::HOST_SCOPE_ZONE.to_string(),
        brand: shared::zone::ZoneBrand::from_str(brand),
        status: ZoneStatus::Installed,
        zonepath: zonepath.clone(),
        configuration: configuration.clone(),
        is_orphaned: false,
        auto_discovered: false,
        last_seen: now,
        created_at: now,
        updated_at: now,
    };

    let mut store = ctx.store.lock().await;
    match store.get_connection() {
        Ok(conn) => match tables::zones::upsert_zone(conn, &zone) {
            Ok(()) => TaskOutcome::Ok,
            Err(e) => TaskOutcome::Terminal(format!("persisting created zone: {e}")),
        },
        Err(e) => TaskOutcome::Terminal(format!("opening store connection: {e}")),
    }
}

pub async fn zone_modify(ctx: &HandlerContext, task: &Task) -> TaskOutcome {
    let configuration = match &task.metadata {
        TaskMetadata::ZoneModify { configuration } => configuration,
        other => return TaskOutcome::Terminal(format!("zone_modify given mismatched metadata: {other:?}")),
    };

    let now = current_timestamp();
    let mut store = ctx.store.lock().await;
    let conn = match store.get_connection() {
        Ok(conn) => conn,
        Err(e) => return TaskOutcome::Terminal(format!("opening store connection: {e}")),
    };
    match tables::zones::update_zone_fields(conn, &task.zone_name, Some(configuration), None, now) {
        Ok(()) => TaskOutcome::Ok,
        Err(e) => TaskOutcome::Terminal(format!("updating zone configuration: {e}")),
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
    use shared::task::{TaskPriority, TaskStatus};
    use std::sync::Arc;
    use std::time::Duration;
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
            ssh: SshClient::new(Duration::from_secs(2)),
        };
        (ctx, dir)
    }

    fn sample_task(metadata: TaskMetadata) -> Task {
        Task {
            id: 1,
            zone_name: "vm-a".to_string(),
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
    async fn zone_modify_patches_configuration_only() {
        let (ctx, _dir) = test_ctx().await;
        {
            let mut store = ctx.store.lock().await;
            let conn = store.get_connection().unwrap();
            tables::zones::upsert_zone(
                conn,
                &shared::zone::Zone {
                    name: "vm-a".to_string(),
                    zone_id: "1".to_string(),
                    host: "system".to_string(),
                    brand: shared::zone::ZoneBrand::Bhyve,
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

        let task = sample_task(TaskMetadata::ZoneModify { configuration: serde_json::json!({"provisioning": {"artifact_id": "a1"}}) });
        let outcome = zone_modify(&ctx, &task).await;
        assert!(matches!(outcome, TaskOutcome::Ok));

        let mut store = ctx.store.lock().await;
        let conn = store.get_connection().unwrap();
        let zone = tables::zones::get_zone(conn, "vm-a").unwrap().unwrap();
        assert_eq!(zone.status, ZoneStatus::Installed);
        assert_eq!(
            zone.configuration.get("provisioning").unwrap().get("artifact_id").unwrap(),
            "a1"
        );
    }
}
