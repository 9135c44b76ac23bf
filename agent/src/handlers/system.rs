//! Host-identity and networking handlers: VNIC CRUD, package install/remove,
//! and user/group/role management. All of these shell straight out to the
//! corresponding illumos utility (`dladm`, `pkg`, `useradd`/`usermod`/
//! `userdel`, `groupadd`/`groupmod`/`groupdel`, `roleadd`/`rolemod`/
//! `roledel`) and have no further Store bookkeeping beyond the task row
//! itself — unlike the zone lifecycle handlers, which also refresh `zones`.

use shared::task::{Task, TaskMetadata, TaskOutcome};

use crate::command::CommandSpec;

use super::{run_and_classify, HandlerContext};

fn properties_to_args(properties: &std::collections::HashMap<String, String>) -> Vec<String> {
    properties
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect()
}

pub async fn create_vnic(ctx: &HandlerContext, task: &Task) -> TaskOutcome {
    let (vnic_name, link, properties) = match &task.metadata {
        TaskMetadata::CreateVnic { vnic_name, link, properties } => (vnic_name, link, properties),
        other => return TaskOutcome::Terminal(format!("create_vnic given mismatched metadata: {other:?}")),
    };

    let mut args = vec!["create-vnic".to_string(), "-l".to_string(), link.clone()];
    let prop_args = properties_to_args(properties);
    if !prop_args.is_empty() {
        args.push("-p".to_string());
        args.push(prop_args.join(","));
    }
    args.push(vnic_name.clone());

    let args_ref: Vec<&str> = args.iter().map(String::as_str).collect();
    let spec = CommandSpec::new("dladm", &args_ref);
    match run_and_classify(&ctx.command_runner, &spec).await {
        Ok(_) => TaskOutcome::Ok,
        Err(outcome) => outcome,
    }
}

pub async fn delete_vnic(ctx: &HandlerContext, task: &Task) -> TaskOutcome {
    let vnic_name = match &task.metadata {
        TaskMetadata::DeleteVnic { vnic_name } => vnic_name,
        other => return TaskOutcome::Terminal(format!("delete_vnic given mismatched metadata: {other:?}")),
    };
    let spec = CommandSpec::new("dladm", &["delete-vnic", vnic_name]);
    match run_and_classify(&ctx.command_runner, &spec).await {
        Ok(_) => TaskOutcome::Ok,
        Err(outcome) => outcome,
    }
}

pub async fn set_vnic_properties(ctx: &HandlerContext, task: &Task) -> TaskOutcome {
    let (vnic_name, properties) = match &task.metadata {
        TaskMetadata::SetVnicProperties { vnic_name, properties } => (vnic_name, properties),
        other => return TaskOutcome::Terminal(format!("set_vnic_properties given mismatched metadata: {other:?}")),
    };
    if properties.is_empty() {
        return TaskOutcome::Ok;
    }
    let prop_arg = properties_to_args(properties).join(",");
    let spec = CommandSpec::new("dladm", &["set-linkprop", "-p", &prop_arg, vnic_name]);
    match run_and_classify(&ctx.command_runner, &spec).await {
        Ok(_) => TaskOutcome::Ok,
        Err(outcome) => outcome,
    }
}

pub async fn pkg_install(ctx: &HandlerContext, task: &Task) -> TaskOutcome {
    let package = match &task.metadata {
        TaskMetadata::PkgInstall { package } => package,
        other => return TaskOutcome::Terminal(format!("pkg_install given mismatched metadata: {other:?}")),
    };
    let spec = CommandSpec::new("pkg", &["install", package]).with_timeout(std::time::Duration::from_secs(600));
    match run_and_classify(&ctx.command_runner, &spec).await {
        Ok(_) => TaskOutcome::Ok,
        Err(outcome) => outcome,
    }
}

pub async fn pkg_uninstall(ctx: &HandlerContext, task: &Task) -> TaskOutcome {
    let package = match &task.metadata {
        TaskMetadata::PkgUninstall { package } => package,
        other => return TaskOutcome::Terminal(format!("pkg_uninstall given mismatched metadata: {other:?}")),
    };
    let spec = CommandSpec::new("pkg", &["uninstall", package]).with_timeout(std::time::Duration::from_secs(300));
    match run_and_classify(&ctx.command_runner, &spec).await {
        Ok(_) => TaskOutcome::Ok,
        Err(outcome) => outcome,
    }
}

pub async fn user_create(ctx: &HandlerContext, task: &Task) -> TaskOutcome {
    let (username, fields) = match &task.metadata {
        TaskMetadata::UserCreate { username, fields } => (username, fields),
        other => return TaskOutcome::Terminal(format!("user_create given mismatched metadata: {other:?}")),
    };
    let mut args = vec!["-m".to_string()];
    if let Some(shell) = fields.get("shell") {
        args.push("-s".to_string());
        args.push(shell.clone());
    }
    if let Some(home) = fields.get("home") {
        args.push("-d".to_string());
        args.push(home.clone());
    }
    args.push(username.clone());
    let args_ref: Vec<&str> = args.iter().map(String::as_str).collect();
    let spec = CommandSpec::new("useradd", &args_ref);
    match run_and_classify(&ctx.command_runner, &spec).await {
        Ok(_) => TaskOutcome::Ok,
        Err(outcome) => outcome,
    }
}

pub async fn user_modify(ctx: &HandlerContext, task: &Task) -> TaskOutcome {
    let (username, fields) = match &task.metadata {
        TaskMetadata::UserModify { username, fields } => (username, fields),
        other => return TaskOutcome::Terminal(format!("user_modify given mismatched metadata: {other:?}")),
    };
    let mut args = Vec::new();
    if let Some(shell) = fields.get("shell") {
        args.push("-s".to_string());
        args.push(shell.clone());
    }
    if let Some(home) = fields.get("home") {
        args.push("-d".to_string());
        args.push(home.clone());
    }
    if args.is_empty() {
        return TaskOutcome::Ok;
    }
    args.push(username.clone());
    let args_ref: Vec<&str> = args.iter().map(String::as_str).collect();
    let spec = CommandSpec::new("usermod", &args_ref);
    match run_and_classify(&ctx.command_runner, &spec).await {
        Ok(_) => TaskOutcome::Ok,
        Err(outcome) => outcome,
    }
}

pub async fn user_delete(ctx: &HandlerContext, task: &Task) -> TaskOutcome {
    let username = match &task.metadata {
        TaskMetadata::UserDelete { username } => username,
        other => return TaskOutcome::Terminal(format!("user_delete given mismatched metadata: {other:?}")),
    };
    let spec = CommandSpec::new("userdel", &["-r", username]);
    match run_and_classify(&ctx.command_runner, &spec).await {
        Ok(_) => TaskOutcome::Ok,
        Err(outcome) => outcome,
    }
}

pub async fn user_set_password(ctx: &HandlerContext, task: &Task) -> TaskOutcome {
    let (username, password_hash) = match &task.metadata {
        TaskMetadata::UserSetPassword { username, password_hash } => (username, password_hash),
        other => return TaskOutcome::Terminal(format!("user_set_password given mismatched metadata: {other:?}")),
    };
    let spec = CommandSpec::new("usermod", &["-P", password_hash, username]);
    match run_and_classify(&ctx.command_runner, &spec).await {
        Ok(_) => TaskOutcome::Ok,
        Err(outcome) => outcome,
    }
}

pub async fn user_lock(ctx: &HandlerContext, task: &Task) -> TaskOutcome {
    let username = match &task.metadata {
        TaskMetadata::UserLock { username } => username,
        other => return TaskOutcome::Terminal(format!("user_lock given mismatched metadata: {other:?}")),
    };
    let spec = CommandSpec::new("passwd", &["-l", username]);
    match run_and_classify(&ctx.command_runner, &spec).await {
        Ok(_) => TaskOutcome::Ok,
        Err(outcome) => outcome,
    }
}

pub async fn user_unlock(ctx: &HandlerContext, task: &Task) -> TaskOutcome {
    let username = match &task.metadata {
        TaskMetadata::UserUnlock { username } => username,
        other => return TaskOutcome::Terminal(format!("user_unlock given mismatched metadata: {other:?}")),
    };
    let spec = CommandSpec::new("passwd", &["-u", username]);
    match run_and_classify(&ctx.command_runner, &spec).await {
        Ok(_) => TaskOutcome::Ok,
        Err(outcome) => outcome,
    }
}

pub async fn group_create(ctx: &HandlerContext, task: &Task) -> TaskOutcome {
    let name = match &task.metadata {
        TaskMetadata::GroupCreate { name } => name,
        other => return TaskOutcome::Terminal(format!("group_create given mismatched metadata: {other:?}")),
    };
    let spec = CommandSpec::new("groupadd", &[name.as_str()]);
    match run_and_classify(&ctx.command_runner, &spec).await {
        Ok(_) => TaskOutcome::Ok,
        Err(outcome) => outcome,
    }
}

pub async fn group_modify(ctx: &HandlerContext, task: &Task) -> TaskOutcome {
    let (name, fields) = match &task.metadata {
        TaskMetadata::GroupModify { name, fields } => (name, fields),
        other => return TaskOutcome::Terminal(format!("group_modify given mismatched metadata: {other:?}")),
    };
    let mut args = Vec::new();
    if let Some(new_name) = fields.get("name") {
        args.push("-n".to_string());
        args.push(new_name.clone());
    }
    if args.is_empty() {
        return TaskOutcome::Ok;
    }
    args.push(name.clone());
    let args_ref: Vec<&str> = args.iter().map(String::as_str).collect();
    let spec = CommandSpec::new("groupmod", &args_ref);
    match run_and_classify(&ctx.command_runner, &spec).await {
        Ok(_) => TaskOutcome::Ok,
        Err(outcome) => outcome,
    }
}

pub async fn group_delete(ctx: &HandlerContext, task: &Task) -> TaskOutcome {
    let name = match &task.metadata {
        TaskMetadata::GroupDelete { name } => name,
        other => return TaskOutcome::Terminal(format!("group_delete given mismatched metadata: {other:?}")),
    };
    let spec = CommandSpec::new("groupdel", &[name.as_str()]);
    match run_and_classify(&ctx.command_runner, &spec).await {
        Ok(_) => TaskOutcome::Ok,
        Err(outcome) => outcome,
    }
}

pub async fn role_create(ctx: &HandlerContext, task: &Task) -> TaskOutcome {
    let name = match &task.metadata {
        TaskMetadata::RoleCreate { name } => name,
        other => return TaskOutcome::Terminal(format!("role_create given mismatched metadata: {other:?}")),
    };
    let spec = CommandSpec::new("roleadd", &["-m", name]);
    match run_and_classify(&ctx.command_runner, &spec).await {
        Ok(_) => TaskOutcome::Ok,
        Err(outcome) => outcome,
    }
}

pub async fn role_modify(ctx: &HandlerContext, task: &Task) -> TaskOutcome {
    let (name, fields) = match &task.metadata {
        TaskMetadata::RoleModify { name, fields } => (name, fields),
        other => return TaskOutcome::Terminal(format!("role_modify given mismatched metadata: {other:?}")),
    };
    let mut args = Vec::new();
    if let Some(shell) = fields.get("shell") {
        args.push("-s".to_string());
        args.push(shell.clone());
    }
    if args.is_empty() {
        return TaskOutcome::Ok;
    }
    args.push(name.clone());
    let args_ref: Vec<&str> = args.iter().map(String::as_str).collect();
    let spec = CommandSpec::new("rolemod", &args_ref);
    match run_and_classify(&ctx.command_runner, &spec).await {
        Ok(_) => TaskOutcome::Ok,
        Err(outcome) => outcome,
    }
}

pub async fn role_delete(ctx: &HandlerContext, task: &Task) -> TaskOutcome {
    let name = match &task.metadata {
        TaskMetadata::RoleDelete { name } => name,
        other => return TaskOutcome::Terminal(format!("role_delete given mismatched metadata: {other:?}")),
    };
    let spec = CommandSpec::new("roledel", &["-r", name]);
    match run_and_classify(&ctx.command_runner, &spec).await {
        Ok(_) => TaskOutcome::Ok,
        Err(outcome) => outcome,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn properties_to_args_formats_key_equals_value() {
        let mut props = std::collections::HashMap::new();
        props.insert("mtu".to_string(), "9000".to_string());
        let args = properties_to_args(&props);
        assert_eq!(args, vec!["mtu=9000".to_string()]);
    }
}
