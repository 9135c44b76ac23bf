//! SSH client wrapper for the Provisioning Orchestrator's `zone_wait_ssh`,
//! `zone_sync` and `zone_provision` steps.
//!
//! Freshly provisioned zones have no host key an operator could have pinned
//! in advance, so the client accepts whatever key a zone presents — the
//! security boundary here is network reachability over the control VNIC,
//! not host identity. `russh` and `russh-sftp` are used instead of shelling
//! out to the system `ssh`/`sftp` binaries so authentication failures and
//! timeouts come back as typed errors rather than scraped stderr.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use russh::client::{Config, Handle, Handler};
use russh::keys::key::PublicKey;
use russh::ChannelMsg;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use shared::task::SshCredentials;

/// Accepts any host key. See the module doc for why that's acceptable here.
struct AcceptAnyHostKey;

impl Handler for AcceptAnyHostKey {
    type Error = russh::Error;

    async fn check_server_key(&mut self, _server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Stateless wrapper; every call opens and tears down its own connection.
/// Provisioning steps run one at a time per zone (zone_sync/zone_provision
/// are mutex-set operations), so connection reuse would save little.
#[derive(Debug, Clone, Copy)]
pub struct SshClient {
    connect_timeout: Duration,
}

impl SshClient {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    async fn connect(&self, ip: &str, port: u16, credentials: &SshCredentials) -> Result<Handle<AcceptAnyHostKey>> {
        let config = Arc::new(Config::default());
        let addr = (ip, port);

        let mut handle = tokio::time::timeout(
            self.connect_timeout,
            russh::client::connect(config, addr, AcceptAnyHostKey),
        )
        .await
        .with_context(|| format!("connecting to {ip}:{port} timed out"))?
        .with_context(|| format!("connecting to {ip}:{port}"))?;

        let authenticated = if let Some(key_pem) = &credentials.private_key {
            let key_pair = russh::keys::decode_secret_key(key_pem, None)
                .context("parsing SSH private key")?;
            handle
                .authenticate_publickey(&credentials.username, Arc::new(key_pair))
                .await
                .context("authenticating with private key")?
        } else if let Some(password) = &credentials.password {
            handle
                .authenticate_password(&credentials.username, password)
                .await
                .context("authenticating with password")?
        } else {
            anyhow::bail!("no password or private key supplied for SSH authentication");
        };

        if !authenticated {
            anyhow::bail!("SSH authentication rejected for user {}", credentials.username);
        }

        Ok(handle)
    }

    /// Best-effort reachability probe used by `zone_wait_ssh` (polled until
    /// it succeeds or the task's retry budget is exhausted) and by
    /// `zone_setup` to decide whether the zlogin recipe step can be skipped.
    pub async fn probe(&self, ip: &str, port: u16, credentials: &SshCredentials) -> bool {
        match self.connect(ip, port, credentials).await {
            Ok(_) => true,
            Err(e) => {
                debug!(%ip, port, error = %e, "ssh probe failed");
                false
            }
        }
    }

    /// Run `command` in a remote shell and return its combined stdout.
    /// Returns an error if the command's exit status is non-zero.
    pub async fn run_command(
        &self,
        ip: &str,
        port: u16,
        credentials: &SshCredentials,
        command: &str,
    ) -> Result<String> {
        let handle = self.connect(ip, port, credentials).await?;
        let mut channel = handle
            .channel_open_session()
            .await
            .context("opening SSH session channel")?;
        channel.exec(true, command).await.context("executing remote command")?;

        let mut stdout = Vec::new();
        let mut exit_status: Option<u32> = None;

        loop {
            match channel.wait().await {
                Some(ChannelMsg::Data { data }) => stdout.extend_from_slice(&data),
                Some(ChannelMsg::ExtendedData { data, .. }) => {
                    warn!(stderr = %String::from_utf8_lossy(&data), "remote command stderr");
                }
                Some(ChannelMsg::ExitStatus { exit_status: status }) => exit_status = Some(status),
                Some(ChannelMsg::Eof) | None => break,
                _ => {}
            }
        }

        match exit_status {
            Some(0) => Ok(String::from_utf8_lossy(&stdout).to_string()),
            Some(status) => anyhow::bail!("remote command '{command}' exited with status {status}"),
            None => anyhow::bail!("remote command '{command}' closed without an exit status"),
        }
    }

    /// Upload `local_path` (file or directory, recursively) to `remote_path`
    /// over SFTP, skipping any path matching an `exclude` glob prefix.
    pub async fn sync_folder(
        &self,
        ip: &str,
        port: u16,
        credentials: &SshCredentials,
        local_path: &str,
        remote_path: &str,
        exclude: &[String],
    ) -> Result<()> {
        let handle = self.connect(ip, port, credentials).await?;
        let channel = handle
            .channel_open_session()
            .await
            .context("opening SSH session channel for SFTP")?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .context("requesting sftp subsystem")?;

        let sftp = russh_sftp::client::SftpSession::new(channel.into_stream())
            .await
            .context("starting SFTP session")?;

        upload_recursive(&sftp, Path::new(local_path), remote_path, exclude)
            .await
            .with_context(|| format!("syncing {local_path} to {remote_path}"))?;

        sftp.close().await.context("closing SFTP session")?;
        Ok(())
    }
}

fn is_excluded(path: &Path, exclude: &[String]) -> bool {
    let path_str = path.to_string_lossy();
    exclude.iter().any(|pattern| path_str.contains(pattern.as_str()))
}

/// Boxed to allow recursion into subdirectories across `.await` points —
/// async fns can't recurse directly since their future would be infinitely
/// sized.
fn upload_recursive<'a>(
    sftp: &'a russh_sftp::client::SftpSession,
    local_path: &'a Path,
    remote_path: &'a str,
    exclude: &'a [String],
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
    Box::pin(async move {
        if is_excluded(local_path, exclude) {
            return Ok(());
        }

        let metadata = tokio::fs::metadata(local_path)
            .await
            .with_context(|| format!("reading metadata for {}", local_path.display()))?;

        if metadata.is_dir() {
            let _ = sftp.create_dir(remote_path).await;

            let mut entries = tokio::fs::read_dir(local_path)
                .await
                .with_context(|| format!("reading directory {}", local_path.display()))?;
            while let Some(entry) = entries.next_entry().await? {
                let child_remote = format!(
                    "{}/{}",
                    remote_path.trim_end_matches('/'),
                    entry.file_name().to_string_lossy()
                );
                upload_recursive(sftp, &entry.path(), &child_remote, exclude).await?;
            }
        } else {
            let contents = tokio::fs::read(local_path)
                .await
                .with_context(|| format!("reading {}", local_path.display()))?;
            let mut remote_file = sftp
                .create(remote_path)
                .await
                .with_context(|| format!("creating remote file {remote_path}"))?;
            remote_file.write_all(&contents).await.context("writing remote file contents")?;
            remote_file.shutdown().await.context("closing remote file")?;
        }

        Ok(())
    })
}
