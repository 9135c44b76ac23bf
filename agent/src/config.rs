//! Configuration loading for the control-plane agent
//!
//! Loads a single `agent.toml`, validates it, and layers CLI overrides on
//! top the way the wider codebase's `ConfigManager` overlays `CliArgs` onto
//! an `agent_id`/`server_url`/... config — just without the separate
//! `tasks.toml`/checksum-reload machinery, since this agent has one config
//! file and reloads it only on SIGHUP-triggered restart, not on a poll loop.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, info};

use shared::config::AgentConfig;

const AGENT_CONFIG_FILE: &str = "agent.toml";

/// Command-line flags. Any `Some` value here overrides the matching
/// `agent.toml` field after load, the way the teacher's `CliArgs` overlays
/// settings without requiring a config file edit for routine tuning.
#[derive(Debug, Parser)]
#[command(name = "zoneweaver-agent", about = "Host-local control-plane agent for illumos zones")]
pub struct CliArgs {
    /// Directory containing agent.toml. Defaults to the current directory.
    #[arg(long, default_value = ".")]
    pub config_dir: PathBuf,

    #[arg(long)]
    pub host: Option<String>,
    #[arg(long)]
    pub data_dir: Option<String>,
    #[arg(long)]
    pub http_bind_address: Option<String>,
    #[arg(long)]
    pub api_key: Option<String>,
    #[arg(long)]
    pub log_dir: Option<PathBuf>,
}

impl CliArgs {
    /// Apply the subset of overrides that target `AgentConfig` fields,
    /// logging each change at `info` (redacting the API key) the way the
    /// teacher logs overrides in `override_and_persist_agent_config`.
    fn apply_overrides(&self, config: &mut AgentConfig) -> bool {
        let mut changed = false;

        if let Some(host) = &self.host {
            if &config.host != host {
                info!(from = %config.host, to = %host, "overriding host");
                config.host = host.clone();
                changed = true;
            }
        }
        if let Some(data_dir) = &self.data_dir {
            if &config.data_dir != data_dir {
                info!(from = %config.data_dir, to = %data_dir, "overriding data_dir");
                config.data_dir = data_dir.clone();
                changed = true;
            }
        }
        if let Some(addr) = &self.http_bind_address {
            if &config.http_bind_address != addr {
                info!(from = %config.http_bind_address, to = %addr, "overriding http_bind_address");
                config.http_bind_address = addr.clone();
                changed = true;
            }
        }
        if let Some(key) = &self.api_key {
            if &config.api_key != key {
                info!("overriding api_key (value hidden)");
                config.api_key = key.clone();
                changed = true;
            }
        }

        changed
    }
}

/// Load `agent.toml` from `config_dir`, parse, validate, then apply any CLI
/// overrides. Returns the final config; does not persist CLI overrides back
/// to disk, since unlike the teacher's long-lived central-server-managed
/// config, this file is expected to be edited directly by an operator.
pub async fn load(config_dir: &Path, cli: &CliArgs) -> Result<AgentConfig> {
    let config_path = config_dir.join(AGENT_CONFIG_FILE);
    info!(path = %config_path.display(), "loading agent configuration");

    let toml_content = tokio::fs::read_to_string(&config_path)
        .await
        .with_context(|| format!("reading {}", config_path.display()))?;

    let mut config: AgentConfig = toml::from_str(&toml_content)
        .with_context(|| format!("parsing {} as TOML", config_path.display()))?;

    config
        .validate()
        .with_context(|| format!("validating configuration loaded from {}", config_path.display()))?;

    if cli.apply_overrides(&mut config) {
        config
            .validate()
            .context("validating configuration after applying CLI overrides")?;
    }

    debug!(
        host = %config.host,
        data_dir = %config.data_dir,
        http_bind_address = %config.http_bind_address,
        worker_pool_size = config.task_engine.worker_pool_size,
        "configuration loaded"
    );

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_config(dir: &Path, contents: &str) {
        std::fs::write(dir.join(AGENT_CONFIG_FILE), contents).unwrap();
    }

    fn base_cli(config_dir: PathBuf) -> CliArgs {
        CliArgs {
            config_dir,
            host: None,
            data_dir: None,
            http_bind_address: None,
            api_key: None,
            log_dir: None,
        }
    }

    #[tokio::test]
    async fn loads_minimal_config_with_defaults() {
        let dir = tempdir().unwrap();
        write_config(dir.path(), "host = \"hv01\"\napi_key = \"secret\"\n");

        let config = load(dir.path(), &base_cli(dir.path().to_path_buf())).await.unwrap();
        assert_eq!(config.host, "hv01");
        assert!(config.task_engine.worker_pool_size > 0);
    }

    #[tokio::test]
    async fn rejects_invalid_config() {
        let dir = tempdir().unwrap();
        write_config(dir.path(), "host = \"\"\napi_key = \"secret\"\n");

        assert!(load(dir.path(), &base_cli(dir.path().to_path_buf())).await.is_err());
    }

    #[tokio::test]
    async fn cli_override_wins_over_file_value() {
        let dir = tempdir().unwrap();
        write_config(dir.path(), "host = \"hv01\"\napi_key = \"secret\"\n");

        let mut cli = base_cli(dir.path().to_path_buf());
        cli.host = Some("hv02".to_string());

        let config = load(dir.path(), &cli).await.unwrap();
        assert_eq!(config.host, "hv02");
    }

    #[tokio::test]
    async fn missing_file_is_an_error() {
        let dir = tempdir().unwrap();
        assert!(load(dir.path(), &base_cli(dir.path().to_path_buf())).await.is_err());
    }
}
