//! Configuration types and validation for the control-plane agent
//!
//! Defines the structure of `agent.toml`, including per-collector intervals
//! and retention horizons, Task Engine tuning, console buffer sizes and SSH
//! defaults. Validation happens once, at load, so the rest of the agent can
//! treat a loaded `AgentConfig` as known-good.

use crate::defaults::*;
use serde::{Deserialize, Serialize};

/// Top-level agent configuration loaded from `agent.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentConfig {
    /// Host identifier embedded in every metric row and task record.
    pub host: String,
    /// Directory holding the SQLite database file.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// Address the HTTP/WebSocket surface binds to.
    #[serde(default = "default_http_bind_address")]
    pub http_bind_address: String,
    /// Pre-shared API key required on every mutating/read endpoint.
    pub api_key: String,
    /// Maximum HTTP request body size, in megabytes.
    #[serde(default = "default_http_body_limit_mb")]
    pub http_body_limit_mb: usize,

    #[serde(default)]
    pub task_engine: TaskEngineConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub collectors: CollectorsConfig,
    #[serde(default)]
    pub console: ConsoleConfig,
    #[serde(default)]
    pub ssh: SshConfig,

    /// Wait time for in-flight tasks/PTYs during shutdown, in seconds.
    #[serde(default = "default_graceful_shutdown_timeout_seconds")]
    pub graceful_shutdown_timeout_seconds: u64,
    /// Channel buffer capacity used across internal mpsc channels.
    #[serde(default = "default_channel_buffer_size")]
    pub channel_buffer_size: usize,
    /// Timeout applied to host utilities spawned by the Command Runner.
    #[serde(default = "default_command_timeout_seconds")]
    pub command_timeout_seconds: u64,
}

fn default_data_dir() -> String {
    "/var/lib/zoneweaver-agent".to_string()
}

/// Task Engine tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskEngineConfig {
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,
    #[serde(default = "default_task_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_task_retry_backoff_seconds")]
    pub retry_backoff_seconds: u64,
    #[serde(default = "default_dispatcher_tick_ms")]
    pub dispatcher_tick_ms: u64,
}

impl Default for TaskEngineConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: default_worker_pool_size(),
            max_retries: default_task_max_retries(),
            retry_backoff_seconds: default_task_retry_backoff_seconds(),
            dispatcher_tick_ms: default_dispatcher_tick_ms(),
        }
    }
}

/// Store (SQLite) tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoreConfig {
    #[serde(default = "default_database_busy_timeout_seconds")]
    pub busy_timeout_seconds: u64,
    #[serde(default = "default_metric_batch_size")]
    pub metric_batch_size: usize,
    #[serde(default = "default_store_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_store_retry_base_ms")]
    pub retry_base_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            busy_timeout_seconds: default_database_busy_timeout_seconds(),
            metric_batch_size: default_metric_batch_size(),
            retry_attempts: default_store_retry_attempts(),
            retry_base_ms: default_store_retry_base_ms(),
        }
    }
}

/// Per-collector interval and retention configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CollectorsConfig {
    #[serde(default = "default_network_config_interval_seconds")]
    pub network_config_interval_seconds: u64,
    #[serde(default = "default_network_usage_interval_seconds")]
    pub network_usage_interval_seconds: u64,
    #[serde(default = "default_cpu_interval_seconds")]
    pub cpu_interval_seconds: u64,
    #[serde(default = "default_memory_interval_seconds")]
    pub memory_interval_seconds: u64,
    #[serde(default = "default_swap_interval_seconds")]
    pub swap_interval_seconds: u64,
    #[serde(default = "default_storage_interval_seconds")]
    pub storage_interval_seconds: u64,
    #[serde(default = "default_arc_interval_seconds")]
    pub arc_interval_seconds: u64,
    #[serde(default = "default_collector_error_threshold")]
    pub error_threshold: u32,
    #[serde(default = "default_collector_error_reset_seconds")]
    pub error_reset_seconds: u64,

    #[serde(default = "default_retention_network_usage_days")]
    pub retention_network_usage_days: u32,
    #[serde(default = "default_retention_cpu_days")]
    pub retention_cpu_days: u32,
    #[serde(default = "default_retention_memory_days")]
    pub retention_memory_days: u32,
    #[serde(default = "default_retention_swap_days")]
    pub retention_swap_days: u32,
    #[serde(default = "default_retention_storage_days")]
    pub retention_storage_days: u32,
    #[serde(default = "default_retention_arc_days")]
    pub retention_arc_days: u32,
    #[serde(default = "default_retention_sweep_interval_seconds")]
    pub retention_sweep_interval_seconds: u64,
}

impl Default for CollectorsConfig {
    fn default() -> Self {
        Self {
            network_config_interval_seconds: default_network_config_interval_seconds(),
            network_usage_interval_seconds: default_network_usage_interval_seconds(),
            cpu_interval_seconds: default_cpu_interval_seconds(),
            memory_interval_seconds: default_memory_interval_seconds(),
            swap_interval_seconds: default_swap_interval_seconds(),
            storage_interval_seconds: default_storage_interval_seconds(),
            arc_interval_seconds: default_arc_interval_seconds(),
            error_threshold: default_collector_error_threshold(),
            error_reset_seconds: default_collector_error_reset_seconds(),
            retention_network_usage_days: default_retention_network_usage_days(),
            retention_cpu_days: default_retention_cpu_days(),
            retention_memory_days: default_retention_memory_days(),
            retention_swap_days: default_retention_swap_days(),
            retention_storage_days: default_retention_storage_days(),
            retention_arc_days: default_retention_arc_days(),
            retention_sweep_interval_seconds: default_retention_sweep_interval_seconds(),
        }
    }
}

/// Console multiplexer buffer sizing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConsoleConfig {
    #[serde(default = "default_console_subscriber_buffer_size")]
    pub subscriber_buffer_size: usize,
    #[serde(default = "default_console_replay_lines")]
    pub replay_lines: usize,
    #[serde(default = "default_console_persisted_lines")]
    pub persisted_lines: usize,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            subscriber_buffer_size: default_console_subscriber_buffer_size(),
            replay_lines: default_console_replay_lines(),
            persisted_lines: default_console_persisted_lines(),
        }
    }
}

/// Defaults used by provisioning SSH steps unless overridden per zone.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SshConfig {
    #[serde(default = "default_ssh_port")]
    pub default_port: u16,
    #[serde(default = "default_ssh_probe_timeout_seconds")]
    pub probe_timeout_seconds: u64,
    #[serde(default = "default_ssh_connect_timeout_seconds")]
    pub connect_timeout_seconds: u64,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            default_port: default_ssh_port(),
            probe_timeout_seconds: default_ssh_probe_timeout_seconds(),
            connect_timeout_seconds: default_ssh_connect_timeout_seconds(),
        }
    }
}

impl AgentConfig {
    /// Validate the loaded configuration, catching mistakes before the agent
    /// spends any effort opening the store or binding a socket.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.host.trim().is_empty() {
            anyhow::bail!("`host` must not be empty");
        }
        if self.api_key.trim().is_empty() {
            anyhow::bail!("`api_key` must not be empty");
        }
        if self.data_dir.trim().is_empty() {
            anyhow::bail!("`data_dir` must not be empty");
        }
        if self.http_bind_address.parse::<std::net::SocketAddr>().is_err() {
            anyhow::bail!(
                "`http_bind_address` is not a valid socket address: {}",
                self.http_bind_address
            );
        }
        if self.task_engine.worker_pool_size == 0 {
            anyhow::bail!("`task_engine.worker_pool_size` must be at least 1");
        }
        Ok(())
    }
}
