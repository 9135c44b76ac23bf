//! Default values for configuration parameters
//!
//! Centralizes all default-value functions used by the configuration
//! structures. Serde calls these when deserializing `agent.toml` files that
//! omit optional fields.

// Task Engine defaults

/// Default bounded worker pool size (recommend 4-16).
pub fn default_worker_pool_size() -> usize {
    8
}

/// Default maximum retry attempts for a retryable handler failure.
pub fn default_task_max_retries() -> u32 {
    5
}

/// Default base backoff for retryable task re-scheduling (seconds).
pub fn default_task_retry_backoff_seconds() -> u64 {
    10
}

/// Default dispatcher tick interval (milliseconds).
pub fn default_dispatcher_tick_ms() -> u64 {
    250
}

// Store defaults

/// Default SQLite busy timeout (seconds).
pub fn default_database_busy_timeout_seconds() -> u64 {
    5
}

/// Default batch size for bulk metric inserts.
pub fn default_metric_batch_size() -> usize {
    200
}

/// Default store-level transient-error retry attempts.
pub fn default_store_retry_attempts() -> u32 {
    5
}

/// Default base backoff for store retries (milliseconds).
pub fn default_store_retry_base_ms() -> u64 {
    100
}

// Collector intervals (seconds)

pub fn default_network_config_interval_seconds() -> u64 {
    60
}

pub fn default_network_usage_interval_seconds() -> u64 {
    20
}

pub fn default_cpu_interval_seconds() -> u64 {
    60
}

pub fn default_memory_interval_seconds() -> u64 {
    60
}

pub fn default_swap_interval_seconds() -> u64 {
    60
}

pub fn default_storage_interval_seconds() -> u64 {
    30
}

pub fn default_arc_interval_seconds() -> u64 {
    60
}

/// Default number of consecutive collector failures before self-disabling.
pub fn default_collector_error_threshold() -> u32 {
    5
}

/// Default idle window (seconds) of successful collections before the
/// consecutive-error counter resets.
pub fn default_collector_error_reset_seconds() -> u64 {
    600
}

// Retention horizons (days), per table family

pub fn default_retention_network_usage_days() -> u32 {
    30
}

pub fn default_retention_cpu_days() -> u32 {
    14
}

pub fn default_retention_memory_days() -> u32 {
    14
}

pub fn default_retention_swap_days() -> u32 {
    14
}

pub fn default_retention_storage_days() -> u32 {
    30
}

pub fn default_retention_arc_days() -> u32 {
    14
}

/// Default retention sweep interval (seconds).
pub fn default_retention_sweep_interval_seconds() -> u64 {
    3600
}

// Console multiplexer defaults

/// Default per-subscriber buffer capacity (output chunks).
pub fn default_console_subscriber_buffer_size() -> usize {
    256
}

/// Default tail length (lines) replayed to a newly connected subscriber.
pub fn default_console_replay_lines() -> usize {
    50
}

/// Default tail length (lines) persisted in `session_buffer` across restarts.
pub fn default_console_persisted_lines() -> usize {
    1000
}

// HTTP surface defaults

pub fn default_http_bind_address() -> String {
    "127.0.0.1:8080".to_string()
}

pub fn default_http_body_limit_mb() -> usize {
    16
}

// SSH defaults

pub fn default_ssh_port() -> u16 {
    22
}

pub fn default_ssh_probe_timeout_seconds() -> u64 {
    3
}

pub fn default_ssh_connect_timeout_seconds() -> u64 {
    15
}

// Graceful shutdown

pub fn default_graceful_shutdown_timeout_seconds() -> u64 {
    30
}

pub fn default_channel_buffer_size() -> usize {
    1000
}

/// Default command timeout for host utilities invoked by collectors and
/// task handlers (seconds).
pub fn default_command_timeout_seconds() -> u64 {
    30
}
