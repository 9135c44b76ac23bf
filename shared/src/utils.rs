//! Small utilities shared by the Store, Task Engine and collectors
//!
//! Bandwidth math and backoff calculation live here because both the
//! Metric Collection Pipeline and the Task Engine need a single place that
//! guards against NaN/Infinity and overflow (see the testable properties
//! on delta computation and retry backoff).

use std::time::{SystemTime, UNIX_EPOCH};

/// Current Unix timestamp in seconds.
pub fn current_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Current Unix timestamp in milliseconds.
pub fn current_timestamp_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Zone names are illumos `zonename` values: alphanumeric plus `-`, `_`
/// and `.`, non-empty, capped at 64 characters.
pub fn validate_zone_name(name: &str) -> anyhow::Result<()> {
    if name.is_empty() {
        anyhow::bail!("zone name must not be empty");
    }
    if name.len() > 64 {
        anyhow::bail!("zone name must not exceed 64 characters");
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        anyhow::bail!(
            "zone name '{name}' may only contain alphanumeric characters, '-', '_' and '.'"
        );
    }
    Ok(())
}

/// Exponential backoff with full jitter, capped at `max_delay_ms`. Used by
/// both the Task Engine's retry scheduling and the Store's transient-error
/// retry loop.
pub fn backoff_with_jitter(attempt: u32, base_delay_ms: u64, max_delay_ms: u64) -> u64 {
    let exp = base_delay_ms.saturating_mul(1u64 << attempt.min(16));
    let capped = exp.min(max_delay_ms);
    if capped == 0 {
        return 0;
    }
    rand::random::<u64>() % (capped + 1)
}

/// Non-negative delta between a current and previous cumulative counter.
/// Counter resets (reboot, interface replacement) make `previous > current`
/// possible; clamping to zero avoids reporting a spurious negative rate.
pub fn counter_delta(current: u64, previous: u64) -> u64 {
    current.saturating_sub(previous)
}

/// Bytes-per-second rate from a byte delta and an elapsed-time delta,
/// guarding against division by zero and non-finite results.
pub fn bytes_per_second(byte_delta: u64, elapsed_seconds: f64) -> f64 {
    if elapsed_seconds <= 0.0 {
        return 0.0;
    }
    let rate = byte_delta as f64 / elapsed_seconds;
    if rate.is_finite() {
        rate
    } else {
        0.0
    }
}

/// Link utilisation percentage from an observed rate and link speed,
/// guarding against an unknown (zero) link speed.
pub fn utilization_percent(bytes_per_second: f64, link_speed_bps: f64) -> f64 {
    if link_speed_bps <= 0.0 {
        return 0.0;
    }
    let pct = (bytes_per_second * 8.0 / link_speed_bps) * 100.0;
    if pct.is_finite() {
        pct.clamp(0.0, 100.0)
    } else {
        0.0
    }
}

/// Percentage helper guarding against division by zero.
pub fn percentage(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        (part as f64 / total as f64) * 100.0
    }
}
