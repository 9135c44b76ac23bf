//! Metric Collection & Retention Pipeline
//!
//! One independent collector per host subsystem (network configuration,
//! network usage, CPU, memory, swap, storage, ARC), each shelling out to a
//! host utility on its own fixed interval, parsing the result per the
//! robustness contract in [`parse`], and upserting into the Store. This
//! generalizes the ping/http/dns scheduler's "one task per config entry,
//! fixed interval" shape from a handful of network probes to a handful of
//! local subsystem scans — the per-collector loop below is deliberately a
//! simplified version of [`crate::scheduler::TaskEngine`]'s ticker: these
//! collectors don't depend on each other and don't need a shared dispatcher.
//!
//! PCI device inventory is folded into the storage collector's pass rather
//! than scheduled on its own interval: it's current-state hardware
//! inventory in the same vein as disks, and `host_info` has no
//! `last_pci_scan` column of its own to drive a separate cadence against.

pub mod arc;
pub mod cpu;
pub mod memory;
pub mod network_config;
pub mod network_usage;
pub mod parse;
pub mod storage;
pub mod swap;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use shared::config::CollectorsConfig;
use shared::utils::current_timestamp;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::command::CommandRunner;
use crate::store::tables;
use crate::store::Store;

/// Everything a collector needs: where to write, how to shell out, and
/// which host identity to stamp onto every row.
#[derive(Clone)]
pub struct CollectorContext {
    pub store: Arc<Mutex<Store>>,
    pub command_runner: CommandRunner,
    pub host: String,
}

/// Spawn every collector's independent loop, returning their join handles so
/// the caller can await them during a graceful shutdown.
pub fn spawn_all(
    ctx: CollectorContext,
    config: &CollectorsConfig,
    shutdown_tx: &broadcast::Sender<()>,
) -> Vec<JoinHandle<()>> {
    vec![
        spawn_loop(
            "network_config",
            "last_network_config_scan",
            config.network_config_interval_seconds,
            config,
            ctx.clone(),
            shutdown_tx.subscribe(),
            |ctx| async move { network_config::collect(&ctx).await },
        ),
        spawn_loop(
            "network_usage",
            "last_network_usage_scan",
            config.network_usage_interval_seconds,
            config,
            ctx.clone(),
            shutdown_tx.subscribe(),
            |ctx| async move { network_usage::collect(&ctx).await },
        ),
        spawn_loop(
            "cpu",
            "last_cpu_scan",
            config.cpu_interval_seconds,
            config,
            ctx.clone(),
            shutdown_tx.subscribe(),
            |ctx| async move { cpu::collect(&ctx).await },
        ),
        spawn_loop(
            "memory",
            "last_memory_scan",
            config.memory_interval_seconds,
            config,
            ctx.clone(),
            shutdown_tx.subscribe(),
            |ctx| async move { memory::collect(&ctx).await },
        ),
        spawn_loop(
            "swap",
            "last_swap_scan",
            config.swap_interval_seconds,
            config,
            ctx.clone(),
            shutdown_tx.subscribe(),
            |ctx| async move { swap::collect(&ctx).await },
        ),
        spawn_loop(
            "storage",
            "last_storage_scan",
            config.storage_interval_seconds,
            config,
            ctx.clone(),
            shutdown_tx.subscribe(),
            |ctx| async move { storage::collect(&ctx).await },
        ),
        spawn_loop(
            "arc",
            "last_arc_scan",
            config.arc_interval_seconds,
            config,
            ctx.clone(),
            shutdown_tx.subscribe(),
            |ctx| async move { arc::collect(&ctx).await },
        ),
    ]
}

/// One collector's scheduling loop: tick, run, record the outcome on
/// `host_info`, and self-disable after `error_threshold` consecutive
/// failures until `error_reset_seconds` of idle time has passed (§4.6 step
/// 6). A disabled collector keeps ticking — it just skips the run and the
/// write — so it notices the reset window elapsing without extra plumbing.
fn spawn_loop<F, Fut>(
    name: &'static str,
    host_info_column: &'static str,
    interval_seconds: u64,
    config: &CollectorsConfig,
    ctx: CollectorContext,
    mut shutdown_rx: broadcast::Receiver<()>,
    run: F,
) -> JoinHandle<()>
where
    F: Fn(CollectorContext) -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    let error_threshold = config.error_threshold;
    let error_reset_seconds = config.error_reset_seconds;

    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(interval_seconds.max(1)));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut consecutive_errors: u32 = 0;
        let mut disabled_since: Option<i64> = None;

        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = shutdown_rx.recv() => {
                    debug!(collector = name, "collector loop shutting down");
                    return;
                }
            }

            let now = current_timestamp();
            if let Some(since) = disabled_since {
                if now - since < error_reset_seconds as i64 {
                    continue;
                }
                debug!(collector = name, "re-enabling collector after idle window");
                disabled_since = None;
                consecutive_errors = 0;
            }

            match run(ctx.clone()).await {
                Ok(()) => {
                    consecutive_errors = 0;
                    if let Err(e) = record_outcome(&ctx, host_info_column, now, None).await {
                        warn!(collector = name, error = %e, "failed to record collector success on host_info");
                    }
                }
                Err(e) => {
                    consecutive_errors += 1;
                    error!(collector = name, error = %e, consecutive_errors, "collector pass failed");
                    if let Err(e2) = record_outcome(&ctx, host_info_column, now, Some(&e.to_string())).await {
                        warn!(collector = name, error = %e2, "failed to record collector failure on host_info");
                    }
                    if consecutive_errors >= error_threshold {
                        warn!(collector = name, consecutive_errors, "self-disabling collector after repeated failures");
                        disabled_since = Some(now);
                    }
                }
            }
        }
    })
}

async fn record_outcome(ctx: &CollectorContext, column: &str, now: i64, error: Option<&str>) -> anyhow::Result<()> {
    let mut store = ctx.store.lock().await;
    let conn = store.get_connection()?;
    tables::host_info::record_scan_outcome(conn, &ctx.host, column, now, error)
}
