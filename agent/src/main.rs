//! Host-local control-plane agent for illumos/OmniOS branded and bhyve zones.
//!
//! Wires together the Store, Command Runner, Task Engine, Provisioning
//! Orchestrator, Console Multiplexer and Metric Collectors behind a single
//! `axum` HTTP/WebSocket surface, then drives them all to completion under
//! one `#[tokio::main]` runtime until a shutdown signal arrives.

#[cfg(not(target_os = "windows"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

mod collectors;
mod command;
mod config;
mod console;
mod handlers;
mod http;
mod orchestrator;
mod scheduler;
mod ssh;
mod store;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use command::CommandRunner;
use config::CliArgs;
use console::ConsoleMultiplexer;
use handlers::HandlerContext;
use orchestrator::ProvisioningOrchestrator;
use scheduler::TaskEngine;
use shared::utils::current_timestamp;
use ssh::SshClient;
use store::Store;

fn init_logging(log_dir: &PathBuf) {
    let file_appender = tracing_appender::rolling::daily(log_dir, "zoneweaver-agent.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    // Leaked deliberately: the guard must outlive the process, and this
    // runs exactly once at startup, the same tradeoff the teacher's
    // `agent/src/main.rs` makes with its own `_guard` binding.
    Box::leak(Box::new(guard));

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("agent=info,shared=info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .json()
        .with_current_span(false)
        .with_span_list(false)
        .with_writer(non_blocking)
        .init();
}

/// Wait for SIGTERM/SIGINT (Unix) or Ctrl+C (everywhere else).
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sigint.recv() => info!("received SIGINT"),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
        info!("received Ctrl+C");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = CliArgs::parse();
    let log_dir = cli.log_dir.clone().unwrap_or_else(|| PathBuf::from("./logs"));
    init_logging(&log_dir);

    info!("zoneweaver-agent starting up");
    let config = match config::load(&cli.config_dir, &cli).await {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "failed to load configuration, aborting startup");
            std::process::exit(1);
        }
    };
    let config = Arc::new(config);

    let mut store = Store::new(&config.data_dir, config.store.busy_timeout_seconds)
        .context("constructing store")?;
    store.initialize().context("initializing store")?;
    let store = Arc::new(Mutex::new(store));

    let command_runner = CommandRunner::new(Duration::from_secs(config.command_timeout_seconds));
    let console = ConsoleMultiplexer::new(store.clone(), config.console.clone());
    let ssh = SshClient::new(Duration::from_secs(config.ssh.connect_timeout_seconds));

    console
        .reconcile_after_restart()
        .await
        .context("reconciling console sessions after restart")?;

    let handler_ctx = Arc::new(HandlerContext {
        store: store.clone(),
        command_runner: command_runner.clone(),
        console: console.clone(),
        ssh,
    });

    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(config.channel_buffer_size.max(1));

    let collector_ctx = collectors::CollectorContext {
        store: store.clone(),
        command_runner: command_runner.clone(),
        host: config.host.clone(),
    };
    let collector_handles = collectors::spawn_all(collector_ctx, &config.collectors, &shutdown_tx);

    let task_engine = TaskEngine::new(store.clone(), config.task_engine.clone(), handler_ctx.clone());
    let engine_shutdown_rx = shutdown_tx.subscribe();
    let engine_handle = tokio::spawn(task_engine.run(engine_shutdown_rx));

    let orchestrator = Arc::new(ProvisioningOrchestrator::new(store.clone(), config.ssh.clone()));

    let retention_handle = {
        let store = store.clone();
        let collectors_config = config.collectors.clone();
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let interval_secs = collectors_config.retention_sweep_interval_seconds.max(1);
            let mut tick = tokio::time::interval(Duration::from_secs(interval_secs));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let now = current_timestamp();
                        let mut store = store.lock().await;
                        match store.cleanup_old_data(now, &collectors_config) {
                            Ok(report) => info!(rows_deleted = report.total(), "retention sweep complete"),
                            Err(e) => warn!(error = %e, "retention sweep failed, retrying next tick"),
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("retention sweep task shutting down");
                        return;
                    }
                }
            }
        })
    };

    let wal_checkpoint_handle = {
        let store = store.clone();
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(300));
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let mut store = store.lock().await;
                        if let Err(e) = store.checkpoint_wal() {
                            warn!(error = %e, "WAL checkpoint failed");
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("WAL checkpoint task shutting down");
                        return;
                    }
                }
            }
        })
    };

    let app_state = http::AppState::new(handler_ctx.clone(), config.clone(), orchestrator);
    let app = http::create_router(app_state);

    let bind_address: std::net::SocketAddr = config
        .http_bind_address
        .parse()
        .context("parsing http_bind_address (already validated at config load)")?;
    let listener = tokio::net::TcpListener::bind(bind_address)
        .await
        .with_context(|| format!("binding HTTP listener to {bind_address}"))?;
    info!(address = %config.http_bind_address, "HTTP/WebSocket surface listening");

    let http_shutdown = {
        let mut rx = shutdown_tx.subscribe();
        async move {
            let _ = rx.recv().await;
            info!("HTTP server received shutdown signal");
        }
    };

    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(http_shutdown)
            .await
    });

    shutdown_signal().await;
    info!("shutdown signal received, stopping zoneweaver-agent");
    let _ = shutdown_tx.send(());

    let grace = Duration::from_secs(config.graceful_shutdown_timeout_seconds);
    if tokio::time::timeout(grace, server).await.is_err() {
        warn!("HTTP server did not shut down within the grace period");
    }
    if tokio::time::timeout(grace, engine_handle).await.is_err() {
        warn!("task engine did not shut down within the grace period");
    }
    for handle in collector_handles {
        let _ = tokio::time::timeout(grace, handle).await;
    }
    let _ = tokio::time::timeout(grace, retention_handle).await;
    let _ = tokio::time::timeout(grace, wal_checkpoint_handle).await;

    console.shutdown_all().await;

    {
        let mut store = store.lock().await;
        if let Err(e) = store.checkpoint_wal() {
            warn!(error = %e, "final WAL checkpoint failed");
        }
    }

    info!("zoneweaver-agent shutdown complete");
    Ok(())
}
