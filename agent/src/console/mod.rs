//! Console Multiplexer
//!
//! Owns at most one `zlogin -C <zone>` PTY per zone and fans its output out
//! to every concurrent WebSocket subscriber and automation reader. A
//! subscriber that falls behind its bounded channel is dropped and told to
//! reconnect rather than silently skipped ahead — replay-on-reconnect
//! (in-memory tail plus the store's persisted tail) is what makes that safe.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use anyhow::{Context, Result};
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use shared::config::ConsoleConfig;
use shared::console::{ConsoleChunk, ConsoleEvent, ConsoleSessionStatus};
use shared::utils::current_timestamp;

use crate::store::Store;

/// A single zone's live PTY plus the fan-out machinery around it.
struct ZoneConsole {
    session_id: i64,
    broadcast_tx: broadcast::Sender<ConsoleEvent>,
    writer: StdMutex<Box<dyn Write + Send>>,
    #[allow(dead_code)]
    master: Box<dyn MasterPty + Send>,
    child: StdMutex<Box<dyn Child + Send + Sync>>,
    sequence: AtomicU64,
    alive: AtomicBool,
    automation_active: AtomicBool,
    live_buffer: StdMutex<Vec<u8>>,
}

/// Tracks one PTY per zone, keyed by zone name. Cheap to clone: internally
/// `Arc`-wrapped so collectors, HTTP handlers and the orchestrator's
/// zone_setup step can all hold a handle.
#[derive(Clone)]
pub struct ConsoleMultiplexer {
    store: Arc<Mutex<Store>>,
    config: ConsoleConfig,
    sessions: Arc<StdMutex<HashMap<String, Arc<ZoneConsole>>>>,
}

impl ConsoleMultiplexer {
    pub fn new(store: Arc<Mutex<Store>>, config: ConsoleConfig) -> Self {
        Self {
            store,
            config,
            sessions: Arc::new(StdMutex::new(HashMap::new())),
        }
    }

    /// Mark any console session left `starting`/`active` in the store as
    /// `stopped` (I8). PTYs are process-local; a restart always orphans
    /// whatever was running before it.
    pub async fn reconcile_after_restart(&self) -> Result<()> {
        let now = current_timestamp();
        let mut store = self.store.lock().await;
        let sessions = store.list_console_sessions()?;
        let mut reconciled = 0;
        for session in sessions {
            if matches!(session.status, ConsoleSessionStatus::Starting | ConsoleSessionStatus::Active) {
                store.mark_console_session_stopped(session.id, now)?;
                reconciled += 1;
            }
        }
        if reconciled > 0 {
            info!(reconciled, "reconciled stale console sessions after restart");
        }
        Ok(())
    }

    /// Get the zone's existing live PTY, or spawn `zlogin -C <zone>` if none
    /// is running.
    pub async fn get_or_create(&self, zone_name: &str) -> Result<Arc<ConsoleHandle>> {
        if let Some(existing) = self.existing_alive(zone_name) {
            return Ok(ConsoleHandle::new(zone_name.to_string(), existing));
        }

        let now = current_timestamp();
        let session_id = {
            let mut store = self.store.lock().await;
            store.start_console_session(zone_name, now)?
        };

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: 40,
                cols: 120,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("opening PTY for zlogin console")?;

        let mut cmd = CommandBuilder::new("zlogin");
        cmd.args(["-C", zone_name]);

        let child = pair
            .slave
            .spawn_command(cmd)
            .with_context(|| format!("spawning zlogin -C {zone_name}"))?;
        let pid = child.process_id();

        let reader = pair
            .master
            .try_clone_reader()
            .context("cloning PTY reader")?;
        let writer = pair.master.take_writer().context("taking PTY writer")?;

        let (broadcast_tx, _rx) = broadcast::channel(self.config.subscriber_buffer_size);

        let console = Arc::new(ZoneConsole {
            session_id,
            broadcast_tx,
            writer: StdMutex::new(writer),
            master: pair.master,
            child: StdMutex::new(child),
            sequence: AtomicU64::new(0),
            alive: AtomicBool::new(true),
            automation_active: AtomicBool::new(false),
            live_buffer: StdMutex::new(Vec::new()),
        });

        {
            let mut store = self.store.lock().await;
            if let Some(pid) = pid {
                store.mark_console_session_active(session_id, pid)?;
            }
        }

        self.sessions
            .lock()
            .unwrap()
            .insert(zone_name.to_string(), console.clone());

        spawn_pty_reader(
            zone_name.to_string(),
            reader,
            console.clone(),
            self.store.clone(),
            self.config.persisted_lines,
        );

        Ok(ConsoleHandle::new(zone_name.to_string(), console))
    }

    fn existing_alive(&self, zone_name: &str) -> Option<Arc<ZoneConsole>> {
        let sessions = self.sessions.lock().unwrap();
        sessions
            .get(zone_name)
            .filter(|c| c.alive.load(Ordering::SeqCst))
            .cloned()
    }

    pub fn is_alive(&self, zone_name: &str) -> bool {
        self.existing_alive(zone_name).is_some()
    }

    /// True while an automation job (e.g. a `zone_setup` recipe) owns the
    /// console's input. Subscribers use this to render a read-mostly mode.
    pub fn is_automation_active(&self, zone_name: &str) -> bool {
        self.existing_alive(zone_name)
            .map(|c| c.automation_active.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Mark a zone's console as automation-owned (or released), broadcasting
    /// an advisory marker so live subscribers can update their UI state.
    pub fn set_automation_active(&self, zone_name: &str, active: bool) {
        if let Some(console) = self.existing_alive(zone_name) {
            console.automation_active.store(active, Ordering::SeqCst);
            let _ = console.broadcast_tx.send(ConsoleEvent::AutomationActive {
                zone_name: zone_name.to_string(),
                active,
            });
        }
    }

    /// Tear down a zone's PTY (used by `zone_stop`/`zone_delete` handlers
    /// and the console HTTP stop endpoint).
    pub async fn destroy(&self, zone_name: &str) -> Result<()> {
        let console = self.sessions.lock().unwrap().remove(zone_name);
        if let Some(console) = console {
            console.alive.store(false, Ordering::SeqCst);
            if let Ok(mut child) = console.child.lock() {
                let _ = child.kill();
            }
            let mut store = self.store.lock().await;
            store.mark_console_session_stopped(console.session_id, current_timestamp())?;
        }
        Ok(())
    }

    /// Destroy every live PTY. Driven by the agent's graceful-shutdown
    /// sequence (§5: "on agent shutdown, all PTYs are destroyed cleanly").
    pub async fn shutdown_all(&self) {
        let zone_names: Vec<String> = self.sessions.lock().unwrap().keys().cloned().collect();
        for zone_name in zone_names {
            if let Err(e) = self.destroy(&zone_name).await {
                warn!(%zone_name, error = %e, "failed to destroy console session during shutdown");
            }
        }
    }
}

/// A reference to one zone's console, returned by [`ConsoleMultiplexer::get_or_create`].
/// Carries the subset of operations a caller (WebSocket handler, zlogin
/// recipe runner) needs without exposing the PTY's internal types.
pub struct ConsoleHandle {
    zone_name: String,
    console: Arc<ZoneConsole>,
}

impl ConsoleHandle {
    fn new(zone_name: String, console: Arc<ZoneConsole>) -> Arc<Self> {
        Arc::new(Self { zone_name, console })
    }

    /// Replayed tail (up to `replay_lines` worth of bytes already in the
    /// live buffer) plus a fresh broadcast subscription for anything after.
    pub fn subscribe(&self, replay_bytes: usize) -> (Vec<u8>, broadcast::Receiver<ConsoleEvent>) {
        let buffer = self.console.live_buffer.lock().unwrap();
        let tail_start = buffer.len().saturating_sub(replay_bytes);
        let replay = buffer[tail_start..].to_vec();
        drop(buffer);
        (replay, self.console.broadcast_tx.subscribe())
    }

    pub fn is_automation_active(&self) -> bool {
        self.console.automation_active.load(Ordering::SeqCst)
    }

    pub fn write_input(&self, data: &[u8]) -> Result<()> {
        let mut writer = self.console.writer.lock().unwrap();
        writer.write_all(data).context("writing to PTY")?;
        writer.flush().context("flushing PTY writer")?;
        Ok(())
    }

    pub fn is_alive(&self) -> bool {
        self.console.alive.load(Ordering::SeqCst)
    }

    pub fn zone_name(&self) -> &str {
        &self.zone_name
    }

    pub fn session_id(&self) -> i64 {
        self.console.session_id
    }
}

/// Spawn the blocking PTY reader on its own OS thread (portable-pty's
/// reader is a synchronous `Read`), forwarding chunks into the async world
/// over a small channel so they can be broadcast and persisted.
fn spawn_pty_reader(
    zone_name: String,
    mut reader: Box<dyn Read + Send>,
    console: Arc<ZoneConsole>,
    store: Arc<Mutex<Store>>,
    persisted_lines_budget: usize,
) {
    let (tx, mut rx) = tokio::sync::mpsc::channel::<Vec<u8>>(64);

    std::thread::spawn(move || {
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(%zone_name, error = %e, "PTY read error");
                    break;
                }
            }
        }
    });

    tokio::spawn(async move {
        // Persisted tail is stored in bytes; approximate a "line" as 80
        // bytes the way the table's own truncation works on raw bytes.
        let persisted_byte_budget = persisted_lines_budget * 80;

        while let Some(chunk) = rx.recv().await {
            let sequence = console.sequence.fetch_add(1, Ordering::SeqCst);
            {
                let mut live = console.live_buffer.lock().unwrap();
                live.extend_from_slice(&chunk);
                let cap = live.len().min(persisted_byte_budget.max(4096));
                let start = live.len() - cap;
                live.drain(0..start);
            }

            let _ = console.broadcast_tx.send(ConsoleEvent::Output(ConsoleChunk {
                zone_name: zone_name.clone(),
                data: chunk.clone(),
                sequence,
            }));

            let mut store = store.lock().await;
            if let Err(e) = store.append_console_buffer(console.session_id, &chunk, persisted_byte_budget) {
                warn!(%zone_name, error = %e, "failed to persist console buffer");
            }
        }

        console.alive.store(false, Ordering::SeqCst);
        debug!(%zone_name, "PTY reader exiting, session ended");
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::config::ConsoleConfig;
    use tempfile::tempdir;

    async fn test_multiplexer() -> (ConsoleMultiplexer, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let mut store = Store::new(dir.path(), 5).unwrap();
        store.initialize().unwrap();
        let store = Arc::new(Mutex::new(store));
        (ConsoleMultiplexer::new(store, ConsoleConfig::default()), dir)
    }

    #[tokio::test]
    async fn reconcile_marks_stale_sessions_stopped() {
        let (mux, _dir) = test_multiplexer().await;
        {
            let mut store = mux.store.lock().await;
            store.start_console_session("vm-a", 1000).unwrap();
        }
        mux.reconcile_after_restart().await.unwrap();

        let mut store = mux.store.lock().await;
        let sessions = store.list_console_sessions().unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].status, ConsoleSessionStatus::Stopped);
    }

    #[test]
    fn replay_returns_only_the_requested_tail() {
        let console = Arc::new(ZoneConsole {
            session_id: 1,
            broadcast_tx: broadcast::channel(8).0,
            writer: StdMutex::new(Box::new(std::io::sink())),
            master: native_pty_system()
                .openpty(PtySize { rows: 24, cols: 80, pixel_width: 0, pixel_height: 0 })
                .unwrap()
                .master,
            child: StdMutex::new(
                native_pty_system()
                    .openpty(PtySize { rows: 24, cols: 80, pixel_width: 0, pixel_height: 0 })
                    .unwrap()
                    .slave
                    .spawn_command(CommandBuilder::new("true"))
                    .unwrap(),
            ),
            sequence: AtomicU64::new(0),
            alive: AtomicBool::new(true),
            automation_active: AtomicBool::new(false),
            live_buffer: StdMutex::new(b"0123456789".to_vec()),
        });
        let handle = ConsoleHandle::new("vm-a".to_string(), console);
        let (replay, _rx) = handle.subscribe(4);
        assert_eq!(replay, b"6789".to_vec());
    }
}
