//! Console multiplexer domain types
//!
//! One `ConsoleSession` exists per zone with an active `zlogin -C` PTY.
//! Multiple HTTP/WebSocket subscribers can attach to the same session;
//! the agent owns exactly one PTY per zone regardless of subscriber count.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsoleSessionStatus {
    Starting,
    Active,
    Stopped,
    Failed,
}

impl ConsoleSessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsoleSessionStatus::Starting => "starting",
            ConsoleSessionStatus::Active => "active",
            ConsoleSessionStatus::Stopped => "stopped",
            ConsoleSessionStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "starting" => ConsoleSessionStatus::Starting,
            "active" => ConsoleSessionStatus::Active,
            "stopped" => ConsoleSessionStatus::Stopped,
            _ => ConsoleSessionStatus::Failed,
        }
    }
}

/// Persisted record of a zone's console session. `session_buffer` holds the
/// last `console.persisted_lines` of output so a subscriber reconnecting
/// after an agent restart still gets useful scrollback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsoleSession {
    pub id: i64,
    pub zone_name: String,
    pub status: ConsoleSessionStatus,
    pub pid: Option<u32>,
    pub started_at: i64,
    pub ended_at: Option<i64>,
}

/// One chunk of output broadcast to console subscribers. Chunks are
/// delivered in the order the PTY produced them; a subscriber that falls
/// behind the bounded channel is dropped and told to reconnect, not
/// silently skipped ahead (see the Console Multiplexer design notes).
#[derive(Debug, Clone)]
pub struct ConsoleChunk {
    pub zone_name: String,
    pub data: Vec<u8>,
    pub sequence: u64,
}

/// What a console subscriber's broadcast channel actually carries: PTY
/// output, or an advisory marker when an automation job starts/stops typing
/// into the same console. UIs use the marker to render a read-mostly mode
/// while a recipe runs.
#[derive(Debug, Clone)]
pub enum ConsoleEvent {
    Output(ConsoleChunk),
    AutomationActive { zone_name: String, active: bool },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips() {
        for s in [
            ConsoleSessionStatus::Starting,
            ConsoleSessionStatus::Active,
            ConsoleSessionStatus::Stopped,
            ConsoleSessionStatus::Failed,
        ] {
            assert_eq!(ConsoleSessionStatus::from_str(s.as_str()), s);
        }
    }
}
