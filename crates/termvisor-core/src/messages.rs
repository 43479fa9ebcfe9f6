//! Viewer protocol events.
//!
//! Every WebSocket text frame carries one JSON object tagged by `"event"`,
//! e.g. `{"event":"start","rows":24,"cols":80,"instant":false}`.

use serde::{Deserialize, Serialize};

/// Events sent by a viewer to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Authenticate this connection.
    Login { password: String },
    /// Start the worker, or reattach to the running one.
    Start {
        rows: u16,
        cols: u16,
        #[serde(default)]
        instant: bool,
    },
    /// Keystrokes for the worker's terminal.
    Input { data: String },
    /// Viewer window size changed.
    Resize { rows: u16, cols: u16 },
    /// Stop the worker (interrupt, then force).
    Kill {},
    /// Ensure the worker is running; authenticated by password, not by login.
    Heartbeat { password: String },
    /// Fetch the decoded configuration blob.
    ConfigGet {},
    /// Replace the configuration blob from TOML text.
    ConfigSave { config: String },
    Ping {},
}

/// Outcome reported by a heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeartbeatState {
    /// A session was already live.
    Running,
    /// No session was live; a fresh one was launched.
    Restarted,
}

/// Events sent by the server to viewers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Terminal output (live stream, history replay or supervisor notice).
    Output { data: String },
    LoginOk {},
    LoginFail { reason: String },
    Status {
        state: HeartbeatState,
        pid: Option<u32>,
    },
    /// Decoded configuration text.
    Config { config: String },
    /// New encoded configuration blob after a save.
    ConfigSaved { encoded: String },
    ConfigError { reason: String },
    Pong {},
    Error { message: String },
}

impl ServerEvent {
    /// Shorthand for an `output` event.
    pub fn output(data: impl Into<String>) -> Self {
        ServerEvent::Output { data: data.into() }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerEvent::Error {
            message: message.into(),
        }
    }
}
