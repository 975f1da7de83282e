use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};

/// Session lifecycle state
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    LoggingIn,
    AwaitingPassword,
    Ready,
    Executing,
    /// Terminal until a fresh `connect()`.
    Failed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Disconnected => "disconnected",
            SessionState::LoggingIn => "logging_in",
            SessionState::AwaitingPassword => "awaiting_password",
            SessionState::Ready => "ready",
            SessionState::Executing => "executing",
            SessionState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How stdout and stderr travel over the single line
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    /// stderr stays on the terminal and arrives interleaved with stdout.
    #[default]
    Combined,
    /// stderr is captured remotely and replayed after stdout between its own markers.
    Separate,
}

/// Outcome of one remote command
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandResult {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// `None` only when the command did not finish before its deadline.
    pub exit_code: Option<i32>,
    /// Output is partial because the deadline passed first.
    pub truncated: bool,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Details about an established session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub device: String,
    pub username: String,
    /// Shell prompt line observed when login completed.
    pub prompt: String,
    pub connected_at: DateTime<Utc>,
}
