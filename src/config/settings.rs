use std::path::Path;
use std::time::Duration;
use serde::{Deserialize, Serialize};

use crate::serial::interface::DEFAULT_BAUD_RATE;
use crate::serial::pump::DEFAULT_CHUNK_SIZE;
use crate::serial::Pattern;
use crate::session::{OutputMode, Result, SessionError};

// Prompt defaults match a stock getty and a POSIX shell
pub const DEFAULT_LOGIN_PROMPT: &str = r"login: $";
pub const DEFAULT_PASSWORD_PROMPT: &str = r"[Pp]assword: ?$";
pub const DEFAULT_SHELL_PROMPT: &str = r"[$#] $";

/// Everything needed to open a serial session and log in
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub device_path: String,
    pub baud_rate: u32,
    pub username: String,
    pub password: String,
    pub login_prompt_pattern: String,
    pub password_prompt_pattern: String,
    pub shell_prompt_pattern: String,
    pub command_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    /// How long to wait for a recognizable prompt before sending the wake byte again.
    pub wake_interval_ms: u64,
    pub max_login_retries: u32,
    pub read_timeout_ms: u64,
    pub read_chunk_size: usize,
    pub output_mode: OutputMode,
    /// Ignore ANSI escape sequences when looking for prompts. Command output is never altered.
    pub strip_ansi: bool,
    pub interrupt_on_timeout: bool,
    pub logout_on_close: bool,
    pub transfer_chunk_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            device_path: String::new(),
            baud_rate: DEFAULT_BAUD_RATE,
            username: "root".to_string(),
            password: String::new(),
            login_prompt_pattern: DEFAULT_LOGIN_PROMPT.to_string(),
            password_prompt_pattern: DEFAULT_PASSWORD_PROMPT.to_string(),
            shell_prompt_pattern: DEFAULT_SHELL_PROMPT.to_string(),
            command_timeout_ms: 30_000,
            connect_timeout_ms: 20_000,
            wake_interval_ms: 2_000,
            max_login_retries: 3,
            read_timeout_ms: 50,
            read_chunk_size: DEFAULT_CHUNK_SIZE,
            output_mode: OutputMode::Combined,
            strip_ansi: true,
            interrupt_on_timeout: true,
            logout_on_close: true,
            transfer_chunk_size: 768,
        }
    }
}

/// Compiled prompt regexes
#[derive(Debug, Clone)]
pub struct PromptPatterns {
    pub login: Pattern,
    pub password: Pattern,
    pub shell: Pattern,
}

impl SessionConfig {
    pub fn new(device_path: impl Into<String>) -> Self {
        Self {
            device_path: device_path.into(),
            ..Self::default()
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| SessionError::Config(format!("invalid session config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)?;
        log::debug!("Loading session config from {}", path.display());
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()> {
        if self.device_path.is_empty() {
            return Err(SessionError::Config("device_path is required".to_string()));
        }
        if self.baud_rate == 0 {
            return Err(SessionError::Config("baud_rate must be positive".to_string()));
        }
        if self.transfer_chunk_size == 0 || self.read_chunk_size == 0 {
            return Err(SessionError::Config("chunk sizes must be positive".to_string()));
        }
        self.compile_prompts().map(|_| ())
    }

    pub fn compile_prompts(&self) -> Result<PromptPatterns> {
        let compile = |label: &str, expr: &str| {
            Pattern::regex(label, expr)
                .map_err(|e| SessionError::Config(format!("{} pattern {:?}: {}", label, expr, e)))
        };
        Ok(PromptPatterns {
            login: compile("login prompt", &self.login_prompt_pattern)?,
            password: compile("password prompt", &self.password_prompt_pattern)?,
            shell: compile("shell prompt", &self.shell_prompt_pattern)?,
        })
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn wake_interval(&self) -> Duration {
        Duration::from_millis(self.wake_interval_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}
