pub mod ansi;
pub mod interface;
pub mod matcher;
pub mod pump;

pub use interface::{Endpoint, SerialInterface, StreamReader, StreamWriter};
pub use matcher::{Matcher, Pattern, PatternMatch};
pub use pump::{CloseReason, PumpControl, PumpEvent, ReaderPump};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialDeviceInfo {
    pub port_name: String,
    pub port_type: String,
    pub serial_number: Option<String>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum SerialError {
    #[error("Device error: {0}")]
    Device(String),

    #[error("Timed out waiting for pattern")]
    Timeout,

    #[error("Stream closed: {0}")]
    StreamClosed(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialport error: {0}")]
    SerialportError(#[from] serialport::Error),
}

impl SerialError {
    /// Errors after which the line can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, SerialError::Timeout | SerialError::InvalidPattern(_))
    }
}

pub type Result<T> = std::result::Result<T, SerialError>;
