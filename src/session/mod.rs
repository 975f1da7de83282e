pub mod connection;
pub mod executor;
pub mod login;
pub mod models;
pub mod transfer;

pub use connection::Session;
pub use executor::CommandFrame;
pub use models::*;

use crate::serial::SerialError;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Connect failed: {0}")]
    Connect(String),

    #[error("Remote rejected the credentials")]
    AuthenticationRejected,

    #[error("Session has failed; reconnect before issuing commands")]
    Failed,

    #[error("Session not connected")]
    NotConnected,

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("File transfer failed: {0}")]
    Transfer(String),

    #[error("Serial communication error: {0}")]
    SerialError(#[from] SerialError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SessionError>;
