//! Remote command execution over a serial console.
//!
//! A [`Session`] owns one serial line: a background pump drains the device
//! into a queue, a matcher scans that queue for prompts and status markers,
//! and commands are framed so the remote shell reports where each command's
//! output ends and what its exit status was.
//!
//! ```no_run
//! use serial_exec::{Session, SessionConfig};
//!
//! # async fn run() -> Result<(), serial_exec::SessionError> {
//! let config = SessionConfig::new("/dev/ttyUSB0").with_credentials("root", "");
//! let session = Session::new(config)?;
//! session.connect().await?;
//!
//! let result = session.exec_command("uname -a", None).await?;
//! println!("{} (exit {:?})", result.stdout_lossy(), result.exit_code);
//!
//! session.put_file("firmware.bin", "/tmp/firmware.bin").await?;
//! session.close().await?;
//! # Ok(())
//! # }
//! ```
pub mod config;
pub mod serial;
pub mod session;

pub use config::SessionConfig;
pub use serial::{Endpoint, SerialError, SerialInterface, StreamReader, StreamWriter};
pub use session::{CommandResult, OutputMode, Session, SessionError, SessionInfo, SessionState};
