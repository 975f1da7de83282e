//! Background reader that drains an endpoint into the byte queue.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tokio::sync::mpsc;

use super::{Result, SerialError, StreamReader};

pub const DEFAULT_CHUNK_SIZE: usize = 512;

/// Why the stream stopped producing data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The session asked the pump to stop.
    Shutdown,
    /// The endpoint reported a fatal read error.
    Error(String),
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::Shutdown => write!(f, "session closed"),
            CloseReason::Error(msg) => write!(f, "{}", msg),
        }
    }
}

/// Items carried by the byte queue, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PumpEvent {
    Data(Vec<u8>),
    Closed(CloseReason),
}

/// Cloneable stop switch for a running pump.
#[derive(Clone)]
pub struct PumpControl {
    running: Arc<AtomicBool>,
    tx: mpsc::UnboundedSender<PumpEvent>,
}

impl PumpControl {
    /// Ask the pump to stop and wake any consumer blocked on the queue.
    /// The thread itself exits at its next read-timeout boundary.
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            let _ = self.tx.send(PumpEvent::Closed(CloseReason::Shutdown));
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

pub struct ReaderPump {
    control: PumpControl,
    handle: Option<JoinHandle<()>>,
}

impl ReaderPump {
    /// Spawn the pump thread. The returned receiver is the consumer end of the
    /// byte queue; pushes never block.
    pub fn start(
        reader: Box<dyn StreamReader>,
        chunk_size: usize,
    ) -> Result<(Self, mpsc::UnboundedReceiver<PumpEvent>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let running = Arc::new(AtomicBool::new(true));
        let control = PumpControl { running: running.clone(), tx: tx.clone() };

        let handle = thread::Builder::new()
            .name("serial-pump".to_string())
            .spawn(move || pump_loop(reader, running, tx, chunk_size.max(1)))
            .map_err(|e| SerialError::Device(format!("failed to spawn reader thread: {}", e)))?;

        Ok((Self { control, handle: Some(handle) }, rx))
    }

    pub fn control(&self) -> PumpControl {
        self.control.clone()
    }

    /// Stop the pump and wait for its thread to exit. Idempotent.
    pub fn stop(&mut self) {
        self.control.stop();
        if let Some(handle) = self.handle.take() {
            log::debug!("Joining serial reader thread...");
            if handle.join().is_err() {
                log::warn!("Serial reader thread panicked");
            }
        }
    }
}

impl Drop for ReaderPump {
    fn drop(&mut self) {
        self.stop();
    }
}

fn pump_loop(
    mut reader: Box<dyn StreamReader>,
    running: Arc<AtomicBool>,
    tx: mpsc::UnboundedSender<PumpEvent>,
    chunk_size: usize,
) {
    let mut buf = vec![0u8; chunk_size];

    while running.load(Ordering::SeqCst) {
        match reader.read(&mut buf) {
            Ok(0) => {}
            Ok(n) => {
                log::trace!("<< {:?}", String::from_utf8_lossy(&buf[..n]));
                if tx.send(PumpEvent::Data(buf[..n].to_vec())).is_err() {
                    // Consumer dropped the queue; nobody is listening anymore.
                    running.store(false, Ordering::SeqCst);
                    break;
                }
            }
            Err(e) => {
                log::warn!("Serial read failed, closing stream: {}", e);
                if running.swap(false, Ordering::SeqCst) {
                    let _ = tx.send(PumpEvent::Closed(CloseReason::Error(e.to_string())));
                }
                break;
            }
        }
    }
    log::debug!("Serial reader thread exiting");
}
