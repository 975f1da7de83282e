use std::sync::{Mutex as StdMutex, MutexGuard};
use std::time::Duration;
use chrono::Utc;
use tokio::sync::{watch, Mutex};

use crate::config::{PromptPatterns, SessionConfig};
use crate::serial::{Endpoint, Matcher, PumpControl, ReaderPump, SerialInterface, StreamWriter};
use super::executor::CommandExecutor;
use super::login::LoginSequencer;
use super::{CommandResult, Result, SessionError, SessionInfo, SessionState};

/// Ctrl-D, ends the remote login shell
const LOGOUT: &[u8] = b"\x04";

/// One logged-in shell over one serial line.
///
/// All methods take `&self`; share the session behind an `Arc` to issue
/// commands from several tasks. Commands are serialized: the line carries
/// no framing that could tell interleaved replies apart.
pub struct Session {
    config: SessionConfig,
    prompts: PromptPatterns,
    executor: CommandExecutor,
    inner: Mutex<Inner>,
    control: StdMutex<Option<PumpControl>>,
    info: StdMutex<Option<SessionInfo>>,
    state_tx: watch::Sender<SessionState>,
}

struct Inner {
    endpoint: Box<dyn Endpoint>,
    link: Option<Link>,
}

/// Everything that only exists while the endpoint is open
struct Link {
    writer: Box<dyn StreamWriter>,
    matcher: Matcher,
    pump: ReaderPump,
}

impl Session {
    /// Session over the serial device named in `config`
    pub fn new(config: SessionConfig) -> Result<Self> {
        let endpoint = SerialInterface::new(config.device_path.clone(), config.baud_rate)
            .with_read_timeout(config.read_timeout());
        Self::with_endpoint(config, Box::new(endpoint))
    }

    /// Session over any byte stream endpoint
    pub fn with_endpoint(config: SessionConfig, endpoint: Box<dyn Endpoint>) -> Result<Self> {
        config.validate()?;
        let prompts = config.compile_prompts()?;
        let executor = CommandExecutor::new(config.output_mode, config.interrupt_on_timeout);
        let (state_tx, _state_rx) = watch::channel(SessionState::Disconnected);

        Ok(Self {
            config,
            prompts,
            executor,
            inner: Mutex::new(Inner { endpoint, link: None }),
            control: StdMutex::new(None),
            info: StdMutex::new(None),
            state_tx,
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    pub fn info(&self) -> Option<SessionInfo> {
        lock(&self.info).clone()
    }

    /// Open the endpoint, start the reader pump and log in.
    ///
    /// Any failure tears everything down again and leaves the session
    /// `Failed`; a half logged-in session is never handed out.
    pub async fn connect(&self) -> Result<SessionInfo> {
        let mut inner = self.inner.lock().await;

        if inner.link.is_some() {
            if self.state() == SessionState::Ready {
                if let Some(info) = self.info() {
                    return Ok(info);
                }
            }
            log::info!("Discarding previous link before reconnecting");
            self.teardown(&mut inner).await;
        }

        match self.establish(&mut inner).await {
            Ok(info) => {
                *lock(&self.info) = Some(info.clone());
                Ok(info)
            }
            Err(e) => {
                log::error!("Connect to {} failed: {}", inner.endpoint.name(), e);
                self.teardown(&mut inner).await;
                self.set_state(SessionState::Failed);
                Err(e)
            }
        }
    }

    async fn establish(&self, inner: &mut Inner) -> Result<SessionInfo> {
        let device = inner.endpoint.name();
        log::info!("Connecting to {}", device);

        let (reader, writer) = inner
            .endpoint
            .open()
            .map_err(|e| SessionError::Connect(e.to_string()))?;
        let (pump, rx) = ReaderPump::start(reader, self.config.read_chunk_size)
            .map_err(|e| SessionError::Connect(e.to_string()))?;
        *lock(&self.control) = Some(pump.control());

        let link = inner.link.insert(Link {
            writer,
            matcher: Matcher::new(rx, self.config.strip_ansi),
            pump,
        });

        let sequencer = LoginSequencer {
            prompts: &self.prompts,
            username: &self.config.username,
            password: &self.config.password,
            wake_interval: self.config.wake_interval(),
            max_retries: self.config.max_login_retries,
        };
        let outcome = sequencer
            .run(
                link.writer.as_mut(),
                &mut link.matcher,
                self.config.connect_timeout(),
                |state| self.set_state(state),
            )
            .await?;

        Ok(SessionInfo {
            device,
            username: self.config.username.clone(),
            prompt: outcome.prompt,
            connected_at: Utc::now(),
        })
    }

    /// Run `command` in the remote shell and wait for it to finish.
    ///
    /// `timeout` defaults to the configured command timeout. A missed
    /// deadline is not an error: the result comes back with `truncated`
    /// set and the session stays usable.
    pub async fn exec_command(&self, command: &str, timeout: Option<Duration>) -> Result<CommandResult> {
        self.run_command(command, None, timeout).await
    }

    /// Like [`Session::exec_command`] with `input` fed to the command's stdin.
    pub async fn exec_with_input(
        &self,
        command: &str,
        input: &str,
        timeout: Option<Duration>,
    ) -> Result<CommandResult> {
        self.run_command(command, Some(input), timeout).await
    }

    async fn run_command(&self, command: &str, input: Option<&str>, timeout: Option<Duration>) -> Result<CommandResult> {
        // Reject early without waiting behind an in-flight command
        if self.state() == SessionState::Failed {
            return Err(SessionError::Failed);
        }

        let mut inner = self.inner.lock().await;
        if self.state() == SessionState::Failed {
            return Err(SessionError::Failed);
        }
        let link = inner.link.as_mut().ok_or(SessionError::NotConnected)?;

        let timeout = timeout.unwrap_or_else(|| self.config.command_timeout());
        let frame = self.executor.frame(command, input);
        self.set_state(SessionState::Executing);

        match self
            .executor
            .exec(link.writer.as_mut(), &mut link.matcher, &frame, timeout)
            .await
        {
            Ok(result) => {
                if result.truncated {
                    log::warn!("Command {:?} truncated after {:?}", command, timeout);
                }
                self.set_state(SessionState::Ready);
                Ok(result)
            }
            Err(e) if e.is_fatal() => {
                log::error!("Command {:?} failed, session is no longer usable: {}", command, e);
                self.set_state(SessionState::Failed);
                Err(e.into())
            }
            Err(e) => {
                log::warn!("Command {:?} failed: {}", command, e);
                self.set_state(SessionState::Ready);
                Err(e.into())
            }
        }
    }

    /// Log out, stop the reader pump and close the endpoint. Idempotent.
    pub async fn close(&self) -> Result<()> {
        let control = lock(&self.control).take();

        let mut inner = match self.inner.try_lock() {
            Ok(inner) => inner,
            Err(_) => {
                // A command is in flight; wake it so it gives up the lock
                if let Some(control) = &control {
                    control.stop();
                }
                self.inner.lock().await
            }
        };

        if let Some(link) = inner.link.as_mut() {
            if self.config.logout_on_close && self.state() == SessionState::Ready {
                log::debug!("Logging out of remote shell");
                if let Err(e) = link.writer.write(LOGOUT) {
                    log::warn!("Logout failed: {}", e);
                }
            }
        }
        self.teardown(&mut inner).await;
        *lock(&self.info) = None;
        self.set_state(SessionState::Disconnected);
        Ok(())
    }

    /// Stop the pump and release the link. Joining the pump thread can take
    /// up to one read timeout, so it happens on the blocking pool.
    async fn teardown(&self, inner: &mut Inner) {
        if let Some(link) = inner.link.take() {
            let Link { writer, matcher, mut pump } = link;
            pump.control().stop();
            if let Err(e) = tokio::task::spawn_blocking(move || pump.stop()).await {
                log::warn!("Serial reader shutdown task failed: {}", e);
            }
            drop(matcher);
            drop(writer);
        }
        *lock(&self.control) = None;
        inner.endpoint.close();
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            log::debug!("Session state {} -> {}", previous, state);
        }
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
