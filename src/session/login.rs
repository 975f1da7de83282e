//! Drive the remote console from an unknown state to a shell prompt.
//!
//! The line may show a getty login prompt, a half-finished password prompt,
//! stale output from a previous session or nothing at all. The sequencer
//! keeps sending the wake byte and rescanning until it recognizes a prompt,
//! giving up after a bounded number of consecutive misses.
use std::time::Duration;
use tokio::time::Instant;

use crate::config::PromptPatterns;
use crate::serial::{ansi, Matcher, PatternMatch, SerialError, StreamWriter};
use super::{Result, SessionError, SessionState};

pub const WAKE: &[u8] = b"\n";

pub struct LoginSequencer<'a> {
    pub prompts: &'a PromptPatterns,
    pub username: &'a str,
    pub password: &'a str,
    pub wake_interval: Duration,
    pub max_retries: u32,
}

/// What the sequencer learned on the way in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginOutcome {
    /// The shell prompt line as the remote printed it.
    pub prompt: String,
    pub retries: u32,
}

impl<'a> LoginSequencer<'a> {
    /// Run the login exchange. `on_state` observes every transition up to
    /// and including `Ready`; failures are returned, never reported as a state.
    pub async fn run<F>(
        &self,
        writer: &mut dyn StreamWriter,
        matcher: &mut Matcher,
        timeout: Duration,
        mut on_state: F,
    ) -> Result<LoginOutcome>
    where
        F: FnMut(SessionState) + Send,
    {
        let deadline = Instant::now() + timeout;
        let mut state = SessionState::LoggingIn;
        let mut retries = 0u32;
        let strip = matcher.strips_prompts();

        on_state(state);
        send(writer, WAKE)?;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(SessionError::Connect(format!(
                    "no shell prompt within {:?} (last state {})",
                    timeout, state
                )));
            }
            let wait = remaining.min(self.wake_interval);

            match state {
                SessionState::LoggingIn => {
                    let found = matcher
                        .await_prompt(&[&self.prompts.login, &self.prompts.shell, &self.prompts.password], wait)
                        .await;
                    match found {
                        Ok(m) if m.index == 1 => return Ok(self.ready(m, strip, retries, &mut on_state)),
                        Ok(m) if m.index == 0 => {
                            log::debug!("Login prompt seen, sending username");
                            retries = 0;
                            send(writer, format!("{}\n", self.username).as_bytes())?;
                            state = SessionState::AwaitingPassword;
                            on_state(state);
                        }
                        Ok(_) => {
                            // A password prompt nobody asked for; abort it and look again.
                            self.retry(&mut retries, "stale password prompt")?;
                            send(writer, WAKE)?;
                        }
                        Err(SerialError::Timeout) => {
                            self.retry(&mut retries, "no recognizable prompt")?;
                            send(writer, WAKE)?;
                        }
                        Err(e) => return Err(connect_error(e)),
                    }
                }
                SessionState::AwaitingPassword => {
                    let found = matcher
                        .await_prompt(&[&self.prompts.password, &self.prompts.shell, &self.prompts.login], wait)
                        .await;
                    match found {
                        Ok(m) if m.index == 0 => {
                            log::debug!("Password prompt seen, sending password");
                            send(writer, format!("{}\n", self.password).as_bytes())?;
                            let remaining = deadline.saturating_duration_since(Instant::now());
                            let verdict = matcher
                                .await_prompt(&[&self.prompts.shell, &self.prompts.login], remaining)
                                .await;
                            return match verdict {
                                Ok(m) if m.index == 0 => Ok(self.ready(m, strip, retries, &mut on_state)),
                                Ok(_) => {
                                    log::error!("Remote rejected login for user {}", self.username);
                                    Err(SessionError::AuthenticationRejected)
                                }
                                Err(e) => Err(connect_error(e)),
                            };
                        }
                        // Accounts without a password go straight to the shell
                        Ok(m) if m.index == 1 => return Ok(self.ready(m, strip, retries, &mut on_state)),
                        Ok(_) => {
                            self.retry(&mut retries, "login prompt repeated")?;
                            send(writer, format!("{}\n", self.username).as_bytes())?;
                        }
                        Err(SerialError::Timeout) => {
                            self.retry(&mut retries, "no password prompt")?;
                            send(writer, WAKE)?;
                            state = SessionState::LoggingIn;
                            on_state(state);
                        }
                        Err(e) => return Err(connect_error(e)),
                    }
                }
                other => {
                    return Err(SessionError::Connect(format!("unexpected login state {}", other)));
                }
            }
        }
    }

    fn ready<F>(&self, found: PatternMatch, strip: bool, retries: u32, on_state: &mut F) -> LoginOutcome
    where
        F: FnMut(SessionState),
    {
        let prompt = if strip { last_line(&ansi::strip(&found.consumed)) } else { last_line(&found.consumed) };
        log::info!("Shell prompt reached: {:?}", prompt);
        on_state(SessionState::Ready);
        LoginOutcome { prompt, retries }
    }

    fn retry(&self, retries: &mut u32, why: &str) -> Result<()> {
        *retries += 1;
        if *retries > self.max_retries {
            return Err(SessionError::Connect(format!(
                "{} after {} attempts",
                why, self.max_retries
            )));
        }
        log::warn!("Login: {}, retrying ({}/{})", why, retries, self.max_retries);
        Ok(())
    }
}

fn send(writer: &mut dyn StreamWriter, data: &[u8]) -> Result<()> {
    writer.write(data).map(|_| ()).map_err(connect_error)
}

fn connect_error(e: SerialError) -> SessionError {
    SessionError::Connect(e.to_string())
}

fn last_line(data: &[u8]) -> String {
    let start = data.iter().rposition(|&b| b == b'\n').map(|i| i + 1).unwrap_or(0);
    String::from_utf8_lossy(&data[start..]).trim_start_matches('\r').to_string()
}
