//! Command framing and output extraction.
//!
//! Each command is wrapped so that the remote shell itself prints a line
//! `START:<token>` right before the command runs and `OUT:<token>:<status>`
//! once it finishes. The token is random per call, so text produced by the
//! command is very unlikely to contain it. Markers are printed with `printf`
//! taking the tag and the token as separate arguments: the terminal echo of
//! the frame only ever contains the tag and token separated by a space, never
//! the contiguous marker. Output is whatever lies between the two markers,
//! regardless of how the tty interleaves echo and continuation prompts.
//!
//! In [`OutputMode::Separate`] the command's stderr goes to a temporary file on
//! the remote side, which is replayed after the status line and terminated by
//! `ERR:<token>`.
use std::time::Duration;
use tokio::time::Instant;

use crate::serial::{Matcher, Pattern, Result, SerialError, StreamWriter};
use super::models::{CommandResult, OutputMode};

pub const START_TAG: &str = "START:";
pub const OUT_TAG: &str = "OUT:";
pub const ERR_TAG: &str = "ERR:";
/// Ctrl-C
pub const INTERRUPT: &[u8] = b"\x03";

/// The text written for one command plus what is needed to parse its reply
#[derive(Debug, Clone)]
pub struct CommandFrame {
    token: String,
    text: String,
    mode: OutputMode,
}

impl CommandFrame {
    pub fn new(command: &str, mode: OutputMode) -> Self {
        Self::build(command, None, mode)
    }

    /// Frame a command whose stdin is `input`, delivered as a quoted heredoc.
    pub fn with_input(command: &str, input: &str, mode: OutputMode) -> Self {
        Self::build(command, Some(input), mode)
    }

    fn build(command: &str, input: Option<&str>, mode: OutputMode) -> Self {
        let token = uuid::Uuid::new_v4().simple().to_string();
        let command = match command.trim() {
            "" => ":",
            trimmed => trimmed,
        };
        let stderr_file = format!("/tmp/.serial-exec.{}", token);
        let delimiter = format!("SERIAL_EXEC_EOF_{}", token);

        // The closing brace sits on its own line so trailing `&`, `;` or
        // comments in the command cannot swallow the status report.
        let mut text = format!("printf '%s%s\\n' {} {}; {{ {}\n}}", START_TAG, token, command);
        if mode == OutputMode::Separate {
            text.push_str(&format!(" 2>'{}'", stderr_file));
        }
        if input.is_some() {
            text.push_str(&format!(" <<'{}'", delimiter));
        }
        text.push_str(&format!("; printf '%s%s:%d\\n' {} {} $?", OUT_TAG, token));
        if mode == OutputMode::Separate {
            text.push_str(&format!(
                "; cat '{file}' 2>/dev/null; rm -f '{file}'; printf '%s%s\\n' {} {}",
                ERR_TAG,
                token,
                file = stderr_file
            ));
        }
        text.push('\n');

        if let Some(body) = input {
            text.push_str(body);
            if !body.is_empty() && !body.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&delimiter);
            text.push('\n');
        }

        Self { token, text, mode }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Bytes to write to the line.
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn mode(&self) -> OutputMode {
        self.mode
    }

    /// Matches the status line; group 1 holds the raw status text.
    pub fn status_pattern(&self) -> Result<Pattern> {
        Pattern::regex(
            "command status",
            &format!(r"{}{}:([^\r\n]*)\r*\n", regex::escape(OUT_TAG), self.token),
        )
    }

    /// Matches the line closing the replayed stderr.
    pub fn stderr_end_pattern(&self) -> Result<Pattern> {
        Pattern::regex(
            "stderr end",
            &format!(r"{}{}\r*\n", regex::escape(ERR_TAG), self.token),
        )
    }

    /// The command's output within `received`: everything after this frame's
    /// start marker line. `None` when the command never started.
    pub fn isolate_output(&self, received: &[u8]) -> Option<Vec<u8>> {
        let marker = format!("{}{}", START_TAG, self.token);
        let pos = rfind(received, marker.as_bytes())?;
        Some(normalize_newlines(&received[line_end(received, pos)..]))
    }
}

/// Runs framed commands over an open link
#[derive(Debug, Clone, Copy)]
pub struct CommandExecutor {
    pub mode: OutputMode,
    pub interrupt_on_timeout: bool,
}

impl CommandExecutor {
    pub fn new(mode: OutputMode, interrupt_on_timeout: bool) -> Self {
        Self { mode, interrupt_on_timeout }
    }

    pub fn frame(&self, command: &str, input: Option<&str>) -> CommandFrame {
        match input {
            Some(body) => CommandFrame::with_input(command, body, self.mode),
            None => CommandFrame::new(command, self.mode),
        }
    }

    /// Write `frame` and collect its result.
    ///
    /// A missed deadline yields a truncated result; a dead stream, a write
    /// failure or an unparseable status are returned as errors.
    pub async fn exec(
        &self,
        writer: &mut dyn StreamWriter,
        matcher: &mut Matcher,
        frame: &CommandFrame,
        timeout: Duration,
    ) -> Result<CommandResult> {
        let deadline = Instant::now() + timeout;
        log::debug!(">> {:?}", frame.text());
        writer.write(frame.text().as_bytes())?;

        let status = frame.status_pattern()?;
        let reply = match matcher.await_pattern(&[&status], timeout).await {
            Ok(reply) => reply,
            Err(SerialError::Timeout) => {
                let partial = matcher.take_pending();
                log::warn!(
                    "Command timed out after {:?}; returning {} bytes of partial output",
                    timeout,
                    partial.len()
                );
                self.interrupt(writer)?;
                return Ok(CommandResult {
                    stdout: frame.isolate_output(&partial).unwrap_or_default(),
                    stderr: Vec::new(),
                    exit_code: None,
                    truncated: true,
                });
            }
            Err(e) => return Err(e),
        };

        let exit_code = parse_status(reply.group(1).unwrap_or_default())?;
        let stdout = frame.isolate_output(reply.before()).ok_or_else(|| {
            SerialError::Protocol("status marker arrived without start marker".to_string())
        })?;

        let (stderr, truncated) = match frame.mode() {
            OutputMode::Combined => (Vec::new(), false),
            OutputMode::Separate => {
                let end = frame.stderr_end_pattern()?;
                let remaining = deadline.saturating_duration_since(Instant::now());
                match matcher.await_pattern(&[&end], remaining).await {
                    Ok(replay) => (normalize_newlines(replay.before()), false),
                    Err(SerialError::Timeout) => {
                        log::warn!("Timed out reading stderr replay; returning partial stderr");
                        (normalize_newlines(&matcher.take_pending()), true)
                    }
                    Err(e) => return Err(e),
                }
            }
        };

        Ok(CommandResult { stdout, stderr, exit_code: Some(exit_code), truncated })
    }

    fn interrupt(&self, writer: &mut dyn StreamWriter) -> Result<()> {
        if self.interrupt_on_timeout {
            log::debug!("Sending interrupt to remote shell");
            writer.write(INTERRUPT)?;
        }
        Ok(())
    }
}

fn parse_status(raw: &[u8]) -> Result<i32> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.trim().parse::<i32>().ok())
        .ok_or_else(|| {
            SerialError::Protocol(format!(
                "unparseable exit status {:?}",
                String::from_utf8_lossy(raw)
            ))
        })
}

fn rfind(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).rposition(|w| w == needle)
}

/// Index just past the newline that ends the line containing `from`.
fn line_end(data: &[u8], from: usize) -> usize {
    data[from..]
        .iter()
        .position(|&b| b == b'\n')
        .map(|i| from + i + 1)
        .unwrap_or(data.len())
}

/// Collapse terminal line endings (`\r\n`, `\r\r\n`) to `\n`.
pub fn normalize_newlines(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;
    while i < data.len() {
        if data[i] == b'\r' {
            let run_end = data[i..].iter().position(|&b| b != b'\r').map(|p| i + p);
            if let Some(next) = run_end {
                if data[next] == b'\n' {
                    i = next;
                    continue;
                }
            }
        }
        out.push(data[i]);
        i += 1;
    }
    out
}
