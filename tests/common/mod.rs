//! In-process stand-in for a serial console attached to a POSIX machine.
//!
//! The remote side runs on its own thread and behaves like getty plus an
//! interactive shell on a tty: it echoes input with CRLF line endings, prints
//! login/password/shell prompts, shows `> ` continuation prompts, handles
//! Ctrl-C and Ctrl-D, and runs every complete script through `sh -c` on the
//! test machine. Output is delivered in small uneven chunks.
#![allow(dead_code)]

use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use regex::Regex;
use serial_exec::serial::{Endpoint, SerialError, StreamReader, StreamWriter};
use serial_exec::SessionConfig;

pub const LOGIN_PROMPT: &str = "target login: ";
pub const PASSWORD_PROMPT: &str = "Password: ";
pub const SHELL_PROMPT: &str = "user@target:~$ ";
pub const MOTD: &str = "Welcome to target\r\n";

#[derive(Debug, Clone)]
pub struct ConsoleOptions {
    pub logged_in: bool,
    pub username: String,
    pub password: Option<String>,
    /// Never answer anything.
    pub silent: bool,
    /// Shell without line editing: the kernel echoes every input chunk as it
    /// arrives and continuation prompts follow the echo.
    pub kernel_echo: bool,
    /// Wrap the shell prompt in colour escape sequences.
    pub colour_prompt: bool,
}

impl Default for ConsoleOptions {
    fn default() -> Self {
        Self {
            logged_in: false,
            username: "user".to_string(),
            password: Some("secret".to_string()),
            silent: false,
            kernel_echo: false,
            colour_prompt: false,
        }
    }
}

#[derive(Default)]
struct LineStats {
    in_write: AtomicBool,
    overlapping_writes: AtomicUsize,
    writes: Mutex<Vec<Vec<u8>>>,
    severed: AtomicBool,
    stall_ms: AtomicU64,
}

/// Test-side view of the line
#[derive(Clone)]
pub struct ConsoleHandle {
    stats: Arc<LineStats>,
}

impl ConsoleHandle {
    /// Simulate a pulled cable.
    pub fn sever(&self) {
        self.stats.severed.store(true, Ordering::SeqCst);
    }

    /// Make the reader's next read block for `duration` without returning data.
    pub fn stall_next_read(&self, duration: Duration) {
        self.stats.stall_ms.store(duration.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn overlapping_writes(&self) -> usize {
        self.stats.overlapping_writes.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.stats.writes.lock().unwrap().clone()
    }

    pub fn wrote(&self, needle: &[u8]) -> bool {
        self.writes().iter().any(|w| w == needle)
    }
}

pub struct FakeConsole {
    options: ConsoleOptions,
    stats: Arc<LineStats>,
    open: bool,
}

impl FakeConsole {
    pub fn new(options: ConsoleOptions) -> (Self, ConsoleHandle) {
        let stats = Arc::new(LineStats::default());
        let handle = ConsoleHandle { stats: stats.clone() };
        (Self { options, stats, open: false }, handle)
    }
}

impl Endpoint for FakeConsole {
    fn name(&self) -> String {
        "fake-console".to_string()
    }

    fn open(&mut self) -> serial_exec::serial::Result<(Box<dyn StreamReader>, Box<dyn StreamWriter>)> {
        let (input_tx, input_rx) = mpsc::channel::<Vec<u8>>();
        let (output_tx, output_rx) = mpsc::channel::<Vec<u8>>();
        let options = self.options.clone();
        thread::spawn(move || Remote::new(options, output_tx).run(input_rx));

        self.open = true;
        Ok((
            Box::new(FakeReader { rx: output_rx, pending: Vec::new(), stats: self.stats.clone() }),
            Box::new(FakeWriter { tx: input_tx, stats: self.stats.clone() }),
        ))
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

struct FakeReader {
    rx: mpsc::Receiver<Vec<u8>>,
    pending: Vec<u8>,
    stats: Arc<LineStats>,
}

impl StreamReader for FakeReader {
    fn read(&mut self, buf: &mut [u8]) -> serial_exec::serial::Result<usize> {
        if self.stats.severed.load(Ordering::SeqCst) {
            return Err(SerialError::Device("line severed".to_string()));
        }
        let stall = self.stats.stall_ms.swap(0, Ordering::SeqCst);
        if stall > 0 {
            thread::sleep(Duration::from_millis(stall));
            return Ok(0);
        }
        if self.pending.is_empty() {
            match self.rx.recv_timeout(Duration::from_millis(20)) {
                Ok(chunk) => self.pending = chunk,
                Err(mpsc::RecvTimeoutError::Timeout) => return Ok(0),
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    return Err(SerialError::Device("remote hung up".to_string()))
                }
            }
        }
        let n = self.pending.len().min(buf.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }
}

struct FakeWriter {
    tx: mpsc::Sender<Vec<u8>>,
    stats: Arc<LineStats>,
}

impl StreamWriter for FakeWriter {
    fn write(&mut self, data: &[u8]) -> serial_exec::serial::Result<usize> {
        if self.stats.severed.load(Ordering::SeqCst) {
            return Err(SerialError::Device("line severed".to_string()));
        }
        if self.stats.in_write.swap(true, Ordering::SeqCst) {
            self.stats.overlapping_writes.fetch_add(1, Ordering::SeqCst);
        }
        self.stats.writes.lock().unwrap().push(data.to_vec());
        // widen the window in which an overlapping writer would be noticed
        thread::sleep(Duration::from_millis(2));
        let sent = self.tx.send(data.to_vec());
        self.stats.in_write.store(false, Ordering::SeqCst);
        sent.map_err(|_| SerialError::Device("remote hung up".to_string()))?;
        Ok(data.len())
    }
}

enum RemoteState {
    Login,
    Password { user: String },
    Shell,
}

struct Remote {
    options: ConsoleOptions,
    state: RemoteState,
    line: Vec<u8>,
    script: Vec<String>,
    open_group: bool,
    heredoc: Option<String>,
    heredoc_re: Regex,
    out: mpsc::Sender<Vec<u8>>,
    pending_out: Vec<u8>,
}

impl Remote {
    fn new(options: ConsoleOptions, out: mpsc::Sender<Vec<u8>>) -> Self {
        let state = if options.logged_in { RemoteState::Shell } else { RemoteState::Login };
        Self {
            options,
            state,
            line: Vec::new(),
            script: Vec::new(),
            open_group: false,
            heredoc: None,
            heredoc_re: Regex::new(r"<<'([^']+)'").unwrap(),
            out,
            pending_out: Vec::new(),
        }
    }

    fn run(mut self, input: mpsc::Receiver<Vec<u8>>) {
        while let Ok(chunk) = input.recv() {
            if self.options.silent {
                continue;
            }
            if self.options.kernel_echo && matches!(self.state, RemoteState::Shell) {
                let echo: Vec<u8> = chunk.iter().copied().filter(|b| !matches!(b, 0x03 | 0x04)).collect();
                self.emit(&crlf(&echo));
            }
            for byte in chunk {
                self.feed(byte);
            }
            self.flush();
        }
    }

    fn emit(&mut self, data: &[u8]) {
        self.pending_out.extend_from_slice(data);
    }

    fn flush(&mut self) {
        for piece in self.pending_out.chunks(13) {
            let _ = self.out.send(piece.to_vec());
        }
        self.pending_out.clear();
    }

    fn take_line(&mut self) -> String {
        String::from_utf8_lossy(&std::mem::take(&mut self.line)).to_string()
    }

    fn feed(&mut self, byte: u8) {
        match self.state {
            RemoteState::Login => match byte {
                b'\n' => {
                    self.emit(b"\r\n");
                    let user = self.take_line();
                    if user.is_empty() {
                        self.emit(LOGIN_PROMPT.as_bytes());
                    } else if self.options.password.is_some() {
                        self.emit(PASSWORD_PROMPT.as_bytes());
                        self.state = RemoteState::Password { user };
                    } else {
                        self.finish_login(&user, true);
                    }
                }
                b'\r' | 0x03 | 0x04 => {}
                other => {
                    self.emit(&[other]);
                    self.line.push(other);
                }
            },
            RemoteState::Password { .. } => match byte {
                b'\n' => {
                    self.emit(b"\r\n");
                    let entered = self.take_line();
                    let user = match std::mem::replace(&mut self.state, RemoteState::Login) {
                        RemoteState::Password { user } => user,
                        _ => String::new(),
                    };
                    let accepted = self.options.password.as_deref() == Some(entered.as_str());
                    self.finish_login(&user, accepted);
                }
                b'\r' => {}
                other => self.line.push(other),
            },
            RemoteState::Shell => self.shell_byte(byte),
        }
    }

    fn finish_login(&mut self, user: &str, accepted: bool) {
        if accepted && user == self.options.username {
            self.emit(MOTD.as_bytes());
            self.emit_prompt();
            self.state = RemoteState::Shell;
        } else {
            self.emit(b"Login incorrect\r\n");
            self.emit(LOGIN_PROMPT.as_bytes());
            self.state = RemoteState::Login;
        }
    }

    fn shell_byte(&mut self, byte: u8) {
        match byte {
            0x03 => {
                self.line.clear();
                self.script.clear();
                self.open_group = false;
                self.heredoc = None;
                self.emit(b"^C\r\n");
                self.emit_prompt();
            }
            0x04 => {
                if self.line.is_empty() && self.script.is_empty() {
                    self.emit(b"logout\r\n\r\n");
                    self.emit(LOGIN_PROMPT.as_bytes());
                    self.state = RemoteState::Login;
                }
            }
            b'\r' => {}
            b'\n' => {
                if !self.options.kernel_echo {
                    self.emit(b"\r\n");
                }
                let line = self.take_line();
                if self.script.is_empty() && line.trim().is_empty() {
                    self.emit_prompt();
                    return;
                }
                let complete = self.track(&line);
                self.script.push(line);
                if complete {
                    let script = std::mem::take(&mut self.script).join("\n");
                    self.flush();
                    let output = run_sh(&script);
                    self.emit(&crlf(&output));
                    self.emit_prompt();
                } else {
                    self.emit(b"> ");
                }
            }
            other => {
                if !self.options.kernel_echo {
                    self.emit(&[other]);
                }
                self.line.push(other);
            }
        }
    }

    fn emit_prompt(&mut self) {
        if self.options.colour_prompt {
            self.emit(b"\x1b[01;32muser@target\x1b[00m:\x1b[01;34m~\x1b[00m$ ");
        } else {
            self.emit(SHELL_PROMPT.as_bytes());
        }
    }

    /// Whether the script is complete after `line`.
    fn track(&mut self, line: &str) -> bool {
        if let Some(delimiter) = &self.heredoc {
            if line == delimiter {
                self.heredoc = None;
            }
            return self.heredoc.is_none() && !self.open_group;
        }
        // frames open a `{` group on their first line and close it on a line of its own
        if !self.open_group && line.contains("; { ") {
            self.open_group = true;
        } else if self.open_group && line.starts_with('}') {
            self.open_group = false;
        }
        if let Some(caps) = self.heredoc_re.captures(line) {
            self.heredoc = Some(caps[1].to_string());
        }
        !self.open_group && self.heredoc.is_none()
    }
}

fn run_sh(script: &str) -> Vec<u8> {
    match Command::new("sh")
        .arg("-c")
        .arg(format!("exec 2>&1\n{}", script))
        .stdin(Stdio::null())
        .output()
    {
        Ok(output) => output.stdout,
        Err(e) => format!("sh: {}\n", e).into_bytes(),
    }
}

fn crlf(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / 8);
    for &b in data {
        if b == b'\n' {
            out.push(b'\r');
        }
        out.push(b);
    }
    out
}

/// Session settings tuned for the fake console
pub fn test_config() -> SessionConfig {
    let mut config = SessionConfig::new("fake-console").with_credentials("user", "secret");
    config.connect_timeout_ms = 5_000;
    config.wake_interval_ms = 300;
    config.command_timeout_ms = 10_000;
    config.read_timeout_ms = 20;
    config
}

pub fn fake_session(options: ConsoleOptions, config: SessionConfig) -> (serial_exec::Session, ConsoleHandle) {
    let (console, handle) = FakeConsole::new(options);
    let session = serial_exec::Session::with_endpoint(config, Box::new(console)).expect("valid config");
    (session, handle)
}
