//! Pattern matching over the byte queue.
//!
//! The serial line has no message boundaries, so every protocol step is
//! "wait until one of these patterns shows up". Received bytes accumulate in
//! a rolling buffer; a successful match consumes everything up to the end of
//! the match and leaves the tail for the next call. The buffer always holds
//! the bytes exactly as received; escape sequences are only hidden from
//! prompt scans.
use std::time::Duration;
use regex::bytes::Regex;
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};

use super::ansi;
use super::pump::{CloseReason, PumpEvent};
use super::{Result, SerialError};

/// A named regular expression matched against raw received bytes.
#[derive(Debug, Clone)]
pub struct Pattern {
    label: String,
    regex: Regex,
}

impl Pattern {
    pub fn regex(label: impl Into<String>, expr: &str) -> Result<Self> {
        Ok(Self { label: label.into(), regex: Regex::new(expr)? })
    }

    /// Match `text` verbatim.
    pub fn literal(label: impl Into<String>, text: &str) -> Result<Self> {
        Self::regex(label, &regex::escape(text))
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn as_str(&self) -> &str {
        self.regex.as_str()
    }
}

/// Result of a successful [`Matcher::await_pattern`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternMatch {
    /// Position of the winning pattern in the caller's slice.
    pub index: usize,
    /// Everything removed from the buffer: text before the match, then the match.
    pub consumed: Vec<u8>,
    /// Offset of the match inside `consumed`.
    pub start: usize,
    /// Capture groups 1.. of the winning pattern.
    pub groups: Vec<Option<Vec<u8>>>,
}

impl PatternMatch {
    pub fn before(&self) -> &[u8] {
        &self.consumed[..self.start]
    }

    pub fn matched(&self) -> &[u8] {
        &self.consumed[self.start..]
    }

    pub fn group(&self, n: usize) -> Option<&[u8]> {
        n.checked_sub(1)
            .and_then(|i| self.groups.get(i))
            .and_then(|g| g.as_deref())
    }
}

/// Consumer end of the byte queue plus the rolling buffer.
pub struct Matcher {
    rx: mpsc::UnboundedReceiver<PumpEvent>,
    buffer: Vec<u8>,
    strip_prompts: bool,
    closed: Option<CloseReason>,
}

impl Matcher {
    /// `strip_prompts` hides ANSI escape sequences from [`Matcher::await_prompt`].
    pub fn new(rx: mpsc::UnboundedReceiver<PumpEvent>, strip_prompts: bool) -> Self {
        Self {
            rx,
            buffer: Vec::new(),
            strip_prompts,
            closed: None,
        }
    }

    pub fn strips_prompts(&self) -> bool {
        self.strip_prompts
    }

    /// Bytes received but not yet consumed by a match.
    pub fn pending(&self) -> &[u8] {
        &self.buffer
    }

    /// Remove and return the unconsumed bytes.
    pub fn take_pending(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffer)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_some()
    }

    /// Wait until one of `patterns` matches the buffered stream.
    ///
    /// The earliest-starting match wins; at equal start the longest match
    /// wins; remaining ties go to the pattern listed first. On timeout the
    /// buffer is left untouched so partial output can still be recovered.
    pub async fn await_pattern(&mut self, patterns: &[&Pattern], timeout: Duration) -> Result<PatternMatch> {
        self.wait(patterns, timeout, false).await
    }

    /// Like [`Matcher::await_pattern`], but patterns are matched against the
    /// text with ANSI escape sequences removed when prompt stripping is on.
    /// Offsets, `consumed` and `before()` still refer to the raw bytes; capture
    /// groups come from the stripped text.
    pub async fn await_prompt(&mut self, patterns: &[&Pattern], timeout: Duration) -> Result<PatternMatch> {
        let strip = self.strip_prompts;
        self.wait(patterns, timeout, strip).await
    }

    async fn wait(&mut self, patterns: &[&Pattern], timeout: Duration, strip: bool) -> Result<PatternMatch> {
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(found) = self.scan(patterns, strip) {
                log::debug!(
                    "Matched pattern '{}' after {} bytes",
                    patterns[found.index].label(),
                    found.consumed.len()
                );
                return Ok(found);
            }
            if let Some(reason) = &self.closed {
                return Err(SerialError::StreamClosed(reason.to_string()));
            }

            match timeout_at(deadline, self.rx.recv()).await {
                Ok(Some(event)) => {
                    self.accept(event);
                    // Take whatever else is already queued before scanning again
                    while self.closed.is_none() {
                        match self.rx.try_recv() {
                            Ok(event) => self.accept(event),
                            Err(_) => break,
                        }
                    }
                }
                Ok(None) => {
                    self.closed = Some(CloseReason::Error("reader pump exited".to_string()));
                }
                Err(_) => {
                    log::debug!(
                        "Timed out after {:?} waiting for {:?}; {} bytes pending",
                        timeout,
                        patterns.iter().map(|p| p.label()).collect::<Vec<_>>(),
                        self.buffer.len()
                    );
                    return Err(SerialError::Timeout);
                }
            }
        }
    }

    fn accept(&mut self, event: PumpEvent) {
        match event {
            PumpEvent::Data(chunk) => self.buffer.extend_from_slice(&chunk),
            PumpEvent::Closed(reason) => {
                if self.closed.is_none() {
                    self.closed = Some(reason);
                }
            }
        }
    }

    fn scan(&mut self, patterns: &[&Pattern], strip: bool) -> Option<PatternMatch> {
        let stripped = strip.then(|| ansi::strip_indexed(&self.buffer));
        let view: &[u8] = match &stripped {
            Some(s) => &s.text,
            None => &self.buffer,
        };

        let mut best: Option<(usize, usize, usize)> = None;
        for (index, pattern) in patterns.iter().enumerate() {
            if let Some(m) = pattern.regex.find(view) {
                let better = match best {
                    None => true,
                    Some((start, end, _)) => {
                        m.start() < start || (m.start() == start && m.end() > end)
                    }
                };
                if better {
                    best = Some((m.start(), m.end(), index));
                }
            }
        }

        let (start, end, index) = best?;
        let groups = patterns[index]
            .regex
            .captures(view)
            .map(|caps| {
                caps.iter()
                    .skip(1)
                    .map(|g| g.map(|m| m.as_bytes().to_vec()))
                    .collect()
            })
            .unwrap_or_default();
        let (start, end) = match &stripped {
            Some(s) => {
                let raw_start = s.raw_start(start);
                let raw_end = if end > start { s.raw_end(end) } else { raw_start };
                (raw_start, raw_end)
            }
            None => (start, end),
        };
        let consumed: Vec<u8> = self.buffer.drain(..end).collect();

        Some(PatternMatch { index, consumed, start, groups })
    }
}
