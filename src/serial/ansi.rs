//! Removal of 7-bit ANSI escape sequences for prompt detection.
//!
//! Remote shells colour their prompts; prompt regexes are written against
//! plain text. The received bytes themselves are never altered: prompt scans
//! run over a stripped view that remembers where each kept byte came from,
//! so a match in the view can be consumed from the raw buffer.

const ESC: u8 = 0x1B;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Text,
    Escape,
    Csi,
}

/// Printable text of a byte slice plus the raw offset of every kept byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stripped {
    pub text: Vec<u8>,
    offsets: Vec<usize>,
    raw_len: usize,
}

impl Stripped {
    /// Raw offset of the view position `pos`.
    pub fn raw_start(&self, pos: usize) -> usize {
        self.offsets.get(pos).copied().unwrap_or(self.raw_len)
    }

    /// Raw offset just past the view range ending at `end`.
    pub fn raw_end(&self, end: usize) -> usize {
        match end.checked_sub(1).and_then(|last| self.offsets.get(last)) {
            Some(&raw) => raw + 1,
            None => 0,
        }
    }
}

/// Strip escape sequences from `input`. An unfinished sequence at the end is
/// left out of the view until the rest of it arrives.
pub fn strip_indexed(input: &[u8]) -> Stripped {
    let mut text = Vec::with_capacity(input.len());
    let mut offsets = Vec::with_capacity(input.len());
    let mut state = State::Text;
    let mut escape_at = 0;
    let mut i = 0;

    while i < input.len() {
        let byte = input[i];
        match state {
            State::Text => {
                if byte == ESC {
                    state = State::Escape;
                    escape_at = i;
                } else {
                    text.push(byte);
                    offsets.push(i);
                }
            }
            State::Escape => match byte {
                b'[' => state = State::Csi,
                // Fe sequences other than CSI: ESC followed by @-Z, \, ], ^, _
                0x40..=0x5A | 0x5C..=0x5F => state = State::Text,
                _ => {
                    // Not an escape sequence after all; keep the ESC, rescan this byte
                    text.push(ESC);
                    offsets.push(escape_at);
                    state = State::Text;
                    continue;
                }
            },
            State::Csi => match byte {
                // parameter and intermediate bytes
                0x20..=0x3F => {}
                // final byte
                0x40..=0x7E => state = State::Text,
                _ => {
                    state = State::Text;
                    continue;
                }
            },
        }
        i += 1;
    }

    Stripped { text, offsets, raw_len: input.len() }
}

pub fn strip(input: &[u8]) -> Vec<u8> {
    strip_indexed(input).text
}
