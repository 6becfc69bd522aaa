//! Line-oriented console session to the device.
//!
//! A [`Console`] is a duplex text channel with the "expect" primitive used by
//! everything above it: send a line, then block until one of several
//! patterns shows up (or a timeout elapses) and look at the text that came
//! before the match.

pub mod serial;

use std::time::Duration;

use regex::Regex;

use crate::error::Result;

pub use serial::SerialConsole;

/// Duplex, line-buffered text channel to the device.
///
/// Only one command may be outstanding at a time; callers own the console
/// exclusively for the duration of a session.
pub trait Console {
    /// Send `line` followed by a newline.
    fn send_line(&mut self, line: &str) -> Result<()>;

    /// Send a control character, e.g. `'c'` for Ctrl-C.
    fn send_control(&mut self, ch: char) -> Result<()>;

    /// Block until one of `patterns` appears or `timeout` elapses.
    ///
    /// Returns the index of the matching pattern. When several match, the
    /// one that starts earliest in the stream wins, ties going to the lower
    /// index. The matched text is consumed and the text preceding it becomes
    /// available through [`Console::before`]. Elapsed timeouts are reported
    /// as [`crate::Error::Timeout`].
    fn expect(&mut self, patterns: &[Regex], timeout: Duration) -> Result<usize>;

    /// Text that preceded the last successful [`Console::expect`] match.
    fn before(&self) -> &str;

    /// Return already buffered text plus whatever arrives within `timeout`,
    /// at most about `max_bytes` of new data. Returns an empty string when
    /// nothing is pending.
    fn read_nonblocking(&mut self, max_bytes: usize, timeout: Duration) -> Result<String>;
}

/// Byte sent on the wire for a control character (`'c'` -> 0x03).
pub fn control_byte(ch: char) -> u8 {
    (ch.to_ascii_uppercase() as u8) & 0x1F
}

/// Find the earliest match of any pattern in `text`.
///
/// Returns `(pattern_index, match_start, match_end)`.
pub fn earliest_match(text: &str, patterns: &[Regex]) -> Option<(usize, usize, usize)> {
    patterns
        .iter()
        .enumerate()
        .filter_map(|(index, pattern)| pattern.find(text).map(|m| (index, m.start(), m.end())))
        .min_by_key(|&(index, start, _)| (start, index))
}

/// Drain buffered bytes into text without stalling on invalid bytes.
///
/// - Valid UTF-8 is emitted as-is.
/// - Invalid byte sequences emit the replacement char `�` and continue.
/// - Incomplete UTF-8 suffix is kept in `buffer` for the next read.
pub fn drain_utf8_lossy(buffer: &mut Vec<u8>) -> String {
    let mut output = String::new();

    loop {
        match std::str::from_utf8(buffer) {
            Ok(valid) => {
                output.push_str(valid);
                buffer.clear();
                break;
            },
            Err(err) => {
                let valid_up_to = err.valid_up_to();
                if valid_up_to > 0 {
                    if let Ok(valid) = std::str::from_utf8(&buffer[..valid_up_to]) {
                        output.push_str(valid);
                    }
                }

                match err.error_len() {
                    Some(invalid_len) => {
                        output.push('�');
                        let drain_to = valid_up_to.saturating_add(invalid_len).min(buffer.len());
                        buffer.drain(..drain_to);
                    },
                    None => {
                        if valid_up_to > 0 {
                            buffer.drain(..valid_up_to);
                        }
                        break;
                    },
                }
            },
        }
    }

    output
}

/// Normalise raw console text for parsing.
///
/// CRLF and lone CR become LF, ANSI escape sequences are removed and other
/// control characters except tab are dropped.
pub fn clean_console_text(text: &str) -> String {
    let normalized = text.replace("\r\n", "\n").replace('\r', "\n");
    let mut out = String::with_capacity(normalized.len());
    let mut chars = normalized.chars();

    while let Some(ch) = chars.next() {
        match ch {
            '\x1b' => {
                // CSI: ESC [ params final-byte
                if chars.clone().next() == Some('[') {
                    chars.next();
                    for c in chars.by_ref() {
                        if c.is_ascii_alphabetic() || c == '~' {
                            break;
                        }
                    }
                }
            },
            '\n' | '\t' => out.push(ch),
            _ if ch.is_control() => {},
            _ => out.push(ch),
        }
    }

    out
}
