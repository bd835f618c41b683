use std::{collections::VecDeque, sync::Arc};

use tokio::sync::Mutex;

pub const DEFAULT_LOG_MAX_LINES: usize = 1000;

/// Bounded, sequence-numbered buffer of renderer output lines.
#[derive(Debug)]
pub struct LogBuffer {
    next_seq: u64,
    max_lines: usize,
    lines: VecDeque<(u64, String)>,
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_LOG_MAX_LINES)
    }
}

impl LogBuffer {
    pub fn with_capacity(max_lines: usize) -> Self {
        Self {
            next_seq: 1,
            max_lines: max_lines.max(1),
            lines: VecDeque::new(),
        }
    }

    pub fn push_line(&mut self, line: String) {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.saturating_add(1);
        self.lines.push_back((seq, line));
        while self.lines.len() > self.max_lines {
            self.lines.pop_front();
        }
    }

    /// Lines after `cursor`, plus the cursor to pass next time.
    /// A zero cursor returns the most recent `limit` lines.
    pub fn tail_after(&self, cursor: u64, limit: usize) -> (Vec<String>, u64) {
        if cursor == 0 {
            let start = self.lines.len().saturating_sub(limit);
            let mut out = Vec::new();
            let mut last = 0;
            for (seq, line) in self.lines.iter().skip(start) {
                out.push(line.clone());
                last = *seq;
            }
            return (out, last);
        }

        let mut out = Vec::new();
        let mut last = cursor;
        for (seq, line) in self.lines.iter() {
            if *seq > cursor {
                out.push(line.clone());
                last = *seq;
                if out.len() >= limit {
                    break;
                }
            }
        }
        (out, last)
    }

    pub fn last_lines(&self, n: usize) -> Vec<String> {
        self.tail_after(0, n).0
    }
}

pub type SharedLogs = Arc<Mutex<LogBuffer>>;

/// Splits a byte stream into lines on `\n` or `\r`.
///
/// Interactive prompts usually arrive without a trailing newline, so the
/// unterminated remainder is exposed through [`LineSplitter::pending`].
#[derive(Debug, Default)]
pub struct LineSplitter {
    buf: Vec<u8>,
}

impl LineSplitter {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| matches!(b, b'\n' | b'\r')) {
            let raw: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = clean_line(&raw[..raw.len() - 1]);
            if !line.is_empty() {
                out.push(line);
            }
        }
        out
    }

    pub fn pending(&self) -> Option<String> {
        let line = clean_line(&self.buf);
        if line.is_empty() { None } else { Some(line) }
    }

    pub fn finish(&mut self) -> Option<String> {
        let line = self.pending();
        self.buf.clear();
        line
    }
}

fn clean_line(raw: &[u8]) -> String {
    strip_ansi(&String::from_utf8_lossy(raw)).trim().to_string()
}

/// Removes CSI / OSC escape sequences emitted by colourful CLIs.
pub fn strip_ansi(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\u{1b}' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some('[') => {
                chars.next();
                // Parameters and intermediates, then one final byte in @..~.
                for n in chars.by_ref() {
                    if ('@'..='~').contains(&n) {
                        break;
                    }
                }
            }
            Some(']') => {
                chars.next();
                while let Some(n) = chars.next() {
                    if n == '\u{7}' {
                        break;
                    }
                    if n == '\u{1b}' && chars.peek() == Some(&'\\') {
                        chars.next();
                        break;
                    }
                }
            }
            Some(_) => {
                chars.next();
            }
            None => {}
        }
    }
    out
}
