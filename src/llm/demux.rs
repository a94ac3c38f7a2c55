//! Thinking/answer demultiplexer for model output streams
//!
//! Models such as DeepSeek-R1 embed their chain of thought in the answer text,
//! delimited by `<think>` and `</think>`. The [`ThinkDemux`] folds fragments into
//! two buffers and can be projected into a [`Snapshot`] at any point.
//!
//! Markers are only recognized when they are wholly contained in a single
//! fragment. A marker split across two fragments is passed through as text.

use crate::llm::Snapshot;
use serde::Deserialize;
use tokio::time::{Duration, Instant};

pub const THINK_OPEN: &str = "<think>";
pub const THINK_CLOSE: &str = "</think>";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Phase {
    #[default]
    Answering,
    Thinking,
}

/// Incremental state of one model turn
#[derive(Debug, Clone, Default)]
pub struct ThinkDemux {
    phase: Phase,
    response: String,
    // Closed segments, concatenated
    complete_thinking: String,
    // Currently open segment, only non-empty while thinking
    current_thinking: String,
}

impl ThinkDemux {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one fragment into the state
    pub fn push(&mut self, fragment: &str) {
        let mut rest = fragment;
        loop {
            match self.phase {
                Phase::Answering => match rest.find(THINK_OPEN) {
                    Some(start) => {
                        self.response.push_str(&rest[..start]);
                        self.current_thinking.clear();
                        self.phase = Phase::Thinking;
                        rest = &rest[start + THINK_OPEN.len()..];
                    }
                    None => {
                        self.response.push_str(rest);
                        return;
                    }
                },
                Phase::Thinking => match rest.find(THINK_CLOSE) {
                    Some(end) => {
                        self.current_thinking.push_str(&rest[..end]);
                        self.complete_thinking.push_str(&self.current_thinking);
                        self.current_thinking.clear();
                        self.phase = Phase::Answering;
                        rest = &rest[end + THINK_CLOSE.len()..];
                    }
                    None => {
                        self.current_thinking.push_str(rest);
                        return;
                    }
                },
            }
        }
    }

    pub fn is_thinking(&self) -> bool {
        self.phase == Phase::Thinking
    }

    /// Current projection. Thinking includes the open segment, if any.
    pub fn snapshot(&self) -> Snapshot {
        let mut thinking =
            String::with_capacity(self.complete_thinking.len() + self.current_thinking.len());
        thinking.push_str(&self.complete_thinking);
        thinking.push_str(&self.current_thinking);
        Snapshot {
            thinking,
            response: self.response.clone(),
        }
    }

    /// Close the stream. An unterminated segment is kept as complete thinking.
    pub fn finish(mut self) -> Snapshot {
        if self.phase == Phase::Thinking {
            let open = std::mem::take(&mut self.current_thinking);
            self.complete_thinking.push_str(&open);
            self.phase = Phase::Answering;
        }
        Snapshot {
            thinking: self.complete_thinking,
            response: self.response,
        }
    }
}

/// Result of interpreting one NDJSON line from the local model server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedLine {
    Fragment { text: String, done: bool },
    /// Upstream reported an error in-band
    UpstreamError(String),
    Skip(SkipReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    Blank,
    InvalidUtf8,
    InvalidJson(String),
    NoText,
}

#[derive(Debug, Deserialize)]
struct GenerateLine {
    response: Option<serde_json::Value>,
    #[serde(default)]
    done: bool,
    error: Option<String>,
}

/// Parse one line of `/api/generate` output. Never fails; unusable lines become `Skip`.
pub fn parse_line(line: &[u8]) -> ParsedLine {
    let Ok(line) = std::str::from_utf8(line) else {
        return ParsedLine::Skip(SkipReason::InvalidUtf8);
    };
    let line = line.trim();
    if line.is_empty() {
        return ParsedLine::Skip(SkipReason::Blank);
    }

    let parsed: GenerateLine = match serde_json::from_str(line) {
        Ok(parsed) => parsed,
        Err(e) => return ParsedLine::Skip(SkipReason::InvalidJson(e.to_string())),
    };

    if let Some(error) = parsed.error {
        return ParsedLine::UpstreamError(error);
    }

    match parsed.response {
        Some(serde_json::Value::String(text)) => ParsedLine::Fragment {
            text,
            done: parsed.done,
        },
        // The final line may carry only statistics
        _ if parsed.done => ParsedLine::Fragment {
            text: String::new(),
            done: true,
        },
        _ => ParsedLine::Skip(SkipReason::NoText),
    }
}

/// Splits a byte stream into complete lines. Bytes are buffered rather than
/// decoded per chunk, so multi-byte characters may straddle chunk boundaries.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buffer: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every line it completed
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        let mut lines = Vec::new();
        for &byte in chunk {
            if byte == b'\n' {
                if !self.buffer.is_empty() {
                    lines.push(std::mem::take(&mut self.buffer));
                }
            } else {
                self.buffer.push(byte);
            }
        }
        lines
    }

    /// Remaining unterminated line, if any
    pub fn flush(&mut self) -> Option<Vec<u8>> {
        if self.buffer.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.buffer))
        }
    }
}

/// Minimum-interval gate for snapshot emission. Only emission is throttled;
/// the fold itself runs on every fragment.
#[derive(Debug)]
pub struct EmissionGate {
    min_interval: Duration,
    last_emit: Option<Instant>,
    /// A fragment was held back since the last emission
    pending: bool,
}

impl EmissionGate {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_emit: None,
            pending: false,
        }
    }

    /// Returns true and records the emission if enough time has passed.
    /// Otherwise the update is remembered for [`EmissionGate::flush_at`].
    pub fn ready(&mut self, now: Instant) -> bool {
        match self.last_emit {
            Some(last) if now.saturating_duration_since(last) < self.min_interval => {
                self.pending = true;
                false
            }
            _ => {
                self.last_emit = Some(now);
                self.pending = false;
                true
            }
        }
    }

    /// When a held-back update becomes due
    pub fn flush_at(&self) -> Option<Instant> {
        match self.last_emit {
            Some(last) if self.pending => Some(last + self.min_interval),
            _ => None,
        }
    }
}
