use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Chat request as posted by the client
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub message: String,
    /// Flattened transcript of the previous turns ("Role: text", blank-line separated)
    #[serde(default)]
    pub context: String,
    #[serde(default)]
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

/// Point-in-time projection of the demultiplexed stream
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub thinking: String,
    pub response: String,
}

impl Snapshot {
    pub fn is_empty(&self) -> bool {
        self.thinking.is_empty() && self.response.is_empty()
    }
}

/// Machine-readable class of a terminal failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Unreachable,
    Rejected,
    Stalled,
    TimedOut,
    MissingCredential,
    InvalidAnswer,
    Network,
}

/// One line of the streamed response sent back to the client
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default)]
    pub thinking: String,
    #[serde(default)]
    pub response: String,
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_thinking: Option<bool>,
}

impl ChatEvent {
    pub fn progress(snapshot: &Snapshot, is_thinking: bool) -> Self {
        Self {
            thinking: snapshot.thinking.clone(),
            response: snapshot.response.clone(),
            done: false,
            is_thinking: Some(is_thinking),
            ..Default::default()
        }
    }

    pub fn finished(snapshot: &Snapshot) -> Self {
        Self {
            thinking: snapshot.thinking.clone(),
            response: snapshot.response.clone(),
            done: true,
            ..Default::default()
        }
    }

    pub fn failed(error: &TransportError, partial: &Snapshot) -> Self {
        Self {
            error: Some(error.to_string()),
            error_kind: Some(error.kind()),
            thinking: partial.thinking.clone(),
            response: partial.response.clone(),
            done: true,
            is_thinking: None,
        }
    }

    pub fn is_failure(&self) -> bool {
        self.error.is_some()
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            thinking: self.thinking.clone(),
            response: self.response.clone(),
        }
    }

    /// Serialize as one NDJSON line, including the trailing newline
    pub fn to_line(&self) -> String {
        let mut line = serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"error":"failed to encode event","done":true}"#.to_string()
        });
        line.push('\n');
        line
    }
}

/// Errors reported by a provider adapter while interpreting a hosted response
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdapterError {
    #[error("{0}")]
    Provider(String),

    #[error("Invalid response format: {0}")]
    MalformedResponse(String),

    #[error("Provider returned an empty answer")]
    EmptyAnswer,
}

/// Terminal failures of a chat turn
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("Ollama server is not running. Please start Ollama and try again. ({0})")]
    Unreachable(String),

    #[error("Upstream rejected request (status {status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Model stopped responding: no data received for {}s", .0.as_secs())]
    Stalled(Duration),

    #[error("Request timed out after {}s", .0.as_secs())]
    TimedOut(Duration),

    #[error("No API key configured for {0}")]
    MissingCredential(String),

    #[error("{0}")]
    Provider(#[from] AdapterError),

    #[error("Network error: {0}")]
    Network(String),
}

impl TransportError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransportError::Unreachable(_) => ErrorKind::Unreachable,
            TransportError::Rejected { .. } | TransportError::Upstream(_) => ErrorKind::Rejected,
            TransportError::Stalled(_) => ErrorKind::Stalled,
            TransportError::TimedOut(_) => ErrorKind::TimedOut,
            TransportError::MissingCredential(_) => ErrorKind::MissingCredential,
            TransportError::Provider(_) => ErrorKind::InvalidAnswer,
            TransportError::Network(_) => ErrorKind::Network,
        }
    }
}

/// Entry of the model list offered to clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
    /// Served by a hosted provider rather than the local model server
    pub hosted: bool,
}

/// How a chat turn ended
#[derive(Debug)]
pub enum TurnOutcome {
    Completed(Snapshot),
    Failed {
        error: TransportError,
        partial: Snapshot,
    },
    /// Caller cancelled or the consumer went away; nothing was emitted after the cancel
    Cancelled(Snapshot),
}

impl TurnOutcome {
    pub fn snapshot(&self) -> &Snapshot {
        match self {
            TurnOutcome::Completed(snapshot) | TurnOutcome::Cancelled(snapshot) => snapshot,
            TurnOutcome::Failed { partial, .. } => partial,
        }
    }
}
