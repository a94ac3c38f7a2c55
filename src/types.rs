use crate::llm::Snapshot;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Id of the greeting shown in a fresh conversation. Never persisted.
pub const PLACEHOLDER_ID: &str = "initial";
pub const PLACEHOLDER_TEXT: &str = "What's on your mind?";

/// Title a session never gets persisted under
pub const UNTITLED: &str = "New Chat";

const TITLE_CHARS: usize = 30;

/// Current time as epoch milliseconds
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// `<epoch-ms>-<9 random base36 chars>`
pub fn generate_message_id() -> String {
    const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::thread_rng();
    let suffix: String = (0..9)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect();
    format!("{}-{}", now_millis(), suffix)
}

pub fn generate_session_id() -> String {
    format!("chat-{}", now_millis())
}

/// One chat message. `thinking` is only meaningful on assistant messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    pub is_user: bool,
    /// Epoch milliseconds
    pub timestamp: i64,
    /// Terminal failure merged into an assistant message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Message {
    pub fn placeholder() -> Self {
        Self {
            id: PLACEHOLDER_ID.to_string(),
            text: PLACEHOLDER_TEXT.to_string(),
            thinking: None,
            is_user: false,
            timestamp: now_millis(),
            error: None,
        }
    }

    pub fn user(text: &str) -> Self {
        Self {
            id: generate_message_id(),
            text: text.to_string(),
            thinking: None,
            is_user: true,
            timestamp: now_millis(),
            error: None,
        }
    }

    pub fn assistant(snapshot: &Snapshot) -> Self {
        let mut message = Self {
            id: generate_message_id(),
            text: String::new(),
            thinking: None,
            is_user: false,
            timestamp: now_millis(),
            error: None,
        };
        message.apply_snapshot(snapshot);
        message
    }

    /// Overwrite text and thinking with a snapshot
    pub fn apply_snapshot(&mut self, snapshot: &Snapshot) {
        self.text = snapshot.response.clone();
        self.thinking = if snapshot.thinking.is_empty() {
            None
        } else {
            Some(snapshot.thinking.clone())
        };
    }

    pub fn is_placeholder(&self) -> bool {
        self.id == PLACEHOLDER_ID
    }
}

/// A persisted conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSession {
    pub id: String,
    pub title: String,
    /// Last-saved time in epoch milliseconds, used for ordering
    pub timestamp: i64,
    pub messages: Vec<Message>,
}

impl ChatSession {
    /// Build a session from the messages worth keeping. Returns `None` when
    /// there is no user message to derive a title from.
    pub fn from_messages(id: String, messages: &[Message]) -> Option<Self> {
        let messages: Vec<Message> = messages
            .iter()
            .filter(|m| !m.is_placeholder())
            .cloned()
            .collect();
        let first_user = messages.iter().find(|m| m.is_user)?;
        let title = title_from(&first_user.text);

        Some(Self {
            id,
            title,
            timestamp: now_millis(),
            messages,
        })
    }

    /// Whether the session may be kept in storage
    pub fn is_valid(&self) -> bool {
        self.title != UNTITLED && self.messages.iter().any(|m| !m.is_placeholder())
    }
}

fn title_from(text: &str) -> String {
    let title: String = text.trim().chars().take(TITLE_CHARS).collect();
    if title.is_empty() {
        UNTITLED.to_string()
    } else {
        title
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_id_format() {
        let id = generate_message_id();
        let (millis, suffix) = id.split_once('-').unwrap();
        assert!(millis.parse::<i64>().is_ok());
        assert_eq!(suffix.len(), 9);
        assert!(suffix
            .chars()
            .all(|c| c.is_ascii_digit() || c.is_ascii_lowercase()));
        assert_ne!(generate_message_id(), id);
    }

    #[test]
    fn test_session_from_messages_drops_placeholder() {
        let messages = vec![
            Message::placeholder(),
            Message::user("Explain the borrow checker in simple words please"),
        ];
        let session = ChatSession::from_messages("chat-1".to_string(), &messages).unwrap();
        assert_eq!(session.messages.len(), 1);
        assert_eq!(session.title, "Explain the borrow checker in ");
        assert!(session.is_valid());
    }

    #[test]
    fn test_session_requires_user_message() {
        assert!(ChatSession::from_messages("chat-1".to_string(), &[Message::placeholder()]).is_none());
        let assistant_only = vec![Message::assistant(&Snapshot::default())];
        assert!(ChatSession::from_messages("chat-1".to_string(), &assistant_only).is_none());
    }

    #[test]
    fn test_title_counts_characters() {
        assert_eq!(title_from(&"ä".repeat(40)).chars().count(), 30);
        assert_eq!(title_from("   "), UNTITLED);
    }

    #[test]
    fn test_assistant_message_serialization() {
        let mut message = Message::assistant(&Snapshot {
            thinking: "hmm".to_string(),
            response: "Hi".to_string(),
        });
        message.timestamp = 1;
        message.id = "1-abc".to_string();
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "id": "1-abc",
                "text": "Hi",
                "thinking": "hmm",
                "isUser": false,
                "timestamp": 1
            })
        );
    }
}
