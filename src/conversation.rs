//! In-memory state of one conversation, driven by chat events.

use crate::llm::{ChatEvent, ChatRequest, Snapshot};
use crate::persistence::ConversationStore;
use crate::types::Message;
use anyhow::{anyhow, Result};
use tracing::debug;

const EMPTY_ANSWER: &str = "Model returned an empty response";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConversationError {
    #[error("A response is still being generated")]
    TurnInProgress,

    #[error("Message is empty")]
    EmptyMessage,
}

/// What to send upstream for a new user message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnRequest {
    pub message: String,
    pub context: String,
}

impl TurnRequest {
    pub fn into_chat_request(self, model: &str, api_key: Option<String>) -> ChatRequest {
        ChatRequest {
            message: self.message,
            context: self.context,
            model: model.to_string(),
            api_key,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TurnState {
    Idle,
    /// Request sent, no assistant message yet
    Waiting,
    /// Index of the open assistant message
    Streaming(usize),
}

pub struct Conversation {
    session_id: Option<String>,
    messages: Vec<Message>,
    history_window: usize,
    turn: TurnState,
}

impl Conversation {
    pub fn new(history_window: usize) -> Self {
        Self {
            session_id: None,
            messages: vec![Message::placeholder()],
            history_window,
            turn: TurnState::Idle,
        }
    }

    /// Resume a stored session
    pub fn load(store: &dyn ConversationStore, session_id: &str, history_window: usize) -> Result<Self> {
        let messages = store
            .load(session_id)?
            .ok_or_else(|| anyhow!("No session with id '{session_id}'"))?;
        Ok(Self {
            session_id: Some(session_id.to_string()),
            messages,
            history_window,
            turn: TurnState::Idle,
        })
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn is_busy(&self) -> bool {
        self.turn != TurnState::Idle
    }

    /// Transcript of the last `window` real messages
    pub fn history_text(&self, window: usize) -> String {
        let real: Vec<&Message> = self.messages.iter().filter(|m| !m.is_placeholder()).collect();
        let start = real.len().saturating_sub(window);
        real[start..]
            .iter()
            .map(|m| {
                let role = if m.is_user { "User" } else { "Assistant" };
                format!("{role}: {}", m.text)
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    pub fn begin_turn(&mut self, text: &str) -> Result<TurnRequest, ConversationError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ConversationError::EmptyMessage);
        }
        if self.is_busy() {
            return Err(ConversationError::TurnInProgress);
        }

        // Context covers the turns before this message only
        let context = self.history_text(self.history_window);
        self.messages.retain(|m| !m.is_placeholder());
        self.messages.push(Message::user(text));
        self.turn = TurnState::Waiting;

        Ok(TurnRequest {
            message: text.to_string(),
            context,
        })
    }

    /// Fold one transport event into the messages. Returns whether anything changed.
    pub fn apply(&mut self, event: &ChatEvent) -> bool {
        if self.turn == TurnState::Idle {
            debug!("Ignoring event outside of a turn");
            return false;
        }
        let snapshot = event.snapshot();

        if let Some(error) = &event.error {
            match self.turn {
                TurnState::Streaming(index) => {
                    let message = &mut self.messages[index];
                    if !snapshot.is_empty() {
                        message.apply_snapshot(&snapshot);
                    }
                    message.error = Some(error.clone());
                }
                _ => self.push_error_message(&snapshot, error),
            }
            self.turn = TurnState::Idle;
            return true;
        }

        if event.done && snapshot.response.is_empty() {
            match self.turn {
                TurnState::Streaming(index) => {
                    let message = &mut self.messages[index];
                    message.apply_snapshot(&snapshot);
                    message.text = EMPTY_ANSWER.to_string();
                    message.error = Some(EMPTY_ANSWER.to_string());
                }
                _ => self.push_error_message(&snapshot, EMPTY_ANSWER),
            }
            self.turn = TurnState::Idle;
            return true;
        }

        match self.turn {
            TurnState::Streaming(index) => self.messages[index].apply_snapshot(&snapshot),
            _ => {
                self.messages.push(Message::assistant(&snapshot));
                self.turn = TurnState::Streaming(self.messages.len() - 1);
            }
        }

        if event.done {
            self.turn = TurnState::Idle;
        }
        true
    }

    fn push_error_message(&mut self, partial: &Snapshot, error: &str) {
        let mut message = Message::assistant(partial);
        if message.text.is_empty() {
            message.text = error.to_string();
        }
        message.error = Some(error.to_string());
        self.messages.push(message);
    }

    /// Close the running turn with the content folded before the cancel.
    ///
    /// Progress events are throttled, so `partial` may be ahead of the last
    /// applied event. It is written into the open message, or opens one.
    pub fn cancel_turn(&mut self, partial: &Snapshot) -> bool {
        match self.turn {
            TurnState::Idle => return false,
            TurnState::Streaming(index) => self.messages[index].apply_snapshot(partial),
            TurnState::Waiting if !partial.is_empty() => {
                self.messages.push(Message::assistant(partial));
            }
            TurnState::Waiting => {}
        }
        self.turn = TurnState::Idle;
        true
    }

    pub fn save(&mut self, store: &dyn ConversationStore) -> Result<()> {
        if let Some(id) = store.append(self.session_id.as_deref(), &self.messages)? {
            self.session_id = Some(id);
        }
        Ok(())
    }
}
