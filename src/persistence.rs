//! Conversation storage on top of a flat key-value blob store.
//!
//! Sessions live under one key (`chatSessions`) as a JSON array, most recently
//! saved first. Writes are debounced and suppressed when the content hash did
//! not change. Every write re-reads the blob first, so concurrent writers lose
//! at most their own unsaved changes (last write wins).

use crate::types::{generate_session_id, ChatSession, Message};
use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

pub const SESSIONS_KEY: &str = "chatSessions";
const THINKING_PANEL_KEY: &str = "thinking-state-global";
const HIDE_THINKING_KEY: &str = "hideThinking";
const API_MODELS_KEY: &str = "apiModels";

/// Flat key-value storage of JSON text
pub trait BlobStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

/// One file per key in a directory
pub struct FileBlobStore {
    root_dir: PathBuf,
}

impl FileBlobStore {
    pub fn new(root_dir: PathBuf) -> Result<Self> {
        if !root_dir.exists() {
            std::fs::create_dir_all(&root_dir).with_context(|| {
                format!("Failed to create data directory {}", root_dir.display())
            })?;
        }
        info!("Storing conversations in: {}", root_dir.display());
        Ok(Self { root_dir })
    }

    fn key_path(&self, key: &str) -> PathBuf {
        self.root_dir.join(format!("{key}.json"))
    }
}

impl BlobStore for FileBlobStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let path = self.key_path(key);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Ok(Some(content))
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let path = self.key_path(key);
        debug!("Writing {} bytes to {}", value.len(), path.display());

        // Write next to the target and rename, so readers never see a partial file
        let mut file = tempfile::NamedTempFile::new_in(&self.root_dir)?;
        std::io::Write::write_all(&mut file, value.as_bytes())?;
        file.persist(&path)
            .with_context(|| format!("Failed to replace {}", path.display()))?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let path = self.key_path(key);
        if path.exists() {
            std::fs::remove_file(&path)
                .with_context(|| format!("Failed to remove {}", path.display()))?;
        }
        Ok(())
    }
}

/// In-memory blob store that counts physical writes
#[cfg(test)]
#[derive(Default)]
pub struct MemoryBlobStore {
    values: Mutex<HashMap<String, String>>,
    writes: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
impl BlobStore for MemoryBlobStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(lock(&self.values).get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.writes.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        lock(&self.values).insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        lock(&self.values).remove(key);
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Change notification broadcast after each physical write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    SessionSaved(String),
    SessionDeleted(String),
    Cleared,
}

/// Operations the conversation controller needs from storage
pub trait ConversationStore: Send + Sync {
    /// Save the messages of a session. Mints an id on the first real save and
    /// returns the session id, or `None` when there was nothing worth saving.
    fn append(&self, session_id: Option<&str>, messages: &[Message]) -> Result<Option<String>>;
    fn load(&self, session_id: &str) -> Result<Option<Vec<Message>>>;
    fn delete(&self, session_id: &str) -> Result<()>;
    fn clear_all(&self) -> Result<()>;
}

struct PendingWrite {
    session: ChatSession,
    hash: md5::Digest,
}

#[derive(Default)]
struct WriteState {
    // Hash of the last physically written content per session
    written: HashMap<String, md5::Digest>,
    pending: Option<PendingWrite>,
    // Bumped whenever the pending write changes; a timer only flushes its own generation
    generation: u64,
}

struct StoreInner {
    blobs: Arc<dyn BlobStore>,
    debounce: Duration,
    state: Mutex<WriteState>,
    events: broadcast::Sender<StoreEvent>,
}

/// Debounced session storage
#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<StoreInner>,
}

impl SessionStore {
    pub fn new(blobs: Arc<dyn BlobStore>, debounce: Duration) -> Self {
        let (events, _) = broadcast::channel(32);
        Self {
            inner: Arc::new(StoreInner {
                blobs,
                debounce,
                state: Mutex::new(WriteState::default()),
                events,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.inner.events.subscribe()
    }

    fn content_hash(messages: &[Message]) -> Result<md5::Digest> {
        let json = serde_json::to_vec(messages)?;
        Ok(md5::compute(json))
    }

    /// Write the pending session now, if any
    pub fn flush(&self) -> Result<()> {
        let mut state = lock(&self.inner.state);
        state.generation += 1;
        match state.pending.take() {
            Some(pending) => self.inner.write_session(&mut state, pending),
            None => Ok(()),
        }
    }

    /// All stored sessions, newest first. A pending write is included.
    pub fn list(&self) -> Result<Vec<ChatSession>> {
        let state = lock(&self.inner.state);
        let mut sessions = self.inner.read_sessions()?;
        if let Some(pending) = &state.pending {
            sessions.retain(|s| s.id != pending.session.id);
            sessions.push(pending.session.clone());
        }
        sessions.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(sessions)
    }

    pub fn session(&self, session_id: &str) -> Result<Option<ChatSession>> {
        let state = lock(&self.inner.state);
        if let Some(pending) = &state.pending {
            if pending.session.id == session_id {
                return Ok(Some(pending.session.clone()));
            }
        }
        Ok(self
            .inner
            .read_sessions()?
            .into_iter()
            .find(|s| s.id == session_id))
    }

    /// Size of the sessions blob in bytes
    pub fn usage_bytes(&self) -> Result<usize> {
        Ok(self
            .inner
            .blobs
            .get(SESSIONS_KEY)?
            .map(|blob| blob.len())
            .unwrap_or(0))
    }

    fn schedule_flush(&self, generation: u64) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            // No runtime to run the timer on; write right away
            if let Err(e) = self.flush() {
                warn!("Failed to save session: {:#}", e);
            }
            return;
        };

        let inner = self.inner.clone();
        handle.spawn(async move {
            tokio::time::sleep(inner.debounce).await;
            let mut state = lock(&inner.state);
            if state.generation != generation {
                return;
            }
            if let Some(pending) = state.pending.take() {
                if let Err(e) = inner.write_session(&mut state, pending) {
                    warn!("Failed to save session: {:#}", e);
                }
            }
        });
    }
}

impl StoreInner {
    /// Stored sessions as found in the blob, entries that do not parse are dropped
    fn read_sessions(&self) -> Result<Vec<ChatSession>> {
        let Some(blob) = self.blobs.get(SESSIONS_KEY)? else {
            return Ok(Vec::new());
        };
        let entries: Vec<serde_json::Value> = match serde_json::from_str(&blob) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Stored sessions are not a JSON array, ignoring them: {}", e);
                return Ok(Vec::new());
            }
        };
        Ok(entries
            .into_iter()
            .filter_map(|entry| match serde_json::from_value::<ChatSession>(entry) {
                Ok(session) => Some(session),
                Err(e) => {
                    warn!("Dropping unreadable session entry: {}", e);
                    None
                }
            })
            .collect())
    }

    /// Read, drop invalid and duplicate entries, apply `change`, write back
    fn rewrite_sessions(&self, change: impl FnOnce(&mut Vec<ChatSession>)) -> Result<()> {
        let mut seen = HashSet::new();
        let mut sessions: Vec<ChatSession> = self
            .read_sessions()?
            .into_iter()
            .filter(|s| s.is_valid() && seen.insert(s.id.clone()))
            .collect();
        change(&mut sessions);

        let json = serde_json::to_string(&sessions)?;
        self.blobs.set(SESSIONS_KEY, &json)
    }

    fn write_session(&self, state: &mut WriteState, pending: PendingWrite) -> Result<()> {
        let PendingWrite { session, hash } = pending;
        let id = session.id.clone();
        debug!("Saving session {} ({} messages)", id, session.messages.len());

        self.rewrite_sessions(|sessions| {
            sessions.retain(|s| s.id != session.id);
            sessions.insert(0, session);
        })?;

        state.written.insert(id.clone(), hash);
        // No receivers is fine
        let _ = self.events.send(StoreEvent::SessionSaved(id));
        Ok(())
    }
}

impl ConversationStore for SessionStore {
    fn append(&self, session_id: Option<&str>, messages: &[Message]) -> Result<Option<String>> {
        let id = session_id
            .map(str::to_string)
            .unwrap_or_else(generate_session_id);
        let Some(session) = ChatSession::from_messages(id.clone(), messages) else {
            return Ok(session_id.map(str::to_string));
        };
        let hash = Self::content_hash(&session.messages)?;

        let mut state = lock(&self.inner.state);
        let pending_same = state
            .pending
            .as_ref()
            .is_some_and(|p| p.session.id == id && p.hash == hash);
        if pending_same || state.written.get(&id) == Some(&hash) {
            debug!("Session {} unchanged, skipping save", id);
            return Ok(Some(id));
        }

        // A pending write for another session must not be lost
        if state.pending.as_ref().is_some_and(|p| p.session.id != id) {
            if let Some(other) = state.pending.take() {
                self.inner.write_session(&mut state, other)?;
            }
        }

        let pending = PendingWrite { session, hash };
        state.generation += 1;
        if self.inner.debounce.is_zero() {
            state.pending = None;
            self.inner.write_session(&mut state, pending)?;
        } else {
            state.pending = Some(pending);
            let generation = state.generation;
            drop(state);
            self.schedule_flush(generation);
        }
        Ok(Some(id))
    }

    fn load(&self, session_id: &str) -> Result<Option<Vec<Message>>> {
        Ok(self.session(session_id)?.map(|s| s.messages))
    }

    fn delete(&self, session_id: &str) -> Result<()> {
        let mut state = lock(&self.inner.state);
        if state
            .pending
            .as_ref()
            .is_some_and(|p| p.session.id == session_id)
        {
            state.pending = None;
            state.generation += 1;
        }
        state.written.remove(session_id);
        self.inner
            .rewrite_sessions(|sessions| sessions.retain(|s| s.id != session_id))?;
        info!("Deleted session {}", session_id);
        let _ = self
            .inner
            .events
            .send(StoreEvent::SessionDeleted(session_id.to_string()));
        Ok(())
    }

    fn clear_all(&self) -> Result<()> {
        let mut state = lock(&self.inner.state);
        state.pending = None;
        state.generation += 1;
        state.written.clear();
        self.inner.blobs.remove(SESSIONS_KEY)?;
        info!("Cleared all sessions");
        let _ = self.inner.events.send(StoreEvent::Cleared);
        Ok(())
    }
}

/// Small scalar settings kept next to the sessions
#[derive(Clone)]
pub struct Preferences {
    blobs: Arc<dyn BlobStore>,
}

impl Preferences {
    pub fn new(blobs: Arc<dyn BlobStore>) -> Self {
        Self { blobs }
    }

    fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.blobs.get(key)? {
            Some(json) => match serde_json::from_str(&json) {
                Ok(value) => Ok(Some(value)),
                Err(e) => {
                    warn!("Ignoring unreadable preference '{}': {}", key, e);
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        self.blobs.set(key, &serde_json::to_string(value)?)
    }

    fn api_key_name(provider: &str) -> String {
        format!("{provider}ApiKey")
    }

    pub fn api_key(&self, provider: &str) -> Result<Option<String>> {
        Ok(self
            .get::<String>(&Self::api_key_name(provider))?
            .filter(|key| !key.trim().is_empty()))
    }

    pub fn set_api_key(&self, provider: &str, key: &str) -> Result<()> {
        self.set(&Self::api_key_name(provider), &key.trim())
    }

    /// Hosted model ids the user has configured a key for
    pub fn api_models(&self) -> Result<Vec<String>> {
        Ok(self.get(API_MODELS_KEY)?.unwrap_or_default())
    }

    pub fn add_api_model(&self, model_id: &str) -> Result<()> {
        let mut models = self.api_models()?;
        if !models.iter().any(|m| m == model_id) {
            models.push(model_id.to_string());
            self.set(API_MODELS_KEY, &models)?;
        }
        Ok(())
    }

    /// Whether thinking is shown expanded
    pub fn thinking_panel_open(&self) -> Result<bool> {
        Ok(self.get(THINKING_PANEL_KEY)?.unwrap_or(true))
    }

    pub fn set_thinking_panel_open(&self, open: bool) -> Result<()> {
        self.set(THINKING_PANEL_KEY, &open)
    }

    pub fn hide_thinking(&self) -> Result<bool> {
        Ok(self.get(HIDE_THINKING_KEY)?.unwrap_or(false))
    }

    pub fn set_hide_thinking(&self, hide: bool) -> Result<()> {
        self.set(HIDE_THINKING_KEY, &hide)
    }
}
