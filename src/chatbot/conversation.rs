//! Per-chat conversation history.
//!
//! Each chat gets an ordered, bounded list of turns. The oldest turns fall
//! off the front when the window is exceeded. Nothing here is persisted:
//! a restart starts every chat from an empty history.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::Mutex;
use tracing::{debug, info};

/// Default number of turns kept per chat.
pub const MAX_HISTORY_MESSAGES: usize = 20;

/// Who produced a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Model,
    System,
}

impl Role {
    /// Role name on the Gemini wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Model => "model",
            Role::System => "system",
        }
    }
}

/// How staged media reaches the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaHandle {
    /// URI returned by the Files API after the upload became active.
    Uri(String),
    /// Base64-encoded bytes sent inline with the request.
    Inline(String),
}

/// A staged attachment, ready to be referenced from a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaRef {
    pub handle: MediaHandle,
    pub mime_type: String,
}

impl MediaRef {
    pub fn is_image(&self) -> bool {
        self.mime_type.starts_with("image/")
    }
}

/// One unit of dialogue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    pub role: Role,
    pub text: Option<String>,
    pub media: Vec<MediaRef>,
}

impl Turn {
    pub fn user(text: impl Into<String>, media: Vec<MediaRef>) -> Self {
        Self {
            role: Role::User,
            text: Some(text.into()),
            media,
        }
    }

    pub fn model(text: impl Into<String>) -> Self {
        Self {
            role: Role::Model,
            text: Some(text.into()),
            media: Vec::new(),
        }
    }

    /// Text, treating an empty string the same as no text.
    pub fn text(&self) -> Option<&str> {
        self.text.as_deref().filter(|t| !t.is_empty())
    }

    /// True when the turn has neither text nor media.
    pub fn is_empty(&self) -> bool {
        self.text().is_none() && self.media.is_empty()
    }

    pub fn image_count(&self) -> usize {
        self.media.iter().filter(|m| m.is_image()).count()
    }
}

/// Ordered turn history for one chat, capped at `capacity` turns.
#[derive(Debug)]
pub struct Conversation {
    turns: VecDeque<Turn>,
    capacity: usize,
}

impl Conversation {
    pub fn new(capacity: usize) -> Self {
        Self {
            turns: VecDeque::with_capacity(capacity.min(64)),
            capacity: capacity.max(1),
        }
    }

    /// Append a turn, evicting from the front if the window overflows.
    pub fn append(&mut self, turn: Turn) {
        self.turns.push_back(turn);
        while self.turns.len() > self.capacity {
            self.turns.pop_front();
        }
    }

    /// Drop the newest turn, but only if it has the given role.
    ///
    /// Returns the removed turn. Calling this twice after a single failure
    /// removes at most one user turn.
    pub fn rollback_last_if_role(&mut self, role: Role) -> Option<Turn> {
        match self.turns.back() {
            Some(last) if last.role == role => self.turns.pop_back(),
            _ => None,
        }
    }

    /// Keep only the newest `n` turns.
    pub fn trim_to(&mut self, n: usize) {
        let excess = self.turns.len().saturating_sub(n);
        if excess > 0 {
            self.turns.drain(..excess);
            debug!("Trimmed {} turn(s) from history", excess);
        }
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }

    pub fn turns(&self) -> impl Iterator<Item = &Turn> {
        self.turns.iter()
    }

    pub fn last(&self) -> Option<&Turn> {
        self.turns.back()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Registry of conversations keyed by chat ID.
///
/// Conversations are created on first use and dropped by `reset`. Each one
/// sits behind its own async mutex: whoever holds it owns the conversation
/// for the whole append, generate, append-or-rollback cycle.
pub struct ConversationStore {
    conversations: StdMutex<HashMap<i64, Arc<Mutex<Conversation>>>>,
    capacity: usize,
}

impl ConversationStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            conversations: StdMutex::new(HashMap::new()),
            capacity,
        }
    }

    /// Get the conversation for a chat, creating an empty one if needed.
    pub fn get_or_create(&self, chat_id: i64) -> Arc<Mutex<Conversation>> {
        let mut map = self.conversations.lock().unwrap_or_else(|p| p.into_inner());
        map.entry(chat_id)
            .or_insert_with(|| {
                debug!("New conversation for chat {}", chat_id);
                Arc::new(Mutex::new(Conversation::new(self.capacity)))
            })
            .clone()
    }

    /// Snapshot of a chat's turns (empty if the chat has no conversation).
    pub async fn get(&self, chat_id: i64) -> Vec<Turn> {
        let conversation = {
            let map = self.conversations.lock().unwrap_or_else(|p| p.into_inner());
            map.get(&chat_id).cloned()
        };
        match conversation {
            Some(c) => c.lock().await.turns().cloned().collect(),
            None => Vec::new(),
        }
    }

    /// Forget a chat's conversation. Returns true if one existed.
    ///
    /// A generation already holding the old conversation finishes against
    /// it; the next message starts a fresh one.
    pub fn reset(&self, chat_id: i64) -> bool {
        let mut map = self.conversations.lock().unwrap_or_else(|p| p.into_inner());
        let existed = map.remove(&chat_id).is_some();
        if existed {
            info!("🧹 Cleared history for chat {}", chat_id);
        }
        existed
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new(MAX_HISTORY_MESSAGES)
    }
}
