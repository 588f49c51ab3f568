use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

use crate::error::{ContextError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
            Role::Tool => "tool",
        }
    }
}

/// How a message was touched by a reduction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionType {
    Pruned,
    Compacted,
    Truncated,
}

/// One turn in a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// Absent counts are filled in by the session's token estimator
    #[serde(default)]
    pub token_count: Option<u32>,
    #[serde(default)]
    pub compressed: bool,
    #[serde(default)]
    pub compression_type: Option<CompressionType>,
    /// Set on a summary message; originals point at it through `condense_parent`
    #[serde(default)]
    pub condense_id: Option<String>,
    #[serde(default)]
    pub condense_parent: Option<String>,
    #[serde(default)]
    pub is_truncation_marker: bool,
    #[serde(default)]
    pub truncation_id: Option<String>,
    #[serde(default)]
    pub truncation_parent: Option<String>,
    #[serde(default)]
    pub checkpoint_id: Option<String>,
    /// Index in the session's original log, stamped by `MessageLog::append`.
    /// Summaries and truncation markers never carry one.
    #[serde(default)]
    pub position: Option<usize>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
            token_count: None,
            compressed: false,
            compression_type: None,
            condense_id: None,
            condense_parent: None,
            is_truncation_marker: false,
            truncation_id: None,
            truncation_parent: None,
            checkpoint_id: None,
            position: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn tool(content: impl Into<String>) -> Self {
        Self::new(Role::Tool, content)
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_tokens(mut self, tokens: u32) -> Self {
        self.token_count = Some(tokens);
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Still part of the live window, i.e. not hidden behind a summary or a truncation marker
    pub fn is_active(&self) -> bool {
        self.condense_parent.is_none() && self.truncation_parent.is_none()
    }

    /// Summary messages anchor a condense chain
    pub fn is_condense_anchor(&self) -> bool {
        self.condense_id.is_some()
    }

    /// Written by a caller rather than produced by a reduction
    pub fn is_original(&self) -> bool {
        !self.is_condense_anchor() && !self.is_truncation_marker
    }

    pub(crate) fn mark_compressed(&mut self, kind: CompressionType) {
        self.compressed = true;
        self.compression_type = Some(kind);
    }
}

/// Append-only ordered message sequence of one session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageLog {
    messages: Vec<Message>,
    /// Position handed to the next original message
    #[serde(default)]
    next_position: usize,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from a stored sequence; ids must be unique.
    ///
    /// Originals without a position are numbered after the highest one present.
    pub fn from_messages(messages: Vec<Message>) -> Result<Self> {
        let mut seen = HashSet::with_capacity(messages.len());
        for message in &messages {
            if !seen.insert(message.id.as_str()) {
                return Err(ContextError::DuplicateMessage(message.id.clone()));
            }
        }
        let next_position = messages
            .iter()
            .filter_map(|m| m.position)
            .max()
            .map_or(0, |p| p + 1);
        let mut log = Self {
            messages: Vec::with_capacity(messages.len()),
            next_position,
        };
        for message in messages {
            log.push_positioned(message);
        }
        Ok(log)
    }

    /// Append a message, stamping its original-log position when it has none
    pub fn append(&mut self, message: Message) -> Result<&Message> {
        if self.messages.iter().any(|m| m.id == message.id) {
            return Err(ContextError::DuplicateMessage(message.id));
        }
        Ok(self.push_positioned(message))
    }

    fn push_positioned(&mut self, mut message: Message) -> &Message {
        if message.is_original() {
            let position = *message.position.get_or_insert(self.next_position);
            self.next_position = self.next_position.max(position + 1);
        }
        self.messages.push(message);
        &self.messages[self.messages.len() - 1]
    }

    /// Position the next appended original will receive
    pub fn next_position(&self) -> usize {
        self.next_position
    }

    /// Swap in the outcome of a compression operation
    pub fn replace_all(&mut self, messages: Vec<Message>) {
        self.messages = messages;
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn into_messages(self) -> Vec<Message> {
        self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }
}

/// Position range in the original log covered by a summary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRange {
    pub start: usize,
    pub end: usize,
}

impl MessageRange {
    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Mid-term memory record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompactedSession {
    pub id: String,
    pub session_id: String,
    pub summary: String,
    pub key_topics: Vec<String>,
    pub decisions: Vec<String>,
    #[serde(default)]
    pub key_findings: Vec<String>,
    pub message_range: MessageRange,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub promoted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexedMetadata {
    pub date: DateTime<Utc>,
    pub topics: Vec<String>,
}

/// Long-term memory record, embedded for vector search
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexedConversation {
    pub id: String,
    pub session_id: String,
    /// CompactedSession this record was promoted from
    pub source_id: String,
    pub embedding: Vec<f32>,
    pub content: String,
    pub metadata: IndexedMetadata,
}

/// Three-tier view of a session's memory
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryLayer {
    pub short_term: Vec<Message>,
    pub mid_term: Vec<CompactedSession>,
    pub long_term: Vec<IndexedConversation>,
}

/// Backing store for live message logs
pub trait MemoryStore: Send + Sync {
    fn get_history(&self, session_id: &str) -> Vec<Message>;
    fn add_message(&self, session_id: &str, message: Message);
    fn replace_history(&self, session_id: &str, messages: Vec<Message>);
    fn clear_history(&self, session_id: &str);
}

#[derive(Clone)]
pub struct InMemoryMemoryStore {
    store: Arc<DashMap<String, Vec<Message>>>,
}

impl InMemoryMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Default for InMemoryMemoryStore {
    fn default() -> Self {
        Self {
            store: Arc::new(DashMap::new()),
        }
    }
}

impl MemoryStore for InMemoryMemoryStore {
    fn get_history(&self, session_id: &str) -> Vec<Message> {
        match self.store.get(session_id) {
            Some(history) => history.clone(),
            None => Vec::new(),
        }
    }

    fn add_message(&self, session_id: &str, message: Message) {
        let mut entry = self.store.entry(session_id.to_string()).or_default();
        entry.push(message);
    }

    fn replace_history(&self, session_id: &str, messages: Vec<Message>) {
        self.store.insert(session_id.to_string(), messages);
    }

    fn clear_history(&self, session_id: &str) {
        self.store.remove(session_id);
    }
}
