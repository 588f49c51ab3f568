//! Table definitions and column conversions for the SQLite store

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// Version 1: checkpoints with their message snapshots, and the two memory tiers
pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS checkpoints (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL,
    name TEXT NOT NULL,
    message_count INTEGER NOT NULL,
    token_count INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    summary TEXT
);

CREATE TABLE IF NOT EXISTS checkpoint_messages (
    checkpoint_id TEXT NOT NULL REFERENCES checkpoints(id) ON DELETE CASCADE,
    position INTEGER NOT NULL,
    payload TEXT NOT NULL,
    PRIMARY KEY (checkpoint_id, position)
);

CREATE TABLE IF NOT EXISTS compacted_sessions (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL,
    summary TEXT NOT NULL,
    key_topics TEXT NOT NULL,
    decisions TEXT NOT NULL,
    key_findings TEXT NOT NULL,
    range_start INTEGER NOT NULL,
    range_end INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    promoted INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS indexed_conversations (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL,
    source_id TEXT NOT NULL UNIQUE,
    embedding BLOB NOT NULL,
    dimension INTEGER NOT NULL,
    content TEXT NOT NULL,
    topics TEXT NOT NULL,
    date INTEGER NOT NULL
);
"#;

/// Version 2: lookup indexes for per-session listing
pub const INDEXES_SQL: &str = r#"
CREATE INDEX IF NOT EXISTS idx_checkpoints_session_created
    ON checkpoints(session_id, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_compacted_session
    ON compacted_sessions(session_id, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_indexed_session
    ON indexed_conversations(session_id);
"#;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatabaseStats {
    pub schema_version: i32,
    pub checkpoints: i64,
    pub checkpoint_messages: i64,
    pub compacted_sessions: i64,
    pub indexed_conversations: i64,
}

pub(crate) fn to_micros(at: &DateTime<Utc>) -> i64 {
    at.timestamp_micros()
}

pub(crate) fn from_micros(micros: i64, id: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::from_timestamp_micros(micros).ok_or_else(|| StorageError::Corrupt {
        id: id.to_string(),
        reason: format!("timestamp {} out of range", micros),
    })
}
