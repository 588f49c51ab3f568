//! Persistence contract for checkpoints, plus a process-local implementation

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::StorageError;
use crate::memory::Message;

/// Named, durable snapshot of a session's message log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub session_id: String,
    pub name: String,
    pub message_count: usize,
    pub token_count: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub summary: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointSnapshot {
    pub checkpoint: Checkpoint,
    pub messages: Vec<Message>,
}

impl CheckpointSnapshot {
    /// Build a snapshot with a fresh id; copied messages are stamped with it
    pub fn capture(
        session_id: impl Into<String>,
        name: impl Into<String>,
        messages: &[Message],
        token_count: u32,
        summary: Option<String>,
    ) -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        let messages: Vec<Message> = messages
            .iter()
            .cloned()
            .map(|mut m| {
                m.checkpoint_id = Some(id.clone());
                m
            })
            .collect();

        Self {
            checkpoint: Checkpoint {
                id,
                session_id: session_id.into(),
                name: name.into(),
                message_count: messages.len(),
                token_count,
                created_at: Utc::now(),
                summary,
            },
            messages,
        }
    }
}

/// Storage the checkpoint subsystem needs from its persistence collaborator.
///
/// Missing ids are not errors: `get_checkpoint` yields `None` and
/// `delete_checkpoint` yields `false`. Implementations must tolerate
/// concurrent calls on different keys.
#[async_trait]
pub trait CheckpointStorage: Send + Sync {
    /// Write metadata and messages together or not at all
    async fn save_checkpoint(&self, checkpoint: &Checkpoint, messages: &[Message]) -> Result<(), StorageError>;

    async fn get_checkpoint(&self, id: &str) -> Result<Option<CheckpointSnapshot>, StorageError>;

    async fn delete_checkpoint(&self, id: &str) -> Result<bool, StorageError>;

    /// Newest first by `created_at`
    async fn list_checkpoints(&self, session_id: &str) -> Result<Vec<Checkpoint>, StorageError>;

    /// Every session's checkpoints, newest first
    async fn list_all_checkpoints(&self) -> Result<Vec<Checkpoint>, StorageError>;
}

pub(crate) fn check_snapshot_shape(checkpoint: &Checkpoint, messages: &[Message]) -> Result<(), StorageError> {
    if checkpoint.message_count != messages.len() {
        return Err(StorageError::Corrupt {
            id: checkpoint.id.clone(),
            reason: format!(
                "message_count {} does not match {} snapshot messages",
                checkpoint.message_count,
                messages.len()
            ),
        });
    }
    Ok(())
}

/// Newest first; ties broken by insertion order, later first
pub(crate) fn sort_newest_first(entries: &mut [(Checkpoint, u64)]) {
    entries.sort_by(|a, b| b.0.created_at.cmp(&a.0.created_at).then(b.1.cmp(&a.1)));
}

#[derive(Clone, Default)]
pub struct InMemoryCheckpointStorage {
    snapshots: Arc<DashMap<String, (u64, CheckpointSnapshot)>>,
    sequence: Arc<AtomicU64>,
}

impl InMemoryCheckpointStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    fn collect(&self, session_id: Option<&str>) -> Vec<Checkpoint> {
        let mut entries: Vec<(Checkpoint, u64)> = self
            .snapshots
            .iter()
            .filter(|e| session_id.map_or(true, |s| e.value().1.checkpoint.session_id == s))
            .map(|e| (e.value().1.checkpoint.clone(), e.value().0))
            .collect();
        sort_newest_first(&mut entries);
        entries.into_iter().map(|(c, _)| c).collect()
    }
}

#[async_trait]
impl CheckpointStorage for InMemoryCheckpointStorage {
    async fn save_checkpoint(&self, checkpoint: &Checkpoint, messages: &[Message]) -> Result<(), StorageError> {
        check_snapshot_shape(checkpoint, messages)?;
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        self.snapshots.insert(
            checkpoint.id.clone(),
            (
                seq,
                CheckpointSnapshot {
                    checkpoint: checkpoint.clone(),
                    messages: messages.to_vec(),
                },
            ),
        );
        Ok(())
    }

    async fn get_checkpoint(&self, id: &str) -> Result<Option<CheckpointSnapshot>, StorageError> {
        Ok(self.snapshots.get(id).map(|e| e.value().1.clone()))
    }

    async fn delete_checkpoint(&self, id: &str) -> Result<bool, StorageError> {
        Ok(self.snapshots.remove(id).is_some())
    }

    async fn list_checkpoints(&self, session_id: &str) -> Result<Vec<Checkpoint>, StorageError> {
        Ok(self.collect(Some(session_id)))
    }

    async fn list_all_checkpoints(&self) -> Result<Vec<Checkpoint>, StorageError> {
        Ok(self.collect(None))
    }
}
