//! Checkpoint metadata and message snapshots in SQLite

use async_trait::async_trait;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension, Row};
use std::sync::Arc;
use tracing::debug;

use crate::checkpoint::storage::{check_snapshot_shape, Checkpoint, CheckpointSnapshot, CheckpointStorage};
use crate::error::StorageError;
use crate::memory::Message;
use crate::memory_db::schema::{from_micros, to_micros};

const CHECKPOINT_COLUMNS: &str = "id, session_id, name, message_count, token_count, created_at, summary";

#[derive(Clone)]
pub struct CheckpointStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl CheckpointStore {
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>, StorageError> {
        Ok(self.pool.get()?)
    }

    /// Metadata and every message in one transaction
    pub fn save(&self, checkpoint: &Checkpoint, messages: &[Message]) -> Result<(), StorageError> {
        check_snapshot_shape(checkpoint, messages)?;
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO checkpoints (id, session_id, name, message_count, token_count, created_at, summary)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                &checkpoint.id,
                &checkpoint.session_id,
                &checkpoint.name,
                checkpoint.message_count as i64,
                i64::from(checkpoint.token_count),
                to_micros(&checkpoint.created_at),
                checkpoint.summary.as_deref(),
            ],
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO checkpoint_messages (checkpoint_id, position, payload) VALUES (?1, ?2, ?3)",
            )?;
            for (position, message) in messages.iter().enumerate() {
                let payload = serde_json::to_string(message)?;
                stmt.execute(params![&checkpoint.id, position as i64, payload])?;
            }
        }
        tx.commit()?;

        debug!(
            "Stored checkpoint {} for session {} ({} messages)",
            checkpoint.id,
            checkpoint.session_id,
            messages.len()
        );
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Option<CheckpointSnapshot>, StorageError> {
        let conn = self.get_conn()?;
        let checkpoint = conn
            .query_row(
                &format!("SELECT {} FROM checkpoints WHERE id = ?1", CHECKPOINT_COLUMNS),
                [id],
                raw_checkpoint,
            )
            .optional()?;
        let Some(raw) = checkpoint else {
            return Ok(None);
        };
        let checkpoint = raw.into_checkpoint()?;

        let mut stmt = conn.prepare(
            "SELECT payload FROM checkpoint_messages WHERE checkpoint_id = ?1 ORDER BY position",
        )?;
        let payloads = stmt
            .query_map([id], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        let messages = payloads
            .iter()
            .map(|p| serde_json::from_str::<Message>(p))
            .collect::<Result<Vec<_>, _>>()?;

        check_snapshot_shape(&checkpoint, &messages)?;
        Ok(Some(CheckpointSnapshot { checkpoint, messages }))
    }

    /// Message rows go with the metadata through the cascade
    pub fn delete(&self, id: &str) -> Result<bool, StorageError> {
        let conn = self.get_conn()?;
        let deleted = conn.execute("DELETE FROM checkpoints WHERE id = ?1", [id])?;
        Ok(deleted > 0)
    }

    pub fn list(&self, session_id: Option<&str>) -> Result<Vec<Checkpoint>, StorageError> {
        let conn = self.get_conn()?;
        let raws = match session_id {
            Some(session_id) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM checkpoints WHERE session_id = ?1 ORDER BY created_at DESC, rowid DESC",
                    CHECKPOINT_COLUMNS
                ))?;
                let rows = stmt.query_map([session_id], raw_checkpoint)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM checkpoints ORDER BY created_at DESC, rowid DESC",
                    CHECKPOINT_COLUMNS
                ))?;
                let rows = stmt.query_map([], raw_checkpoint)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
        };
        raws.into_iter().map(RawCheckpoint::into_checkpoint).collect()
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(CheckpointStore) -> Result<T, StorageError> + Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || f(store))
            .await
            .map_err(|e| StorageError::Backend(format!("storage task failed: {}", e)))?
    }
}

struct RawCheckpoint {
    id: String,
    session_id: String,
    name: String,
    message_count: i64,
    token_count: i64,
    created_at: i64,
    summary: Option<String>,
}

impl RawCheckpoint {
    fn into_checkpoint(self) -> Result<Checkpoint, StorageError> {
        let created_at = from_micros(self.created_at, &self.id)?;
        let corrupt = |id: &str, what: &str| StorageError::Corrupt {
            id: id.to_string(),
            reason: format!("negative {}", what),
        };
        let message_count = usize::try_from(self.message_count).map_err(|_| corrupt(&self.id, "message_count"))?;
        let token_count = u32::try_from(self.token_count).map_err(|_| corrupt(&self.id, "token_count"))?;
        Ok(Checkpoint {
            id: self.id,
            session_id: self.session_id,
            name: self.name,
            message_count,
            token_count,
            created_at,
            summary: self.summary,
        })
    }
}

fn raw_checkpoint(row: &Row) -> rusqlite::Result<RawCheckpoint> {
    Ok(RawCheckpoint {
        id: row.get(0)?,
        session_id: row.get(1)?,
        name: row.get(2)?,
        message_count: row.get(3)?,
        token_count: row.get(4)?,
        created_at: row.get(5)?,
        summary: row.get(6)?,
    })
}

#[async_trait]
impl CheckpointStorage for CheckpointStore {
    async fn save_checkpoint(&self, checkpoint: &Checkpoint, messages: &[Message]) -> Result<(), StorageError> {
        let checkpoint = checkpoint.clone();
        let messages = messages.to_vec();
        self.blocking(move |store| store.save(&checkpoint, &messages)).await
    }

    async fn get_checkpoint(&self, id: &str) -> Result<Option<CheckpointSnapshot>, StorageError> {
        let id = id.to_string();
        self.blocking(move |store| store.get(&id)).await
    }

    async fn delete_checkpoint(&self, id: &str) -> Result<bool, StorageError> {
        let id = id.to_string();
        self.blocking(move |store| store.delete(&id)).await
    }

    async fn list_checkpoints(&self, session_id: &str) -> Result<Vec<Checkpoint>, StorageError> {
        let session_id = session_id.to_string();
        self.blocking(move |store| store.list(Some(&session_id))).await
    }

    async fn list_all_checkpoints(&self) -> Result<Vec<Checkpoint>, StorageError> {
        self.blocking(|store| store.list(None)).await
    }
}
