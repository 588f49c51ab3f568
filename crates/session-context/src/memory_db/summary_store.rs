//! Mid-term memory: compacted session summaries

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::StorageError;
use crate::memory::{CompactedSession, MessageRange};
use crate::memory_db::schema::{from_micros, to_micros};

const SUMMARY_COLUMNS: &str =
    "id, session_id, summary, key_topics, decisions, key_findings, range_start, range_end, created_at, promoted";

#[derive(Clone)]
pub struct SummaryStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl SummaryStore {
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>, StorageError> {
        Ok(self.pool.get()?)
    }

    pub fn store_summary(&self, record: &CompactedSession) -> Result<(), StorageError> {
        let conn = self.get_conn()?;

        debug!(
            "Storing summary {} for session {} (messages {} to {})",
            record.id, record.session_id, record.message_range.start, record.message_range.end
        );

        conn.execute(
            "INSERT INTO compacted_sessions
             (id, session_id, summary, key_topics, decisions, key_findings,
              range_start, range_end, created_at, promoted)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                &record.id,
                &record.session_id,
                &record.summary,
                serde_json::to_string(&record.key_topics)?,
                serde_json::to_string(&record.decisions)?,
                serde_json::to_string(&record.key_findings)?,
                record.message_range.start as i64,
                record.message_range.end as i64,
                to_micros(&record.created_at),
                record.promoted,
            ],
        )?;
        Ok(())
    }

    pub fn get_summary(&self, id: &str) -> Result<Option<CompactedSession>, StorageError> {
        let conn = self.get_conn()?;
        let row = conn
            .query_row(
                &format!("SELECT {} FROM compacted_sessions WHERE id = ?1", SUMMARY_COLUMNS),
                [id],
                RawSummary::from_row,
            )
            .optional()?;
        row.map(RawSummary::into_record).transpose()
    }

    /// Newest first
    pub fn get_session_summaries(&self, session_id: &str) -> Result<Vec<CompactedSession>, StorageError> {
        self.query_session(session_id, false)
    }

    pub fn get_unpromoted_summaries(&self, session_id: &str) -> Result<Vec<CompactedSession>, StorageError> {
        self.query_session(session_id, true)
    }

    fn query_session(&self, session_id: &str, unpromoted_only: bool) -> Result<Vec<CompactedSession>, StorageError> {
        let conn = self.get_conn()?;
        let filter = if unpromoted_only { " AND promoted = 0" } else { "" };
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM compacted_sessions WHERE session_id = ?1{} ORDER BY created_at DESC, rowid DESC",
            SUMMARY_COLUMNS, filter
        ))?;
        let raws = stmt
            .query_map([session_id], RawSummary::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        raws.into_iter().map(RawSummary::into_record).collect()
    }

    /// True only on the transition from unpromoted to promoted
    pub fn mark_promoted(&self, id: &str) -> Result<bool, StorageError> {
        let conn = self.get_conn()?;
        mark_promoted_on(&conn, id)
    }

    pub fn delete_session_summaries(&self, session_id: &str) -> Result<usize, StorageError> {
        let conn = self.get_conn()?;
        let deleted = conn.execute("DELETE FROM compacted_sessions WHERE session_id = ?1", [session_id])?;
        info!("Deleted {} summaries for session {}", deleted, session_id);
        Ok(deleted)
    }
}

pub(crate) fn mark_promoted_on(conn: &Connection, id: &str) -> Result<bool, StorageError> {
    let changed = conn.execute(
        "UPDATE compacted_sessions SET promoted = 1 WHERE id = ?1 AND promoted = 0",
        [id],
    )?;
    Ok(changed > 0)
}

struct RawSummary {
    id: String,
    session_id: String,
    summary: String,
    key_topics: String,
    decisions: String,
    key_findings: String,
    range_start: i64,
    range_end: i64,
    created_at: i64,
    promoted: bool,
}

impl RawSummary {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            session_id: row.get(1)?,
            summary: row.get(2)?,
            key_topics: row.get(3)?,
            decisions: row.get(4)?,
            key_findings: row.get(5)?,
            range_start: row.get(6)?,
            range_end: row.get(7)?,
            created_at: row.get(8)?,
            promoted: row.get(9)?,
        })
    }

    fn into_record(self) -> Result<CompactedSession, StorageError> {
        let position = |value: i64| {
            usize::try_from(value).map_err(|_| StorageError::Corrupt {
                id: self.id.clone(),
                reason: format!("negative message position {}", value),
            })
        };
        let message_range = MessageRange {
            start: position(self.range_start)?,
            end: position(self.range_end)?,
        };
        let created_at = from_micros(self.created_at, &self.id)?;

        Ok(CompactedSession {
            key_topics: serde_json::from_str(&self.key_topics)?,
            decisions: serde_json::from_str(&self.decisions)?,
            key_findings: serde_json::from_str(&self.key_findings)?,
            id: self.id,
            session_id: self.session_id,
            summary: self.summary,
            message_range,
            created_at,
            promoted: self.promoted,
        })
    }
}
