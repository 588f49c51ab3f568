//! Long-term memory: embedded conversation records with linear similarity search

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

use crate::error::StorageError;
use crate::memory::{IndexedConversation, IndexedMetadata};
use crate::memory_db::schema::{from_micros, to_micros};

const INDEXED_COLUMNS: &str = "id, session_id, source_id, embedding, content, topics, date";

#[derive(Debug, Clone, Serialize)]
pub struct EmbeddingStats {
    pub total_embeddings: usize,
    pub dimension: usize,
}

#[derive(Clone)]
pub struct EmbeddingStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl EmbeddingStore {
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>, StorageError> {
        Ok(self.pool.get()?)
    }

    /// False when the source record was already indexed
    pub fn store_embedding(&self, record: &IndexedConversation) -> Result<bool, StorageError> {
        let conn = self.get_conn()?;
        insert_indexed_on(&conn, record)
    }

    pub fn get_by_source(&self, source_id: &str) -> Result<Option<IndexedConversation>, StorageError> {
        let conn = self.get_conn()?;
        let raw = conn
            .query_row(
                &format!("SELECT {} FROM indexed_conversations WHERE source_id = ?1", INDEXED_COLUMNS),
                [source_id],
                RawIndexed::from_row,
            )
            .optional()?;
        raw.map(RawIndexed::into_record).transpose()
    }

    pub fn get_session_records(&self, session_id: &str) -> Result<Vec<IndexedConversation>, StorageError> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM indexed_conversations WHERE session_id = ?1 ORDER BY date DESC, rowid DESC",
            INDEXED_COLUMNS
        ))?;
        let raws = stmt
            .query_map([session_id], RawIndexed::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        raws.into_iter().map(RawIndexed::into_record).collect()
    }

    /// Cosine similarity over every stored vector, best first
    pub fn find_similar(
        &self,
        query: &[f32],
        limit: usize,
        similarity_threshold: f32,
    ) -> Result<Vec<(IndexedConversation, f32)>, StorageError> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM indexed_conversations WHERE dimension = ?1",
            INDEXED_COLUMNS
        ))?;
        let raws = stmt
            .query_map([query.len() as i64], RawIndexed::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut matches = Vec::new();
        for raw in raws {
            let record = raw.into_record()?;
            let sim = cosine_similarity(query, &record.embedding);
            if sim >= similarity_threshold {
                matches.push((record, sim));
            }
        }

        matches.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        matches.truncate(limit);
        debug!("Similarity search matched {} records", matches.len());
        Ok(matches)
    }

    pub fn get_stats(&self) -> Result<EmbeddingStats, StorageError> {
        let conn = self.get_conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM indexed_conversations", [], |row| row.get(0))?;
        let dimension: Option<i64> = conn
            .query_row("SELECT dimension FROM indexed_conversations LIMIT 1", [], |row| row.get(0))
            .optional()?;

        Ok(EmbeddingStats {
            total_embeddings: count as usize,
            dimension: dimension.unwrap_or(0) as usize,
        })
    }
}

/// Insert keyed on `source_id`; an existing row wins
pub(crate) fn insert_indexed_on(conn: &Connection, record: &IndexedConversation) -> Result<bool, StorageError> {
    let embedding_bytes = bincode::serialize(&record.embedding)?;
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO indexed_conversations
         (id, session_id, source_id, embedding, dimension, content, topics, date)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            &record.id,
            &record.session_id,
            &record.source_id,
            embedding_bytes,
            record.embedding.len() as i64,
            &record.content,
            serde_json::to_string(&record.metadata.topics)?,
            to_micros(&record.metadata.date),
        ],
    )?;
    Ok(inserted > 0)
}

struct RawIndexed {
    id: String,
    session_id: String,
    source_id: String,
    embedding: Vec<u8>,
    content: String,
    topics: String,
    date: i64,
}

impl RawIndexed {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            session_id: row.get(1)?,
            source_id: row.get(2)?,
            embedding: row.get(3)?,
            content: row.get(4)?,
            topics: row.get(5)?,
            date: row.get(6)?,
        })
    }

    fn into_record(self) -> Result<IndexedConversation, StorageError> {
        let embedding: Vec<f32> = bincode::deserialize(&self.embedding)?;
        let date = from_micros(self.date, &self.id)?;
        Ok(IndexedConversation {
            metadata: IndexedMetadata {
                date,
                topics: serde_json::from_str(&self.topics)?,
            },
            id: self.id,
            session_id: self.session_id,
            source_id: self.source_id,
            embedding,
            content: self.content,
        })
    }
}

pub(crate) fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}
