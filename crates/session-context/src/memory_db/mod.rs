//! Memory database module - SQLite-backed storage for checkpoints, summaries and embeddings
pub mod schema;
pub mod migration;
pub mod checkpoint_store;
pub mod summary_store;
pub mod embedding_store;
pub use schema::*;
pub use migration::MigrationManager;
pub use checkpoint_store::CheckpointStore;
pub use summary_store::SummaryStore;
pub use embedding_store::{EmbeddingStore, EmbeddingStats};
use std::path::Path;
use std::sync::Arc;
use async_trait::async_trait;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use tracing::info;

use crate::context_engine::tier_manager::TierStore;
use crate::error::StorageError;
use crate::memory::{CompactedSession, IndexedConversation};

const CONNECTION_PRAGMAS: &str = "PRAGMA foreign_keys = ON;
     PRAGMA busy_timeout = 5000;";

/// Pooled SQLite database exposing one store per table group
#[derive(Clone)]
pub struct MemoryDatabase {
    pub checkpoints: CheckpointStore,
    pub summaries: SummaryStore,
    pub embeddings: EmbeddingStore,
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl MemoryDatabase {
    /// Open (or create) a database file and bring its schema up to date
    pub fn new(db_path: &Path) -> Result<Self, StorageError> {
        info!("Opening memory database at: {}", db_path.display());
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let manager = SqliteConnectionManager::file(db_path)
            .with_flags(
                rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_FULL_MUTEX,
            )
            .with_init(|conn| conn.execute_batch(CONNECTION_PRAGMAS));
        let pool = Pool::builder().max_size(10).build(manager)?;

        {
            let mut conn = pool.get()?;
            let version = MigrationManager::new(&mut conn).initialize_database()?;
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;",
            )?;
            info!("Memory database ready at schema version {}", version);
        }
        Ok(Self::from_pool(pool))
    }

    /// Private database for tests and ephemeral sessions.
    /// Every SQLite `:memory:` connection is its own database, so the pool holds one.
    pub fn new_in_memory() -> Result<Self, StorageError> {
        let manager = SqliteConnectionManager::memory()
            .with_init(|conn| conn.execute_batch(CONNECTION_PRAGMAS));
        let pool = Pool::builder().max_size(1).build(manager)?;
        {
            let mut conn = pool.get()?;
            MigrationManager::new(&mut conn).initialize_database()?;
        }
        Ok(Self::from_pool(pool))
    }

    fn from_pool(pool: Pool<SqliteConnectionManager>) -> Self {
        let pool = Arc::new(pool);
        Self {
            checkpoints: CheckpointStore::new(Arc::clone(&pool)),
            summaries: SummaryStore::new(Arc::clone(&pool)),
            embeddings: EmbeddingStore::new(Arc::clone(&pool)),
            pool,
        }
    }

    pub fn get_stats(&self) -> Result<DatabaseStats, StorageError> {
        let conn = self.pool.get()?;
        Ok(migration::get_database_stats(&conn)?)
    }

    /// Insert a long-term record and flag its source summary in one transaction
    pub fn store_promotion(&self, record: &IndexedConversation) -> Result<bool, StorageError> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        let inserted = embedding_store::insert_indexed_on(&tx, record)?;
        summary_store::mark_promoted_on(&tx, &record.source_id)?;
        tx.commit()?;
        Ok(inserted)
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(MemoryDatabase) -> Result<T, StorageError> + Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || f(db))
            .await
            .map_err(|e| StorageError::Backend(format!("storage task failed: {}", e)))?
    }
}

#[async_trait]
impl TierStore for MemoryDatabase {
    async fn save_compacted(&self, record: &CompactedSession) -> Result<(), StorageError> {
        let record = record.clone();
        self.blocking(move |db| db.summaries.store_summary(&record)).await
    }

    async fn get_compacted(&self, id: &str) -> Result<Option<CompactedSession>, StorageError> {
        let id = id.to_string();
        self.blocking(move |db| db.summaries.get_summary(&id)).await
    }

    async fn list_compacted(&self, session_id: &str) -> Result<Vec<CompactedSession>, StorageError> {
        let session_id = session_id.to_string();
        self.blocking(move |db| db.summaries.get_session_summaries(&session_id)).await
    }

    async fn mark_promoted(&self, id: &str) -> Result<bool, StorageError> {
        let id = id.to_string();
        self.blocking(move |db| db.summaries.mark_promoted(&id)).await
    }

    async fn save_promotion(&self, record: &IndexedConversation) -> Result<bool, StorageError> {
        let record = record.clone();
        self.blocking(move |db| db.store_promotion(&record)).await
    }

    async fn indexed_for_source(&self, source_id: &str) -> Result<Option<IndexedConversation>, StorageError> {
        let source_id = source_id.to_string();
        self.blocking(move |db| db.embeddings.get_by_source(&source_id)).await
    }

    async fn list_indexed(&self, session_id: &str) -> Result<Vec<IndexedConversation>, StorageError> {
        let session_id = session_id.to_string();
        self.blocking(move |db| db.embeddings.get_session_records(&session_id)).await
    }

    async fn find_similar(
        &self,
        query: &[f32],
        limit: usize,
        min_similarity: f32,
    ) -> Result<Vec<(IndexedConversation, f32)>, StorageError> {
        let query = query.to_vec();
        self.blocking(move |db| db.embeddings.find_similar(&query, limit, min_similarity)).await
    }
}
