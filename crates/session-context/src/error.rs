//! Error types for context budgeting, compression and checkpoint storage

/// Result type for session-context operations
pub type Result<T> = std::result::Result<T, ContextError>;

/// Errors raised by the evaluator, compression engine, tier manager and orchestrator
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    /// Configuration rejected at construction time
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Explicit compaction range is unusable
    #[error("Invalid compaction range {start}..{end}: {reason}")]
    InvalidRange {
        start: usize,
        end: usize,
        reason: String,
    },

    /// The requested reduction has nothing to operate on
    #[error("Nothing to reduce: {0}")]
    NothingToReduce(String),

    /// Message id already present in the log
    #[error("Duplicate message id: {0}")]
    DuplicateMessage(String),

    /// Session has no live state
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Checkpoint does not exist
    #[error("Checkpoint not found: {0}")]
    CheckpointNotFound(String),

    /// Mid-term memory record does not exist
    #[error("Memory record not found: {0}")]
    RecordNotFound(String),

    /// Summarization collaborator failed or timed out
    #[error("Summarizer error: {0}")]
    Summarizer(String),

    /// Embedding collaborator failed or returned an unusable vector
    #[error("Embedder error: {0}")]
    Embedder(String),

    /// Persistence collaborator failed
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Work aborted through a cancellation token; batch items report its text
    #[error("cancelled")]
    Cancelled,
}

impl ContextError {
    /// Collaborator failures the caller can fall back from or retry later
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ContextError::Summarizer(_)
                | ContextError::Embedder(_)
                | ContextError::NothingToReduce(_)
        )
    }
}

/// Failures of the persistence collaborator.
///
/// Not-found is deliberately absent: lookups return `None` and deletes return
/// `false` for ids that do not exist.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt record {id}: {reason}")]
    Corrupt { id: String, reason: String },

    #[error("{0}")]
    Backend(String),
}

impl From<anyhow::Error> for StorageError {
    fn from(err: anyhow::Error) -> Self {
        StorageError::Backend(err.to_string())
    }
}
