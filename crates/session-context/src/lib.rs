// session-context/crates/session-context/src/lib.rs

pub mod checkpoint;
pub mod config;
pub mod context_engine;
pub mod error;
pub mod memory;
pub mod memory_db;
pub mod metrics;
pub mod telemetry;
pub mod utils;

// Public API exports
pub use checkpoint::{
    BatchCheckpointOperations, BatchOptions, BatchResult, Checkpoint, CheckpointMaintenance, CheckpointSnapshot,
    CheckpointStorage, CreateCheckpointRequest, InMemoryCheckpointStorage, SessionLocks,
};
pub use config::{ContextConfig, MaintenanceConfig};
pub use context_engine::{
    CompressionEngine, ContextOrchestrator, MemoryTierManager, TierManagerConfig, TokenBudgetEvaluator, UsageStatus,
};
pub use error::{ContextError, Result, StorageError};
pub use memory::{InMemoryMemoryStore, MemoryStore, Message, Role};
pub use memory_db::MemoryDatabase;
