//! Checkpoint snapshots: storage contract, batch operations and retention

pub mod batch;
pub mod locks;
pub mod maintenance;
pub mod storage;

pub use batch::{BatchCheckpointOperations, BatchFailure, BatchOptions, BatchResult, CreateCheckpointRequest, ProgressCallback};
pub use locks::SessionLocks;
pub use maintenance::{CheckpointMaintenance, CleanupReport, StorageStats};
pub use storage::{Checkpoint, CheckpointSnapshot, CheckpointStorage, InMemoryCheckpointStorage};
