//! End-to-end walkthroughs of budgeting, retention, batching and promotion

use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::sync::Arc;

use session_context::checkpoint::{
    BatchCheckpointOperations, BatchOptions, Checkpoint, CheckpointMaintenance, CheckpointSnapshot, CheckpointStorage,
    CreateCheckpointRequest, InMemoryCheckpointStorage, SessionLocks,
};
use session_context::config::{ContextConfig, MaintenanceConfig};
use session_context::context_engine::{
    CharRatioEstimator, HashingEmbedder, MemoryTierManager, PromotionOutcome, TierManagerConfig, TierStore,
    TokenBudgetEvaluator, UsageLevel,
};
use session_context::error::StorageError;
use session_context::memory::{CompactedSession, Message, MessageRange};
use session_context::memory_db::MemoryDatabase;

fn budget_config() -> ContextConfig {
    ContextConfig {
        max_tokens: 8000,
        reserved_output_tokens: 1000,
        prune_threshold: 0.6,
        compact_threshold: 0.75,
        truncate_threshold: 0.9,
        ..Default::default()
    }
}

fn messages_totalling(count: usize, total: u32) -> Vec<Message> {
    let each = total / count as u32;
    (0..count)
        .map(|i| {
            let m = if i % 2 == 0 { Message::user("q") } else { Message::assistant("a") };
            m.with_id(format!("m{}", i)).with_tokens(each)
        })
        .collect()
}

fn operations(storage: Arc<dyn CheckpointStorage>) -> BatchCheckpointOperations {
    BatchCheckpointOperations::new(storage, SessionLocks::new(), Arc::new(CharRatioEstimator::default()))
}

#[test]
fn scenario_a_low_usage_needs_no_action() {
    let evaluator = TokenBudgetEvaluator::with_default_estimator(budget_config()).unwrap();
    let status = evaluator.evaluate(&messages_totalling(20, 2000));

    assert!((status.usage.percentage - 2000.0 / 7000.0).abs() < 1e-9);
    assert_eq!(status.level, UsageLevel::Normal);
    assert!(!status.requires_action());
}

#[test]
fn scenario_b_high_usage_asks_for_compaction() {
    let evaluator = TokenBudgetEvaluator::with_default_estimator(budget_config()).unwrap();
    let status = evaluator.evaluate(&messages_totalling(20, 5600));

    assert!((status.usage.percentage - 0.8).abs() < 1e-9);
    assert_eq!(status.level, UsageLevel::Warning);
    assert!(status.should_compact);
    assert!(!status.should_prune);
    assert!(!status.should_truncate);
}

#[tokio::test]
async fn scenario_c_cleanup_keeps_three_newest_in_sqlite() {
    let db = MemoryDatabase::new_in_memory().unwrap();
    let mut ids = Vec::new();
    for i in 0..10 {
        let mut snapshot = CheckpointSnapshot::capture("s1", format!("cp{}", i), &[Message::user("x")], 1, None);
        snapshot.checkpoint.created_at = Utc::now() - Duration::minutes(100 - i);
        db.checkpoints
            .save_checkpoint(&snapshot.checkpoint, &snapshot.messages)
            .await
            .unwrap();
        ids.push(snapshot.checkpoint.id);
    }

    let ops = operations(Arc::new(db.checkpoints.clone()));
    let result = ops.cleanup_old_checkpoints("s1", 3, None).await.unwrap();
    assert_eq!(result.success.len(), 7);
    assert!(result.failed.is_empty());

    let remaining: Vec<String> = db
        .checkpoints
        .list_checkpoints("s1")
        .await
        .unwrap()
        .into_iter()
        .map(|c| c.id)
        .collect();
    assert_eq!(remaining, vec![ids[9].clone(), ids[8].clone(), ids[7].clone()]);

    // a maintenance pass over the same store finds nothing left to do
    let config = MaintenanceConfig {
        max_checkpoints_per_session: 3,
        ..Default::default()
    };
    let maintenance = CheckpointMaintenance::new(ops, config).unwrap();
    assert_eq!(maintenance.perform_cleanup().await.unwrap().checkpoints_deleted, 0);
}

/// Rejects writes for one checkpoint name
struct RejectingStorage {
    inner: InMemoryCheckpointStorage,
    reject: &'static str,
}

#[async_trait]
impl CheckpointStorage for RejectingStorage {
    async fn save_checkpoint(&self, checkpoint: &Checkpoint, messages: &[Message]) -> Result<(), StorageError> {
        if checkpoint.name == self.reject {
            return Err(StorageError::Backend("disk quota exceeded".into()));
        }
        self.inner.save_checkpoint(checkpoint, messages).await
    }

    async fn get_checkpoint(&self, id: &str) -> Result<Option<CheckpointSnapshot>, StorageError> {
        self.inner.get_checkpoint(id).await
    }

    async fn delete_checkpoint(&self, id: &str) -> Result<bool, StorageError> {
        self.inner.delete_checkpoint(id).await
    }

    async fn list_checkpoints(&self, session_id: &str) -> Result<Vec<Checkpoint>, StorageError> {
        self.inner.list_checkpoints(session_id).await
    }

    async fn list_all_checkpoints(&self) -> Result<Vec<Checkpoint>, StorageError> {
        self.inner.list_all_checkpoints().await
    }
}

#[tokio::test]
async fn scenario_d_one_failed_write_is_isolated() {
    for options in [BatchOptions::sequential(), BatchOptions::parallel()] {
        let storage = Arc::new(RejectingStorage {
            inner: InMemoryCheckpointStorage::new(),
            reject: "item3",
        });
        let ops = operations(storage.clone());
        let requests = (1..=5)
            .map(|i| CreateCheckpointRequest::new("s1", format!("item{}", i), vec![Message::user("hi")]))
            .collect();

        let result = ops.create_batch(requests, &options).await;
        assert_eq!(result.total, 5);
        assert_eq!(result.success.len(), 4);
        assert_eq!(result.failed.len(), 1);
        assert_eq!(result.failed[0].id, "item3");
        assert!(result.failed[0].error.contains("disk quota exceeded"));
        assert_eq!(storage.list_checkpoints("s1").await.unwrap().len(), 4);
    }
}

#[tokio::test]
async fn promotion_happens_once_in_sqlite() {
    let db = Arc::new(MemoryDatabase::new_in_memory().unwrap());
    let config = TierManagerConfig {
        embedding_dimension: 64,
        ..Default::default()
    };
    let manager = MemoryTierManager::new(db.clone(), Arc::new(HashingEmbedder::new(64)), config);

    let record = CompactedSession {
        id: "c1".into(),
        session_id: "s1".into(),
        summary: "Switched the session store to sqlite".into(),
        key_topics: vec!["database".into()],
        decisions: vec!["Fixed the rust pool deadlock".into()],
        key_findings: vec![],
        message_range: MessageRange { start: 0, end: 6 },
        created_at: Utc::now(),
        promoted: false,
    };
    db.save_compacted(&record).await.unwrap();

    let report = manager.run_promotion("s1", 6, None).await.unwrap();
    assert_eq!(report.promoted, 1);
    assert_eq!(manager.promote(&record).await.unwrap(), PromotionOutcome::AlreadyPromoted);
    assert_eq!(db.get_stats().unwrap().indexed_conversations, 1);
}
