use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::compression::{CompressionEngine, Reduction};
use super::tier_manager::{MemoryTierManager, PromotionCriteria, PromotionReport};
use super::token_budget::{ReductionStrategy, TokenUsage, UsageStatus};
use crate::checkpoint::{BatchCheckpointOperations, Checkpoint, CreateCheckpointRequest};
use crate::error::{ContextError, Result};
use crate::memory::{CompactedSession, MemoryLayer, MemoryStore, Message, MessageLog};
use crate::metrics;

/// Point-in-time view of a live session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: String,
    /// Most recent checkpoint taken or restored
    pub checkpoint_id: Option<String>,
    pub messages: Vec<Message>,
    pub token_usage: TokenUsage,
    pub created_at: DateTime<Utc>,
    pub messages_since_checkpoint: usize,
    /// Messages that left the window through reductions
    pub archived_count: usize,
}

/// What happened while appending one message
#[derive(Debug, Clone)]
pub struct AppendOutcome {
    /// Verdict before any reduction ran
    pub status: UsageStatus,
    pub applied: Option<ReductionStrategy>,
    pub compacted: Option<CompactedSession>,
    pub checkpoint: Option<Checkpoint>,
    /// Interval checkpoint that was due but could not be written; the next append retries
    pub checkpoint_error: Option<String>,
    /// Usage of the window as left by this append
    pub token_usage: TokenUsage,
}

struct SessionEntry {
    log: MessageLog,
    archive: Vec<Message>,
    checkpoint_id: Option<String>,
    created_at: DateTime<Utc>,
    since_checkpoint: usize,
    total_appended: usize,
    auto_checkpoints: usize,
}

impl SessionEntry {
    fn new(log: MessageLog) -> Self {
        let total_appended = log.len();
        Self {
            log,
            archive: Vec::new(),
            checkpoint_id: None,
            created_at: Utc::now(),
            since_checkpoint: 0,
            total_appended,
            auto_checkpoints: 0,
        }
    }
}

/// Drives the append path: evaluate, reduce, record mid-term memory and checkpoint
pub struct ContextOrchestrator {
    engine: CompressionEngine,
    checkpoints: BatchCheckpointOperations,
    tiers: Arc<MemoryTierManager>,
    store: Arc<dyn MemoryStore>,
    sessions: DashMap<String, Arc<Mutex<SessionEntry>>>,
}

impl ContextOrchestrator {
    pub fn new(
        engine: CompressionEngine,
        checkpoints: BatchCheckpointOperations,
        tiers: Arc<MemoryTierManager>,
        store: Arc<dyn MemoryStore>,
    ) -> Self {
        info!(
            "Context orchestrator initialized (max_tokens={}, checkpoint_interval={})",
            engine.config().max_tokens,
            engine.config().checkpoint_interval
        );
        Self {
            engine,
            checkpoints,
            tiers,
            store,
            sessions: DashMap::new(),
        }
    }

    pub fn engine(&self) -> &CompressionEngine {
        &self.engine
    }

    pub fn checkpoints(&self) -> &BatchCheckpointOperations {
        &self.checkpoints
    }

    pub fn tiers(&self) -> &Arc<MemoryTierManager> {
        &self.tiers
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Live entry for a session, resumed from the message store on first use
    fn entry(&self, session_id: &str) -> Result<Arc<Mutex<SessionEntry>>> {
        if let Some(entry) = self.sessions.get(session_id) {
            return Ok(entry.clone());
        }
        let log = MessageLog::from_messages(self.store.get_history(session_id))?;
        let entry = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| {
                metrics::inc_sessions();
                debug!("Opened session {} with {} stored messages", session_id, log.len());
                Arc::new(Mutex::new(SessionEntry::new(log)))
            })
            .clone();
        Ok(entry)
    }

    fn existing(&self, session_id: &str) -> Result<Arc<Mutex<SessionEntry>>> {
        self.sessions
            .get(session_id)
            .map(|e| e.clone())
            .ok_or_else(|| ContextError::SessionNotFound(session_id.to_string()))
    }

    pub async fn append_message(&self, session_id: &str, message: Message) -> Result<AppendOutcome> {
        let entry = self.entry(session_id)?;
        let mut state = entry.lock().await;

        let stored = state.log.append(message)?.clone();
        self.store.add_message(session_id, stored);
        state.total_appended += 1;
        state.since_checkpoint += 1;

        let status = self.engine.evaluator().evaluate(state.log.messages());
        let reduction = self.engine.reduce(&status, state.log.messages()).await?;
        let applied = reduction.strategy();

        let mut compacted = None;
        if let Some(window) = reduction.messages() {
            let window = window.to_vec();
            self.store.replace_history(session_id, window.clone());
            state.log.replace_all(window);
            state.archive.extend(reduction.archived());
        }
        if let Reduction::Compacted(result) = &reduction {
            match self.tiers.record_compaction(session_id, result).await {
                Ok(record) => compacted = Some(record),
                Err(e) => warn!("Could not record compaction for session {}: {}", session_id, e),
            }
        }
        if let Some(strategy) = applied {
            info!(
                "Session {}: {} applied at {:.1}% usage, window now {} messages",
                session_id,
                strategy.as_str(),
                status.usage.percentage,
                state.log.len()
            );
        }

        let interval = self.engine.config().checkpoint_interval;
        let mut checkpoint = None;
        let mut checkpoint_error = None;
        if interval > 0 && state.since_checkpoint >= interval {
            let name = format!("auto-{}", state.auto_checkpoints + 1);
            let request = CreateCheckpointRequest::new(session_id, name, state.log.messages().to_vec());
            match self.checkpoints.create_checkpoint(request).await {
                Ok(created) => {
                    state.auto_checkpoints += 1;
                    state.checkpoint_id = Some(created.id.clone());
                    state.since_checkpoint = 0;
                    checkpoint = Some(created);
                }
                Err(e) => {
                    warn!(
                        "Interval checkpoint for session {} failed, retrying on next append: {}",
                        session_id, e
                    );
                    checkpoint_error = Some(e.to_string());
                }
            }
        }

        Ok(AppendOutcome {
            status,
            applied,
            compacted,
            checkpoint,
            checkpoint_error,
            token_usage: self.engine.evaluator().usage(state.log.messages()),
        })
    }

    /// Manual checkpoint of the current window
    pub async fn create_checkpoint(
        &self,
        session_id: &str,
        name: &str,
        summary: Option<String>,
    ) -> Result<Checkpoint> {
        let entry = self.existing(session_id)?;
        let mut state = entry.lock().await;

        let mut request = CreateCheckpointRequest::new(session_id, name, state.log.messages().to_vec());
        request.summary = summary;
        let checkpoint = self.checkpoints.create_checkpoint(request).await?;

        state.checkpoint_id = Some(checkpoint.id.clone());
        state.since_checkpoint = 0;
        info!("Checkpoint {} ({}) created for session {}", checkpoint.id, name, session_id);
        Ok(checkpoint)
    }

    /// Replace the live window with a checkpoint taken from the same session
    pub async fn restore_checkpoint(&self, session_id: &str, checkpoint_id: &str) -> Result<SessionState> {
        let snapshot = self.checkpoints.restore_checkpoint(checkpoint_id).await?;
        if snapshot.checkpoint.session_id != session_id {
            warn!(
                "Checkpoint {} belongs to session {}, not {}",
                checkpoint_id, snapshot.checkpoint.session_id, session_id
            );
            return Err(ContextError::CheckpointNotFound(checkpoint_id.to_string()));
        }
        let log = MessageLog::from_messages(snapshot.messages)?;

        let entry = self.entry(session_id)?;
        let mut state = entry.lock().await;
        self.store.replace_history(session_id, log.messages().to_vec());
        state.log = log;
        state.checkpoint_id = Some(checkpoint_id.to_string());
        state.since_checkpoint = 0;

        info!(
            "Session {} restored from checkpoint {} ({} messages)",
            session_id,
            checkpoint_id,
            state.log.len()
        );
        Ok(self.snapshot(session_id, &state))
    }

    pub async fn session_state(&self, session_id: &str) -> Option<SessionState> {
        let entry = self.sessions.get(session_id).map(|e| e.clone())?;
        let state = entry.lock().await;
        Some(self.snapshot(session_id, &state))
    }

    /// Messages removed from the window, oldest reduction first
    pub async fn archived_messages(&self, session_id: &str) -> Result<Vec<Message>> {
        let entry = self.existing(session_id)?;
        let state = entry.lock().await;
        Ok(state.archive.clone())
    }

    pub async fn memory_layer(&self, session_id: &str) -> Result<MemoryLayer> {
        let entry = self.existing(session_id)?;
        let messages = entry.lock().await.log.messages().to_vec();
        self.tiers.memory_layer(session_id, &messages).await
    }

    /// Close a session and promote what it produced worth keeping
    pub async fn end_session(
        &self,
        session_id: &str,
        criteria: Option<&PromotionCriteria>,
    ) -> Result<PromotionReport> {
        let (_, entry) = self
            .sessions
            .remove(session_id)
            .ok_or_else(|| ContextError::SessionNotFound(session_id.to_string()))?;
        metrics::dec_sessions();

        let session_length = entry.lock().await.total_appended;
        self.checkpoints.locks().prune_idle();
        let report = self.tiers.run_promotion(session_id, session_length, criteria).await?;
        info!("Session {} ended after {} messages", session_id, session_length);
        Ok(report)
    }

    fn snapshot(&self, session_id: &str, state: &SessionEntry) -> SessionState {
        SessionState {
            session_id: session_id.to_string(),
            checkpoint_id: state.checkpoint_id.clone(),
            messages: state.log.messages().to_vec(),
            token_usage: self.engine.evaluator().usage(state.log.messages()),
            created_at: state.created_at,
            messages_since_checkpoint: state.since_checkpoint,
            archived_count: state.archive.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{CheckpointSnapshot, CheckpointStorage, InMemoryCheckpointStorage, SessionLocks};
    use crate::error::StorageError;
    use crate::memory::MessageRange;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use crate::config::ContextConfig;
    use crate::context_engine::collaborators::{ExtractiveSummarizer, HashingEmbedder, NoopSummarizer, Summarizer};
    use crate::context_engine::tier_manager::{InMemoryTierStore, TierManagerConfig, TierStore};
    use crate::context_engine::token_budget::{CharRatioEstimator, TokenBudgetEvaluator};
    use crate::memory::InMemoryMemoryStore;

    struct Harness {
        orchestrator: ContextOrchestrator,
        storage: Arc<InMemoryCheckpointStorage>,
        tier_store: Arc<InMemoryTierStore>,
        messages: Arc<InMemoryMemoryStore>,
    }

    fn harness(config: ContextConfig, summarizer: Arc<dyn Summarizer>) -> Harness {
        let storage = Arc::new(InMemoryCheckpointStorage::new());
        harness_over(config, summarizer, storage.clone(), storage)
    }

    fn harness_over(
        config: ContextConfig,
        summarizer: Arc<dyn Summarizer>,
        storage: Arc<InMemoryCheckpointStorage>,
        backend: Arc<dyn CheckpointStorage>,
    ) -> Harness {
        let evaluator = TokenBudgetEvaluator::with_default_estimator(config).unwrap();
        let engine = CompressionEngine::new(evaluator, summarizer);
        let ops = BatchCheckpointOperations::new(backend, SessionLocks::new(), Arc::new(CharRatioEstimator::default()));
        let tier_store = Arc::new(InMemoryTierStore::new());
        let tiers = Arc::new(MemoryTierManager::new(
            tier_store.clone(),
            Arc::new(HashingEmbedder::new(384)),
            TierManagerConfig::default(),
        ));
        let messages = Arc::new(InMemoryMemoryStore::new());
        Harness {
            orchestrator: ContextOrchestrator::new(engine, ops, tiers, messages.clone()),
            storage,
            tier_store,
            messages,
        }
    }

    /// Checkpoint backend whose writes fail while `failing` is set
    struct FlakyStorage {
        inner: Arc<InMemoryCheckpointStorage>,
        failing: AtomicBool,
    }

    #[async_trait]
    impl CheckpointStorage for FlakyStorage {
        async fn save_checkpoint(&self, checkpoint: &Checkpoint, messages: &[Message]) -> std::result::Result<(), StorageError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(StorageError::Backend("disk full".into()));
            }
            self.inner.save_checkpoint(checkpoint, messages).await
        }

        async fn get_checkpoint(&self, id: &str) -> std::result::Result<Option<CheckpointSnapshot>, StorageError> {
            self.inner.get_checkpoint(id).await
        }

        async fn delete_checkpoint(&self, id: &str) -> std::result::Result<bool, StorageError> {
            self.inner.delete_checkpoint(id).await
        }

        async fn list_checkpoints(&self, session_id: &str) -> std::result::Result<Vec<Checkpoint>, StorageError> {
            self.inner.list_checkpoints(session_id).await
        }

        async fn list_all_checkpoints(&self) -> std::result::Result<Vec<Checkpoint>, StorageError> {
            self.inner.list_all_checkpoints().await
        }
    }

    fn small_config(interval: usize) -> ContextConfig {
        ContextConfig {
            max_tokens: 1000,
            reserved_output_tokens: 100,
            prune_threshold: 0.5,
            compact_threshold: 0.7,
            truncate_threshold: 0.9,
            messages_to_keep: 2,
            buffer_percentage: 0.1,
            checkpoint_interval: interval,
        }
    }

    fn turn(i: usize, tokens: u32) -> Message {
        let m = if i % 2 == 0 {
            Message::user(format!("We decided to use sqlite for storage in step {}", i))
        } else {
            Message::assistant(format!("Fixed the rust migration bug in step {}", i))
        };
        m.with_id(format!("m{}", i)).with_tokens(tokens)
    }

    // ===== Append Path Tests =====

    #[tokio::test]
    async fn test_append_under_budget_changes_nothing() {
        let h = harness(small_config(0), Arc::new(NoopSummarizer));
        let outcome = h.orchestrator.append_message("s1", turn(0, 10)).await.unwrap();
        assert!(outcome.applied.is_none());
        assert!(outcome.checkpoint.is_none());
        assert_eq!(outcome.token_usage.total, 10);
        assert_eq!(h.messages.get_history("s1").len(), 1);
        assert_eq!(h.orchestrator.active_sessions(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_message_rejected() {
        let h = harness(small_config(0), Arc::new(NoopSummarizer));
        h.orchestrator.append_message("s1", turn(0, 10)).await.unwrap();
        let err = h.orchestrator.append_message("s1", turn(0, 10)).await.unwrap_err();
        assert!(matches!(err, ContextError::DuplicateMessage(_)));
    }

    #[tokio::test]
    async fn test_compaction_records_mid_term_memory() {
        let h = harness(small_config(0), Arc::new(ExtractiveSummarizer::default()));
        // 400 of 900 is still normal; the 250 token turn lifts usage to 72%
        for i in 0..4 {
            h.orchestrator.append_message("s1", turn(i, 100)).await.unwrap();
        }
        let outcome = h.orchestrator.append_message("s1", turn(4, 250)).await.unwrap();

        assert_eq!(outcome.applied, Some(ReductionStrategy::Compact));
        let record = outcome.compacted.unwrap();
        assert_eq!(h.tier_store.list_compacted("s1").await.unwrap()[0].id, record.id);
        assert_eq!(record.message_range, MessageRange { start: 0, end: 3 });

        let state = h.orchestrator.session_state("s1").await.unwrap();
        assert_eq!(state.archived_count, 3);
        assert_eq!(state.messages.len(), 3);
        assert_eq!(h.messages.get_history("s1"), state.messages);
        assert!(state.messages.iter().any(|m| m.is_condense_anchor()));
        let tail: Vec<_> = state.messages[1..].iter().map(|m| m.position).collect();
        assert_eq!(tail, vec![Some(3), Some(4)]);
    }

    #[tokio::test]
    async fn test_positions_continue_after_compaction() {
        let h = harness(small_config(0), Arc::new(ExtractiveSummarizer::default()));
        for i in 0..4 {
            h.orchestrator.append_message("s1", turn(i, 100)).await.unwrap();
        }
        h.orchestrator.append_message("s1", turn(4, 250)).await.unwrap();
        h.orchestrator.append_message("s1", turn(5, 5)).await.unwrap();

        let history = h.messages.get_history("s1");
        assert_eq!(history.last().and_then(|m| m.position), Some(5));
        let archived: Vec<_> = h
            .orchestrator
            .archived_messages("s1")
            .await
            .unwrap()
            .iter()
            .map(|m| m.position)
            .collect();
        assert_eq!(archived, vec![Some(0), Some(1), Some(2)]);
    }

    #[tokio::test]
    async fn test_interval_checkpoints() {
        let h = harness(small_config(3), Arc::new(NoopSummarizer));
        let mut created = Vec::new();
        for i in 0..7 {
            let outcome = h.orchestrator.append_message("s1", turn(i, 5)).await.unwrap();
            if let Some(c) = outcome.checkpoint {
                created.push(c);
            }
        }
        assert_eq!(created.len(), 2);
        assert_eq!(created[0].name, "auto-1");
        assert_eq!(created[1].message_count, 6);

        let state = h.orchestrator.session_state("s1").await.unwrap();
        assert_eq!(state.checkpoint_id.as_deref(), Some(created[1].id.as_str()));
        assert_eq!(state.messages_since_checkpoint, 1);
        assert_eq!(h.storage.list_checkpoints("s1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_interval_checkpoint_is_retried() {
        let inner = Arc::new(InMemoryCheckpointStorage::new());
        let flaky = Arc::new(FlakyStorage {
            inner: inner.clone(),
            failing: AtomicBool::new(true),
        });
        let h = harness_over(small_config(2), Arc::new(NoopSummarizer), inner, flaky.clone());

        h.orchestrator.append_message("s1", turn(0, 5)).await.unwrap();
        let outcome = h.orchestrator.append_message("s1", turn(1, 5)).await.unwrap();
        assert!(outcome.checkpoint.is_none());
        assert!(outcome.checkpoint_error.unwrap().contains("disk full"));

        // the message stays committed and the checkpoint stays due
        let state = h.orchestrator.session_state("s1").await.unwrap();
        assert_eq!(state.messages.len(), 2);
        assert_eq!(state.messages_since_checkpoint, 2);
        assert!(state.checkpoint_id.is_none());
        assert_eq!(h.messages.get_history("s1").len(), 2);

        flaky.failing.store(false, Ordering::SeqCst);
        let outcome = h.orchestrator.append_message("s1", turn(2, 5)).await.unwrap();
        assert!(outcome.checkpoint_error.is_none());
        let created = outcome.checkpoint.unwrap();
        assert_eq!(created.name, "auto-1");
        assert_eq!(created.message_count, 3);
        assert_eq!(h.storage.list_checkpoints("s1").await.unwrap().len(), 1);
    }

    // ===== Checkpoint Tests =====

    #[tokio::test]
    async fn test_checkpoint_and_restore() {
        let h = harness(small_config(0), Arc::new(NoopSummarizer));
        for i in 0..3 {
            h.orchestrator.append_message("s1", turn(i, 5)).await.unwrap();
        }
        let checkpoint = h.orchestrator.create_checkpoint("s1", "before", None).await.unwrap();
        h.orchestrator.append_message("s1", turn(3, 5)).await.unwrap();

        let restored = h.orchestrator.restore_checkpoint("s1", &checkpoint.id).await.unwrap();
        assert_eq!(restored.messages.len(), 3);
        assert_eq!(restored.checkpoint_id.as_deref(), Some(checkpoint.id.as_str()));
        assert_eq!(h.messages.get_history("s1").len(), 3);

        // ids from the dropped branch can be appended again
        h.orchestrator.append_message("s1", turn(3, 5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_restore_rejects_foreign_checkpoint() {
        let h = harness(small_config(0), Arc::new(NoopSummarizer));
        h.orchestrator.append_message("a", turn(0, 5)).await.unwrap();
        let checkpoint = h.orchestrator.create_checkpoint("a", "mine", None).await.unwrap();
        let err = h.orchestrator.restore_checkpoint("b", &checkpoint.id).await.unwrap_err();
        assert!(matches!(err, ContextError::CheckpointNotFound(_)));
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let h = harness(small_config(0), Arc::new(NoopSummarizer));
        assert!(h.orchestrator.session_state("ghost").await.is_none());
        assert!(matches!(
            h.orchestrator.create_checkpoint("ghost", "x", None).await,
            Err(ContextError::SessionNotFound(_))
        ));
        assert!(h.orchestrator.end_session("ghost", None).await.is_err());
    }

    // ===== Session Lifecycle Tests =====

    #[tokio::test]
    async fn test_end_session_promotes_compactions() {
        let h = harness(small_config(0), Arc::new(ExtractiveSummarizer::default()));
        for i in 0..4 {
            h.orchestrator.append_message("s1", turn(i, 100)).await.unwrap();
        }
        h.orchestrator.append_message("s1", turn(4, 250)).await.unwrap();
        assert_eq!(h.tier_store.list_compacted("s1").await.unwrap().len(), 1);

        let criteria = PromotionCriteria {
            user_marked_important: true,
            ..Default::default()
        };
        let report = h.orchestrator.end_session("s1", Some(&criteria)).await.unwrap();
        assert_eq!(report.promoted, 1);
        assert_eq!(h.orchestrator.active_sessions(), 0);
        assert_eq!(h.tier_store.indexed_count(), report.promoted);
    }

    #[tokio::test]
    async fn test_end_session_releases_checkpoint_locks() {
        let h = harness(small_config(2), Arc::new(NoopSummarizer));
        for session in ["a", "b", "c"] {
            for i in 0..2 {
                h.orchestrator.append_message(session, turn(i, 5)).await.unwrap();
            }
        }
        assert_eq!(h.orchestrator.checkpoints().locks().len(), 3);

        h.orchestrator.end_session("a", None).await.unwrap();
        assert!(h.orchestrator.checkpoints().locks().is_empty());
    }

    #[tokio::test]
    async fn test_session_resumes_from_store() {
        let h = harness(small_config(0), Arc::new(NoopSummarizer));
        h.messages.add_message("s1", turn(0, 5));
        h.orchestrator.append_message("s1", turn(1, 5)).await.unwrap();
        let state = h.orchestrator.session_state("s1").await.unwrap();
        assert_eq!(state.messages.len(), 2);
    }
}
