use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use lazy_static::lazy_static;
use moka::sync::Cache;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::collaborators::Embedder;
use super::compression::CompressionResult;
use crate::checkpoint::SessionLocks;
use crate::config::env_or;
use crate::error::{ContextError, Result, StorageError};
use crate::memory::{CompactedSession, IndexedConversation, IndexedMetadata, MemoryLayer, Message};
use crate::memory_db::embedding_store::cosine_similarity;
use crate::metrics;

lazy_static! {
    static ref CODE_FIX_REGEX: Regex = Regex::new(
        r"(?i)\b(fix(ed|es|ing)?|bug|patch(ed)?|resolved?|workaround|regression|root cause)\b"
    ).unwrap();
    static ref LEARNING_REGEX: Regex = Regex::new(
        r"(?i)\b(learn(ed|t|ing)?|understood|discovered|turns out|realized|insight|lesson)\b"
    ).unwrap();
    static ref TECH_STACK_REGEX: Regex = Regex::new(
        r"(?i)\b(rust|python|typescript|javascript|golang|java|kotlin|swift|react|vue|node(\.?js)?|docker|kubernetes|postgres(ql)?|sqlite|mysql|redis|aws|gcp|azure|tokio|linux|graphql|grpc)\b"
    ).unwrap();
}

const HIGH_IMPORTANCE_KEYWORDS: &[&str] = &[
    "architecture",
    "security",
    "bug",
    "performance",
    "database",
    "api",
    "deployment",
    "authentication",
    "decision",
    "migration",
];

#[derive(Debug, Clone)]
pub struct TierManagerConfig {
    pub embedding_dimension: usize,
    pub cache_capacity: u64,
    pub cache_ttl_seconds: u64,
    pub min_mentions: u32,
    pub min_session_length: usize,
}

impl Default for TierManagerConfig {
    fn default() -> Self {
        Self {
            embedding_dimension: 384,
            cache_capacity: 500,
            cache_ttl_seconds: 3600,
            min_mentions: 3,
            min_session_length: 20,
        }
    }
}

impl TierManagerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            embedding_dimension: env_or("TIER_EMBEDDING_DIMENSION", defaults.embedding_dimension)?,
            cache_capacity: env_or("TIER_CACHE_CAPACITY", defaults.cache_capacity)?,
            cache_ttl_seconds: env_or("TIER_CACHE_TTL_SECONDS", defaults.cache_ttl_seconds)?,
            min_mentions: env_or("TIER_MIN_MENTIONS", defaults.min_mentions)?,
            min_session_length: env_or("TIER_MIN_SESSION_LENGTH", defaults.min_session_length)?,
        })
    }

    pub fn default_criteria(&self) -> PromotionCriteria {
        PromotionCriteria {
            user_marked_important: false,
            mention_count: 0,
            min_mentions: self.min_mentions,
            min_session_length: self.min_session_length,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Importance {
    Low,
    Medium,
    High,
}

/// Extra signals for the promotion decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromotionCriteria {
    pub user_marked_important: bool,
    pub mention_count: u32,
    pub min_mentions: u32,
    pub min_session_length: usize,
}

impl Default for PromotionCriteria {
    fn default() -> Self {
        TierManagerConfig::default().default_criteria()
    }
}

/// decisions x2, findings x1.5, topics x0.5, plus 2.0 when a topic is a high-importance keyword
pub fn importance_score(topics: &[String], decisions: &[String], key_findings: &[String]) -> f64 {
    let mut score = decisions.len() as f64 * 2.0 + key_findings.len() as f64 * 1.5 + topics.len() as f64 * 0.5;
    let keyword_hit = topics.iter().any(|topic| {
        let topic = topic.to_lowercase();
        HIGH_IMPORTANCE_KEYWORDS.iter().any(|k| topic.contains(k))
    });
    if keyword_hit {
        score += 2.0;
    }
    score
}

pub fn calculate_memory_importance(topics: &[String], decisions: &[String], key_findings: &[String]) -> Importance {
    let score = importance_score(topics, decisions, key_findings);
    if score >= 5.0 {
        Importance::High
    } else if score >= 2.0 {
        Importance::Medium
    } else {
        Importance::Low
    }
}

/// Weighted signals: code fix 2, learning 1.5, tech stack 1, user mark 3, mentions 1.
/// Promotes at a score of 3, or unconditionally for long sessions.
pub fn should_promote_to_permanent_memory(
    decisions: &[String],
    key_findings: &[String],
    topics: &[String],
    session_length: usize,
    criteria: &PromotionCriteria,
) -> bool {
    let corpus: Vec<&str> = decisions
        .iter()
        .chain(key_findings)
        .chain(topics)
        .map(String::as_str)
        .collect();
    let mentions = |pattern: &Regex| corpus.iter().any(|text| pattern.is_match(text));

    let mut score = 0.0;
    if mentions(&CODE_FIX_REGEX) {
        score += 2.0;
    }
    if mentions(&LEARNING_REGEX) {
        score += 1.5;
    }
    if mentions(&TECH_STACK_REGEX) {
        score += 1.0;
    }
    if criteria.user_marked_important {
        score += 3.0;
    }
    if criteria.min_mentions > 0 && criteria.mention_count >= criteria.min_mentions {
        score += 1.0;
    }

    score >= 3.0 || session_length >= criteria.min_session_length
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PromotionOutcome {
    Promoted { record: IndexedConversation },
    AlreadyPromoted,
    /// Record stays eligible for a later attempt
    Deferred { reason: String },
}

impl PromotionOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            PromotionOutcome::Promoted { .. } => "promoted",
            PromotionOutcome::AlreadyPromoted => "already_promoted",
            PromotionOutcome::Deferred { .. } => "deferred",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PromotionReport {
    pub evaluated: usize,
    pub promoted: usize,
    pub already_promoted: usize,
    pub deferred: usize,
    pub skipped: usize,
}

/// Persistence for mid-term and long-term records
#[async_trait]
pub trait TierStore: Send + Sync {
    async fn save_compacted(&self, record: &CompactedSession) -> std::result::Result<(), StorageError>;

    async fn get_compacted(&self, id: &str) -> std::result::Result<Option<CompactedSession>, StorageError>;

    /// Newest first
    async fn list_compacted(&self, session_id: &str) -> std::result::Result<Vec<CompactedSession>, StorageError>;

    /// True only when the record changed from unpromoted to promoted
    async fn mark_promoted(&self, id: &str) -> std::result::Result<bool, StorageError>;

    /// Insert the long-term record and mark its source promoted together.
    /// False when `source_id` already has a long-term record.
    async fn save_promotion(&self, record: &IndexedConversation) -> std::result::Result<bool, StorageError>;

    async fn indexed_for_source(&self, source_id: &str) -> std::result::Result<Option<IndexedConversation>, StorageError>;

    async fn list_indexed(&self, session_id: &str) -> std::result::Result<Vec<IndexedConversation>, StorageError>;

    async fn find_similar(
        &self,
        query: &[f32],
        limit: usize,
        min_similarity: f32,
    ) -> std::result::Result<Vec<(IndexedConversation, f32)>, StorageError>;
}

#[derive(Clone, Default)]
pub struct InMemoryTierStore {
    compacted: Arc<DashMap<String, (u64, CompactedSession)>>,
    indexed: Arc<DashMap<String, IndexedConversation>>,
    sequence: Arc<AtomicU64>,
}

impl InMemoryTierStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn indexed_count(&self) -> usize {
        self.indexed.len()
    }
}

#[async_trait]
impl TierStore for InMemoryTierStore {
    async fn save_compacted(&self, record: &CompactedSession) -> std::result::Result<(), StorageError> {
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        self.compacted.insert(record.id.clone(), (seq, record.clone()));
        Ok(())
    }

    async fn get_compacted(&self, id: &str) -> std::result::Result<Option<CompactedSession>, StorageError> {
        Ok(self.compacted.get(id).map(|e| e.value().1.clone()))
    }

    async fn list_compacted(&self, session_id: &str) -> std::result::Result<Vec<CompactedSession>, StorageError> {
        let mut records: Vec<(u64, CompactedSession)> = self
            .compacted
            .iter()
            .filter(|e| e.value().1.session_id == session_id)
            .map(|e| e.value().clone())
            .collect();
        records.sort_by(|a, b| b.1.created_at.cmp(&a.1.created_at).then(b.0.cmp(&a.0)));
        Ok(records.into_iter().map(|(_, r)| r).collect())
    }

    async fn mark_promoted(&self, id: &str) -> std::result::Result<bool, StorageError> {
        Ok(match self.compacted.get_mut(id) {
            Some(mut entry) if !entry.1.promoted => {
                entry.1.promoted = true;
                true
            }
            _ => false,
        })
    }

    async fn save_promotion(&self, record: &IndexedConversation) -> std::result::Result<bool, StorageError> {
        let inserted = match self.indexed.entry(record.source_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(record.clone());
                true
            }
        };
        if let Some(mut entry) = self.compacted.get_mut(&record.source_id) {
            entry.1.promoted = true;
        }
        Ok(inserted)
    }

    async fn indexed_for_source(&self, source_id: &str) -> std::result::Result<Option<IndexedConversation>, StorageError> {
        Ok(self.indexed.get(source_id).map(|e| e.value().clone()))
    }

    async fn list_indexed(&self, session_id: &str) -> std::result::Result<Vec<IndexedConversation>, StorageError> {
        let mut records: Vec<IndexedConversation> = self
            .indexed
            .iter()
            .filter(|e| e.value().session_id == session_id)
            .map(|e| e.value().clone())
            .collect();
        records.sort_by(|a, b| b.metadata.date.cmp(&a.metadata.date));
        Ok(records)
    }

    async fn find_similar(
        &self,
        query: &[f32],
        limit: usize,
        min_similarity: f32,
    ) -> std::result::Result<Vec<(IndexedConversation, f32)>, StorageError> {
        let mut matches: Vec<(IndexedConversation, f32)> = self
            .indexed
            .iter()
            .map(|e| {
                let sim = cosine_similarity(query, &e.value().embedding);
                (e.value().clone(), sim)
            })
            .filter(|(_, sim)| *sim >= min_similarity)
            .collect();
        matches.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        matches.truncate(limit);
        Ok(matches)
    }
}

/// Moves session content from mid-term summaries into long-term embedded memory
pub struct MemoryTierManager {
    store: Arc<dyn TierStore>,
    embedder: Arc<dyn Embedder>,
    mid_term_cache: Cache<String, Vec<CompactedSession>>,
    long_term_cache: Cache<String, Vec<IndexedConversation>>,
    promotion_locks: SessionLocks,
    pub config: TierManagerConfig,
}

impl MemoryTierManager {
    pub fn new(store: Arc<dyn TierStore>, embedder: Arc<dyn Embedder>, config: TierManagerConfig) -> Self {
        let ttl = Duration::from_secs(config.cache_ttl_seconds);
        Self {
            store,
            embedder,
            mid_term_cache: Cache::builder()
                .max_capacity(config.cache_capacity)
                .time_to_live(ttl)
                .build(),
            long_term_cache: Cache::builder()
                .max_capacity(config.cache_capacity)
                .time_to_live(ttl)
                .build(),
            promotion_locks: SessionLocks::new(),
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn TierStore> {
        &self.store
    }

    fn invalidate(&self, session_id: &str) {
        self.mid_term_cache.invalidate(session_id);
        self.long_term_cache.invalidate(session_id);
    }

    /// Persist the mid-term record for a compaction
    pub async fn record_compaction(&self, session_id: &str, result: &CompressionResult) -> Result<CompactedSession> {
        let record = CompactedSession {
            id: result
                .summary
                .condense_id
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            session_id: session_id.to_string(),
            summary: result.summary.content.clone(),
            key_topics: result.key_topics.clone(),
            decisions: result.decisions.clone(),
            key_findings: result.key_findings.clone(),
            message_range: result.message_range,
            created_at: Utc::now(),
            promoted: false,
        };
        self.store.save_compacted(&record).await?;
        self.invalidate(session_id);
        debug!(
            "Recorded compaction {} for session {} ({:?} importance)",
            record.id,
            session_id,
            calculate_memory_importance(&record.key_topics, &record.decisions, &record.key_findings)
        );
        Ok(record)
    }

    pub fn should_promote(
        &self,
        record: &CompactedSession,
        session_length: usize,
        criteria: Option<&PromotionCriteria>,
    ) -> bool {
        let defaults;
        let criteria = match criteria {
            Some(c) => c,
            None => {
                defaults = self.config.default_criteria();
                &defaults
            }
        };
        should_promote_to_permanent_memory(
            &record.decisions,
            &record.key_findings,
            &record.key_topics,
            session_length,
            criteria,
        )
    }

    /// Embed a mid-term record into long-term memory, at most once per record
    pub async fn promote(&self, record: &CompactedSession) -> Result<PromotionOutcome> {
        let outcome = {
            let _guard = self.promotion_locks.lock(&record.id).await;
            self.promote_locked(record).await
        };
        // one lock per record id; keep only those another caller still holds
        self.promotion_locks.prune_idle();
        let outcome = outcome?;

        metrics::inc_promotion(outcome.label());
        match &outcome {
            PromotionOutcome::Promoted { record: indexed } => {
                info!("Promoted {} to long-term memory as {}", record.id, indexed.id)
            }
            PromotionOutcome::AlreadyPromoted => debug!("{} already promoted", record.id),
            PromotionOutcome::Deferred { reason } => warn!("Promotion of {} deferred: {}", record.id, reason),
        }
        Ok(outcome)
    }

    async fn promote_locked(&self, record: &CompactedSession) -> Result<PromotionOutcome> {
        match self.store.get_compacted(&record.id).await? {
            Some(stored) if stored.promoted => return Ok(PromotionOutcome::AlreadyPromoted),
            Some(_) => {}
            None => self.store.save_compacted(record).await?,
        }
        if self.store.indexed_for_source(&record.id).await?.is_some() {
            self.store.mark_promoted(&record.id).await?;
            self.invalidate(&record.session_id);
            return Ok(PromotionOutcome::AlreadyPromoted);
        }

        if !self.embedder.is_available() {
            return Ok(PromotionOutcome::Deferred {
                reason: "no embedding service configured".into(),
            });
        }
        let content = long_term_content(record);
        let embedding = match self.embedder.embed(&content).await {
            Ok(v) => v,
            Err(e) => {
                return Ok(PromotionOutcome::Deferred {
                    reason: ContextError::Embedder(e.to_string()).to_string(),
                })
            }
        };
        if embedding.len() != self.config.embedding_dimension {
            return Ok(PromotionOutcome::Deferred {
                reason: format!(
                    "embedding has {} dimensions, deployment uses {}",
                    embedding.len(),
                    self.config.embedding_dimension
                ),
            });
        }

        let indexed = IndexedConversation {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: record.session_id.clone(),
            source_id: record.id.clone(),
            embedding,
            content,
            metadata: IndexedMetadata {
                date: record.created_at,
                topics: record.key_topics.clone(),
            },
        };
        let inserted = self.store.save_promotion(&indexed).await?;
        self.invalidate(&record.session_id);

        Ok(if inserted {
            PromotionOutcome::Promoted { record: indexed }
        } else {
            PromotionOutcome::AlreadyPromoted
        })
    }

    /// Promote a stored mid-term record by id
    pub async fn mark_as_promoted(&self, id: &str) -> Result<PromotionOutcome> {
        let record = self
            .store
            .get_compacted(id)
            .await?
            .ok_or_else(|| ContextError::RecordNotFound(id.to_string()))?;
        self.promote(&record).await
    }

    /// Evaluate every unpromoted record of a session
    pub async fn run_promotion(
        &self,
        session_id: &str,
        session_length: usize,
        criteria: Option<&PromotionCriteria>,
    ) -> Result<PromotionReport> {
        let records = self.store.list_compacted(session_id).await?;
        let mut report = PromotionReport::default();

        for record in records.iter().filter(|r| !r.promoted) {
            report.evaluated += 1;
            if !self.should_promote(record, session_length, criteria) {
                report.skipped += 1;
                continue;
            }
            match self.promote(record).await? {
                PromotionOutcome::Promoted { .. } => report.promoted += 1,
                PromotionOutcome::AlreadyPromoted => report.already_promoted += 1,
                PromotionOutcome::Deferred { .. } => report.deferred += 1,
            }
        }

        info!(
            "Promotion pass for {}: {} evaluated, {} promoted, {} deferred",
            session_id, report.evaluated, report.promoted, report.deferred
        );
        Ok(report)
    }

    pub async fn mid_term(&self, session_id: &str) -> Result<Vec<CompactedSession>> {
        if let Some(records) = self.mid_term_cache.get(session_id) {
            return Ok(records);
        }
        let records = self.store.list_compacted(session_id).await?;
        self.mid_term_cache.insert(session_id.to_string(), records.clone());
        Ok(records)
    }

    pub async fn long_term(&self, session_id: &str) -> Result<Vec<IndexedConversation>> {
        if let Some(records) = self.long_term_cache.get(session_id) {
            return Ok(records);
        }
        let records = self.store.list_indexed(session_id).await?;
        self.long_term_cache.insert(session_id.to_string(), records.clone());
        Ok(records)
    }

    /// Three-tier view; short-term keeps only live, uncompressed messages
    pub async fn memory_layer(&self, session_id: &str, messages: &[Message]) -> Result<MemoryLayer> {
        Ok(MemoryLayer {
            short_term: messages
                .iter()
                .filter(|m| m.is_active() && !m.compressed && !m.is_truncation_marker)
                .cloned()
                .collect(),
            mid_term: self.mid_term(session_id).await?,
            long_term: self.long_term(session_id).await?,
        })
    }

    /// Long-term records closest to a free-text query
    pub async fn search_long_term(
        &self,
        query: &str,
        limit: usize,
        min_similarity: f32,
    ) -> Result<Vec<(IndexedConversation, f32)>> {
        let embedding = self
            .embedder
            .embed(query)
            .await
            .map_err(|e| ContextError::Embedder(e.to_string()))?;
        Ok(self.store.find_similar(&embedding, limit, min_similarity).await?)
    }
}

fn long_term_content(record: &CompactedSession) -> String {
    let mut content = record.summary.clone();
    if !record.decisions.is_empty() {
        content.push_str("\nDecisions: ");
        content.push_str(&record.decisions.join("; "));
    }
    if !record.key_findings.is_empty() {
        content.push_str("\nFindings: ");
        content.push_str(&record.key_findings.join("; "));
    }
    content
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context_engine::collaborators::{HashingEmbedder, NoopEmbedder};
    use crate::memory::MessageRange;
    use anyhow::anyhow;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn compacted(id: &str, decisions: &[&str], topics: &[&str]) -> CompactedSession {
        CompactedSession {
            id: id.to_string(),
            session_id: "s1".into(),
            summary: format!("summary {}", id),
            key_topics: strings(topics),
            decisions: strings(decisions),
            key_findings: vec![],
            message_range: MessageRange { start: 0, end: 4 },
            created_at: Utc::now(),
            promoted: false,
        }
    }

    fn manager_with(embedder: Arc<dyn Embedder>) -> (Arc<InMemoryTierStore>, MemoryTierManager) {
        let store = Arc::new(InMemoryTierStore::new());
        let config = TierManagerConfig {
            embedding_dimension: 16,
            ..Default::default()
        };
        (store.clone(), MemoryTierManager::new(store, embedder, config))
    }

    struct FlakyEmbedder;

    #[async_trait]
    impl Embedder for FlakyEmbedder {
        fn dimension(&self) -> usize {
            16
        }

        async fn embed(&self, _text: &str) -> anyhow::Result<Vec<f32>> {
            Err(anyhow!("rate limited"))
        }
    }

    // ===== Scoring Tests =====

    #[test]
    fn test_importance_thresholds() {
        assert_eq!(calculate_memory_importance(&[], &[], &[]), Importance::Low);
        assert_eq!(calculate_memory_importance(&strings(&["a", "b", "c"]), &[], &[]), Importance::Low);
        assert_eq!(calculate_memory_importance(&[], &strings(&["d"]), &[]), Importance::Medium);
        assert_eq!(
            calculate_memory_importance(&strings(&["x"]), &strings(&["d1", "d2"]), &strings(&["f"])),
            Importance::High
        );
    }

    #[test]
    fn test_keyword_bonus() {
        assert_eq!(importance_score(&strings(&["Database tuning"]), &[], &[]), 2.5);
        assert_eq!(calculate_memory_importance(&strings(&["security"]), &[], &[]), Importance::Medium);
    }

    #[test]
    fn test_promotion_signals() {
        let criteria = PromotionCriteria::default();
        // code fix (2) + tech stack (1)
        assert!(should_promote_to_permanent_memory(
            &strings(&["Fixed the tokio deadlock"]),
            &[],
            &[],
            3,
            &criteria
        ));
        // tech stack alone is not enough
        assert!(!should_promote_to_permanent_memory(&[], &[], &strings(&["rust"]), 3, &criteria));
        // long session passes on length alone
        assert!(should_promote_to_permanent_memory(&[], &[], &[], 20, &criteria));
    }

    #[test]
    fn test_user_mark_and_mentions() {
        let marked = PromotionCriteria {
            user_marked_important: true,
            ..Default::default()
        };
        assert!(should_promote_to_permanent_memory(&[], &[], &[], 1, &marked));

        let mentioned = PromotionCriteria {
            mention_count: 5,
            ..Default::default()
        };
        // mentions (1) + learning (1.5) = 2.5
        assert!(!should_promote_to_permanent_memory(&[], &strings(&["learned about lifetimes"]), &[], 1, &mentioned));
        // + tech stack (1) = 3.5
        assert!(should_promote_to_permanent_memory(&[], &strings(&["learned about rust lifetimes"]), &[], 1, &mentioned));
    }

    // ===== Promotion Tests =====

    #[tokio::test]
    async fn test_promotion_is_idempotent() {
        let (store, manager) = manager_with(Arc::new(HashingEmbedder::new(16)));
        let record = compacted("c1", &["use sqlite"], &["database"]);
        store.save_compacted(&record).await.unwrap();

        let first = manager.promote(&record).await.unwrap();
        assert!(matches!(first, PromotionOutcome::Promoted { .. }));
        let second = manager.mark_as_promoted("c1").await.unwrap();
        assert_eq!(second, PromotionOutcome::AlreadyPromoted);
        let third = manager.promote(&record).await.unwrap();
        assert_eq!(third, PromotionOutcome::AlreadyPromoted);

        assert_eq!(store.indexed_count(), 1);
        assert!(store.get_compacted("c1").await.unwrap().unwrap().promoted);
    }

    #[tokio::test]
    async fn test_concurrent_promotion_creates_one_record() {
        let (store, manager) = manager_with(Arc::new(HashingEmbedder::new(16)));
        let manager = Arc::new(manager);
        let record = compacted("c1", &["use sqlite"], &[]);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let manager = manager.clone();
                let record = record.clone();
                tokio::spawn(async move { manager.promote(&record).await.unwrap() })
            })
            .collect();
        let mut promoted = 0;
        for handle in handles {
            if matches!(handle.await.unwrap(), PromotionOutcome::Promoted { .. }) {
                promoted += 1;
            }
        }
        assert_eq!(promoted, 1);
        assert_eq!(store.indexed_count(), 1);
        assert!(manager.promotion_locks.is_empty());
    }

    #[tokio::test]
    async fn test_embedder_failure_defers_and_keeps_record() {
        let (store, manager) = manager_with(Arc::new(FlakyEmbedder));
        let record = compacted("c1", &["d"], &[]);
        let outcome = manager.promote(&record).await.unwrap();
        assert!(matches!(outcome, PromotionOutcome::Deferred { ref reason } if reason.contains("rate limited")));

        let stored = store.get_compacted("c1").await.unwrap().unwrap();
        assert!(!stored.promoted);
        assert_eq!(store.indexed_count(), 0);
    }

    #[tokio::test]
    async fn test_wrong_dimension_defers() {
        let (_, manager) = manager_with(Arc::new(HashingEmbedder::new(8)));
        let outcome = manager.promote(&compacted("c1", &[], &[])).await.unwrap();
        assert!(matches!(outcome, PromotionOutcome::Deferred { .. }));
    }

    #[tokio::test]
    async fn test_noop_embedder_defers() {
        let (_, manager) = manager_with(Arc::new(NoopEmbedder::new(16)));
        let outcome = manager.promote(&compacted("c1", &[], &[])).await.unwrap();
        assert_eq!(outcome.label(), "deferred");
    }

    #[tokio::test]
    async fn test_mark_unknown_record() {
        let (_, manager) = manager_with(Arc::new(HashingEmbedder::new(16)));
        assert!(matches!(
            manager.mark_as_promoted("nope").await,
            Err(ContextError::RecordNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_run_promotion_report() {
        let (store, manager) = manager_with(Arc::new(HashingEmbedder::new(16)));
        store.save_compacted(&compacted("fix", &["fixed the rust build"], &[])).await.unwrap();
        store.save_compacted(&compacted("chat", &[], &["weather"])).await.unwrap();

        let report = manager.run_promotion("s1", 2, None).await.unwrap();
        assert_eq!(report.evaluated, 2);
        assert_eq!(report.promoted, 1);
        assert_eq!(report.skipped, 1);

        let again = manager.run_promotion("s1", 2, None).await.unwrap();
        assert_eq!(again.evaluated, 1);
        assert_eq!(again.promoted, 0);
        assert!(manager.promotion_locks.is_empty());
    }

    #[tokio::test]
    async fn test_promotion_locks_do_not_accumulate() {
        let (_, manager) = manager_with(Arc::new(HashingEmbedder::new(16)));
        for i in 0..5 {
            manager.promote(&compacted(&format!("c{}", i), &["use sqlite"], &[])).await.unwrap();
        }
        assert!(manager.promotion_locks.is_empty());
    }

    // ===== Tier View Tests =====

    #[tokio::test]
    async fn test_memory_layer_refreshes_after_promotion() {
        let (store, manager) = manager_with(Arc::new(HashingEmbedder::new(16)));
        let record = compacted("c1", &["use sqlite"], &[]);
        store.save_compacted(&record).await.unwrap();

        let mut hidden = Message::user("old");
        hidden.condense_parent = Some("c1".into());
        let messages = vec![hidden, Message::user("live")];

        let before = manager.memory_layer("s1", &messages).await.unwrap();
        assert_eq!(before.short_term.len(), 1);
        assert_eq!(before.mid_term.len(), 1);
        assert!(before.long_term.is_empty());

        manager.promote(&record).await.unwrap();
        let after = manager.memory_layer("s1", &messages).await.unwrap();
        assert_eq!(after.long_term.len(), 1);
        assert!(after.mid_term[0].promoted);
    }

    #[tokio::test]
    async fn test_search_long_term() {
        let (store, manager) = manager_with(Arc::new(HashingEmbedder::new(16)));
        let record = compacted("c1", &["use sqlite for storage"], &[]);
        store.save_compacted(&record).await.unwrap();
        manager.promote(&record).await.unwrap();

        let hits = manager.search_long_term("summary c1 Decisions: use sqlite for storage", 3, 0.5).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0.source_id, "c1");
    }
}
