//! Context engine module - budgets, compresses and tiers a session's context

pub mod collaborators;
pub mod compression;
pub mod orchestrator;
pub mod tier_manager;
pub mod token_budget;

pub use collaborators::{Embedder, ExtractiveSummarizer, HashingEmbedder, NoopEmbedder, NoopSummarizer, Summarizer, SummaryOutput};
pub use compression::{message_priority, CompressionEngine, CompressionResult, PruneResult, Reduction, TruncationResult};
pub use orchestrator::{AppendOutcome, ContextOrchestrator, SessionState};
pub use tier_manager::{
    calculate_memory_importance, should_promote_to_permanent_memory, Importance, InMemoryTierStore, MemoryTierManager,
    PromotionCriteria, PromotionOutcome, PromotionReport, TierManagerConfig, TierStore,
};
pub use token_budget::{
    CachedEstimator, CharRatioEstimator, ReductionStrategy, TokenBudgetEvaluator, TokenCountCache, TokenEstimator,
    TokenUsage, UsageLevel, UsageStatus,
};
