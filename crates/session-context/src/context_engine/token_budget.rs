//! Token accounting and threshold evaluation.
//!
//! The evaluator is pure: it reads a message slice and a validated
//! [`ContextConfig`] and produces a [`UsageStatus`]. Acting on the verdict is
//! the caller's business.

use moka::sync::Cache;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use crate::config::ContextConfig;
use crate::error::Result;
use crate::memory::{Message, Role};

/// Approximate token counting. Must return the same count for the same content.
pub trait TokenEstimator: Send + Sync {
    fn estimate(&self, content: &str) -> u32;

    /// Stored count when present, estimate otherwise
    fn message_tokens(&self, message: &Message) -> u32 {
        message
            .token_count
            .unwrap_or_else(|| self.estimate(&message.content))
    }
}

/// Characters-per-token heuristic
#[derive(Debug, Clone, Copy)]
pub struct CharRatioEstimator {
    chars_per_token: f64,
}

impl Default for CharRatioEstimator {
    fn default() -> Self {
        Self { chars_per_token: 4.0 }
    }
}

impl CharRatioEstimator {
    pub fn new(chars_per_token: f64) -> Self {
        Self {
            chars_per_token: if chars_per_token > 0.0 { chars_per_token } else { 4.0 },
        }
    }
}

impl TokenEstimator for CharRatioEstimator {
    fn estimate(&self, content: &str) -> u32 {
        let chars = content.chars().count() as f64;
        (chars / self.chars_per_token).ceil() as u32
    }
}

/// Bounded, expiring memo of content hash to token count.
///
/// Owned by whoever builds the estimator; clones share the same entries.
#[derive(Clone)]
pub struct TokenCountCache {
    entries: Cache<u64, u32>,
}

impl TokenCountCache {
    pub fn new(max_capacity: u64, ttl: Duration) -> Self {
        Self {
            entries: Cache::builder()
                .max_capacity(max_capacity)
                .time_to_live(ttl)
                .build(),
        }
    }

    pub fn entry_count(&self) -> u64 {
        self.entries.run_pending_tasks();
        self.entries.entry_count()
    }

    pub fn clear(&self) {
        self.entries.invalidate_all();
    }

    fn key(content: &str) -> u64 {
        let mut hasher = DefaultHasher::new();
        content.hash(&mut hasher);
        hasher.finish()
    }
}

impl Default for TokenCountCache {
    fn default() -> Self {
        Self::new(10_000, Duration::from_secs(600))
    }
}

/// Wraps another estimator with a [`TokenCountCache`]
pub struct CachedEstimator<E> {
    inner: E,
    cache: TokenCountCache,
}

impl<E: TokenEstimator> CachedEstimator<E> {
    pub fn new(inner: E, cache: TokenCountCache) -> Self {
        Self { inner, cache }
    }

    pub fn cache(&self) -> &TokenCountCache {
        &self.cache
    }
}

impl<E: TokenEstimator> TokenEstimator for CachedEstimator<E> {
    fn estimate(&self, content: &str) -> u32 {
        let key = TokenCountCache::key(content);
        self.cache
            .entries
            .get_with(key, || self.inner.estimate(content))
    }
}

/// Budget snapshot
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Non-assistant tokens
    pub prompt: u32,
    /// Assistant tokens
    pub completion: u32,
    pub total: u32,
    pub limit: u32,
    pub percentage: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageLevel {
    Normal,
    Warning,
    Critical,
}

/// Reduction a verdict asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReductionStrategy {
    Prune,
    Compact,
    Truncate,
}

impl ReductionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReductionStrategy::Prune => "prune",
            ReductionStrategy::Compact => "compact",
            ReductionStrategy::Truncate => "truncate",
        }
    }
}

/// Evaluator verdict
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageStatus {
    pub level: UsageLevel,
    pub should_prune: bool,
    pub should_compact: bool,
    pub should_truncate: bool,
    pub message: String,
    pub usage: TokenUsage,
}

impl UsageStatus {
    pub fn requested_strategy(&self) -> Option<ReductionStrategy> {
        if self.should_truncate {
            Some(ReductionStrategy::Truncate)
        } else if self.should_compact {
            Some(ReductionStrategy::Compact)
        } else if self.should_prune {
            Some(ReductionStrategy::Prune)
        } else {
            None
        }
    }

    pub fn requires_action(&self) -> bool {
        self.requested_strategy().is_some()
    }
}

#[derive(Clone)]
pub struct TokenBudgetEvaluator {
    config: ContextConfig,
    estimator: Arc<dyn TokenEstimator>,
}

impl std::fmt::Debug for TokenBudgetEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBudgetEvaluator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl TokenBudgetEvaluator {
    /// Fails on an invalid config so per-message evaluation never has to
    pub fn new(config: ContextConfig, estimator: Arc<dyn TokenEstimator>) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, estimator })
    }

    pub fn with_default_estimator(config: ContextConfig) -> Result<Self> {
        Self::new(config, Arc::new(CharRatioEstimator::default()))
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    pub fn estimator(&self) -> &Arc<dyn TokenEstimator> {
        &self.estimator
    }

    pub fn message_tokens(&self, message: &Message) -> u32 {
        self.estimator.message_tokens(message)
    }

    /// Sum over messages still in the live window
    pub fn active_tokens(&self, messages: &[Message]) -> u32 {
        messages
            .iter()
            .filter(|m| m.is_active())
            .map(|m| self.message_tokens(m))
            .fold(0u32, u32::saturating_add)
    }

    pub fn usage(&self, messages: &[Message]) -> TokenUsage {
        let mut prompt = 0u32;
        let mut completion = 0u32;
        for message in messages.iter().filter(|m| m.is_active()) {
            let tokens = self.message_tokens(message);
            match message.role {
                Role::Assistant => completion = completion.saturating_add(tokens),
                _ => prompt = prompt.saturating_add(tokens),
            }
        }
        let total = prompt.saturating_add(completion);
        let percentage = total as f64 / self.config.available_tokens() as f64;

        TokenUsage {
            prompt,
            completion,
            total,
            limit: self.config.max_tokens,
            percentage: percentage.max(0.0),
        }
    }

    pub fn evaluate(&self, messages: &[Message]) -> UsageStatus {
        let usage = self.usage(messages);
        self.classify(usage)
    }

    /// Threshold check, most severe first
    pub fn classify(&self, usage: TokenUsage) -> UsageStatus {
        let config = &self.config;
        let pct = usage.percentage;
        let shown = pct * 100.0;

        let (level, strategy, message) = if pct >= config.truncate_threshold {
            (
                UsageLevel::Critical,
                Some(ReductionStrategy::Truncate),
                format!("Context at {:.1}% of budget; oldest messages must be truncated", shown),
            )
        } else if pct >= config.compact_threshold {
            (
                UsageLevel::Warning,
                Some(ReductionStrategy::Compact),
                format!("Context at {:.1}% of budget; older messages should be summarized", shown),
            )
        } else if pct >= config.prune_threshold {
            (
                UsageLevel::Warning,
                Some(ReductionStrategy::Prune),
                format!("Context at {:.1}% of budget; low-priority messages can be pruned", shown),
            )
        } else {
            (UsageLevel::Normal, None, format!("Context at {:.1}% of budget", shown))
        };

        UsageStatus {
            level,
            should_prune: strategy == Some(ReductionStrategy::Prune),
            should_compact: strategy == Some(ReductionStrategy::Compact),
            should_truncate: strategy == Some(ReductionStrategy::Truncate),
            message,
            usage,
        }
    }

    /// Token level the prune threshold corresponds to
    pub fn prune_target(&self) -> u32 {
        (self.config.prune_threshold * self.config.available_tokens() as f64).floor() as u32
    }
}
