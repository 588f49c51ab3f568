//! Capability interfaces for the summarization and embedding services.
//!
//! Each has a null implementation chosen at construction time, so callers
//! never branch on whether a service is configured.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::memory::{Message, Role};
use crate::utils::topic_extractor::{extract_decisions, extract_findings};
use crate::utils::{TextUtils, TopicExtractor};

/// What a summarizer returns for a message range
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SummaryOutput {
    pub text: String,
    /// Summarizer's own estimate; the engine estimates when absent
    pub token_count: Option<u32>,
    #[serde(default)]
    pub key_topics: Vec<String>,
    #[serde(default)]
    pub decisions: Vec<String>,
    #[serde(default)]
    pub key_findings: Vec<String>,
}

#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, messages: &[Message]) -> Result<SummaryOutput>;

    fn is_available(&self) -> bool {
        true
    }
}

#[async_trait]
pub trait Embedder: Send + Sync {
    /// Fixed output width for this deployment
    fn dimension(&self) -> usize;

    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    fn is_available(&self) -> bool {
        true
    }
}

/// No summarization service configured
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSummarizer;

#[async_trait]
impl Summarizer for NoopSummarizer {
    async fn summarize(&self, _messages: &[Message]) -> Result<SummaryOutput> {
        Err(anyhow!("no summarization service configured"))
    }

    fn is_available(&self) -> bool {
        false
    }
}

/// No embedding service configured
#[derive(Debug, Clone, Copy)]
pub struct NoopEmbedder {
    dimension: usize,
}

impl NoopEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }
}

#[async_trait]
impl Embedder for NoopEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        Err(anyhow!("no embedding service configured"))
    }

    fn is_available(&self) -> bool {
        false
    }
}

/// Local summarizer built from leading sentences and extracted topics
pub struct ExtractiveSummarizer {
    topics: TopicExtractor,
    max_points: usize,
    max_chars_per_point: usize,
}

impl Default for ExtractiveSummarizer {
    fn default() -> Self {
        Self {
            topics: TopicExtractor::default(),
            max_points: 6,
            max_chars_per_point: 160,
        }
    }
}

impl ExtractiveSummarizer {
    pub fn new(max_points: usize, max_chars_per_point: usize) -> Self {
        Self {
            topics: TopicExtractor::default(),
            max_points: max_points.max(1),
            max_chars_per_point: max_chars_per_point.max(16),
        }
    }
}

#[async_trait]
impl Summarizer for ExtractiveSummarizer {
    async fn summarize(&self, messages: &[Message]) -> Result<SummaryOutput> {
        let points: Vec<String> = messages
            .iter()
            .filter(|m| m.role != Role::System && !m.content.trim().is_empty())
            .take(self.max_points)
            .map(|m| {
                let sentence = TextUtils::normalize_whitespace(TextUtils::first_sentence(&m.content)).into_owned();
                format!(
                    "- {}: {}",
                    m.role.as_str(),
                    TextUtils::truncate_with_ellipsis(&sentence, self.max_chars_per_point)
                )
            })
            .collect();

        if points.is_empty() {
            return Err(anyhow!("nothing to summarize in {} messages", messages.len()));
        }

        let key_topics = self.topics.extract_from_messages(messages);
        let mut text = format!("Summary of {} earlier messages", messages.len());
        if !key_topics.is_empty() {
            text.push_str(&format!(" (topics: {})", key_topics.join(", ")));
        }
        text.push('\n');
        text.push_str(&points.join("\n"));

        Ok(SummaryOutput {
            text,
            token_count: None,
            key_topics,
            decisions: extract_decisions(messages),
            key_findings: extract_findings(messages),
        })
    }
}

/// Deterministic feature-hashing embedder for offline use and tests
#[derive(Debug, Clone, Copy)]
pub struct HashingEmbedder {
    dimension: usize,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vector = vec![0.0f32; self.dimension];
        for word in text.split_whitespace() {
            let token = word
                .trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase();
            if token.is_empty() {
                continue;
            }
            let mut hasher = DefaultHasher::new();
            token.hash(&mut hasher);
            let hash = hasher.finish();
            let slot = (hash % self.dimension as u64) as usize;
            let sign = if (hash >> 63) & 1 == 0 { 1.0 } else { -1.0 };
            vector[slot] += sign;
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|v| *v /= norm);
        }
        Ok(vector)
    }
}
