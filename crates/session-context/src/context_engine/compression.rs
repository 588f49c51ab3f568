//! Prune, compact and truncate over a session's live message window

use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::collaborators::{Summarizer, SummaryOutput};
use super::token_budget::{ReductionStrategy, TokenBudgetEvaluator, UsageStatus};
use crate::config::ContextConfig;
use crate::error::{ContextError, Result};
use crate::memory::{CompressionType, Message, MessageRange, Role};
use crate::metrics;
use crate::utils::TopicExtractor;

const DEFAULT_SUMMARIZER_TIMEOUT: Duration = Duration::from_secs(30);

/// Higher survives pruning longer
pub fn message_priority(role: Role) -> u8 {
    match role {
        Role::System => 3,
        Role::Tool => 2,
        Role::Assistant => 1,
        Role::User => 0,
    }
}

#[derive(Debug, Clone)]
pub struct PruneResult {
    pub original_count: usize,
    pub messages: Vec<Message>,
    /// Archived copies of what was dropped, marked pruned
    pub removed: Vec<Message>,
    pub removed_count: usize,
    pub removed_tokens: u32,
}

#[derive(Debug, Clone)]
pub struct CompressionResult {
    pub original_count: usize,
    /// Live window with the summary in place of the range
    pub messages: Vec<Message>,
    pub summary: Message,
    /// Replaced originals, each pointing at the summary through `condense_parent`
    pub archived: Vec<Message>,
    /// Net shrink of the window: range length minus the summary
    pub removed_count: usize,
    pub saved_tokens: u32,
    pub message_range: MessageRange,
    pub key_topics: Vec<String>,
    pub decisions: Vec<String>,
    pub key_findings: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct TruncationResult {
    pub original_count: usize,
    /// Live window including the marker
    pub messages: Vec<Message>,
    pub marker_index: usize,
    /// Oldest cut message; the marker took its slot
    pub displaced: Message,
    /// The other cut messages
    pub removed: Vec<Message>,
    /// Length of `removed`, so the displaced message is not counted.
    /// `messages.len() + removed_count == original_count` always holds;
    /// use `truncated_count()` for every message the cut took out.
    pub removed_count: usize,
    /// Tokens of every cut message, displaced one included
    pub removed_tokens: u32,
}

impl TruncationResult {
    pub fn marker(&self) -> Option<&Message> {
        self.messages.get(self.marker_index)
    }

    /// Every message the cut took out of the window
    pub fn truncated_count(&self) -> usize {
        self.removed_count + 1
    }
}

/// Outcome of acting on an evaluator verdict
#[derive(Debug, Clone)]
pub enum Reduction {
    Pruned(PruneResult),
    Compacted(CompressionResult),
    Truncated(TruncationResult),
    Unchanged,
}

impl Reduction {
    pub fn strategy(&self) -> Option<ReductionStrategy> {
        match self {
            Reduction::Pruned(_) => Some(ReductionStrategy::Prune),
            Reduction::Compacted(_) => Some(ReductionStrategy::Compact),
            Reduction::Truncated(_) => Some(ReductionStrategy::Truncate),
            Reduction::Unchanged => None,
        }
    }

    pub fn messages(&self) -> Option<&[Message]> {
        match self {
            Reduction::Pruned(r) => Some(&r.messages),
            Reduction::Compacted(r) => Some(&r.messages),
            Reduction::Truncated(r) => Some(&r.messages),
            Reduction::Unchanged => None,
        }
    }

    /// Messages that left the window, for audit and undo
    pub fn archived(&self) -> Vec<Message> {
        match self {
            Reduction::Pruned(r) => r.removed.clone(),
            Reduction::Compacted(r) => r.archived.clone(),
            Reduction::Truncated(r) => {
                let mut out = Vec::with_capacity(r.removed.len() + 1);
                out.push(r.displaced.clone());
                out.extend(r.removed.iter().cloned());
                out
            }
            Reduction::Unchanged => Vec::new(),
        }
    }
}

pub struct CompressionEngine {
    evaluator: TokenBudgetEvaluator,
    summarizer: Arc<dyn Summarizer>,
    summarizer_timeout: Duration,
    topics: TopicExtractor,
}

impl CompressionEngine {
    pub fn new(evaluator: TokenBudgetEvaluator, summarizer: Arc<dyn Summarizer>) -> Self {
        Self {
            evaluator,
            summarizer,
            summarizer_timeout: DEFAULT_SUMMARIZER_TIMEOUT,
            topics: TopicExtractor::default(),
        }
    }

    pub fn with_summarizer_timeout(mut self, timeout: Duration) -> Self {
        self.summarizer_timeout = timeout;
        self
    }

    pub fn evaluator(&self) -> &TokenBudgetEvaluator {
        &self.evaluator
    }

    pub fn config(&self) -> &ContextConfig {
        self.evaluator.config()
    }

    fn tail_start(&self, len: usize) -> usize {
        len.saturating_sub(self.config().messages_to_keep)
    }

    /// Drop low-priority messages until the window is back under the prune threshold.
    ///
    /// The newest `messages_to_keep`, system messages, truncation markers and
    /// summaries are never candidates.
    pub fn prune(&self, messages: &[Message]) -> PruneResult {
        let original_count = messages.len();
        let tail_start = self.tail_start(original_count);
        let target = self.evaluator.prune_target();
        let mut current = self.evaluator.active_tokens(messages);

        let mut candidates: Vec<usize> = messages
            .iter()
            .enumerate()
            .filter(|(i, m)| {
                *i < tail_start
                    && m.is_active()
                    && m.role != Role::System
                    && !m.is_truncation_marker
                    && !m.is_condense_anchor()
            })
            .map(|(i, _)| i)
            .collect();
        candidates.sort_by_key(|&i| (message_priority(messages[i].role), i));

        let mut drop = vec![false; original_count];
        let mut removed_tokens = 0u32;
        for index in candidates {
            if current <= target {
                break;
            }
            let tokens = self.evaluator.message_tokens(&messages[index]);
            current = current.saturating_sub(tokens);
            removed_tokens = removed_tokens.saturating_add(tokens);
            drop[index] = true;
        }

        let mut retained = Vec::with_capacity(original_count);
        let mut removed = Vec::new();
        for (message, dropped) in messages.iter().zip(drop) {
            if dropped {
                let mut archived = message.clone();
                archived.mark_compressed(CompressionType::Pruned);
                removed.push(archived);
            } else {
                retained.push(message.clone());
            }
        }

        debug!(
            "Prune removed {} of {} messages ({} tokens), window now {} tokens",
            removed.len(),
            original_count,
            removed_tokens,
            current
        );

        PruneResult {
            original_count,
            removed_count: removed.len(),
            messages: retained,
            removed,
            removed_tokens,
        }
    }

    /// Replace a contiguous range with one summary message.
    ///
    /// `range` indexes the current window. With no explicit range, the oldest
    /// run of at least two compactable messages ahead of the retained tail is used.
    /// The recorded `message_range` is in original-log positions.
    pub async fn compact(&self, messages: &[Message], range: Option<Range<usize>>) -> Result<CompressionResult> {
        let range = match range {
            Some(range) => {
                self.check_range(messages, &range)?;
                range
            }
            None => self.select_compaction_range(messages).ok_or_else(|| {
                ContextError::NothingToReduce(format!(
                    "no run of two or more compactable messages among {}",
                    messages.len()
                ))
            })?,
        };

        if !self.summarizer.is_available() {
            return Err(ContextError::Summarizer("no summarization service configured".into()));
        }

        let slice = &messages[range.clone()];
        let output = self.summarize_with_timeout(slice).await?;
        if output.text.trim().is_empty() {
            return Err(ContextError::Summarizer("summarizer returned an empty summary".into()));
        }

        let range_tokens = slice
            .iter()
            .map(|m| self.evaluator.message_tokens(m))
            .fold(0u32, u32::saturating_add);
        let summary_tokens = output
            .token_count
            .unwrap_or_else(|| self.evaluator.estimator().estimate(&output.text));

        let saved_tokens = if summary_tokens > range_tokens {
            warn!(
                "Summary of {} messages is larger than its source ({} > {} tokens); recording zero savings",
                slice.len(),
                summary_tokens,
                range_tokens
            );
            0
        } else {
            range_tokens - summary_tokens
        };

        let condense_id = uuid::Uuid::new_v4().to_string();
        let mut summary = Message::new(Role::Assistant, output.text.clone()).with_tokens(summary_tokens);
        if let Some(last) = slice.last() {
            summary.timestamp = last.timestamp;
        }
        summary.condense_id = Some(condense_id.clone());
        summary.mark_compressed(CompressionType::Compacted);

        let archived: Vec<Message> = slice
            .iter()
            .map(|m| {
                let mut original = m.clone();
                original.condense_parent = Some(condense_id.clone());
                original.mark_compressed(CompressionType::Compacted);
                original
            })
            .collect();

        let mut retained = Vec::with_capacity(messages.len() - range.len() + 1);
        retained.extend_from_slice(&messages[..range.start]);
        retained.push(summary.clone());
        retained.extend_from_slice(&messages[range.end..]);

        let key_topics = if output.key_topics.is_empty() {
            self.topics.extract_from_messages(slice)
        } else {
            output.key_topics
        };

        info!(
            "Compacted messages {}..{} into summary {} (saved {} tokens)",
            range.start, range.end, condense_id, saved_tokens
        );

        Ok(CompressionResult {
            original_count: messages.len(),
            removed_count: range.len() - 1,
            messages: retained,
            summary,
            archived,
            saved_tokens,
            message_range: original_range(slice, &range),
            key_topics,
            decisions: output.decisions,
            key_findings: output.key_findings,
        })
    }

    async fn summarize_with_timeout(&self, slice: &[Message]) -> Result<SummaryOutput> {
        match tokio::time::timeout(self.summarizer_timeout, self.summarizer.summarize(slice)).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(ContextError::Summarizer(e.to_string())),
            Err(_) => Err(ContextError::Summarizer(format!(
                "summarizer timed out after {:?}",
                self.summarizer_timeout
            ))),
        }
    }

    fn is_compactable(message: &Message) -> bool {
        message.is_active()
            && message.role != Role::System
            && !message.is_truncation_marker
            && !message.is_condense_anchor()
    }

    fn select_compaction_range(&self, messages: &[Message]) -> Option<Range<usize>> {
        let tail_start = self.tail_start(messages.len());
        let mut start = None;
        for (i, message) in messages[..tail_start].iter().enumerate() {
            match (Self::is_compactable(message), start) {
                (true, None) => start = Some(i),
                (false, Some(s)) if i - s >= 2 => return Some(s..i),
                (false, Some(_)) => start = None,
                _ => {}
            }
        }
        start.filter(|s| tail_start - s >= 2).map(|s| s..tail_start)
    }

    fn check_range(&self, messages: &[Message], range: &Range<usize>) -> Result<()> {
        let invalid = |reason: &str| ContextError::InvalidRange {
            start: range.start,
            end: range.end,
            reason: reason.to_string(),
        };

        if range.end > messages.len() || range.start >= range.end {
            return Err(invalid("range is outside the message log"));
        }
        if range.len() < 2 {
            return Err(invalid("a compaction needs at least two messages"));
        }
        if range.end > self.tail_start(messages.len()) {
            return Err(invalid("range overlaps the retained tail"));
        }
        if !messages[range.clone()].iter().all(Self::is_compactable) {
            return Err(invalid("range contains system messages, markers or summaries"));
        }
        Ok(())
    }

    /// Cut the oldest messages until the window fits `max_tokens - reserved - buffer`.
    ///
    /// One marker replaces the cut run at the position of its oldest message.
    pub fn truncate(&self, messages: &[Message]) -> Result<TruncationResult> {
        let original_count = messages.len();
        let target = self.config().truncation_target();
        let total = self.evaluator.active_tokens(messages);
        if total <= target {
            return Err(ContextError::NothingToReduce(format!(
                "window of {} tokens already fits {}",
                total, target
            )));
        }

        let tail_start = self.tail_start(original_count);
        let candidates: Vec<usize> = messages[..tail_start]
            .iter()
            .enumerate()
            .filter(|(_, m)| m.is_active() && m.role != Role::System && !m.is_truncation_marker)
            .map(|(i, _)| i)
            .collect();
        if candidates.is_empty() {
            return Err(ContextError::NothingToReduce(
                "every message ahead of the retained tail is protected".into(),
            ));
        }

        let mut cut_tokens = 0u32;
        let mut cut_count = 0usize;
        let mut fits = false;
        for &index in &candidates {
            cut_tokens = cut_tokens.saturating_add(self.evaluator.message_tokens(&messages[index]));
            cut_count += 1;
            let marker_tokens = self.evaluator.estimator().estimate(&marker_text(cut_count));
            if total.saturating_sub(cut_tokens).saturating_add(marker_tokens) <= target {
                fits = true;
                break;
            }
        }
        if !fits {
            warn!(
                "Truncation cut all {} eligible messages but the window still exceeds {} tokens",
                cut_count, target
            );
        }

        let cut = &candidates[..cut_count];
        let marker_index = cut[0];
        let truncation_id = uuid::Uuid::new_v4().to_string();
        let marker_content = marker_text(cut_count);
        let marker_tokens = self.evaluator.estimator().estimate(&marker_content);
        let mut marker = Message::new(Role::System, marker_content).with_tokens(marker_tokens);
        marker.timestamp = messages[marker_index].timestamp;
        marker.is_truncation_marker = true;
        marker.truncation_id = Some(truncation_id.clone());

        let mut retained = Vec::with_capacity(original_count - cut_count + 1);
        let mut displaced = None;
        let mut removed = Vec::with_capacity(cut_count.saturating_sub(1));
        let mut is_cut = vec![false; original_count];
        for &i in cut {
            is_cut[i] = true;
        }
        for (i, message) in messages.iter().enumerate() {
            if !is_cut[i] {
                retained.push(message.clone());
                continue;
            }
            let mut gone = message.clone();
            gone.truncation_parent = Some(truncation_id.clone());
            gone.mark_compressed(CompressionType::Truncated);
            if i == marker_index {
                retained.push(marker.clone());
                displaced = Some(gone);
            } else {
                removed.push(gone);
            }
        }

        let displaced = displaced.ok_or_else(|| {
            ContextError::NothingToReduce("truncation selected no messages".into())
        })?;

        info!(
            "Truncated {} messages ({} tokens) behind marker {}",
            cut_count, cut_tokens, truncation_id
        );

        Ok(TruncationResult {
            original_count,
            removed_count: removed.len(),
            messages: retained,
            marker_index,
            displaced,
            removed,
            removed_tokens: cut_tokens,
        })
    }

    /// Run the strategy a verdict asks for. A failed compaction falls back to pruning.
    pub async fn reduce(&self, status: &UsageStatus, messages: &[Message]) -> Result<Reduction> {
        let reduction = match status.requested_strategy() {
            None => Reduction::Unchanged,
            Some(ReductionStrategy::Truncate) => match self.truncate(messages) {
                Ok(result) => Reduction::Truncated(result),
                Err(ContextError::NothingToReduce(reason)) => {
                    debug!("Truncation skipped: {}", reason);
                    Reduction::Unchanged
                }
                Err(e) => return Err(e),
            },
            Some(ReductionStrategy::Compact) => match self.compact(messages, None).await {
                Ok(result) => Reduction::Compacted(result),
                Err(e) if e.is_recoverable() => {
                    warn!("Compaction unavailable ({}), falling back to prune", e);
                    self.prune_or_unchanged(messages)
                }
                Err(e) => return Err(e),
            },
            Some(ReductionStrategy::Prune) => self.prune_or_unchanged(messages),
        };

        if let Some(strategy) = reduction.strategy() {
            metrics::inc_compression(strategy.as_str());
        }
        Ok(reduction)
    }

    fn prune_or_unchanged(&self, messages: &[Message]) -> Reduction {
        let result = self.prune(messages);
        if result.removed_count == 0 {
            Reduction::Unchanged
        } else {
            Reduction::Pruned(result)
        }
    }
}

/// Original-log span of a compacted run, or its window indices when the
/// messages were never stamped with positions
fn original_range(slice: &[Message], window: &Range<usize>) -> MessageRange {
    match (slice.first().and_then(|m| m.position), slice.last().and_then(|m| m.position)) {
        (Some(start), Some(last)) if last >= start => MessageRange { start, end: last + 1 },
        _ => MessageRange {
            start: window.start,
            end: window.end,
        },
    }
}

fn marker_text(count: usize) -> String {
    format!(
        "[{} earlier message{} truncated to fit the context window]",
        count,
        if count == 1 { "" } else { "s" }
    )
}
