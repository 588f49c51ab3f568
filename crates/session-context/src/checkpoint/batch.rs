//! Bulk create / restore / delete with per-item failure isolation

use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::locks::SessionLocks;
use super::storage::{Checkpoint, CheckpointSnapshot, CheckpointStorage};
use crate::context_engine::TokenEstimator;
use crate::error::{ContextError, Result};
use crate::memory::Message;
use crate::metrics;


pub type ProgressCallback = Arc<dyn Fn(usize, usize) + Send + Sync>;

/// Execution mode for a batch
#[derive(Clone, Default)]
pub struct BatchOptions {
    pub parallel: bool,
    /// Called with `(completed, total)` after every item, in completion order
    pub progress: Option<ProgressCallback>,
    pub cancel: Option<CancellationToken>,
}

impl BatchOptions {
    pub fn sequential() -> Self {
        Self::default()
    }

    pub fn parallel() -> Self {
        Self {
            parallel: true,
            ..Self::default()
        }
    }

    pub fn with_progress(mut self, progress: impl Fn(usize, usize) + Send + Sync + 'static) -> Self {
        self.progress = Some(Arc::new(progress));
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchFailure {
    pub id: String,
    pub error: String,
}

/// `total == success.len() + failed.len()` always holds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResult<T> {
    pub success: Vec<T>,
    pub failed: Vec<BatchFailure>,
    pub total: usize,
}

impl<T> BatchResult<T> {
    fn with_capacity(total: usize) -> Self {
        Self {
            success: Vec::with_capacity(total),
            failed: Vec::new(),
            total,
        }
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateCheckpointRequest {
    pub session_id: String,
    pub name: String,
    pub messages: Vec<Message>,
    #[serde(default)]
    pub summary: Option<String>,
}

impl CreateCheckpointRequest {
    pub fn new(session_id: impl Into<String>, name: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            session_id: session_id.into(),
            name: name.into(),
            messages,
            summary: None,
        }
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }
}

#[derive(Clone)]
pub struct BatchCheckpointOperations {
    storage: Arc<dyn CheckpointStorage>,
    locks: SessionLocks,
    estimator: Arc<dyn TokenEstimator>,
}

impl BatchCheckpointOperations {
    pub fn new(storage: Arc<dyn CheckpointStorage>, locks: SessionLocks, estimator: Arc<dyn TokenEstimator>) -> Self {
        Self {
            storage,
            locks,
            estimator,
        }
    }

    pub fn storage(&self) -> &Arc<dyn CheckpointStorage> {
        &self.storage
    }

    pub fn locks(&self) -> &SessionLocks {
        &self.locks
    }

    /// Single create under the session's write lock
    pub async fn create_checkpoint(&self, request: CreateCheckpointRequest) -> Result<Checkpoint> {
        let _guard = self.locks.lock(&request.session_id).await;

        let token_count = request
            .messages
            .iter()
            .map(|m| self.estimator.message_tokens(m))
            .fold(0u32, u32::saturating_add);
        let snapshot = CheckpointSnapshot::capture(
            request.session_id,
            request.name,
            &request.messages,
            token_count,
            request.summary,
        );
        self.storage
            .save_checkpoint(&snapshot.checkpoint, &snapshot.messages)
            .await?;

        metrics::inc_checkpoints_created();
        debug!(
            "Created checkpoint {} ({}) for session {} with {} messages",
            snapshot.checkpoint.id, snapshot.checkpoint.name, snapshot.checkpoint.session_id, snapshot.checkpoint.message_count
        );
        Ok(snapshot.checkpoint)
    }

    pub async fn restore_checkpoint(&self, id: &str) -> Result<CheckpointSnapshot> {
        self.storage
            .get_checkpoint(id)
            .await?
            .ok_or_else(|| ContextError::CheckpointNotFound(id.to_string()))
    }

    pub async fn delete_checkpoint(&self, id: &str) -> Result<()> {
        if self.storage.delete_checkpoint(id).await? {
            metrics::add_checkpoints_deleted(1);
            Ok(())
        } else {
            Err(ContextError::CheckpointNotFound(id.to_string()))
        }
    }

    /// Failures are reported under the request's name
    pub async fn create_batch(
        &self,
        requests: Vec<CreateCheckpointRequest>,
        options: &BatchOptions,
    ) -> BatchResult<Checkpoint> {
        let ops = self.clone();
        let result = run_batch(
            requests,
            |r: &CreateCheckpointRequest| r.name.clone(),
            move |request: CreateCheckpointRequest| {
                let ops = ops.clone();
                async move { ops.create_checkpoint(request).await }
            },
            options,
        )
        .await;
        info!(
            "Checkpoint create batch: {} created, {} failed",
            result.success.len(),
            result.failed.len()
        );
        result
    }

    pub async fn restore_batch(&self, ids: Vec<String>, options: &BatchOptions) -> BatchResult<CheckpointSnapshot> {
        let ops = self.clone();
        run_batch(
            ids,
            |id: &String| id.clone(),
            move |id: String| {
                let ops = ops.clone();
                async move { ops.restore_checkpoint(&id).await }
            },
            options,
        )
        .await
    }

    /// Successes are the deleted ids; unknown ids are failures
    pub async fn delete_batch(&self, ids: Vec<String>, options: &BatchOptions) -> BatchResult<String> {
        let ops = self.clone();
        let result = run_batch(
            ids,
            |id: &String| id.clone(),
            move |id: String| {
                let ops = ops.clone();
                async move { ops.delete_checkpoint(&id).await.map(|_| id) }
            },
            options,
        )
        .await;
        if !result.failed.is_empty() {
            warn!("Checkpoint delete batch: {} of {} failed", result.failed.len(), result.total);
        }
        result
    }

    /// Keep the `keep_count` newest checkpoints of a session and delete the rest.
    ///
    /// With `older_than_days`, only checkpoints older than that are considered,
    /// and `keep_count` of those survive alongside every newer one. The session
    /// lock is held from listing until the last delete.
    pub async fn cleanup_old_checkpoints(
        &self,
        session_id: &str,
        keep_count: usize,
        older_than_days: Option<u32>,
    ) -> Result<BatchResult<String>> {
        let _guard = self.locks.lock(session_id).await;

        let mut candidates = self.storage.list_checkpoints(session_id).await?;
        if let Some(days) = older_than_days {
            let cutoff = Utc::now() - chrono::Duration::days(i64::from(days));
            candidates.retain(|c| c.created_at < cutoff);
        }
        candidates.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let doomed: Vec<String> = candidates.into_iter().skip(keep_count).map(|c| c.id).collect();
        if doomed.is_empty() {
            return Ok(BatchResult::with_capacity(0));
        }

        let result = self.delete_batch(doomed, &BatchOptions::sequential()).await;
        info!(
            "Cleanup for session {} removed {} checkpoints (keep {})",
            session_id,
            result.success.len(),
            keep_count
        );
        Ok(result)
    }
}

/// Run `op` over every item, isolating failures per item.
///
/// Parallel mode spawns one task per item; a panicking task or one stopped by
/// the cancellation token is recorded as a failure.
async fn run_batch<I, T, K, F, Fut>(items: Vec<I>, key: K, op: F, options: &BatchOptions) -> BatchResult<T>
where
    I: Send + 'static,
    T: Send + 'static,
    K: Fn(&I) -> String,
    F: Fn(I) -> Fut,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    let total = items.len();
    let mut result = BatchResult::with_capacity(total);
    let cancel = options.cancel.clone().unwrap_or_else(CancellationToken::new);
    let mut completed = 0usize;

    let mut record = |result: &mut BatchResult<T>, id: String, outcome: std::result::Result<T, String>| {
        match outcome {
            Ok(value) => result.success.push(value),
            Err(error) => result.failed.push(BatchFailure { id, error }),
        }
        completed += 1;
        if let Some(progress) = &options.progress {
            progress(completed, total);
        }
    };

    if options.parallel {
        let mut pending = FuturesUnordered::new();
        for item in items {
            let id = key(&item);
            if cancel.is_cancelled() {
                record(&mut result, id, Err(ContextError::Cancelled.to_string()));
                continue;
            }
            let token = cancel.clone();
            let work = op(item);
            let handle = tokio::spawn(async move {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => Err(ContextError::Cancelled.to_string()),
                    outcome = work => outcome.map_err(|e| e.to_string()),
                }
            });
            pending.push(async move { (id, handle.await) });
        }

        while let Some((id, joined)) = pending.next().await {
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(e) if e.is_panic() => Err(format!("task panicked: {}", e)),
                Err(e) => Err(format!("task aborted: {}", e)),
            };
            record(&mut result, id, outcome);
        }
    } else {
        for item in items {
            let id = key(&item);
            let outcome = if cancel.is_cancelled() {
                Err(ContextError::Cancelled.to_string())
            } else {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(ContextError::Cancelled.to_string()),
                    outcome = op(item) => outcome.map_err(|e| e.to_string()),
                }
            };
            record(&mut result, id, outcome);
        }
    }

    result
}
