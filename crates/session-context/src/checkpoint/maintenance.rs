//! Background retention enforcement and storage statistics

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::batch::{BatchCheckpointOperations, BatchFailure};
use crate::config::MaintenanceConfig;
use crate::error::Result;
use crate::metrics;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub sessions_scanned: usize,
    pub checkpoints_deleted: usize,
    pub failures: Vec<BatchFailure>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageStats {
    pub total_checkpoints: usize,
    pub total_sessions: usize,
    pub total_tokens: u64,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

struct CleanupTask {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

pub struct CheckpointMaintenance {
    ops: BatchCheckpointOperations,
    config: MaintenanceConfig,
    task: Mutex<Option<CleanupTask>>,
}

impl CheckpointMaintenance {
    pub fn new(ops: BatchCheckpointOperations, config: MaintenanceConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            ops,
            config,
            task: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &MaintenanceConfig {
        &self.config
    }

    /// Spawn the periodic cleanup. Returns false when it was already running.
    pub async fn start_auto_cleanup(&self) -> bool {
        let mut task = self.task.lock().await;
        if task.as_ref().map_or(false, |t| !t.handle.is_finished()) {
            debug!("Auto cleanup already running");
            return false;
        }

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let ops = self.ops.clone();
        let config = self.config.clone();
        let period = config.cleanup_interval();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = run_cleanup(&ops, &config).await {
                            error!("Scheduled checkpoint cleanup failed: {}", e);
                        }
                    }
                }
            }
            debug!("Auto cleanup loop exited");
        });

        *task = Some(CleanupTask { handle, cancel });
        info!("Started checkpoint auto cleanup every {:?}", period);
        true
    }

    /// Stop the periodic cleanup and wait for an in-flight pass to finish.
    /// Returns false when nothing was running.
    pub async fn stop_auto_cleanup(&self) -> bool {
        let Some(task) = self.task.lock().await.take() else {
            return false;
        };
        task.cancel.cancel();
        if let Err(e) = task.handle.await {
            warn!("Auto cleanup task ended abnormally: {}", e);
        }
        info!("Stopped checkpoint auto cleanup");
        true
    }

    pub async fn is_running(&self) -> bool {
        self.task
            .lock()
            .await
            .as_ref()
            .map_or(false, |t| !t.handle.is_finished())
    }

    /// One retention pass over every session
    pub async fn perform_cleanup(&self) -> Result<CleanupReport> {
        run_cleanup(&self.ops, &self.config).await
    }

    /// Aggregate counts; reads only
    pub async fn get_storage_stats(&self) -> Result<StorageStats> {
        let all = self.ops.storage().list_all_checkpoints().await?;

        let sessions: BTreeSet<&str> = all.iter().map(|c| c.session_id.as_str()).collect();
        Ok(StorageStats {
            total_checkpoints: all.len(),
            total_sessions: sessions.len(),
            total_tokens: all.iter().map(|c| u64::from(c.token_count)).sum(),
            oldest: all.iter().map(|c| c.created_at).min(),
            newest: all.iter().map(|c| c.created_at).max(),
        })
    }
}

async fn run_cleanup(ops: &BatchCheckpointOperations, config: &MaintenanceConfig) -> Result<CleanupReport> {
    let all = ops.storage().list_all_checkpoints().await?;
    let sessions: BTreeSet<String> = all.into_iter().map(|c| c.session_id).collect();

    let mut report = CleanupReport {
        sessions_scanned: sessions.len(),
        ..Default::default()
    };
    for session_id in sessions {
        let outcome = ops
            .cleanup_old_checkpoints(
                &session_id,
                config.max_checkpoints_per_session,
                config.max_checkpoint_age_days,
            )
            .await;
        match outcome {
            Ok(result) => {
                report.checkpoints_deleted += result.success.len();
                report.failures.extend(result.failed);
            }
            Err(e) => {
                warn!("Cleanup of session {} failed: {}", session_id, e);
                report.failures.push(BatchFailure {
                    id: session_id,
                    error: e.to_string(),
                });
            }
        }
    }

    let released = ops.locks().prune_idle();
    if released > 0 {
        debug!("Released {} idle session locks", released);
    }
    metrics::inc_cleanup_pass();
    if report.checkpoints_deleted > 0 || !report.failures.is_empty() {
        info!(
            "Checkpoint cleanup: {} sessions, {} deleted, {} failures",
            report.sessions_scanned,
            report.checkpoints_deleted,
            report.failures.len()
        );
    } else {
        debug!("Checkpoint cleanup: {} sessions, nothing to delete", report.sessions_scanned);
    }
    Ok(report)
}

impl Drop for CheckpointMaintenance {
    fn drop(&mut self) {
        if let Ok(mut task) = self.task.try_lock() {
            if let Some(task) = task.take() {
                task.cancel.cancel();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::locks::SessionLocks;
    use crate::checkpoint::storage::{CheckpointSnapshot, CheckpointStorage, InMemoryCheckpointStorage};
    use crate::checkpoint::batch::{BatchOptions, CreateCheckpointRequest};
    use crate::checkpoint::storage::Checkpoint;
    use crate::context_engine::CharRatioEstimator;
    use crate::error::StorageError;
    use crate::memory::Message;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Duration;

    /// Wraps the in-memory backend with slow writes and an unreadable session
    struct TroubledStorage {
        inner: Arc<InMemoryCheckpointStorage>,
        unreadable: Option<&'static str>,
        save_delay: Duration,
    }

    #[async_trait]
    impl CheckpointStorage for TroubledStorage {
        async fn save_checkpoint(
            &self,
            checkpoint: &Checkpoint,
            messages: &[Message],
        ) -> std::result::Result<(), StorageError> {
            tokio::time::sleep(self.save_delay).await;
            self.inner.save_checkpoint(checkpoint, messages).await
        }

        async fn get_checkpoint(&self, id: &str) -> std::result::Result<Option<CheckpointSnapshot>, StorageError> {
            self.inner.get_checkpoint(id).await
        }

        async fn delete_checkpoint(&self, id: &str) -> std::result::Result<bool, StorageError> {
            self.inner.delete_checkpoint(id).await
        }

        async fn list_checkpoints(&self, session_id: &str) -> std::result::Result<Vec<Checkpoint>, StorageError> {
            if self.unreadable == Some(session_id) {
                return Err(StorageError::Backend("io".into()));
            }
            self.inner.list_checkpoints(session_id).await
        }

        async fn list_all_checkpoints(&self) -> std::result::Result<Vec<Checkpoint>, StorageError> {
            self.inner.list_all_checkpoints().await
        }
    }

    fn maintenance_over(storage: Arc<dyn CheckpointStorage>) -> CheckpointMaintenance {
        let ops = BatchCheckpointOperations::new(storage, SessionLocks::new(), Arc::new(CharRatioEstimator::default()));
        let config = MaintenanceConfig {
            cleanup_interval_seconds: 60,
            max_checkpoints_per_session: 2,
            max_checkpoint_age_days: None,
        };
        CheckpointMaintenance::new(ops, config).unwrap()
    }

    async fn seeded(per_session: &[(&str, usize)]) -> (Arc<InMemoryCheckpointStorage>, CheckpointMaintenance) {
        let storage = Arc::new(InMemoryCheckpointStorage::new());
        for (session, count) in per_session {
            for i in 0..*count {
                let mut snapshot = CheckpointSnapshot::capture(*session, format!("{}-{}", session, i), &[], 5, None);
                snapshot.checkpoint.created_at = Utc::now() - chrono::Duration::minutes(1000 - i as i64);
                storage.save_checkpoint(&snapshot.checkpoint, &[]).await.unwrap();
            }
        }
        let ops = BatchCheckpointOperations::new(
            storage.clone(),
            SessionLocks::new(),
            Arc::new(CharRatioEstimator::default()),
        );
        let config = MaintenanceConfig {
            cleanup_interval_seconds: 60,
            max_checkpoints_per_session: 2,
            max_checkpoint_age_days: None,
        };
        (storage, CheckpointMaintenance::new(ops, config).unwrap())
    }

    #[tokio::test]
    async fn test_perform_cleanup_trims_every_session_and_is_idempotent() {
        let (storage, maintenance) = seeded(&[("a", 5), ("b", 1), ("c", 3)]).await;

        let first = maintenance.perform_cleanup().await.unwrap();
        assert_eq!(first.sessions_scanned, 3);
        assert_eq!(first.checkpoints_deleted, 4);
        assert_eq!(storage.list_checkpoints("a").await.unwrap().len(), 2);
        assert_eq!(storage.list_checkpoints("b").await.unwrap().len(), 1);

        let second = maintenance.perform_cleanup().await.unwrap();
        assert_eq!(second.checkpoints_deleted, 0);
    }

    #[tokio::test]
    async fn test_failing_session_does_not_stop_the_pass() {
        let (inner, _) = seeded(&[("a", 5), ("b", 5)]).await;
        let maintenance = maintenance_over(Arc::new(TroubledStorage {
            inner: inner.clone(),
            unreadable: Some("a"),
            save_delay: Duration::ZERO,
        }));

        let report = maintenance.perform_cleanup().await.unwrap();
        assert_eq!(report.sessions_scanned, 2);
        assert_eq!(report.checkpoints_deleted, 3);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].id, "a");
        assert!(report.failures[0].error.contains("io"));
        assert_eq!(inner.list_checkpoints("a").await.unwrap().len(), 5);
        assert_eq!(inner.list_checkpoints("b").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_cleanup_releases_idle_session_locks() {
        let (_, maintenance) = seeded(&[("a", 3), ("b", 3), ("c", 1)]).await;
        maintenance.perform_cleanup().await.unwrap();
        assert!(maintenance.ops.locks().is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_racing_parallel_creates() {
        let (inner, _) = seeded(&[("s1", 3)]).await;
        let maintenance = maintenance_over(Arc::new(TroubledStorage {
            inner: inner.clone(),
            unreadable: None,
            save_delay: Duration::from_millis(5),
        }));
        let ops = maintenance.ops.clone();
        let requests = (0..6)
            .map(|i| CreateCheckpointRequest::new("s1", format!("new-{}", i), vec![Message::user("hi")]))
            .collect();

        let batch_options = BatchOptions::parallel();
        let (created, report) = tokio::join!(
            ops.create_batch(requests, &batch_options),
            maintenance.perform_cleanup()
        );
        let report = report.unwrap();
        assert_eq!(created.success.len(), 6);
        assert!(report.failures.is_empty());

        // every create either survived or was removed by the pass, nothing else changed
        let remaining = inner.list_checkpoints("s1").await.unwrap();
        assert_eq!(remaining.len(), 3 + 6 - report.checkpoints_deleted);
        let stored: HashSet<&str> = remaining.iter().map(|c| c.id.as_str()).collect();
        let missing_creates = created.success.iter().filter(|c| !stored.contains(c.id.as_str())).count();
        assert!(missing_creates <= report.checkpoints_deleted);

        let settled = maintenance.perform_cleanup().await.unwrap();
        assert!(settled.failures.is_empty());
        assert_eq!(inner.list_checkpoints("s1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_storage_stats_are_read_only() {
        let (storage, maintenance) = seeded(&[("a", 3), ("b", 2)]).await;
        let stats = maintenance.get_storage_stats().await.unwrap();
        assert_eq!(stats.total_checkpoints, 5);
        assert_eq!(stats.total_sessions, 2);
        assert_eq!(stats.total_tokens, 25);
        assert!(stats.oldest.unwrap() < stats.newest.unwrap());
        assert_eq!(storage.len(), 5);
    }

    #[tokio::test]
    async fn test_empty_storage_stats() {
        let (_, maintenance) = seeded(&[]).await;
        let stats = maintenance.get_storage_stats().await.unwrap();
        assert_eq!(stats, StorageStats::default());
    }

    #[tokio::test]
    async fn test_start_stop_idempotent() {
        let (_, maintenance) = seeded(&[]).await;
        assert!(maintenance.start_auto_cleanup().await);
        assert!(!maintenance.start_auto_cleanup().await);
        assert!(maintenance.is_running().await);

        assert!(maintenance.stop_auto_cleanup().await);
        assert!(!maintenance.stop_auto_cleanup().await);
        assert!(!maintenance.is_running().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_runs_cleanup() {
        let (storage, maintenance) = seeded(&[("a", 4)]).await;
        maintenance.start_auto_cleanup().await;

        tokio::time::sleep(Duration::from_secs(61)).await;
        // let the spawned pass finish
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(storage.list_checkpoints("a").await.unwrap().len(), 2);
        maintenance.stop_auto_cleanup().await;
    }

    #[test]
    fn test_invalid_config_rejected() {
        let ops = BatchCheckpointOperations::new(
            Arc::new(InMemoryCheckpointStorage::new()),
            SessionLocks::new(),
            Arc::new(CharRatioEstimator::default()),
        );
        let config = MaintenanceConfig {
            cleanup_interval_seconds: 0,
            ..Default::default()
        };
        assert!(CheckpointMaintenance::new(ops, config).is_err());
    }
}
