// session-context/crates/session-context/src/config.rs

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

use crate::error::ContextError;

/// Budget policy for a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextConfig {
    pub max_tokens: u32,
    pub reserved_output_tokens: u32,
    pub compact_threshold: f64,
    pub prune_threshold: f64,
    pub truncate_threshold: f64,
    pub messages_to_keep: usize,
    pub buffer_percentage: f64,
    /// Appended messages between automatic checkpoints; 0 disables them
    pub checkpoint_interval: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_tokens: 128_000,
            reserved_output_tokens: 8_192,
            compact_threshold: 0.8,
            prune_threshold: 0.7,
            truncate_threshold: 0.95,
            messages_to_keep: 10,
            buffer_percentage: 0.05,
            checkpoint_interval: 20,
        }
    }
}

impl ContextConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let config = Self {
            max_tokens: env_or("CONTEXT_MAX_TOKENS", defaults.max_tokens)?,
            reserved_output_tokens: env_or("CONTEXT_RESERVED_OUTPUT_TOKENS", defaults.reserved_output_tokens)?,
            compact_threshold: env_or("CONTEXT_COMPACT_THRESHOLD", defaults.compact_threshold)?,
            prune_threshold: env_or("CONTEXT_PRUNE_THRESHOLD", defaults.prune_threshold)?,
            truncate_threshold: env_or("CONTEXT_TRUNCATE_THRESHOLD", defaults.truncate_threshold)?,
            messages_to_keep: env_or("CONTEXT_MESSAGES_TO_KEEP", defaults.messages_to_keep)?,
            buffer_percentage: env_or("CONTEXT_BUFFER_PERCENTAGE", defaults.buffer_percentage)?,
            checkpoint_interval: env_or("CONTEXT_CHECKPOINT_INTERVAL", defaults.checkpoint_interval)?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject threshold orderings and limits the evaluator cannot work with
    pub fn validate(&self) -> Result<(), ContextError> {
        if self.max_tokens == 0 {
            return Err(ContextError::InvalidConfig("max_tokens must be positive".into()));
        }
        if self.reserved_output_tokens >= self.max_tokens {
            return Err(ContextError::InvalidConfig(format!(
                "reserved_output_tokens ({}) must be below max_tokens ({})",
                self.reserved_output_tokens, self.max_tokens
            )));
        }
        let thresholds_ordered = self.prune_threshold > 0.0
            && self.prune_threshold <= self.compact_threshold
            && self.compact_threshold <= self.truncate_threshold
            && self.truncate_threshold <= 1.0;
        if !thresholds_ordered {
            return Err(ContextError::InvalidConfig(format!(
                "thresholds must satisfy 0 < prune ({}) <= compact ({}) <= truncate ({}) <= 1.0",
                self.prune_threshold, self.compact_threshold, self.truncate_threshold
            )));
        }
        if self.messages_to_keep == 0 {
            return Err(ContextError::InvalidConfig("messages_to_keep must be at least 1".into()));
        }
        if !(0.0..1.0).contains(&self.buffer_percentage) {
            return Err(ContextError::InvalidConfig(format!(
                "buffer_percentage ({}) must be within [0, 1)",
                self.buffer_percentage
            )));
        }
        Ok(())
    }

    /// Tokens the prompt may use before any threshold applies
    pub fn available_tokens(&self) -> u32 {
        self.max_tokens.saturating_sub(self.reserved_output_tokens).max(1)
    }

    /// Safety margin against estimation error
    pub fn buffer_tokens(&self) -> u32 {
        (self.buffer_percentage * self.max_tokens as f64).floor() as u32
    }

    /// Window a truncation has to fit into
    pub fn truncation_target(&self) -> u32 {
        self.max_tokens
            .saturating_sub(self.reserved_output_tokens)
            .saturating_sub(self.buffer_tokens())
    }

    pub fn print_config(&self) {
        info!("Context Configuration:");
        info!("- Max Tokens: {}", self.max_tokens);
        info!("- Reserved Output Tokens: {}", self.reserved_output_tokens);
        info!(
            "- Thresholds: prune {:.2}, compact {:.2}, truncate {:.2}",
            self.prune_threshold, self.compact_threshold, self.truncate_threshold
        );
        info!("- Messages To Keep: {}", self.messages_to_keep);
        info!("- Buffer: {:.1}%", self.buffer_percentage * 100.0);
        info!("- Checkpoint Interval: {}", self.checkpoint_interval);
    }
}

/// Retention policy for the background checkpoint cleaner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    pub cleanup_interval_seconds: u64,
    pub max_checkpoints_per_session: usize,
    pub max_checkpoint_age_days: Option<u32>,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            cleanup_interval_seconds: 3600,
            max_checkpoints_per_session: 10,
            max_checkpoint_age_days: None,
        }
    }
}

impl MaintenanceConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let max_checkpoint_age_days = match env::var("MAINTENANCE_MAX_CHECKPOINT_AGE_DAYS") {
            Ok(raw) if !raw.trim().is_empty() => Some(raw.trim().parse()?),
            _ => defaults.max_checkpoint_age_days,
        };

        let config = Self {
            cleanup_interval_seconds: env_or("MAINTENANCE_CLEANUP_INTERVAL_SECONDS", defaults.cleanup_interval_seconds)?,
            max_checkpoints_per_session: env_or("MAINTENANCE_MAX_CHECKPOINTS_PER_SESSION", defaults.max_checkpoints_per_session)?,
            max_checkpoint_age_days,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ContextError> {
        if self.cleanup_interval_seconds == 0 {
            return Err(ContextError::InvalidConfig("cleanup_interval_seconds must be positive".into()));
        }
        Ok(())
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_seconds)
    }
}

pub(crate) fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr + ToString,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw = env::var(key).unwrap_or_else(|_| default.to_string());
    raw.trim()
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid value for {}: {:?} ({})", key, raw, e))
}
