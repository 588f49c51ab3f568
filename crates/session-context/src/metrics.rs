use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Registry, TextEncoder};
use std::sync::OnceLock;

lazy_static! {
    static ref REGISTRY: Registry = Registry::new();
}
static COMPRESSIONS: OnceLock<IntCounterVec> = OnceLock::new();
static CHECKPOINTS_CREATED: OnceLock<IntCounter> = OnceLock::new();
static CHECKPOINTS_DELETED: OnceLock<IntCounter> = OnceLock::new();
static CLEANUP_PASSES: OnceLock<IntCounter> = OnceLock::new();
static PROMOTIONS: OnceLock<IntCounterVec> = OnceLock::new();
static ACTIVE_SESSIONS: OnceLock<IntGauge> = OnceLock::new();

/// Register collectors with the crate registry. Recording helpers are no-ops until this runs.
pub fn init_metrics() -> prometheus::Result<()> {
    if COMPRESSIONS.get().is_none() {
        let counter = IntCounterVec::new(
            prometheus::opts!("context_compressions_total", "Reductions applied per strategy"),
            &["strategy"],
        )?;
        REGISTRY.register(Box::new(counter.clone())).ok();
        let _ = COMPRESSIONS.set(counter);
    }
    if CHECKPOINTS_CREATED.get().is_none() {
        let counter = IntCounter::new("checkpoints_created_total", "Checkpoints written")?;
        REGISTRY.register(Box::new(counter.clone())).ok();
        let _ = CHECKPOINTS_CREATED.set(counter);
    }
    if CHECKPOINTS_DELETED.get().is_none() {
        let counter = IntCounter::new("checkpoints_deleted_total", "Checkpoints removed")?;
        REGISTRY.register(Box::new(counter.clone())).ok();
        let _ = CHECKPOINTS_DELETED.set(counter);
    }
    if CLEANUP_PASSES.get().is_none() {
        let counter = IntCounter::new("checkpoint_cleanup_passes_total", "Maintenance cleanup passes")?;
        REGISTRY.register(Box::new(counter.clone())).ok();
        let _ = CLEANUP_PASSES.set(counter);
    }
    if PROMOTIONS.get().is_none() {
        let counter = IntCounterVec::new(
            prometheus::opts!("memory_promotions_total", "Promotion attempts per outcome"),
            &["outcome"],
        )?;
        REGISTRY.register(Box::new(counter.clone())).ok();
        let _ = PROMOTIONS.set(counter);
    }
    if ACTIVE_SESSIONS.get().is_none() {
        let gauge = IntGauge::new("context_active_sessions", "Sessions with live state")?;
        REGISTRY.register(Box::new(gauge.clone())).ok();
        let _ = ACTIVE_SESSIONS.set(gauge);
    }
    Ok(())
}

pub fn inc_compression(strategy: &str) {
    if let Some(counter) = COMPRESSIONS.get() {
        counter.with_label_values(&[strategy]).inc();
    }
}

pub fn inc_checkpoints_created() {
    if let Some(counter) = CHECKPOINTS_CREATED.get() {
        counter.inc();
    }
}

pub fn add_checkpoints_deleted(count: usize) {
    if let Some(counter) = CHECKPOINTS_DELETED.get() {
        counter.inc_by(count as u64);
    }
}

pub fn inc_cleanup_pass() {
    if let Some(counter) = CLEANUP_PASSES.get() {
        counter.inc();
    }
}

pub fn inc_promotion(outcome: &str) {
    if let Some(counter) = PROMOTIONS.get() {
        counter.with_label_values(&[outcome]).inc();
    }
}

pub fn inc_sessions() {
    if let Some(gauge) = ACTIVE_SESSIONS.get() {
        gauge.inc();
    }
}

pub fn dec_sessions() {
    if let Some(gauge) = ACTIVE_SESSIONS.get() {
        gauge.dec();
    }
}

/// Prometheus text exposition of every registered collector
pub fn gather_metrics() -> prometheus::Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}
