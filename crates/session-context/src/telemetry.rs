// session-context/crates/session-context/src/telemetry.rs

use tracing_subscriber::{fmt, EnvFilter};

/// Filter applied when `RUST_LOG` is unset
pub const DEFAULT_LOG_FILTER: &str = "session_context=info,warn";

/// Install the global fmt subscriber. Safe to call more than once; later calls are ignored.
pub fn init_tracing() {
    init_tracing_with(DEFAULT_LOG_FILTER);
}

pub fn init_tracing_with(default_filter: &str) {
    let env_filter = resolve_filter(std::env::var("RUST_LOG").ok(), default_filter);

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .with_target(true)
        .with_level(true)
        .compact()
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// Tracing plus the metrics registry, as a binary wants them at startup
pub fn init_observability() -> prometheus::Result<()> {
    init_tracing();
    crate::metrics::init_metrics()
}

fn resolve_filter(from_env: Option<String>, default_filter: &str) -> EnvFilter {
    from_env
        .filter(|raw| !raw.trim().is_empty())
        .and_then(|raw| EnvFilter::try_new(raw).ok())
        .unwrap_or_else(|| EnvFilter::new(default_filter))
}
