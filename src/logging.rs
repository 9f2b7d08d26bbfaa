//! `[AMBIENT]` A small `tracing-subscriber` init helper for the demo
//! binary. The library itself never installs a global subscriber — it
//! only emits spans/events (§4's logging instrumentation points); that
//! decision belongs to the embedder, mirrored here for manual testing.

use tracing_subscriber::EnvFilter;

/// Installs a `fmt` subscriber filtered by `RUST_LOG`, defaulting to
/// `default_level` when unset. Grounded on the teacher's
/// `build_loglevel_filter_layer`, trimmed of the OpenTelemetry export
/// layer (no telemetry non-goal, §1).
pub fn init(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.to_string()));

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
