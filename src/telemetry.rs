//! Structured logging setup.
//!
//! A plain `tracing_subscriber::fmt` layer driven by `RUST_LOG`. No
//! OTLP/metrics exporter — dashboards are an external collaborator's
//! concern, not this crate's.

use tracing_subscriber::EnvFilter;

/// Install a global `tracing` subscriber reading `RUST_LOG`, defaulting
/// to `info` for this crate and `warn` for everything else.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,ralph_core=info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
