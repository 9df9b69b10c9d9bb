//! Telemetry helpers for structured logging and tracing.

/// Initialize tracing for the broker. Embedders can install their own
/// subscriber first; this helper only installs an env-filtered `fmt`
/// subscriber when none is set, so calling it twice is harmless.
pub fn init_tracing() {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(true)
        .try_init();
    tracing::debug!("lab broker tracing initialized");
}
