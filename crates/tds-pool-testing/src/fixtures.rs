//! Test fixture utilities.

use std::time::Duration;

/// Step used by [`settle`].
pub const SETTLE_STEP: Duration = Duration::from_millis(1);

/// Let spawned pool tasks (connects, resets, event handling) run.
///
/// Intended for tests on a paused clock: the sleep only completes after
/// every task that is ready to run has run.
pub async fn settle() {
    tokio::time::sleep(SETTLE_STEP).await;
}

/// Advance by `duration` of (usually virtual) time, then settle.
pub async fn settle_for(duration: Duration) {
    tokio::time::sleep(duration).await;
    settle().await;
}

/// Install a `tracing` subscriber that writes through the test harness.
///
/// Honors `RUST_LOG`; defaults to `tds_pool=debug`. Safe to call from
/// every test.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("tds_pool=debug"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
