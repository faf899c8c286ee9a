//! Helpers shared by the test suites.

/// Installs a debug-level tracing subscriber that writes to the test
/// harness's captured output. Safe to call from every test; only the first
/// call installs anything.
#[inline]
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}
