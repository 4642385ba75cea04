//! Shared test setup.

use std::sync::Once;

static INIT: Once = Once::new();

/// Install the `RUST_LOG`-filtered subscriber once per test binary so the
/// runtime's tracing output is visible when a test run asks for it.
pub fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_writer(std::io::stderr)
            .try_init();
    });
}
