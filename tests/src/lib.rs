//! Integration tests for the xlat crates, one module per crate.

#[cfg(test)]
mod backend;

/// Route `tracing` output through the test harness. `RUST_LOG`
/// selects the level; safe to call from every test.
#[cfg(test)]
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
