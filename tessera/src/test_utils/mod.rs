use crate::runtime::{Builder, Executor};
use std::sync::Once;
use tracing_subscriber::{EnvFilter, fmt};

mod tracker;
pub(crate) use tracker::Tracker;

static INIT: Once = Once::new();

/// Installs a test-writer subscriber once per process. Filter with
/// `RUST_LOG=tessera=trace`.
pub(crate) fn init_tracing() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        // Another test binary harness may already own the global default.
        let _ = fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_target(true)
            .try_init();
    });
}

/// Executor with `workers` threads and otherwise default settings.
pub(crate) fn executor(workers: usize) -> Executor {
    init_tracing();
    Builder::new()
        .worker_threads(workers)
        .try_build()
        .expect("failed to build executor")
}
