//! Process-wide `tracing` subscriber setup for binaries and tests.

use tracing_subscriber::EnvFilter;

/// Install a formatting subscriber.
///
/// `RUST_LOG` wins when set; otherwise `default_filter` (e.g. `"subsystem_scheduler=info"`) is
/// used. Calling this more than once is harmless: only the first subscriber is installed.
pub fn init(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .try_init();
}
