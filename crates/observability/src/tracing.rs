//! Tracing/logging initialization.

use tracing_subscriber::EnvFilter;

/// Install the JSON subscriber.
///
/// `RUST_LOG` wins over `default_directives`. Safe to call multiple times
/// (subsequent calls are no-ops).
pub fn init(default_directives: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives));

    // One JSON object per line; workers run headless under a supervisor.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false)
        .with_current_span(true)
        .try_init();
}

#[cfg(test)]
mod tests {
    #[test]
    fn repeated_init_is_harmless() {
        super::init("debug");
        super::init("info");
        crate::init("test");
    }
}
