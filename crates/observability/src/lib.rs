//! Process-wide tracing/logging setup shared by every worker binary.

/// Initialize tracing for a worker process and log which role started.
///
/// Safe to call multiple times; subsequent calls become no-ops.
pub fn init(service: &str) {
    tracing::init(DEFAULT_DIRECTIVES);
    ::tracing::info!(service, "observability initialized");
}

/// Filter used when `RUST_LOG` is unset: pipeline at info, driver chatter muted.
pub const DEFAULT_DIRECTIVES: &str = "info,sqlx=warn,hyper=warn,reqwest=warn";

/// Tracing configuration (filters, layers).
pub mod tracing;
