//! Tracing and logging (shared setup).

/// Initialize process-wide observability (tracing/logging).
///
/// `verbose` lowers the default level to `debug`; `RUST_LOG` still wins.
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init(verbose: bool) {
    tracing::init(verbose);
}

/// Tracing configuration (filters, layers).
pub mod tracing;
