//! Tracing and logging setup shared by every ingestion process.

/// Initialize process-wide observability (tracing/logging).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init(tracing::LogFormat::from_env());
}

/// Route logs through the libtest capture so they show up only for failing tests.
pub fn init_for_tests() {
    tracing::init_test_writer();
}

/// Tracing configuration (filters, layers).
pub mod tracing;
