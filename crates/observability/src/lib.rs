//! Tracing and logging setup shared by credit union binaries.

/// Initialize process-wide tracing with the format named by
/// `CREDITUNION_LOG_FORMAT` (JSON unless set to `pretty`).
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init() {
    tracing::init(tracing::LogFormat::from_env());
}

pub mod tracing;

pub use tracing::{LogFormat, UnknownLogFormat};
