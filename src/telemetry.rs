//! Structured logging for the bootstrap
//!
//! Logs go to stderr so they interleave with the application's own
//! output in `docker logs`, and never to stdout, which belongs to the
//! application after exec.
//!
//! ```text
//! handoff (root) ── tracing ──► stderr ──► container log driver
//!        │
//!        └─ exec ─► gunicorn (app) ──► stdout/stderr
//! ```

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LogFormat;

/// Default filter when RUST_LOG is unset
const DEFAULT_FILTER: &str = "info,handoff=debug";

/// Initialize the global subscriber
///
/// # Arguments
/// * `format` - human-readable text or one JSON object per line
///
/// # Example
/// ```ignore
/// init_logging(LogFormat::Text)?;
/// ```
pub fn init_logging(format: LogFormat) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Text => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .try_init()?,
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_current_span(true)
                    .with_span_list(false),
            )
            .try_init()?,
    }

    Ok(())
}

/// Create a new boot id (UUIDv7: time-sortable across restarts)
pub fn new_boot_id() -> String {
    uuid::Uuid::now_v7().to_string()
}
