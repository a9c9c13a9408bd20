//! Structured logging setup.
//!
//! Logs go to stderr so that stdout stays free for reports.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the logging system
///
/// Set the `RUST_LOG` environment variable to control the level:
/// - `RUST_LOG=debug` shows every membership change
/// - `RUST_LOG=netsensor_topology=trace` for everything this crate emits
///
/// Defaults to INFO. Calling this when a global subscriber is already installed
/// (another subsystem, or a test harness) is not an error.
pub fn init_logging() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;

    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .compact();

    let init_result = tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .try_init();

    if let Err(e) = init_result {
        if e.to_string().contains("already been set") {
            return Ok(());
        }
        return Err(Box::new(e));
    }

    tracing::debug!("Logging initialized");
    Ok(())
}
