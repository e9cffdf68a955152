//! Logging setup for the demo server.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Default filter when `RUST_LOG` is unset.
const DEFAULT_FILTER: &str = "info,molt=debug,molt_server=debug";

/// Install a console subscriber.
///
/// Environment variables:
/// - `RUST_LOG`: Log filter (default: `info,molt=debug,molt_server=debug`)
pub fn init_local() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()?;

    tracing::debug!(pid = std::process::id(), "Telemetry initialized");

    Ok(())
}
