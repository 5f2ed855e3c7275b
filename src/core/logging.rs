//! Logging initialization.
//!
//! The codebase logs through the `log` facade; output goes through
//! `tracing-subscriber` with `RUST_LOG`-style filtering, bridged via
//! `tracing-log`.

use anyhow::Result;
use tracing_subscriber::EnvFilter;

/// Initialize the global logger.
///
/// Honors `RUST_LOG`; defaults to `info` for the crate and `warn` for
/// dependencies when unset.
pub fn init_logger() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,talkreg=info"));

    tracing_log::LogTracer::init()?;
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    Ok(())
}
