//! Logging setup.
//!
//! Everything in kiln logs through `tracing`. The subscriber writes to
//! stderr and, when enabled in the config, appends the same events to
//! `<data_dir>/logs/kiln.log` so a failed build can be inspected later.

use crate::config::Config;
use std::fs::OpenOptions;
use std::sync::Mutex;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable holding the tracing filter.
pub const LOG_ENV: &str = "KILN_LOG";

/// Resolve the filter: `KILN_LOG`, then `RUST_LOG`, then the configured level.
fn env_filter(config: &Config) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level))
}

/// Initialize the global tracing subscriber.
///
/// Must be called once at startup. Returns an error if a subscriber is
/// already installed or the log file cannot be opened.
pub fn init(config: &Config) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_level(true)
        .with_writer(std::io::stderr);

    let file_layer = if config.log_to_file {
        let path = config.log_file();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Some(fmt::layer().with_ansi(false).with_target(true).with_writer(Mutex::new(file)))
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(env_filter(config))
        .with(stderr_layer)
        .with(file_layer)
        .try_init()?;

    tracing::debug!(log_to_file = config.log_to_file, "Logging initialized");
    Ok(())
}
