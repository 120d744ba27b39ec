//! Tracing subscriber setup.

use tracing_subscriber::EnvFilter;

use crate::config::{ApplicationConfig, LogFormat};
use crate::error::{AppResult, DaqError};

/// Install the global subscriber from `config`.
///
/// `RUST_LOG`, when set, replaces the configured level. Returns an error if a
/// subscriber is already installed or the filter does not parse.
pub fn init_from_config(config: &ApplicationConfig) -> AppResult<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(format!("{}={}", env!("CARGO_CRATE_NAME"), config.log_level))
            .map_err(|e| DaqError::Configuration(format!("Invalid log filter: {e}")))?,
    };

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = match config.log_format {
        LogFormat::Pretty => builder.with_target(false).try_init(),
        LogFormat::Json => builder.json().with_current_span(true).try_init(),
    };
    installed.map_err(|e| DaqError::Configuration(format!("Logging already initialized: {e}")))
}
