use super::config::{LogFormat, LogLevel};
use thiserror::Error;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Noisy dependencies held at `warn` whatever the configured level.
const QUIET_TARGETS: &[&str] = &["hyper", "hyper_util", "reqwest", "h2", "rustls"];

#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("Invalid log filter '{filter}': {source}")]
    InvalidFilter {
        filter: String,
        #[source]
        source: tracing_subscriber::filter::ParseError,
    },
    #[error("Failed to install global subscriber: {0}")]
    AlreadyInitialized(#[from] tracing_subscriber::util::TryInitError),
}

pub fn build_filter_string(level: LogLevel) -> String {
    let mut parts = Vec::with_capacity(QUIET_TARGETS.len() + 1);
    parts.push(level.as_str().to_string());
    parts.extend(QUIET_TARGETS.iter().map(|target| format!("{target}=warn")));
    parts.join(",")
}

/// Installs the global subscriber. `RUST_LOG`, when set, replaces the
/// configured level.
pub fn setup_logging(level: LogLevel, format: LogFormat) -> Result<(), LoggingError> {
    let filter_string = std::env::var(EnvFilter::DEFAULT_ENV)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| build_filter_string(level));

    let env_filter =
        EnvFilter::try_new(&filter_string).map_err(|source| LoggingError::InvalidFilter {
            filter: filter_string.clone(),
            source,
        })?;

    let registry = tracing_subscriber::registry().with(env_filter);
    match format {
        LogFormat::Compact => registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_level(true)
                    .with_writer(std::io::stderr)
                    .compact(),
            )
            .try_init()?,
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(false)
                    .with_writer(std::io::stderr),
            )
            .try_init()?,
    }

    Ok(())
}
