pub mod config;
pub mod forwarder;
pub mod logging_system;
pub mod shutdown;

pub use config::{Config, ConfigError, LogFormat, LogLevel, RetryConfig};
pub use forwarder::{EnvelopeDefaults, ForwardStats, forward_lines, parse_line};
pub use logging_system::{LoggingError, setup_logging};

use crate::channel::TelemetryChannel;
use anyhow::Context;
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub fn get_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

/// Runs the forwarder with an already loaded configuration.
pub async fn run(config: Config) -> anyhow::Result<()> {
    info!("Starting telemetry-forwarder v{}", get_version());
    info!(
        "Configuration: endpoint={}, buffer_capacity={}, sender_capacity={}, developer_mode={}",
        config.endpoint, config.buffer_capacity, config.sender_capacity, config.developer_mode
    );

    let channel_config = config.channel_config()?;
    let channel = TelemetryChannel::new(channel_config)
        .await
        .context("failed to start telemetry channel")?;

    let cancel = CancellationToken::new();
    let signals = shutdown::spawn_signal_handler(cancel.clone());
    let defaults = EnvelopeDefaults::detect(config.instrumentation_key.clone());

    let forwarded = forward_lines(
        BufReader::new(tokio::io::stdin()),
        &channel,
        &defaults,
        &cancel,
    )
    .await;
    cancel.cancel();
    let _ = signals.await;

    let shutdown = channel.shutdown().await;
    let snapshot = channel.diagnostics().snapshot();
    info!(
        "Forwarded {} items: {} transmissions succeeded, {} stored, {} items dropped",
        snapshot.items_received,
        snapshot.transmissions_succeeded,
        snapshot.transmissions_stored,
        snapshot.items_dropped
    );

    let metrics = channel.diagnostics().gather_text();
    if !metrics.is_empty() {
        info!("Final channel metrics:\n{metrics}");
    }

    let stats = forwarded.context("failed to read input")?;
    info!("Read {} lines, forwarded {}", stats.lines, stats.forwarded);
    shutdown.context("telemetry channel did not shut down cleanly")?;
    Ok(())
}

pub async fn main() -> anyhow::Result<()> {
    let config = Config::from_args_and_env(std::env::args_os())?;

    if let Err(e) = setup_logging(config.log_level, config.log_format) {
        eprintln!("Failed to initialize logging: {e}");
    }

    if let Err(e) = run(config).await {
        error!("telemetry-forwarder failed: {e:#}");
        return Err(e);
    }
    Ok(())
}
