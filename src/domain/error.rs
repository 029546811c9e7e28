use thiserror::Error;

/// Top-level error type for the transmission pipeline.
///
/// None of these ever reach a producer through `TelemetryChannel::send`; they
/// surface from construction, configuration and explicit lifecycle calls.
#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::app::ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] crate::reliability::StorageError),

    #[error("Client error: {0}")]
    Client(#[from] crate::sender::ClientError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] crate::sender::SerializationError),

    #[error("Channel is shut down")]
    Closed,

    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(std::time::Duration),
}
