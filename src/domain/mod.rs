//! Domain layer for telemetry-channel.
//!
//! Contains the canonical types shared across all modules:
//! - `TelemetryItem`: The contract every record handed to the channel satisfies
//! - `Envelope`: A generic, schema-agnostic telemetry record
//! - `ChannelError`: Top-level error type

pub mod envelope;
pub mod error;
pub mod telemetry;

pub use envelope::{Envelope, EnvelopeData};
pub use error::ChannelError;
pub use telemetry::{BoxedItem, TelemetryItem};
