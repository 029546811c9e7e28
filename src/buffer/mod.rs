pub mod telemetry_buffer;

pub use telemetry_buffer::{BufferSignal, TelemetryBuffer};
