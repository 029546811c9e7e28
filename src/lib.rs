#![warn(rust_2024_compatibility)]
// Specific pedantic lints enforced (not blanket allow):
#![deny(
    clippy::explicit_iter_loop,
    clippy::manual_let_else,
    clippy::semicolon_if_nothing_returned,
    clippy::inconsistent_struct_constructor
)]
// Noisy pedantic lints suppressed with justification:
#![allow(
    clippy::cast_lossless,            // Infallible casts are clear enough with `as`
    clippy::cast_possible_truncation, // Sizes and durations stay well within range
    clippy::cast_possible_wrap,       // Safe in non-negative contexts
    clippy::cast_precision_loss,      // Acceptable for metrics/display
    clippy::cast_sign_loss,           // Safe where values are known non-negative
    clippy::missing_errors_doc,       // Internal API
    clippy::module_name_repetitions,  // e.g. StorageError in storage module
    clippy::must_use_candidate,       // Annotated selectively on critical APIs
    clippy::new_without_default,      // Constructors with side effects stay explicit
    clippy::doc_markdown              // Internal API
)]

pub mod app;
pub mod buffer;
pub mod channel;
pub mod diagnostics;
pub mod domain;
pub mod reliability;
pub mod sender;

pub use channel::{ChannelConfig, DEFAULT_ENDPOINT, TelemetryChannel};
pub use diagnostics::{Diagnostics, DiagnosticsSnapshot, DropReason, EventSource, TransmissionEvent};
pub use domain::{BoxedItem, ChannelError, Envelope, EnvelopeData, TelemetryItem};
pub use reliability::{BackoffPolicy, StorageConfig, TransmissionStorage};
pub use sender::{
    ClientConfig, HttpClient, SenderConfig, Transmission, TransmissionClient, TransmissionOutcome,
    TransmissionSender,
};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
