pub mod client;
pub mod response;
pub mod serialization;
pub mod transmission;
pub mod transmitter;

pub use client::{
    ClientConfig, ClientError, ConnectionStats, HttpClient, HttpResponse, TransmissionClient,
};
pub use response::{BackendResponse, ItemError, TransmissionOutcome};
pub use serialization::{
    ContentEncoding, JSON_STREAM_CONTENT_TYPE, SerializationError, SerializedBatch, Serializer,
};
pub use transmission::{SendResult, Transmission};
pub use transmitter::{SenderConfig, TransmissionSender};
