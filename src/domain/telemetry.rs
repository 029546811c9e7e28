use crate::sender::SerializationError;
use chrono::{DateTime, Utc};

/// A single observability record as the pipeline sees it.
///
/// The channel never looks inside an item: it buffers it, asks it to
/// sanitize itself once right before serialization, and writes whatever
/// bytes `serialize` produces as one line of the payload.
pub trait TelemetryItem: Send + 'static {
    /// When the observed event happened.
    fn timestamp(&self) -> DateTime<Utc>;

    /// Enforce field length and charset limits in place.
    fn sanitize(&mut self);

    /// Render the item as a single JSON record without a trailing newline.
    fn serialize(&self) -> Result<Vec<u8>, SerializationError>;
}

pub type BoxedItem = Box<dyn TelemetryItem>;

impl<T: TelemetryItem + ?Sized> TelemetryItem for Box<T> {
    fn timestamp(&self) -> DateTime<Utc> {
        (**self).timestamp()
    }

    fn sanitize(&mut self) {
        (**self).sanitize();
    }

    fn serialize(&self) -> Result<Vec<u8>, SerializationError> {
        (**self).serialize()
    }
}
