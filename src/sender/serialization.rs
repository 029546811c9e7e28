use crate::domain::TelemetryItem;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::io::{Read, Write};
use thiserror::Error;
use tracing::warn;

// Upper bound for the initial payload allocation
const MAX_SAFE_BUFFER_SIZE: usize = 16 * 1024 * 1024; // 16MB
const ESTIMATED_ITEM_SIZE: usize = 512; // bytes per item

pub const JSON_STREAM_CONTENT_TYPE: &str = "application/x-json-stream";

#[derive(Error, Debug)]
pub enum SerializationError {
    #[error("JSON serialization failed: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("IO error during serialization: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Item produced an invalid record: {0}")]
    InvalidRecord(String),
}

/// Content encoding applied to a transmission payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ContentEncoding {
    Gzip,
}

impl ContentEncoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentEncoding::Gzip => "gzip",
        }
    }
}

/// Output of serializing one flushed batch.
#[derive(Debug, Clone)]
pub struct SerializedBatch {
    pub payload: Vec<u8>,
    pub item_count: usize,
    pub skipped: usize,
}

impl SerializedBatch {
    pub fn is_empty(&self) -> bool {
        self.item_count == 0
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Serializer;

impl Serializer {
    pub fn new() -> Self {
        Self
    }

    /// Sanitizes and renders every item as one line of newline-delimited JSON.
    ///
    /// An item that fails to serialize, renders an empty record or renders a
    /// record containing a raw newline is skipped; the rest of the batch is
    /// kept in order. Line `i` of the payload is always item `i`.
    pub fn serialize<I>(&self, items: I) -> SerializedBatch
    where
        I: IntoIterator,
        I::Item: TelemetryItem,
    {
        let items = items.into_iter();
        let estimated = items.size_hint().0.saturating_mul(ESTIMATED_ITEM_SIZE);
        let mut payload = Vec::with_capacity(estimated.min(MAX_SAFE_BUFFER_SIZE));
        let mut item_count = 0;
        let mut skipped = 0;

        for mut item in items {
            item.sanitize();
            match item.serialize().and_then(check_record) {
                Ok(record) => {
                    payload.extend_from_slice(&record);
                    payload.push(b'\n');
                    item_count += 1;
                }
                Err(e) => {
                    skipped += 1;
                    warn!("Skipping telemetry item that failed to serialize: {e}");
                }
            }
        }

        SerializedBatch {
            payload,
            item_count,
            skipped,
        }
    }

    pub fn compress(&self, data: &[u8]) -> Result<Vec<u8>, SerializationError> {
        let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 4), Compression::fast());
        encoder.write_all(data)?;
        Ok(encoder.finish()?)
    }

    pub fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, SerializationError> {
        let mut decoder = GzDecoder::new(data);
        let mut decompressed = Vec::with_capacity(data.len() * 4);
        decoder.read_to_end(&mut decompressed)?;
        Ok(decompressed)
    }

    /// Recovers the individual records of a payload, decoding it first when
    /// it was compressed. Only the terminator after the last record is
    /// dropped, so positions match the backend's per-item indices.
    pub fn split_lines(
        &self,
        payload: &[u8],
        encoding: Option<ContentEncoding>,
    ) -> Result<Vec<Vec<u8>>, SerializationError> {
        let plain = match encoding {
            Some(ContentEncoding::Gzip) => self.decompress(payload)?,
            None => payload.to_vec(),
        };

        let body = plain.strip_suffix(b"\n").unwrap_or(&plain[..]);
        if body.is_empty() {
            return Ok(Vec::new());
        }
        Ok(body.split(|b| *b == b'\n').map(<[u8]>::to_vec).collect())
    }

    /// Builds a new payload holding only the records at `indices`, encoded
    /// the same way as the source payload. Out-of-range indices are ignored.
    pub fn select_lines(
        &self,
        payload: &[u8],
        encoding: Option<ContentEncoding>,
        indices: &[usize],
    ) -> Result<SerializedBatch, SerializationError> {
        let lines = self.split_lines(payload, encoding)?;
        let mut selected = Vec::new();
        let mut item_count = 0;

        let mut wanted: Vec<usize> = indices.to_vec();
        wanted.sort_unstable();
        wanted.dedup();

        for idx in wanted {
            if let Some(line) = lines.get(idx) {
                selected.extend_from_slice(line);
                selected.push(b'\n');
                item_count += 1;
            }
        }

        let payload = match encoding {
            Some(ContentEncoding::Gzip) if item_count > 0 => self.compress(&selected)?,
            _ => selected,
        };

        Ok(SerializedBatch {
            payload,
            item_count,
            skipped: 0,
        })
    }
}

fn check_record(record: Vec<u8>) -> Result<Vec<u8>, SerializationError> {
    if record.iter().all(u8::is_ascii_whitespace) {
        return Err(SerializationError::InvalidRecord(
            "record is empty".to_string(),
        ));
    }
    if record.contains(&b'\n') {
        return Err(SerializationError::InvalidRecord(
            "record contains a raw newline".to_string(),
        ));
    }
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};

    struct Line(&'static str);

    impl TelemetryItem for Line {
        fn timestamp(&self) -> DateTime<Utc> {
            Utc::now()
        }

        fn sanitize(&mut self) {}

        fn serialize(&self) -> Result<Vec<u8>, SerializationError> {
            if self.0 == "corrupt" {
                return Err(SerializationError::InvalidRecord("corrupt".to_string()));
            }
            Ok(self.0.as_bytes().to_vec())
        }
    }

    #[test]
    fn test_serialize_preserves_order() {
        let batch = Serializer::new().serialize(vec![Line("A"), Line("B"), Line("C")]);

        assert_eq!(batch.payload, b"A\nB\nC\n");
        assert_eq!(batch.item_count, 3);
        assert_eq!(batch.skipped, 0);
    }

    #[test]
    fn test_serialize_skips_corrupt_item() {
        let batch = Serializer::new().serialize(vec![Line("A"), Line("corrupt"), Line("C")]);

        assert_eq!(batch.payload, b"A\nC\n");
        assert_eq!(batch.item_count, 2);
        assert_eq!(batch.skipped, 1);
    }

    #[test]
    fn test_serialize_rejects_embedded_newline() {
        let batch = Serializer::new().serialize(vec![Line("A\nB")]);

        assert!(batch.is_empty());
        assert_eq!(batch.skipped, 1);
    }

    #[test]
    fn test_select_lines_from_compressed_payload() {
        let serializer = Serializer::new();
        let compressed = serializer.compress(b"a\nb\nc\nd\ne\n").unwrap();

        let selected = serializer
            .select_lines(&compressed, Some(ContentEncoding::Gzip), &[3, 1, 9])
            .unwrap();

        assert_eq!(selected.item_count, 2);
        assert_eq!(serializer.decompress(&selected.payload).unwrap(), b"b\nd\n");
    }

    #[test]
    fn test_empty_record_is_skipped_and_indices_stay_aligned() {
        let serializer = Serializer::new();
        let batch = serializer.serialize(vec![Line("A"), Line(""), Line("C")]);

        assert_eq!(batch.payload, b"A\nC\n");
        assert_eq!(batch.item_count, 2);
        assert_eq!(batch.skipped, 1);

        let selected = serializer.select_lines(&batch.payload, None, &[1]).unwrap();
        assert_eq!(selected.payload, b"C\n");
        assert_eq!(selected.item_count, 1);
    }

    #[test]
    fn test_split_lines_keeps_blank_positions() {
        let serializer = Serializer::new();

        let lines = serializer.split_lines(b"a\n\nc\n", None).unwrap();

        assert_eq!(lines, vec![b"a".to_vec(), Vec::new(), b"c".to_vec()]);
        let selected = serializer.select_lines(b"a\n\nc\n", None, &[2]).unwrap();
        assert_eq!(selected.payload, b"c\n");
        assert!(serializer.split_lines(b"", None).unwrap().is_empty());
    }
}
