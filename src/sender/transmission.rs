use super::client::{HttpResponse, TransmissionClient};
use super::response::{TransmissionOutcome, classify};
use super::serialization::{ContentEncoding, JSON_STREAM_CONTENT_TYPE};
use bytes::Bytes;
use chrono::{DateTime, SubsecRound, Utc};
use std::time::{Duration, Instant};
use tracing::debug;
use url::Url;
use uuid::Uuid;

/// One network-bound batch of serialized telemetry.
///
/// The payload never changes after construction. A payload that comes back
/// from storage is re-wrapped with its original id and creation time so that
/// it keeps its place in the storage queue.
#[derive(Debug, Clone, PartialEq)]
pub struct Transmission {
    pub(crate) id: String,
    pub(crate) endpoint: Url,
    pub(crate) payload: Bytes,
    pub(crate) content_type: String,
    pub(crate) content_encoding: Option<ContentEncoding>,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) item_count: usize,
    pub(crate) attempt: u32,
}

/// Result of a single send attempt.
#[derive(Debug, Clone)]
pub struct SendResult {
    pub outcome: TransmissionOutcome,
    pub latency: Duration,
}

impl Transmission {
    pub fn new(
        endpoint: Url,
        payload: impl Into<Bytes>,
        content_encoding: Option<ContentEncoding>,
        item_count: usize,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            endpoint,
            payload: payload.into(),
            content_type: JSON_STREAM_CONTENT_TYPE.to_string(),
            content_encoding,
            // Storage keeps microseconds; a restored copy must compare equal.
            created_at: Utc::now().trunc_subsecs(6),
            item_count,
            attempt: 0,
        }
    }

    /// A follow-up transmission for part of this one's items.
    pub fn resubmission(&self, payload: impl Into<Bytes>, item_count: usize) -> Self {
        Self {
            attempt: self.attempt.saturating_add(1),
            ..Self::new(
                self.endpoint.clone(),
                payload,
                self.content_encoding,
                item_count,
            )
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn content_encoding(&self) -> Option<ContentEncoding> {
        self.content_encoding
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn item_count(&self) -> usize {
        self.item_count
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn size(&self) -> usize {
        self.payload.len()
    }

    /// File name stem under which this transmission is stored. Sorting stems
    /// lexicographically sorts transmissions by creation time.
    pub fn storage_key(&self) -> String {
        let micros = self.created_at.timestamp_micros().max(0);
        format!("{micros:020}-{}", self.id)
    }

    /// Posts the payload and classifies the response. Never fails: transport
    /// errors and timeouts become transient outcomes.
    pub async fn send(&self, client: &dyn TransmissionClient, timeout: Duration) -> SendResult {
        let start = Instant::now();

        debug!(
            "Sending transmission {} ({} items, {} bytes, attempt {})",
            self.id,
            self.item_count,
            self.payload.len(),
            self.attempt + 1
        );

        let outcome = match tokio::time::timeout(timeout, client.post(self)).await {
            Ok(Ok(response)) => self.classify(&response),
            Ok(Err(e)) if e.is_transient() => TransmissionOutcome::TransientFailure {
                status: None,
                retry_after: None,
                reason: e.to_string(),
            },
            Ok(Err(e)) => TransmissionOutcome::PermanentFailure {
                status: None,
                reason: e.to_string(),
            },
            Err(_) => TransmissionOutcome::TransientFailure {
                status: None,
                retry_after: None,
                reason: format!("timed out after {timeout:?}"),
            },
        };

        SendResult {
            outcome,
            latency: start.elapsed(),
        }
    }

    /// Classifies an already received response against this transmission.
    pub fn classify(&self, response: &HttpResponse) -> TransmissionOutcome {
        classify(response, self)
    }
}
