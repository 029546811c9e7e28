use super::client::HttpResponse;
use super::transmission::Transmission;
use serde::Deserialize;
use std::time::Duration;
use tracing::warn;

/// How a single send attempt ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TransmissionOutcome {
    /// Every item was accepted.
    Success { status: u16 },
    /// The backend accepted some items; `retry_indices` are the payload lines
    /// to send again.
    PartialSuccess {
        status: u16,
        accepted: usize,
        retry_indices: Vec<usize>,
        dropped: usize,
    },
    /// Worth retrying later from storage.
    TransientFailure {
        status: Option<u16>,
        retry_after: Option<Duration>,
        reason: String,
    },
    /// Will fail the same way every time; dropped.
    PermanentFailure { status: Option<u16>, reason: String },
}

impl TransmissionOutcome {
    pub fn status(&self) -> Option<u16> {
        match self {
            TransmissionOutcome::Success { status }
            | TransmissionOutcome::PartialSuccess { status, .. } => Some(*status),
            TransmissionOutcome::TransientFailure { status, .. }
            | TransmissionOutcome::PermanentFailure { status, .. } => *status,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TransmissionOutcome::Success { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TransmissionOutcome::Success { .. } => "success",
            TransmissionOutcome::PartialSuccess { .. } => "partial",
            TransmissionOutcome::TransientFailure { .. } => "transient",
            TransmissionOutcome::PermanentFailure { .. } => "permanent",
        }
    }
}

/// Body of a multi-status ingestion response.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendResponse {
    pub items_received: usize,
    pub items_accepted: usize,
    #[serde(default)]
    pub errors: Vec<ItemError>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemError {
    pub index: usize,
    pub status_code: u16,
    #[serde(default)]
    pub message: String,
}

pub const PARTIAL_CONTENT: u16 = 206;
pub const MULTI_STATUS: u16 = 207;

/// Statuses that say "try again later" rather than "this payload is bad".
pub fn is_transient_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 439 | 500 | 502 | 503 | 504)
}

pub fn classify(response: &HttpResponse, transmission: &Transmission) -> TransmissionOutcome {
    let status = response.status;

    if status == PARTIAL_CONTENT || status == MULTI_STATUS {
        return classify_partial(response, transmission);
    }

    if (200..300).contains(&status) {
        return TransmissionOutcome::Success { status };
    }

    if is_transient_status(status) {
        return TransmissionOutcome::TransientFailure {
            status: Some(status),
            retry_after: response.retry_after,
            reason: format!("HTTP {status}"),
        };
    }

    TransmissionOutcome::PermanentFailure {
        status: Some(status),
        reason: format!("HTTP {status}: {}", String::from_utf8_lossy(&response.body)),
    }
}

fn classify_partial(response: &HttpResponse, transmission: &Transmission) -> TransmissionOutcome {
    let status = response.status;
    let parsed: BackendResponse = match serde_json::from_slice(&response.body) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!(
                "Unreadable multi-status body for transmission {}: {e}",
                transmission.id()
            );
            return TransmissionOutcome::Success { status };
        }
    };

    if parsed.errors.is_empty() || parsed.items_accepted >= parsed.items_received {
        return TransmissionOutcome::Success { status };
    }

    // Rejected items always get one more try; after that only the ones the
    // backend itself reports as retryable are sent again.
    let first_attempt = transmission.attempt() == 0;
    let (retry, dropped): (Vec<&ItemError>, Vec<&ItemError>) = parsed
        .errors
        .iter()
        .filter(|e| e.index < transmission.item_count())
        .partition(|e| first_attempt || is_transient_status(e.status_code));

    for error in &dropped {
        warn!(
            "Dropping item {} of transmission {}: HTTP {} {}",
            error.index,
            transmission.id(),
            error.status_code,
            error.message
        );
    }

    TransmissionOutcome::PartialSuccess {
        status,
        accepted: parsed.items_accepted,
        retry_indices: retry.iter().map(|e| e.index).collect(),
        dropped: dropped.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    fn transmission(items: usize) -> Transmission {
        Transmission::new(
            Url::parse("http://localhost/v2/track").unwrap(),
            b"payload".to_vec(),
            None,
            items,
        )
    }

    #[test]
    fn test_classify_status_codes() {
        let t = transmission(1);

        assert!(classify(&HttpResponse::new(200), &t).is_success());
        assert!(classify(&HttpResponse::new(202), &t).is_success());
        for status in [408, 429, 500, 502, 503, 504] {
            assert!(matches!(
                classify(&HttpResponse::new(status), &t),
                TransmissionOutcome::TransientFailure { .. }
            ));
        }
        for status in [400, 401, 403, 404, 413] {
            assert!(matches!(
                classify(&HttpResponse::new(status), &t),
                TransmissionOutcome::PermanentFailure { .. }
            ));
        }
    }

    #[test]
    fn test_transient_keeps_retry_after() {
        let response = HttpResponse::new(429).with_retry_after(Duration::from_secs(7));

        match classify(&response, &transmission(1)) {
            TransmissionOutcome::TransientFailure { retry_after, .. } => {
                assert_eq!(retry_after, Some(Duration::from_secs(7)));
            }
            other => panic!("Expected transient failure, got {other:?}"),
        }
    }

    #[test]
    fn test_partial_first_attempt_retries_all_rejected() {
        let body = r#"{"itemsReceived":5,"itemsAccepted":3,"errors":[
            {"index":1,"statusCode":500,"message":"Internal"},
            {"index":4,"statusCode":400,"message":"Bad field"}]}"#;
        let response = HttpResponse::new(206).with_body(body);

        match classify(&response, &transmission(5)) {
            TransmissionOutcome::PartialSuccess {
                retry_indices,
                dropped,
                accepted,
                ..
            } => {
                assert_eq!(retry_indices, vec![1, 4]);
                assert_eq!(dropped, 0);
                assert_eq!(accepted, 3);
            }
            other => panic!("Expected partial success, got {other:?}"),
        }
    }

    #[test]
    fn test_partial_resubmission_drops_permanent_rejections() {
        let body = r#"{"itemsReceived":2,"itemsAccepted":0,"errors":[
            {"index":0,"statusCode":503},
            {"index":1,"statusCode":400}]}"#;
        let response = HttpResponse::new(206).with_body(body);
        let mut t = transmission(2);
        t.attempt = 1;

        match classify(&response, &t) {
            TransmissionOutcome::PartialSuccess {
                retry_indices,
                dropped,
                ..
            } => {
                assert_eq!(retry_indices, vec![0]);
                assert_eq!(dropped, 1);
            }
            other => panic!("Expected partial success, got {other:?}"),
        }
    }

    #[test]
    fn test_unreadable_partial_body_counts_as_success() {
        let response = HttpResponse::new(206).with_body("not json");

        assert!(classify(&response, &transmission(3)).is_success());
    }
}
