use super::transmission::Transmission;
use bytes::Bytes;
use futures::future::BoxFuture;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE, HeaderMap, HeaderValue, RETRY_AFTER};
use reqwest::{Client, ClientBuilder};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Request timeout: {0}")]
    RequestTimeout(String),
    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),
}

impl ClientError {
    /// Whether a later attempt with the same payload can be expected to work.
    pub fn is_transient(&self) -> bool {
        !matches!(self, ClientError::InvalidConfiguration(_))
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub timeout: Duration,
    pub connection_timeout: Duration,
    pub max_connections: usize,
    pub keep_alive_timeout: Duration,
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            connection_timeout: Duration::from_secs(10),
            max_connections: 10,
            keep_alive_timeout: Duration::from_secs(60),
            user_agent: format!("telemetry-channel/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// What the sender needs to know about an ingestion response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Bytes,
    pub retry_after: Option<Duration>,
}

impl HttpResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            body: Bytes::new(),
            retry_after: None,
        }
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }
}

/// The network seam of the pipeline: posts one transmission and reports the
/// raw response. Classification happens in the sender, not here.
pub trait TransmissionClient: Send + Sync + 'static {
    fn post<'a>(
        &'a self,
        transmission: &'a Transmission,
    ) -> BoxFuture<'a, Result<HttpResponse, ClientError>>;
}

impl<T: TransmissionClient + ?Sized> TransmissionClient for Arc<T> {
    fn post<'a>(
        &'a self,
        transmission: &'a Transmission,
    ) -> BoxFuture<'a, Result<HttpResponse, ClientError>> {
        (**self).post(transmission)
    }
}

#[derive(Debug, Default)]
pub struct ClientStats {
    total_requests: AtomicU64,
    successful_requests: AtomicU64,
    failed_requests: AtomicU64,
    total_response_time: AtomicU64,
}

impl ClientStats {
    pub fn record_request(&self, success: bool, response_time: Duration) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.total_response_time
            .fetch_add(response_time.as_millis() as u64, Ordering::Relaxed);

        if success {
            self.successful_requests.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_requests.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub average_response_time: Duration,
}

/// reqwest-backed client with a pooled connection set.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
    config: ClientConfig,
    stats: Arc<ClientStats>,
}

impl HttpClient {
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let client = ClientBuilder::new()
            .timeout(config.timeout)
            .connect_timeout(config.connection_timeout)
            .pool_max_idle_per_host(config.max_connections)
            .pool_idle_timeout(config.keep_alive_timeout)
            .user_agent(&config.user_agent)
            .build()
            .map_err(|e| {
                ClientError::InvalidConfiguration(format!("Failed to build HTTP client: {e}"))
            })?;

        Ok(Self {
            client,
            config,
            stats: Arc::new(ClientStats::default()),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn connection_stats(&self) -> ConnectionStats {
        let total_requests = self.stats.total_requests.load(Ordering::Relaxed);
        let total_response_time = self.stats.total_response_time.load(Ordering::Relaxed);

        let average_response_time = if total_requests > 0 {
            Duration::from_millis(total_response_time / total_requests)
        } else {
            Duration::ZERO
        };

        ConnectionStats {
            total_requests,
            successful_requests: self.stats.successful_requests.load(Ordering::Relaxed),
            failed_requests: self.stats.failed_requests.load(Ordering::Relaxed),
            average_response_time,
        }
    }

    fn build_headers(&self, transmission: &Transmission) -> Result<HeaderMap, ClientError> {
        let mut headers = HeaderMap::new();

        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_str(transmission.content_type()).map_err(|e| {
                ClientError::InvalidConfiguration(format!("Invalid content type: {e}"))
            })?,
        );

        if let Some(encoding) = transmission.content_encoding() {
            headers.insert(CONTENT_ENCODING, HeaderValue::from_static(encoding.as_str()));
        }

        headers.insert(
            "x-transmission-id",
            HeaderValue::from_str(transmission.id()).map_err(|e| {
                ClientError::InvalidConfiguration(format!("Invalid transmission id: {e}"))
            })?,
        );
        headers.insert("x-item-count", HeaderValue::from(transmission.item_count()));

        Ok(headers)
    }

    async fn post_transmission(
        &self,
        transmission: &Transmission,
    ) -> Result<HttpResponse, ClientError> {
        let headers = self.build_headers(transmission)?;
        let start = std::time::Instant::now();

        let result = self
            .client
            .post(transmission.endpoint().clone())
            .headers(headers)
            .body(transmission.payload().clone())
            .send()
            .await;

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                self.stats.record_request(false, start.elapsed());
                if e.is_timeout() {
                    return Err(ClientError::RequestTimeout(e.to_string()));
                }
                if e.is_connect() {
                    return Err(ClientError::ConnectionFailed(e.to_string()));
                }
                return Err(ClientError::NetworkError(e));
            }
        };

        let status = response.status();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        let body = response.bytes().await.unwrap_or_default();

        self.stats.record_request(status.is_success(), start.elapsed());

        Ok(HttpResponse {
            status: status.as_u16(),
            body,
            retry_after,
        })
    }
}

impl TransmissionClient for HttpClient {
    fn post<'a>(
        &'a self,
        transmission: &'a Transmission,
    ) -> BoxFuture<'a, Result<HttpResponse, ClientError>> {
        Box::pin(self.post_transmission(transmission))
    }
}

/// `Retry-After` is either delta-seconds or an HTTP date.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let date = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    let delta = date.with_timezone(&chrono::Utc) - chrono::Utc::now();
    delta.to_std().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_retry_after_seconds() {
        assert_eq!(parse_retry_after("120"), Some(Duration::from_secs(120)));
        assert_eq!(parse_retry_after(" 5 "), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_parse_retry_after_past_date_is_none() {
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
        assert_eq!(parse_retry_after("soon"), None);
    }

    #[test]
    fn test_invalid_configuration_is_not_transient() {
        assert!(!ClientError::InvalidConfiguration("bad".to_string()).is_transient());
        assert!(ClientError::RequestTimeout("slow".to_string()).is_transient());
    }
}
