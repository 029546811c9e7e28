#![allow(dead_code)]

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use telemetry_channel::reliability::StorageConfig;
use telemetry_channel::sender::{
    ClientError, ContentEncoding, HttpResponse, SerializationError, Serializer, Transmission,
    TransmissionClient,
};
use telemetry_channel::{BackoffPolicy, ChannelConfig, TelemetryItem};
use url::Url;

pub fn endpoint() -> Url {
    Url::parse("http://localhost:9600/v2/track").unwrap()
}

pub fn storage_config(path: &Path, capacity_bytes: u64) -> StorageConfig {
    StorageConfig {
        storage_path: path.to_path_buf(),
        capacity_bytes,
        max_age: None,
    }
}

/// Channel settings that keep timers out of the way unless a test wants them.
pub fn channel_config(path: &Path) -> ChannelConfig {
    let mut config = ChannelConfig::new(endpoint());
    config.compression = false;
    config.flush_interval = Duration::from_secs(3600);
    config.peek_interval = Duration::from_secs(3600);
    config.shutdown_timeout = Duration::from_secs(2);
    config.storage = storage_config(path, 10 * 1024 * 1024);
    config.backoff = BackoffPolicy {
        jitter: false,
        ..BackoffPolicy::default()
    };
    config
}

pub fn transmission(payload: &str, item_count: usize) -> Transmission {
    Transmission::new(endpoint(), payload.as_bytes().to_vec(), None, item_count)
}

/// Item whose serialized form is exactly its text.
pub struct TextItem(pub String);

impl TextItem {
    pub fn new(text: &str) -> Self {
        Self(text.to_string())
    }
}

impl TelemetryItem for TextItem {
    fn timestamp(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sanitize(&mut self) {}

    fn serialize(&self) -> Result<Vec<u8>, SerializationError> {
        Ok(self.0.as_bytes().to_vec())
    }
}

/// What a test client saw for one post.
#[derive(Debug, Clone)]
pub struct Posted {
    pub id: String,
    /// Payload with any content encoding removed.
    pub body: Vec<u8>,
    pub item_count: usize,
    pub attempt: u32,
    pub compressed: bool,
}

impl Posted {
    pub fn text(&self) -> String {
        String::from_utf8(self.body.clone()).unwrap()
    }

    pub fn lines(&self) -> Vec<String> {
        self.text().lines().map(str::to_string).collect()
    }
}

/// Answers posts from a script, then with a fixed status, and records
/// every request.
pub struct ScriptedClient {
    script: Mutex<VecDeque<HttpResponse>>,
    fallback_status: u16,
    posted: Mutex<Vec<Posted>>,
}

impl ScriptedClient {
    pub fn always(status: u16) -> Arc<Self> {
        Self::with_script(Vec::new(), status)
    }

    pub fn with_script(script: Vec<HttpResponse>, fallback_status: u16) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            fallback_status,
            posted: Mutex::new(Vec::new()),
        })
    }

    pub fn posted(&self) -> Vec<Posted> {
        self.posted.lock().clone()
    }

    pub fn post_count(&self) -> usize {
        self.posted.lock().len()
    }

    pub async fn wait_for_posts(&self, count: usize, timeout: Duration) -> Vec<Posted> {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.post_count() < count && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.posted()
    }
}

impl TransmissionClient for ScriptedClient {
    fn post<'a>(
        &'a self,
        transmission: &'a Transmission,
    ) -> BoxFuture<'a, Result<HttpResponse, ClientError>> {
        Box::pin(async move {
            let compressed = transmission.content_encoding() == Some(ContentEncoding::Gzip);
            let body = if compressed {
                Serializer::new()
                    .decompress(transmission.payload())
                    .expect("gzip payload")
            } else {
                transmission.payload().to_vec()
            };

            self.posted.lock().push(Posted {
                id: transmission.id().to_string(),
                body,
                item_count: transmission.item_count(),
                attempt: transmission.attempt(),
                compressed,
            });

            let response = self
                .script
                .lock()
                .pop_front()
                .unwrap_or_else(|| HttpResponse::new(self.fallback_status));
            Ok(response)
        })
    }
}

/// Never answers; every post stays in flight until the sender times it out.
#[derive(Default)]
pub struct PendingClient {
    calls: AtomicUsize,
}

impl PendingClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl TransmissionClient for PendingClient {
    fn post<'a>(
        &'a self,
        _transmission: &'a Transmission,
    ) -> BoxFuture<'a, Result<HttpResponse, ClientError>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Box::pin(futures::future::pending())
    }
}

pub async fn eventually<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
