//! Producer-facing entry point of the pipeline.
//!
//! Items flow Buffer → Serializer → Transmission → Sender, with storage as
//! the fallback tier whenever the sender has no free slot or the backend
//! fails transiently. A background peeker feeds stored transmissions back.

mod flush;

use crate::buffer::{BufferSignal, TelemetryBuffer};
use crate::diagnostics::{Diagnostics, DropReason, TransmissionEvent};
use crate::domain::{BoxedItem, ChannelError, TelemetryItem};
use crate::reliability::{BackoffPolicy, StorageConfig, StoragePeeker, TransmissionStorage};
use crate::sender::{
    ClientConfig, ContentEncoding, HttpClient, SenderConfig, Serializer, Transmission,
    TransmissionClient, TransmissionSender,
};
use flush::FlushRequest;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

pub const DEFAULT_ENDPOINT: &str = "https://dc.services.visualstudio.com/v2/track";

/// Shorter flush intervals are raised to this.
pub const MIN_FLUSH_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub endpoint: Url,
    /// Send every item as its own transmission, without buffering.
    pub developer_mode: bool,
    pub buffer_capacity: usize,
    pub flush_interval: Duration,
    pub compression: bool,
    pub shutdown_timeout: Duration,
    pub peek_interval: Duration,
    pub sender: SenderConfig,
    pub storage: StorageConfig,
    pub client: ClientConfig,
    pub backoff: BackoffPolicy,
}

impl ChannelConfig {
    pub fn new(endpoint: Url) -> Self {
        Self {
            endpoint,
            developer_mode: false,
            buffer_capacity: 500,
            flush_interval: Duration::from_secs(30),
            compression: true,
            shutdown_timeout: Duration::from_secs(5),
            peek_interval: Duration::from_secs(5),
            sender: SenderConfig::default(),
            storage: StorageConfig::default(),
            client: ClientConfig::default(),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// State shared between the channel handle and its background tasks.
pub(crate) struct ChannelShared {
    buffer: TelemetryBuffer,
    serializer: Serializer,
    sender: TransmissionSender,
    storage: Arc<TransmissionStorage>,
    diagnostics: Arc<Diagnostics>,
    endpoint: RwLock<Url>,
    developer_mode: AtomicBool,
    compression: bool,
    flush_interval: Mutex<Duration>,
    interval_changed: Notify,
    closed: AtomicBool,
    requests: mpsc::UnboundedSender<FlushRequest>,
}

impl ChannelShared {
    fn flush_interval(&self) -> Duration {
        *self.flush_interval.lock()
    }

    fn queue(&self, request: FlushRequest) {
        if let Err(mpsc::error::SendError(request)) = self.requests.send(request)
            && let FlushRequest::Batch(items) = request
        {
            self.diagnostics
                .record_items_dropped(items.len(), DropReason::Closed);
        }
    }

    /// Asks the flush worker to drain the buffer behind every batch already
    /// queued, and waits until that drained batch has been handed off.
    async fn drain(&self) -> bool {
        let (ack, done) = oneshot::channel();
        if self.requests.send(FlushRequest::Drain(Some(ack))).is_err() {
            return false;
        }
        done.await.is_ok()
    }

    /// Serializes a batch and hands it to the sender, falling back to storage
    /// and finally to a counted drop.
    async fn submit(&self, items: Vec<BoxedItem>) {
        let batch = self.serializer.serialize(items);
        if batch.skipped > 0 {
            self.diagnostics.record_items_skipped(batch.skipped);
        }
        if batch.is_empty() {
            return;
        }

        let (payload, encoding) = if self.compression {
            match self.serializer.compress(&batch.payload) {
                Ok(compressed) => (compressed, Some(ContentEncoding::Gzip)),
                Err(e) => {
                    warn!("Compression failed, sending uncompressed: {e}");
                    (batch.payload, None)
                }
            }
        } else {
            (batch.payload, None)
        };

        let endpoint = self.endpoint.read().clone();
        let transmission = Transmission::new(endpoint, payload, encoding, batch.item_count);

        if let Err(transmission) = self.sender.try_enqueue(transmission) {
            debug!(
                "Sender at capacity ({} in flight), storing transmission {}",
                self.sender.in_flight(),
                transmission.id()
            );
            let item_count = transmission.item_count();
            if !self.storage.store(transmission).await {
                warn!("Sender and storage both full; dropping {item_count} items");
                self.diagnostics
                    .record_transmission_dropped(item_count, DropReason::StorageFull);
            }
        }
    }
}

/// Buffers telemetry and ships it to the ingestion endpoint.
///
/// # Example
///
/// ```no_run
/// use telemetry_channel::{ChannelConfig, Envelope, TelemetryChannel};
///
/// # async fn run() -> Result<(), telemetry_channel::ChannelError> {
/// let endpoint = url::Url::parse("https://ingest.example.com/v2/track").unwrap();
/// let channel = TelemetryChannel::new(ChannelConfig::new(endpoint)).await?;
/// channel.send(Envelope::trace("service started"));
/// channel.shutdown().await?;
/// # Ok(())
/// # }
/// ```
pub struct TelemetryChannel {
    shared: Arc<ChannelShared>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown_timeout: Duration,
}

impl TelemetryChannel {
    /// Builds a channel posting through the reqwest-backed [`HttpClient`].
    pub async fn new(config: ChannelConfig) -> Result<Self, ChannelError> {
        let client = HttpClient::new(config.client.clone())?;
        Self::with_client(config, Arc::new(client)).await
    }

    /// Builds a channel posting through `client`.
    ///
    /// Opens (and creates) the storage directory and starts the flush timer,
    /// the flush worker and the storage peeker.
    pub async fn with_client(
        config: ChannelConfig,
        client: Arc<dyn TransmissionClient>,
    ) -> Result<Self, ChannelError> {
        let diagnostics = Arc::new(Diagnostics::new());
        let storage = Arc::new(
            TransmissionStorage::new(config.storage.clone(), Arc::clone(&diagnostics)).await?,
        );
        let sender = TransmissionSender::new(
            config.sender.clone(),
            client,
            Arc::clone(&storage),
            Arc::clone(&diagnostics),
        );

        let (requests, receiver) = mpsc::unbounded_channel();
        let shared = Arc::new(ChannelShared {
            buffer: TelemetryBuffer::new(config.buffer_capacity),
            serializer: Serializer::new(),
            sender: sender.clone(),
            storage: Arc::clone(&storage),
            diagnostics,
            endpoint: RwLock::new(config.endpoint.clone()),
            developer_mode: AtomicBool::new(config.developer_mode),
            compression: config.compression,
            flush_interval: Mutex::new(config.flush_interval.max(MIN_FLUSH_INTERVAL)),
            interval_changed: Notify::new(),
            closed: AtomicBool::new(false),
            requests,
        });

        let cancel = CancellationToken::new();
        let peeker = StoragePeeker::new(storage, sender, config.peek_interval, config.backoff);
        let tasks = vec![
            flush::spawn_worker(Arc::clone(&shared), receiver, cancel.child_token()),
            flush::spawn_timer(Arc::clone(&shared), cancel.child_token()),
            peeker.spawn(cancel.child_token()),
        ];

        info!(
            "Telemetry channel started: endpoint {}, buffer {}, sender {}, storage {}",
            config.endpoint,
            config.buffer_capacity,
            config.sender.capacity,
            shared.storage.path().display()
        );

        Ok(Self {
            shared,
            cancel,
            tasks: Mutex::new(tasks),
            shutdown_timeout: config.shutdown_timeout,
        })
    }

    /// Accepts an item for delivery. Never blocks on I/O and never fails:
    /// items sent after shutdown are dropped and counted.
    pub fn send(&self, item: impl TelemetryItem) {
        let shared = &self.shared;
        if shared.closed.load(Ordering::Acquire) {
            shared.diagnostics.record_items_dropped(1, DropReason::Closed);
            return;
        }
        shared.diagnostics.record_item_received();

        let item: BoxedItem = Box::new(item);
        if shared.developer_mode.load(Ordering::Relaxed) {
            shared.diagnostics.record_flush();
            shared.queue(FlushRequest::Batch(vec![item]));
            return;
        }

        if shared.buffer.enqueue(item) == BufferSignal::Full {
            // Another producer may have swapped the buffer out first.
            let items = shared.buffer.take_all();
            if !items.is_empty() {
                shared.diagnostics.record_flush();
                shared.queue(FlushRequest::Batch(items));
            }
        }
    }

    /// Hands everything buffered so far to the sender (or storage).
    pub async fn flush(&self) -> Result<(), ChannelError> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(ChannelError::Closed);
        }
        if self.shared.drain().await {
            Ok(())
        } else {
            Err(ChannelError::Closed)
        }
    }

    /// Flushes, waits for in-flight sends and stops the background tasks,
    /// all within the configured shutdown timeout. Calling it again is a
    /// no-op.
    pub async fn shutdown(&self) -> Result<(), ChannelError> {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!("Shutting down telemetry channel");

        let deadline = tokio::time::Instant::now() + self.shutdown_timeout;
        let drained = tokio::time::timeout_at(deadline, self.shared.drain())
            .await
            .unwrap_or(false);
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let idle = self.shared.sender.wait_idle(remaining).await;

        self.cancel.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if tokio::time::timeout(remaining, task).await.is_err() {
                warn!("Background task did not stop before the shutdown deadline");
            }
        }

        let leftover = self.shared.buffer.take_all();
        if !leftover.is_empty() {
            self.shared
                .diagnostics
                .record_items_dropped(leftover.len(), DropReason::Closed);
        }

        if drained && idle {
            info!("Telemetry channel stopped");
            Ok(())
        } else {
            warn!(
                "Shutdown incomplete after {:?}: {} transmissions still in flight",
                self.shutdown_timeout,
                self.shared.sender.in_flight()
            );
            Err(ChannelError::ShutdownTimeout(self.shutdown_timeout))
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    pub fn endpoint_address(&self) -> Url {
        self.shared.endpoint.read().clone()
    }

    /// Applies to transmissions created from now on.
    pub fn set_endpoint_address(&self, endpoint: Url) {
        *self.shared.endpoint.write() = endpoint;
    }

    pub fn developer_mode(&self) -> bool {
        self.shared.developer_mode.load(Ordering::Relaxed)
    }

    /// Turning developer mode on also flushes whatever is buffered.
    pub fn set_developer_mode(&self, enabled: bool) {
        let was = self.shared.developer_mode.swap(enabled, Ordering::Relaxed);
        if enabled && !was && !self.shared.buffer.is_empty() {
            self.shared.queue(FlushRequest::Drain(None));
        }
    }

    pub fn buffer_capacity(&self) -> usize {
        self.shared.buffer.capacity()
    }

    pub fn set_buffer_capacity(&self, capacity: usize) {
        self.shared.buffer.set_capacity(capacity);
    }

    pub fn sender_capacity(&self) -> usize {
        self.shared.sender.capacity()
    }

    pub fn set_sender_capacity(&self, capacity: usize) {
        self.shared.sender.set_capacity(capacity);
    }

    pub fn storage_capacity_bytes(&self) -> u64 {
        self.shared.storage.capacity()
    }

    pub fn set_storage_capacity_bytes(&self, capacity: u64) {
        self.shared.storage.set_capacity(capacity);
    }

    pub fn flush_interval(&self) -> Duration {
        self.shared.flush_interval()
    }

    pub fn set_flush_interval(&self, interval: Duration) {
        *self.shared.flush_interval.lock() = interval.max(MIN_FLUSH_INTERVAL);
        self.shared.interval_changed.notify_waiters();
    }

    pub fn buffered_len(&self) -> usize {
        self.shared.buffer.len()
    }

    pub fn diagnostics(&self) -> &Arc<Diagnostics> {
        &self.shared.diagnostics
    }

    /// Stream of "transmission sent" notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<TransmissionEvent> {
        self.shared.diagnostics.subscribe()
    }

    pub fn storage(&self) -> &Arc<TransmissionStorage> {
        &self.shared.storage
    }

    pub fn sender(&self) -> &TransmissionSender {
        &self.shared.sender
    }
}

impl Drop for TelemetryChannel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for TelemetryChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryChannel")
            .field("endpoint", &*self.shared.endpoint.read())
            .field("buffered", &self.buffered_len())
            .field("sender", &self.shared.sender)
            .field("storage", &self.shared.storage)
            .field("closed", &self.is_closed())
            .finish()
    }
}
