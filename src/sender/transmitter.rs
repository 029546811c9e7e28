use super::client::TransmissionClient;
use super::response::TransmissionOutcome;
use super::serialization::Serializer;
use super::transmission::Transmission;
use crate::diagnostics::{Diagnostics, DropReason, EventSource, TransmissionEvent};
use crate::reliability::{BackoffState, TransmissionStorage};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct SenderConfig {
    /// Maximum number of transmissions on the wire at once.
    pub capacity: usize,
    pub request_timeout: Duration,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            capacity: 10,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Delivers transmissions under a concurrency budget.
///
/// Admission is decided synchronously: a transmission is either accepted and
/// sent on its own task, or refused on the spot so the caller can fall back
/// to storage. Transient failures are written to storage by the sender itself.
#[derive(Clone)]
pub struct TransmissionSender {
    inner: Arc<SenderInner>,
}

struct SenderInner {
    client: Arc<dyn TransmissionClient>,
    storage: Arc<TransmissionStorage>,
    diagnostics: Arc<Diagnostics>,
    backoff: Arc<BackoffState>,
    serializer: Serializer,
    capacity: AtomicUsize,
    in_flight: AtomicUsize,
    idle: Notify,
    request_timeout: Duration,
    runtime: Handle,
}

/// Holds one unit of sender capacity; released on drop, whatever the exit.
struct InFlightGuard {
    inner: Arc<SenderInner>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.inner.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}

impl TransmissionSender {
    /// # Panics
    ///
    /// Must be called from within a Tokio runtime; sends are spawned on it.
    pub fn new(
        config: SenderConfig,
        client: Arc<dyn TransmissionClient>,
        storage: Arc<TransmissionStorage>,
        diagnostics: Arc<Diagnostics>,
    ) -> Self {
        Self {
            inner: Arc::new(SenderInner {
                client,
                storage,
                diagnostics,
                backoff: Arc::new(BackoffState::new()),
                serializer: Serializer::new(),
                capacity: AtomicUsize::new(config.capacity),
                in_flight: AtomicUsize::new(0),
                idle: Notify::new(),
                request_timeout: config.request_timeout,
                runtime: Handle::current(),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity.load(Ordering::Relaxed)
    }

    /// Sends already in flight are not interrupted when shrinking.
    pub fn set_capacity(&self, capacity: usize) {
        self.inner.capacity.store(capacity, Ordering::Relaxed);
    }

    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::Acquire)
    }

    pub fn has_capacity(&self) -> bool {
        self.in_flight() < self.capacity()
    }

    pub fn backoff(&self) -> &Arc<BackoffState> {
        &self.inner.backoff
    }

    /// Accepts the transmission built by `factory` if a send slot is free.
    ///
    /// Returns false without invoking the factory when the sender is at
    /// capacity, and false when the factory yields nothing.
    pub fn enqueue<F>(&self, factory: F) -> bool
    where
        F: FnOnce() -> Option<Transmission>,
    {
        let Some(guard) = self.inner.try_acquire() else {
            self.inner.diagnostics.record_sender_rejection();
            return false;
        };
        match factory() {
            Some(transmission) => {
                self.inner.spawn_delivery(transmission, EventSource::Channel, guard);
                true
            }
            None => false,
        }
    }

    /// Like [`enqueue`](Self::enqueue) but hands the transmission back when
    /// there is no free slot.
    pub fn try_enqueue(&self, transmission: Transmission) -> Result<(), Transmission> {
        self.inner.try_dispatch(transmission, EventSource::Channel)
    }

    pub(crate) fn try_enqueue_from(
        &self,
        transmission: Transmission,
        source: EventSource,
    ) -> Result<(), Transmission> {
        self.inner.try_dispatch(transmission, source)
    }

    /// Waits until no send is in flight. Returns false on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.inner.idle.notified();
            if self.in_flight() == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.in_flight() == 0;
            }
        }
    }
}

impl SenderInner {
    fn try_acquire(self: &Arc<Self>) -> Option<InFlightGuard> {
        let capacity = self.capacity.load(Ordering::Relaxed);
        self.in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < capacity).then_some(current + 1)
            })
            .ok()
            .map(|_| InFlightGuard {
                inner: Arc::clone(self),
            })
    }

    fn try_dispatch(
        self: &Arc<Self>,
        transmission: Transmission,
        source: EventSource,
    ) -> Result<(), Transmission> {
        match self.try_acquire() {
            Some(guard) => {
                self.spawn_delivery(transmission, source, guard);
                Ok(())
            }
            None => {
                self.diagnostics.record_sender_rejection();
                Err(transmission)
            }
        }
    }

    fn spawn_delivery(self: &Arc<Self>, transmission: Transmission, source: EventSource, guard: InFlightGuard) {
        let inner = Arc::clone(self);
        self.runtime.spawn(async move {
            inner.deliver(transmission, source).await;
            drop(guard);
        });
    }

    async fn deliver(self: Arc<Self>, transmission: Transmission, source: EventSource) {
        let result = transmission
            .send(self.client.as_ref(), self.request_timeout)
            .await;

        self.diagnostics.record_transmission(TransmissionEvent {
            transmission_id: transmission.id().to_string(),
            item_count: transmission.item_count(),
            bytes: transmission.size(),
            outcome: result.outcome.clone(),
            latency: result.latency,
            source,
        });

        match result.outcome {
            TransmissionOutcome::Success { status } => {
                self.backoff.record_success();
                debug!(
                    "Transmission {} delivered ({} items, HTTP {status}) in {:?}",
                    transmission.id(),
                    transmission.item_count(),
                    result.latency
                );
            }
            TransmissionOutcome::PartialSuccess {
                status,
                accepted,
                retry_indices,
                dropped,
            } => {
                self.backoff.record_success();
                info!(
                    "Transmission {} partially accepted (HTTP {status}): {accepted} accepted, {} to resend, {dropped} dropped",
                    transmission.id(),
                    retry_indices.len()
                );
                self.diagnostics
                    .record_items_dropped(dropped, DropReason::Rejected);
                self.resubmit(&transmission, &retry_indices).await;
            }
            TransmissionOutcome::TransientFailure {
                status,
                retry_after,
                reason,
            } => {
                self.backoff.record_transient(retry_after);
                warn!(
                    "Transmission {} failed transiently (status {:?}): {reason}; storing for retry",
                    transmission.id(),
                    status
                );
                self.store(transmission).await;
            }
            TransmissionOutcome::PermanentFailure { status, reason } => {
                warn!(
                    "Transmission {} rejected (status {:?}): {reason}; dropping {} items",
                    transmission.id(),
                    status,
                    transmission.item_count()
                );
                self.diagnostics
                    .record_transmission_dropped(transmission.item_count(), DropReason::Rejected);
            }
        }
    }

    /// Sends the rejected subset of a partially accepted transmission as one
    /// new transmission.
    async fn resubmit(self: &Arc<Self>, original: &Transmission, indices: &[usize]) {
        if indices.is_empty() {
            return;
        }

        let batch = match self.serializer.select_lines(
            original.payload(),
            original.content_encoding(),
            indices,
        ) {
            Ok(batch) if !batch.is_empty() => batch,
            Ok(_) => return,
            Err(e) => {
                warn!(
                    "Could not extract rejected items of transmission {}: {e}; storing whole payload",
                    original.id()
                );
                self.store(original.clone()).await;
                return;
            }
        };

        let follow_up = original.resubmission(batch.payload, batch.item_count);
        self.diagnostics.record_resubmitted();
        debug!(
            "Resubmitting {} rejected items of {} as {}",
            follow_up.item_count(),
            original.id(),
            follow_up.id()
        );

        if let Err(follow_up) = self.try_dispatch(follow_up, EventSource::Resubmission) {
            self.store(follow_up).await;
        }
    }

    async fn store(&self, transmission: Transmission) {
        let item_count = transmission.item_count();
        let id = transmission.id().to_string();
        if !self.storage.store(transmission).await {
            warn!("Storage refused transmission {id}; dropping {item_count} items");
            self.diagnostics
                .record_transmission_dropped(item_count, DropReason::StorageFull);
        }
    }
}

impl std::fmt::Debug for TransmissionSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransmissionSender")
            .field("capacity", &self.capacity())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}
