use super::backoff::BackoffPolicy;
use super::storage::TransmissionStorage;
use crate::diagnostics::EventSource;
use crate::sender::{Transmission, TransmissionSender};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What one peeker pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeekPass {
    /// Stored transmissions handed to the sender.
    pub resubmitted: usize,
    /// The pass ended because the sender refused a transmission.
    pub sender_full: bool,
    /// The pass ended because a resend failed transiently while it ran.
    pub backed_off: bool,
}

/// Background loop that moves stored transmissions back to the sender.
pub struct StoragePeeker {
    storage: Arc<TransmissionStorage>,
    sender: TransmissionSender,
    interval: Duration,
    policy: BackoffPolicy,
}

impl StoragePeeker {
    pub fn new(
        storage: Arc<TransmissionStorage>,
        sender: TransmissionSender,
        interval: Duration,
        policy: BackoffPolicy,
    ) -> Self {
        Self {
            storage,
            sender,
            interval,
            policy,
        }
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                "Storage peeker started (interval {:?}, {} stored transmissions)",
                self.interval,
                self.storage.len()
            );
            loop {
                let delay = self.policy.next_delay(self.interval, self.sender.backoff());
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }

                let pass = self.run_once().await;
                if pass.resubmitted > 0 {
                    debug!(
                        "Peeker resubmitted {} stored transmissions ({} left)",
                        pass.resubmitted,
                        self.storage.len()
                    );
                }
            }
            info!("Storage peeker stopped");
        })
    }

    /// Resubmits stored transmissions oldest-first while the sender has room.
    ///
    /// A pass touches each transmission that was stored when it started at
    /// most once, and stops as soon as a send fails transiently; the next
    /// pass waits out the backoff delay.
    pub async fn run_once(&self) -> PeekPass {
        let mut pass = PeekPass::default();
        let budget = self.storage.len();
        let failures_at_start = self.sender.backoff().consecutive_failures();
        let mut seen = HashSet::with_capacity(budget);

        while pass.resubmitted < budget && self.sender.has_capacity() {
            if self.sender.backoff().consecutive_failures() > failures_at_start {
                pass.backed_off = true;
                break;
            }

            let Some(transmission) = self.storage.dequeue().await else {
                break;
            };

            if !seen.insert(transmission.id().to_string()) {
                // Already sent once this pass and stored again.
                self.restore(transmission).await;
                pass.backed_off = true;
                break;
            }

            match self
                .sender
                .try_enqueue_from(transmission, EventSource::Storage)
            {
                Ok(()) => pass.resubmitted += 1,
                Err(transmission) => {
                    // Lost the slot race; put it back under the same name.
                    self.restore(transmission).await;
                    pass.sender_full = true;
                    break;
                }
            }
        }

        if !pass.backed_off && !self.sender.has_capacity() && !self.storage.is_empty() {
            pass.sender_full = true;
        }
        pass
    }

    async fn restore(&self, transmission: Transmission) {
        let id = transmission.id().to_string();
        if !self.storage.store(transmission).await {
            warn!("Could not return transmission {id} to storage");
        }
    }
}
