use super::ChannelShared;
use crate::diagnostics::DropReason;
use crate::domain::BoxedItem;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Work for the flush worker, processed strictly in order.
pub(crate) enum FlushRequest {
    /// A batch already swapped out of the buffer.
    Batch(Vec<BoxedItem>),
    /// Drain whatever is in the buffer now; the sender is acked once the
    /// drained batch has been handed off.
    Drain(Option<oneshot::Sender<()>>),
}

impl FlushRequest {
    fn item_count(&self) -> usize {
        match self {
            FlushRequest::Batch(items) => items.len(),
            FlushRequest::Drain(_) => 0,
        }
    }
}

pub(crate) fn spawn_worker(
    shared: Arc<ChannelShared>,
    mut requests: mpsc::UnboundedReceiver<FlushRequest>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                request = requests.recv() => match request {
                    Some(request) => handle(&shared, request).await,
                    None => break,
                },
                _ = cancel.cancelled() => break,
            }
        }

        requests.close();
        let mut abandoned = 0;
        while let Ok(request) = requests.try_recv() {
            abandoned += request.item_count();
        }
        if abandoned > 0 {
            shared
                .diagnostics
                .record_items_dropped(abandoned, DropReason::Closed);
        }
        debug!("Flush worker stopped");
    })
}

async fn handle(shared: &ChannelShared, request: FlushRequest) {
    match request {
        FlushRequest::Batch(items) => shared.submit(items).await,
        FlushRequest::Drain(ack) => {
            let items = shared.buffer.take_all();
            if !items.is_empty() {
                shared.diagnostics.record_flush();
                shared.submit(items).await;
            }
            if let Some(ack) = ack {
                // The caller may have given up waiting.
                let _ = ack.send(());
            }
        }
    }
}

/// Periodically drains the buffer. Restarts its wait whenever the interval
/// is changed.
pub(crate) fn spawn_timer(shared: Arc<ChannelShared>, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Flush timer started (interval {:?})", shared.flush_interval());
        loop {
            let changed = shared.interval_changed.notified();
            let interval = shared.flush_interval();
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = changed => continue,
                _ = tokio::time::sleep(interval) => {
                    if !shared.buffer.is_empty() {
                        shared.queue(FlushRequest::Drain(None));
                    }
                }
            }
        }
        debug!("Flush timer stopped");
    })
}
