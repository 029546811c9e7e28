use crate::domain::BoxedItem;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

// Upper bound for the up-front allocation of a fresh buffer
const MAX_PREALLOCATED_ITEMS: usize = 4096;

/// What the orchestrator should do after an enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferSignal {
    Accepted,
    /// The buffer reached its capacity and should be flushed.
    Full,
}

/// In-memory accumulation of telemetry items between flushes.
///
/// The capacity is a flush threshold, not a hard limit: the buffer never
/// refuses an item, it only reports `Full` once the threshold is reached.
pub struct TelemetryBuffer {
    items: Mutex<Vec<BoxedItem>>,
    capacity: AtomicUsize,
}

impl TelemetryBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Mutex::new(Vec::with_capacity(capacity.min(MAX_PREALLOCATED_ITEMS))),
            capacity: AtomicUsize::new(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Relaxed)
    }

    /// Takes effect on the next enqueue; items already buffered are kept.
    pub fn set_capacity(&self, capacity: usize) {
        self.capacity.store(capacity.max(1), Ordering::Relaxed);
    }

    pub fn enqueue(&self, item: BoxedItem) -> BufferSignal {
        let len = {
            let mut items = self.items.lock();
            items.push(item);
            items.len()
        };

        if len >= self.capacity() {
            BufferSignal::Full
        } else {
            BufferSignal::Accepted
        }
    }

    /// Swaps the whole contents out, leaving an empty buffer behind.
    pub fn take_all(&self) -> Vec<BoxedItem> {
        let fresh = Vec::with_capacity(self.capacity().min(MAX_PREALLOCATED_ITEMS));
        let mut items = self.items.lock();
        std::mem::replace(&mut *items, fresh)
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

impl std::fmt::Debug for TelemetryBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryBuffer")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}
