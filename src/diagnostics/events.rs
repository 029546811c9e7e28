use crate::sender::TransmissionOutcome;
use std::time::Duration;

/// Where the transmission that produced an event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSource {
    /// A fresh batch flushed by the channel.
    Channel,
    /// A payload recovered from storage by the peeker.
    Storage,
    /// The retry of items a partial response rejected.
    Resubmission,
}

/// "Transmission sent" notification.
#[derive(Debug, Clone)]
pub struct TransmissionEvent {
    pub transmission_id: String,
    pub item_count: usize,
    pub bytes: usize,
    pub outcome: TransmissionOutcome,
    pub latency: Duration,
    pub source: EventSource,
}

impl TransmissionEvent {
    pub fn status(&self) -> Option<u16> {
        self.outcome.status()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The channel was already shut down.
    Closed,
    /// The last tier, storage, had no room.
    StorageFull,
    /// The backend rejected the payload for good.
    Rejected,
    /// The item could not be serialized.
    Serialization,
    /// Stored longer than the configured maximum age.
    Expired,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::Closed => "closed",
            DropReason::StorageFull => "storage_full",
            DropReason::Rejected => "rejected",
            DropReason::Serialization => "serialization",
            DropReason::Expired => "expired",
        }
    }
}
