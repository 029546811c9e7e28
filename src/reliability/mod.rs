pub mod backoff;
pub mod peeker;
pub mod storage;

pub use backoff::{BackoffPolicy, BackoffState, RetryStrategy};
pub use peeker::{PeekPass, StoragePeeker};
pub use storage::{StorageConfig, StorageError, TransmissionStorage};
