//! Cloud synchronisation: HTTP transport, bounded retry queue and the
//! synchronizer that ties them to the progress store.

pub mod retry_queue;
pub mod synchronizer;
pub mod transport;

pub use retry_queue::{RetryDisposition, RetryPolicy, RetryQueue, RetryQueueEntry};
pub use synchronizer::{CloudSynchronizer, QueuedPush, RetryReport, SyncMeta, SyncResult, SyncSettings};
pub use transport::{fetch_latest, CloudError, CloudTransport, HttpTransport, PushAck, PushRequest};
