//! Pending-write buffer for nidb.
//!
//! Ingest is decoupled from durable persistence: events are appended to a
//! [`WriteQueue`] and written to the [`EventStore`](nidb_store::EventStore)
//! in batches by a periodic flush. Until a batch's write has completed its
//! events stay visible through [`WriteQueue::match_pending`], so readers
//! always see their own writes.
//!
//! The queue also tracks which UIDs were read or written since the last
//! flush and records their last-used time, which drives pruning.

pub mod error;
pub mod queue;
pub mod transform;

pub use error::{QueueError, QueueResult};
pub use queue::{FlushReport, WriteQueue, DEFAULT_BATCH_WRITE};
pub use transform::EventTransform;
