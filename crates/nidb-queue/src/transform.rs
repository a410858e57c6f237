use async_trait::async_trait;

use nidb_types::Event;

use crate::error::QueueResult;

/// Hook applied to each batch before it is written.
///
/// The returned events replace the batch, so a transform can enrich,
/// filter or substitute events. Returning an error aborts the flush of
/// that batch.
#[async_trait]
pub trait EventTransform: Send + Sync {
    async fn transform(&self, events: Vec<Event>) -> QueueResult<Vec<Event>>;
}
