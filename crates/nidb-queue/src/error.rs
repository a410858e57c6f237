use nidb_store::StoreError;

/// Errors from flushing the write queue.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The durable store rejected a write.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The flush transform failed; the batch was not written.
    #[error("transform failed: {0}")]
    Transform(String),
}

/// Result alias for queue operations.
pub type QueueResult<T> = Result<T, QueueError>;
