use nidb_query::QueryError;
use nidb_queue::QueueError;
use nidb_store::StoreError;

/// Errors surfaced by the engine.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// A replaceable delete was asked for a kind that is neither replaceable
    /// nor addressable, so it has no address UID.
    #[error("kind {kind} is not replaceable")]
    NotReplaceable { kind: u16 },

    #[error("query error: {0}")]
    Query(#[from] QueryError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("write queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Result alias for engine operations.
pub type RelayResult<T> = Result<T, RelayError>;
