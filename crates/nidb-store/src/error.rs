/// Errors from durable store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A write (put, delete, clear) was rejected by the backend.
    #[error("write failed: {0}")]
    WriteFailed(String),

    /// A read or scan failed in the backend.
    #[error("read failed: {0}")]
    ReadFailed(String),
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
