use nidb_store::StoreError;

/// Errors from query planning and execution.
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    /// A filter with no constraining field. Matching everything is never
    /// what the caller meant.
    #[error("empty filter")]
    EmptyFilter,

    /// An empty list of filters.
    #[error("no filters")]
    NoFilters,

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Result alias for query operations.
pub type QueryResult<T> = Result<T, QueryError>;
