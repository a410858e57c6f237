//! Filter resolution for nidb.
//!
//! A [`QueryEngine`] turns filters into UID sets, events and counts using the
//! durable store's secondary indexes, an optional [`IndexCache`](nidb_index::IndexCache)
//! and an optional in-memory event cache.
//!
//! # Strategies
//!
//! - [`QueryStrategy::SetBased`] - resolve each field to a UID set, intersect
//!   within a filter, union across filters
//! - [`QueryStrategy::CursorMerge`] - walk descending cursors over the
//!   `authors`/`kinds` indexes and stop at the limit
//!
//! Both produce the same events in the same order: newest first, ties broken
//! by UID.

pub mod cursor;
pub mod engine;
pub mod error;
pub mod strategy;

pub use cursor::{pick_furthest, CursorState, CURSOR_PAGE};
pub use engine::{by_recency, min_limit, QueryEngine, SharedEventCache, SharedIndexCache};
pub use error::{QueryError, QueryResult};
pub use strategy::QueryStrategy;
