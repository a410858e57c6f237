//! In-memory secondary index cache for nidb.
//!
//! Query planning resolves kind, author and tag constraints to sets of
//! UIDs. Loading those sets from the durable store is the expensive part of
//! a query, so recently used sets are kept here and updated as events are
//! ingested.
//!
//! # Key Types
//!
//! - [`IndexCache`] - The cache: one UID set per [`IndexId`], bounded by an LRU
//! - [`IndexId`] - Identity of one cached index (kind, author, or tag key)
//!
//! # Rules
//!
//! 1. Capacity is counted in whole indexes, not member UIDs.
//! 2. Ingest never creates an index; only a query miss does (via `set_*`).
//! 3. Every `get_*`/`set_*` hit moves the index to the most recently used end.

pub mod cache;
pub mod id;

pub use cache::{IndexCache, UidSet, DEFAULT_MAX_INDEXES};
pub use id::IndexId;
