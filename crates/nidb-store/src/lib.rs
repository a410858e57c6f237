//! Durable storage for nidb.
//!
//! The durable store is an external collaborator: a transactional key/value
//! store holding one record per event UID, with secondary indexes over id,
//! kind, author, indexable tags and `created_at`, plus a separate table of
//! last-used timestamps. This crate defines that contract and the policies
//! layered on top of it.
//!
//! # Storage Backends
//!
//! All backends implement the [`EventStore`] trait:
//!
//! - [`InMemoryEventStore`] - ordered in-memory indexes for tests and embedding
//!
//! # Policies
//!
//! - [`add_events`] - verification and the replaceable-write policy
//!   (a replaceable slot is only overwritten by an event at least as new)
//! - [`prune_last_used`] - least-recently-used eviction down to a target size
//! - [`events_from_address_pointers`], [`count_events_by_kind`],
//!   [`count_events_by_author`] - whole-store reads
//!
//! All store errors are propagated to the caller; nothing here retries.

pub mod error;
pub mod ingest;
pub mod memory;
pub mod misc;
pub mod prune;
pub mod traits;

pub use error::{StoreError, StoreResult};
pub use ingest::{add_event, add_events, update_used};
pub use memory::InMemoryEventStore;
pub use misc::{
    count_events, count_events_by_author, count_events_by_kind, events_from_address_pointers,
    AddressPointer,
};
pub use prune::{prune_last_used, PruneReport};
pub use traits::{EventStore, IndexKey, Position, StoredRecord, UsedRecord};
