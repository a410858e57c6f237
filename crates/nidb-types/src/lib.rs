//! Foundation types for nidb, an embeddable store for signed, append-only
//! protocol events.
//!
//! Every other nidb crate depends on `nidb-types`.
//!
//! # Key Types
//!
//! - [`Event`] - Immutable signed event (id, author, timestamp, kind, tags, content, signature)
//! - [`Uid`] - Storage key: the event id, or `kind:pubkey:identifier` for replaceable kinds
//! - [`KeyedEvent`] - An event paired with its UID, computed once
//! - [`KindClass`] - Regular / replaceable / ephemeral / addressable classification
//! - [`Filter`] - Closed query structure (AND across fields, OR across values)
//! - [`EventVerifier`] - Validation predicate applied at ingest

pub mod builder;
pub mod error;
pub mod event;
pub mod filter;
pub mod kind;
pub mod uid;
pub mod verify;

pub use builder::{fixture_pubkey, unix_timestamp, EventBuilder};
pub use error::TypeError;
pub use event::{is_indexable_tag_name, tag_key, Event, Tag};
pub use filter::{matches_any, Filter};
pub use kind::{
    is_addressable_kind, is_ephemeral_kind, is_regular_kind, is_replaceable_kind, KindClass,
};
pub use uid::{KeyedEvent, Uid};
pub use verify::{AcceptAll, EventVerifier, StructuralVerifier};
