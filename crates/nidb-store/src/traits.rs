use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use nidb_types::{Event, Uid};

use crate::error::StoreResult;

/// A secondary index lookup key.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IndexKey {
    /// Event id. Lets replaceable events be found by id even though they
    /// are stored under their address.
    Id(String),
    Kind(u16),
    Author(String),
    /// Indexable tag key (`name + value`).
    Tag(String),
}

impl fmt::Display for IndexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "id:{id}"),
            Self::Kind(kind) => write!(f, "kind:{kind}"),
            Self::Author(pubkey) => write!(f, "author:{pubkey}"),
            Self::Tag(key) => write!(f, "tag:{key}"),
        }
    }
}

/// A row's place in recency order: `created_at`, then UID.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Position {
    pub created_at: u64,
    pub uid: Uid,
}

impl Position {
    pub fn new(created_at: u64, uid: Uid) -> Self {
        Self { created_at, uid }
    }
}

/// The record kept per UID: the event plus its indexable tag keys.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub event: Event,
    pub tags: Vec<String>,
}

impl StoredRecord {
    pub fn new(event: Event) -> Self {
        let tags = event.indexable_tags();
        Self { event, tags }
    }

    pub fn uid(&self) -> Uid {
        self.event.uid()
    }

    pub fn position(&self) -> Position {
        Position::new(self.event.created_at, self.uid())
    }

    /// Every secondary index key this record appears under.
    pub fn index_keys(&self) -> Vec<IndexKey> {
        let mut keys = Vec::with_capacity(self.tags.len() + 3);
        keys.push(IndexKey::Id(self.event.id.clone()));
        keys.push(IndexKey::Kind(self.event.kind));
        keys.push(IndexKey::Author(self.event.pubkey.clone()));
        keys.extend(self.tags.iter().cloned().map(IndexKey::Tag));
        keys
    }
}

/// Last-used timestamp for a UID.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsedRecord {
    pub uid: Uid,
    /// Unix seconds.
    pub last_used: u64,
}

/// Durable event store.
///
/// The store is a transactional key/value collaborator: it holds one
/// [`StoredRecord`] per UID, maintains secondary indexes over it, and keeps
/// a separate "used" table of last-used timestamps. It never applies the
/// replaceable-write policy itself; that belongs to the ingest path.
///
/// All failures are propagated to the caller. Implementations never retry.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Read the record stored under `uid`.
    async fn get(&self, uid: &Uid) -> StoreResult<Option<StoredRecord>>;

    /// Write a record under its UID, replacing whatever was there.
    async fn put(&self, record: StoredRecord) -> StoreResult<()>;

    /// Delete the record under `uid`. Returns `true` if it existed.
    async fn delete(&self, uid: &Uid) -> StoreResult<bool>;

    /// Delete every record. The used table is left alone.
    async fn clear(&self) -> StoreResult<()>;

    /// Number of stored records.
    async fn count(&self) -> StoreResult<usize>;

    /// All UIDs under a secondary index key, in no particular order.
    async fn keys_by_index(&self, key: &IndexKey) -> StoreResult<Vec<Uid>>;

    /// UIDs with `since <= created_at <= until`, oldest first, or newest
    /// first when `reverse` is set.
    async fn keys_by_time_range(
        &self,
        since: Option<u64>,
        until: Option<u64>,
        reverse: bool,
    ) -> StoreResult<Vec<Uid>>;

    /// One page of a descending scan over an index key.
    ///
    /// Returns up to `page` positions strictly below `before` (or from the
    /// top when `before` is `None`), newest first.
    async fn scan_index(
        &self,
        key: &IndexKey,
        before: Option<&Position>,
        page: usize,
    ) -> StoreResult<Vec<Position>>;

    /// Every stored record. Used by whole-store statistics.
    async fn all_records(&self) -> StoreResult<Vec<StoredRecord>>;

    async fn put_used(&self, uid: &Uid, last_used: u64) -> StoreResult<()>;

    async fn delete_used(&self, uid: &Uid) -> StoreResult<bool>;

    /// Every last-used record, in no particular order.
    async fn all_used(&self) -> StoreResult<Vec<UsedRecord>>;

    /// Read several records.
    ///
    /// Default implementation calls `get()` for each UID. Backends may
    /// override to read in one transaction.
    async fn get_batch(&self, uids: &[Uid]) -> StoreResult<Vec<Option<StoredRecord>>> {
        let mut out = Vec::with_capacity(uids.len());
        for uid in uids {
            out.push(self.get(uid).await?);
        }
        Ok(out)
    }
}
