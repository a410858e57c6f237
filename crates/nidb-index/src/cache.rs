use std::collections::HashSet;

use indexmap::IndexMap;
use tracing::trace;

use nidb_types::{KeyedEvent, Uid};

use crate::id::IndexId;

/// A cached index: the UIDs stored under one kind, author or tag key.
pub type UidSet = HashSet<Uid>;

/// Default number of indexes kept before eviction.
pub const DEFAULT_MAX_INDEXES: usize = 1000;

/// LRU cache of whole secondary indexes.
///
/// Holds at most `max` indexes across all three families. The least
/// recently read or written index is evicted first, and eviction removes
/// the index itself, not individual members.
pub struct IndexCache {
    /// Ordered least recently used first.
    indexes: IndexMap<IndexId, UidSet>,
    max: usize,
}

impl IndexCache {
    pub fn new() -> Self {
        Self::with_max(DEFAULT_MAX_INDEXES)
    }

    pub fn with_max(max: usize) -> Self {
        Self {
            indexes: IndexMap::new(),
            max,
        }
    }

    /// Number of cached indexes.
    pub fn count(&self) -> usize {
        self.indexes.len()
    }

    pub fn max(&self) -> usize {
        self.max
    }

    /// Change the capacity, evicting immediately if the cache is over it.
    pub fn set_max(&mut self, max: usize) {
        self.max = max;
        self.prune_indexes();
    }

    /// Returns `true` if the index is cached. Does not count as a use.
    pub fn contains(&self, id: &IndexId) -> bool {
        self.indexes.contains_key(id)
    }

    /// Look up an index, marking it most recently used.
    pub fn get(&mut self, id: &IndexId) -> Option<&UidSet> {
        let pos = self.indexes.get_index_of(id)?;
        let newest = self.touch(pos);
        self.indexes.get_index(newest).map(|(_, uids)| uids)
    }

    /// Replace an index wholesale, marking it most recently used, then
    /// evict down to capacity.
    pub fn set(&mut self, id: IndexId, uids: UidSet) {
        let (pos, _) = self.indexes.insert_full(id, uids);
        self.touch(pos);
        self.prune_indexes();
    }

    pub fn get_kind_index(&mut self, kind: u16) -> Option<&UidSet> {
        self.get(&IndexId::Kind(kind))
    }

    pub fn set_kind_index(&mut self, kind: u16, uids: UidSet) {
        self.set(IndexId::Kind(kind), uids);
    }

    pub fn get_author_index(&mut self, pubkey: &str) -> Option<&UidSet> {
        self.get(&IndexId::Author(pubkey.to_string()))
    }

    pub fn set_author_index(&mut self, pubkey: &str, uids: UidSet) {
        self.set(IndexId::Author(pubkey.to_string()), uids);
    }

    pub fn get_tag_index(&mut self, tag_key: &str) -> Option<&UidSet> {
        self.get(&IndexId::Tag(tag_key.to_string()))
    }

    pub fn set_tag_index(&mut self, tag_key: &str, uids: UidSet) {
        self.set(IndexId::Tag(tag_key.to_string()), uids);
    }

    /// Add the event's UID to each of its indexes that is already cached.
    ///
    /// Indexes that are not cached stay absent: a partial set would be
    /// mistaken for a complete one by the next query. Recency is not
    /// changed, since ingest is not a use.
    pub fn add_event_to_indexes(&mut self, event: &KeyedEvent) {
        for id in IndexId::for_event(event) {
            if let Some(set) = self.indexes.get_mut(&id) {
                set.insert(event.uid().clone());
            }
        }
    }

    /// Remove the event's UID from each of its cached indexes.
    pub fn remove_event(&mut self, event: &KeyedEvent) {
        for id in IndexId::for_event(event) {
            if let Some(set) = self.indexes.get_mut(&id) {
                set.remove(event.uid());
            }
        }
    }

    /// Evict least recently used indexes until `count() <= max`.
    pub fn prune_indexes(&mut self) {
        while self.indexes.len() > self.max {
            let Some((oldest, _)) = self.indexes.shift_remove_index(0) else {
                break;
            };
            trace!(index = %oldest, "evicting index");
        }
    }

    /// Drop every cached index.
    pub fn clear(&mut self) {
        self.indexes.clear();
    }

    /// Move the entry at `pos` to the most recently used end and return
    /// its new position.
    fn touch(&mut self, pos: usize) -> usize {
        let newest = self.indexes.len() - 1;
        self.indexes.move_index(pos, newest);
        newest
    }
}

impl Default for IndexCache {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for IndexCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexCache")
            .field("count", &self.count())
            .field("max", &self.max)
            .finish()
    }
}
