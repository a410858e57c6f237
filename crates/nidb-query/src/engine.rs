use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use nidb_index::{IndexCache, IndexId};
use nidb_store::{EventStore, IndexKey};
use nidb_types::{Event, Filter, Uid};

use crate::cursor;
use crate::error::{QueryError, QueryResult};
use crate::strategy::QueryStrategy;

/// Index cache shared between the engine and the ingest path.
pub type SharedIndexCache = Arc<Mutex<IndexCache>>;

/// Events already held in memory, keyed by UID. Consulted before the store.
pub type SharedEventCache = Arc<Mutex<HashMap<Uid, Event>>>;

/// Canonical result order: newest first, ties broken by UID, descending.
pub fn by_recency(a: &Event, b: &Event) -> Ordering {
    b.created_at
        .cmp(&a.created_at)
        .then_with(|| Uid::of(b).cmp(&Uid::of(a)))
}

/// Smallest `limit` across `filters`, if any sets one.
pub fn min_limit(filters: &[Filter]) -> Option<usize> {
    filters.iter().filter_map(|f| f.limit).min()
}

/// Resolves filters against the durable store.
///
/// The store is the source of truth. An optional [`IndexCache`] short-cuts
/// kind, author and tag lookups, and an optional event cache short-cuts
/// record reads. Pending writes are not seen here; merging them is the
/// caller's job.
pub struct QueryEngine {
    store: Arc<dyn EventStore>,
    index_cache: Option<SharedIndexCache>,
    event_cache: Option<SharedEventCache>,
    strategy: QueryStrategy,
}

impl QueryEngine {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self {
            store,
            index_cache: None,
            event_cache: None,
            strategy: QueryStrategy::default(),
        }
    }

    pub fn with_index_cache(mut self, cache: SharedIndexCache) -> Self {
        self.index_cache = Some(cache);
        self
    }

    pub fn with_event_cache(mut self, cache: SharedEventCache) -> Self {
        self.event_cache = Some(cache);
        self
    }

    pub fn with_strategy(mut self, strategy: QueryStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn strategy(&self) -> QueryStrategy {
        self.strategy
    }

    pub fn store(&self) -> &dyn EventStore {
        self.store.as_ref()
    }

    // -----------------------------------------------------------------------
    // Id resolution
    // -----------------------------------------------------------------------

    /// Resolve one filter to a set of UIDs.
    ///
    /// `ids` is returned verbatim and ignores every other field. `search`
    /// yields nothing. Otherwise the time range, each tag, `authors` and
    /// `kinds` are intersected. With both a time range and a `limit`, the
    /// result is cut to the `limit` newest entries of the time index.
    pub async fn ids_for_filter(&self, filter: &Filter) -> QueryResult<HashSet<Uid>> {
        if let Some(ref ids) = filter.ids {
            return Ok(ids.iter().map(|id| Uid::from(id.as_str())).collect());
        }
        if filter.search.is_some() {
            return Ok(HashSet::new());
        }
        if filter.is_empty() {
            return Err(QueryError::EmptyFilter);
        }

        let mut acc: Option<HashSet<Uid>> = None;

        let time_list = if filter.has_time_range() {
            let list = self
                .store
                .keys_by_time_range(filter.since, filter.until, true)
                .await?;
            intersect(&mut acc, list.iter().cloned().collect());
            Some(list)
        } else {
            None
        };

        for (name, values) in filter.tag_constraints() {
            let ids = values
                .iter()
                .map(|v| IndexId::Tag(nidb_types::tag_key(name, v)))
                .collect();
            intersect(&mut acc, self.union_of(ids).await?);
        }
        if let Some(ref authors) = filter.authors {
            let ids = authors.iter().cloned().map(IndexId::Author).collect();
            intersect(&mut acc, self.union_of(ids).await?);
        }
        if let Some(ref kinds) = filter.kinds {
            let ids = kinds.iter().copied().map(IndexId::Kind).collect();
            intersect(&mut acc, self.union_of(ids).await?);
        }

        let ids = acc.unwrap_or_default();
        match (filter.limit, time_list) {
            (Some(limit), Some(list)) => Ok(list
                .into_iter()
                .filter(|uid| ids.contains(uid))
                .take(limit)
                .collect()),
            _ => Ok(ids),
        }
    }

    /// Union of the UID sets of every filter.
    pub async fn ids_for_filters(&self, filters: &[Filter]) -> QueryResult<HashSet<Uid>> {
        if filters.is_empty() {
            return Err(QueryError::NoFilters);
        }
        let mut ids = HashSet::new();
        for filter in filters {
            ids.extend(self.ids_for_filter(filter).await?);
        }
        Ok(ids)
    }

    /// Union of the UIDs under several index ids, loading and caching any
    /// the cache does not hold.
    async fn union_of(&self, ids: Vec<IndexId>) -> QueryResult<HashSet<Uid>> {
        let mut out = HashSet::new();
        let missing: Vec<IndexId> = match self.index_cache.as_ref() {
            Some(cache) => {
                let mut cache = lock(cache);
                ids.into_iter()
                    .filter(|id| match cache.get(id) {
                        Some(set) => {
                            out.extend(set.iter().cloned());
                            false
                        }
                        None => true,
                    })
                    .collect()
            }
            None => ids,
        };

        for id in missing {
            let uids = self.store.keys_by_index(&store_key(&id)).await?;
            out.extend(uids.iter().cloned());
            if let Some(cache) = self.index_cache.as_ref() {
                lock(cache).set(id, uids.into_iter().collect());
            }
        }
        Ok(out)
    }

    // -----------------------------------------------------------------------
    // Event loading
    // -----------------------------------------------------------------------

    /// Load one event by UID: the event cache, then the store, then the
    /// store's id index for plain event ids that name an address-keyed
    /// record.
    pub async fn load_one(&self, uid: &Uid) -> QueryResult<Option<Event>> {
        if let Some(cache) = self.event_cache.as_ref() {
            if let Some(event) = lock(cache).get(uid) {
                return Ok(Some(event.clone()));
            }
        }
        if let Some(record) = self.store.get(uid).await? {
            return Ok(Some(record.event));
        }
        if uid.is_address() {
            return Ok(None);
        }
        let keys = self
            .store
            .keys_by_index(&IndexKey::Id(uid.to_string()))
            .await?;
        for key in keys {
            if let Some(record) = self.store.get(&key).await? {
                if record.event.id == uid.as_str() {
                    return Ok(Some(record.event));
                }
            }
        }
        Ok(None)
    }

    /// Load events for a set of UIDs, newest first. Missing UIDs are skipped.
    pub async fn load_events<'a, I>(&self, uids: I) -> QueryResult<Vec<Event>>
    where
        I: IntoIterator<Item = &'a Uid>,
    {
        let mut seen = HashSet::new();
        let mut events = Vec::new();
        for uid in uids {
            if let Some(event) = self.load_one(uid).await? {
                if seen.insert(event.id.clone()) {
                    events.push(event);
                }
            }
        }
        events.sort_by(by_recency);
        Ok(events)
    }

    // -----------------------------------------------------------------------
    // Events and counts
    // -----------------------------------------------------------------------

    pub async fn events_for_filter(&self, filter: &Filter) -> QueryResult<Vec<Event>> {
        self.events_for_filters(std::slice::from_ref(filter)).await
    }

    /// Events matching any filter, newest first, cut to the smallest
    /// `limit` among the filters.
    pub async fn events_for_filters(&self, filters: &[Filter]) -> QueryResult<Vec<Event>> {
        if filters.is_empty() {
            return Err(QueryError::NoFilters);
        }

        let mut merged: HashMap<Uid, Event> = HashMap::new();
        for filter in filters {
            for event in self.execute(filter).await? {
                merged.insert(Uid::of(&event), event);
            }
        }

        let mut events: Vec<Event> = merged.into_values().collect();
        events.sort_by(by_recency);
        if let Some(limit) = min_limit(filters) {
            events.truncate(limit);
        }
        debug!(filters = filters.len(), results = events.len(), strategy = %self.strategy, "query");
        Ok(events)
    }

    async fn execute(&self, filter: &Filter) -> QueryResult<Vec<Event>> {
        if self.strategy == QueryStrategy::CursorMerge && QueryStrategy::cursor_eligible(filter) {
            return cursor::execute(self, filter).await;
        }

        let ids = self.ids_for_filter(filter).await?;
        let mut events = self.load_events(&ids).await?;
        // Cached indexes can name a UID whose stored version has moved on.
        if filter.ids.is_none() {
            events.retain(|e| filter.matches(e));
        }
        Ok(events)
    }

    pub async fn count_for_filter(&self, filter: &Filter) -> QueryResult<usize> {
        Ok(self.ids_for_filter(filter).await?.len())
    }

    /// Number of distinct UIDs matched by any filter. Never loads events.
    pub async fn count_for_filters(&self, filters: &[Filter]) -> QueryResult<usize> {
        Ok(self.ids_for_filters(filters).await?.len())
    }
}

impl std::fmt::Debug for QueryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryEngine")
            .field("strategy", &self.strategy)
            .field("index_cache", &self.index_cache.is_some())
            .field("event_cache", &self.event_cache.is_some())
            .finish()
    }
}

fn intersect(acc: &mut Option<HashSet<Uid>>, set: HashSet<Uid>) {
    match acc {
        Some(current) => current.retain(|uid| set.contains(uid)),
        None => *acc = Some(set),
    }
}

fn store_key(id: &IndexId) -> IndexKey {
    match id {
        IndexId::Kind(kind) => IndexKey::Kind(*kind),
        IndexId::Author(pubkey) => IndexKey::Author(pubkey.clone()),
        IndexId::Tag(key) => IndexKey::Tag(key.clone()),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nidb_store::{add_events, InMemoryEventStore};
    use nidb_types::{fixture_pubkey, AcceptAll, EventBuilder};

    async fn engine_with(events: Vec<Event>) -> (Arc<InMemoryEventStore>, QueryEngine) {
        let store = Arc::new(InMemoryEventStore::new());
        add_events(store.as_ref(), events, &AcceptAll).await.unwrap();
        let engine = QueryEngine::new(store.clone());
        (store, engine)
    }

    fn note(author: &str, kind: u16, created_at: u64) -> Event {
        EventBuilder::new(kind)
            .author(author)
            .created_at(created_at)
            .build()
    }

    fn uid_set(events: &[&Event]) -> HashSet<Uid> {
        events.iter().map(|e| Uid::of(e)).collect()
    }

    // -----------------------------------------------------------------------
    // ids_for_filter
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn ids_bypass_other_fields() {
        let a = note("alice", 1, 10);
        let (_, engine) = engine_with(vec![a.clone()]).await;
        let filter = Filter::new().ids([a.id.clone(), "unknown".into()]).kinds([99]).since(1_000);

        let ids = engine.ids_for_filter(&filter).await.unwrap();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(a.id.as_str()));
        assert!(ids.contains("unknown"));
    }

    #[tokio::test]
    async fn search_yields_nothing() {
        let (_, engine) = engine_with(vec![note("alice", 1, 10)]).await;
        let ids = engine.ids_for_filter(&Filter::new().kinds([1]).search("x")).await.unwrap();
        assert!(ids.is_empty());
    }

    #[tokio::test]
    async fn empty_filter_is_an_error() {
        let (_, engine) = engine_with(vec![]).await;
        assert!(matches!(
            engine.ids_for_filter(&Filter::new().limit(3)).await,
            Err(QueryError::EmptyFilter)
        ));
        assert!(matches!(
            engine.ids_for_filters(&[]).await,
            Err(QueryError::NoFilters)
        ));
    }

    #[tokio::test]
    async fn fields_are_anded_values_ored() {
        let a1 = note("alice", 1, 10);
        let a7 = note("alice", 7, 11);
        let b1 = note("bob", 1, 12);
        let c2 = note("carol", 2, 13);
        let (_, engine) = engine_with(vec![a1.clone(), a7.clone(), b1.clone(), c2.clone()]).await;

        let filter = Filter::new()
            .authors([fixture_pubkey("alice"), fixture_pubkey("bob")])
            .kinds([1, 2]);
        let ids = engine.ids_for_filter(&filter).await.unwrap();
        assert_eq!(ids, uid_set(&[&a1, &b1]));
    }

    #[tokio::test]
    async fn tag_constraints_use_tag_index() {
        let tagged = EventBuilder::new(1).tag(["t", "rust"]).build();
        let other = EventBuilder::new(1).tag(["t", "go"]).build();
        let (_, engine) = engine_with(vec![tagged.clone(), other]).await;

        let ids = engine
            .ids_for_filter(&Filter::new().tag('t', ["rust", "zig"]))
            .await
            .unwrap();
        assert_eq!(ids, uid_set(&[&tagged]));
    }

    #[tokio::test]
    async fn time_limit_keeps_newest() {
        let events: Vec<Event> = (0..10).map(|i| note("alice", 1, 100 + i)).collect();
        let noise = note("alice", 2, 200);
        let mut all = events.clone();
        all.push(noise);
        let (_, engine) = engine_with(all).await;

        let filter = Filter::new().kinds([1]).since(100).limit(3);
        let ids = engine.ids_for_filter(&filter).await.unwrap();
        assert_eq!(ids, uid_set(&[&events[9], &events[8], &events[7]]));
    }

    #[tokio::test]
    async fn until_alone_is_a_constraint() {
        let old = note("alice", 1, 10);
        let new = note("alice", 1, 20);
        let (_, engine) = engine_with(vec![old.clone(), new]).await;
        let ids = engine.ids_for_filter(&Filter::new().until(15)).await.unwrap();
        assert_eq!(ids, uid_set(&[&old]));
    }

    #[tokio::test]
    async fn filters_are_unioned() {
        let a = note("alice", 1, 10);
        let b = note("bob", 2, 11);
        let (_, engine) = engine_with(vec![a.clone(), b.clone()]).await;

        let filters = [Filter::new().kinds([1]), Filter::new().kinds([2])];
        let ids = engine.ids_for_filters(&filters).await.unwrap();
        assert_eq!(ids, uid_set(&[&a, &b]));
    }

    // -----------------------------------------------------------------------
    // Index cache
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn misses_populate_the_cache() {
        let a = note("alice", 1, 10);
        let (_, engine) = engine_with(vec![a.clone()]).await;
        let cache: SharedIndexCache = Arc::new(Mutex::new(IndexCache::new()));
        let engine = engine.with_index_cache(cache.clone());

        engine
            .ids_for_filter(&Filter::new().kinds([1]).authors([a.pubkey.clone()]))
            .await
            .unwrap();

        let mut cache = cache.lock().unwrap();
        assert_eq!(cache.count(), 2);
        assert!(cache.get_kind_index(1).unwrap().contains(&a.uid()));
    }

    #[tokio::test]
    async fn cache_hits_skip_the_store() {
        let (store, engine) = engine_with(vec![note("alice", 1, 10)]).await;
        let cache: SharedIndexCache = Arc::new(Mutex::new(IndexCache::new()));
        cache
            .lock()
            .unwrap()
            .set_kind_index(1, [Uid::from("cached")].into_iter().collect());
        let engine = engine.with_index_cache(cache);

        store.fail_next_reads(1);
        let ids = engine.ids_for_filter(&Filter::new().kinds([1])).await.unwrap();
        assert_eq!(ids.len(), 1);
        assert!(ids.contains("cached"));
    }

    // -----------------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn events_are_sorted_and_cut_to_min_limit() {
        let events: Vec<Event> = (0..5).map(|i| note("alice", 1, 100 + i)).collect();
        let (_, engine) = engine_with(events.clone()).await;

        let filters = [Filter::new().kinds([1]).limit(4), Filter::new().kinds([1]).limit(2)];
        let got = engine.events_for_filters(&filters).await.unwrap();
        assert_eq!(got, vec![events[4].clone(), events[3].clone()]);
    }

    #[tokio::test]
    async fn ids_find_address_keyed_events() {
        let profile = EventBuilder::new(0).author("alice").build();
        let (_, engine) = engine_with(vec![profile.clone()]).await;
        let got = engine
            .events_for_filter(&Filter::new().ids([profile.id.clone()]))
            .await
            .unwrap();
        assert_eq!(got, vec![profile]);
    }

    #[tokio::test]
    async fn event_cache_is_consulted_first() {
        let stored = note("alice", 1, 10);
        let (_, engine) = engine_with(vec![stored.clone()]).await;
        let mut cached = stored.clone();
        cached.content = "from cache".into();
        let event_cache: SharedEventCache =
            Arc::new(Mutex::new([(stored.uid(), cached.clone())].into_iter().collect()));
        let engine = engine.with_event_cache(event_cache);

        let got = engine.events_for_filter(&Filter::new().kinds([1])).await.unwrap();
        assert_eq!(got, vec![cached]);
    }

    #[tokio::test]
    async fn counts_do_not_load() {
        let (store, engine) = engine_with(vec![note("alice", 1, 10), note("bob", 1, 11)]).await;
        assert_eq!(engine.count_for_filter(&Filter::new().kinds([1])).await.unwrap(), 2);
        store.clear().await.unwrap();
        assert_eq!(engine.count_for_filters(&[Filter::new().kinds([1])]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn store_errors_propagate() {
        let (store, engine) = engine_with(vec![note("alice", 1, 10)]).await;
        store.fail_next_reads(1);
        assert!(matches!(
            engine.events_for_filter(&Filter::new().kinds([1])).await,
            Err(QueryError::Store(_))
        ));
    }
}
