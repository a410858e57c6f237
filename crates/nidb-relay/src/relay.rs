use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Instant;

use indexmap::IndexSet;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use nidb_index::IndexCache;
use nidb_query::{by_recency, min_limit, QueryEngine, SharedIndexCache};
use nidb_queue::{EventTransform, FlushReport, WriteQueue};
use nidb_store::{prune_last_used, EventStore, IndexKey, PruneReport};
use nidb_types::{matches_any, unix_timestamp, AcceptAll, Event, EventVerifier, Filter, KeyedEvent, KindClass, Uid};

use crate::config::EngineConfig;
use crate::error::{RelayError, RelayResult};
use crate::subscription::{Feature, Registry, Subscription, SubscriptionEntry, SubscriptionHandlers};

/// Ephemeral event ids remembered for duplicate suppression.
const EPHEMERAL_SEEN_MAX: usize = 10_000;

type PruneSkip = Arc<dyn Fn(&Event) -> bool + Send + Sync>;
type Clock = Arc<dyn Fn() -> u64 + Send + Sync>;

/// Bounded set of recently seen ids in insertion order, oldest evicted
/// first.
#[derive(Default)]
struct RecentIds(IndexSet<String>);

impl RecentIds {
    /// Returns `true` if `id` was not already present.
    fn insert(&mut self, id: &str) -> bool {
        if self.0.contains(id) {
            return false;
        }
        self.0.insert(id.to_string());
        while self.0.len() > EPHEMERAL_SEEN_MAX {
            self.0.shift_remove_index(0);
        }
        true
    }

    fn clear(&mut self) {
        self.0.clear();
    }
}

struct Timers {
    flush: JoinHandle<()>,
    prune: JoinHandle<()>,
}

struct RelayInner {
    config: EngineConfig,
    store: Arc<dyn EventStore>,
    queue: WriteQueue,
    engine: QueryEngine,
    index_cache: SharedIndexCache,
    /// Latest known version of every non-ephemeral UID published or read.
    /// Drives live-delivery dedup and index cache upkeep; reads always go
    /// to the queue and the store.
    seen: Mutex<HashMap<Uid, Event>>,
    ephemeral: Mutex<RecentIds>,
    verifier: Arc<dyn EventVerifier>,
    prune_skip: Option<PruneSkip>,
    subscriptions: Arc<Registry>,
    flush_lock: tokio::sync::Mutex<()>,
    prune_lock: tokio::sync::Mutex<()>,
    timers: Mutex<Option<Timers>>,
}

/// Builder for a [`Relay`].
pub struct RelayBuilder {
    store: Arc<dyn EventStore>,
    config: EngineConfig,
    verifier: Arc<dyn EventVerifier>,
    prune_skip: Option<PruneSkip>,
    clock: Option<Clock>,
}

impl RelayBuilder {
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Validate events on publish and again when flushed.
    pub fn with_verifier(mut self, verifier: Arc<dyn EventVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    /// Protect events matching `skip` from pruning.
    pub fn with_prune_skip(mut self, skip: impl Fn(&Event) -> bool + Send + Sync + 'static) -> Self {
        self.prune_skip = Some(Arc::new(skip));
        self
    }

    /// Clock (unix seconds) used for last-used timestamps.
    pub fn with_clock(mut self, clock: impl Fn() -> u64 + Send + Sync + 'static) -> Self {
        self.clock = Some(Arc::new(clock));
        self
    }

    /// Build the engine. Fails if the configuration does not validate.
    pub fn build(self) -> RelayResult<Relay> {
        self.config.validate()?;
        let index_cache: SharedIndexCache =
            Arc::new(Mutex::new(IndexCache::with_max(self.config.cache_indexes)));

        let clock: Clock = match self.clock {
            Some(clock) => clock,
            None => Arc::new(unix_timestamp),
        };
        let queue = WriteQueue::new(self.store.clone())
            .with_verifier(self.verifier.clone())
            .with_clock(move || (clock)());
        let engine = QueryEngine::new(self.store.clone())
            .with_index_cache(index_cache.clone())
            .with_strategy(self.config.query_strategy);

        Ok(Relay {
            inner: Arc::new(RelayInner {
                config: self.config,
                store: self.store,
                queue,
                engine,
                index_cache,
                seen: Mutex::new(HashMap::new()),
                ephemeral: Mutex::new(RecentIds::default()),
                verifier: self.verifier,
                prune_skip: self.prune_skip,
                subscriptions: Arc::new(Registry::default()),
                flush_lock: tokio::sync::Mutex::new(()),
                prune_lock: tokio::sync::Mutex::new(()),
                timers: Mutex::new(None),
            }),
        })
    }
}

/// Embeddable event engine: publish, query and subscribe over one durable
/// store.
///
/// Published events are buffered in a write queue and become visible to
/// every read immediately; a background task flushes them to the store
/// and another prunes the store to `max_events`. Cloning the handle is
/// cheap and every clone drives the same engine.
///
/// [`Relay::start`], [`Relay::stop`] and [`Relay::subscribe`] must be called
/// from within a tokio runtime.
#[derive(Clone)]
pub struct Relay {
    inner: Arc<RelayInner>,
}

impl Relay {
    pub fn new(store: Arc<dyn EventStore>, config: EngineConfig) -> RelayResult<Self> {
        Self::builder(store).with_config(config).build()
    }

    pub fn builder(store: Arc<dyn EventStore>) -> RelayBuilder {
        RelayBuilder {
            store,
            config: EngineConfig::default(),
            verifier: Arc::new(AcceptAll),
            prune_skip: None,
            clock: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.inner.store
    }

    /// Events waiting to be flushed.
    pub fn pending_len(&self) -> usize {
        self.inner.queue.len()
    }

    /// Number of open subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.len()
    }

    /// Capabilities beyond the base operations.
    pub fn supports(&self) -> Vec<Feature> {
        vec![Feature::Subscribe]
    }

    /// Install or remove the transform applied to each flushed batch.
    pub fn set_transform(&self, transform: Option<Arc<dyn EventTransform>>) {
        self.inner.queue.set_transform(transform);
    }

    // -----------------------------------------------------------------------
    // Publishing
    // -----------------------------------------------------------------------

    /// Publish an event.
    ///
    /// Ephemeral events only go to live subscriptions. Anything else is
    /// queued for the store and becomes readable at once. Matching
    /// subscriptions are notified before this returns, the first time a
    /// UID is seen. Returns `false` only if the verifier rejects the event.
    pub fn add(&self, event: Event) -> bool {
        if !self.inner.verifier.verify(&event) {
            debug!(id = %event.id, "rejected event");
            return false;
        }
        let keyed = KeyedEvent::new(event);

        let first = if keyed.class().is_persisted() {
            self.inner.queue.add_event(keyed.clone());
            self.inner.remember(&keyed)
        } else {
            self.inner.lock_ephemeral().insert(&keyed.id)
        };

        if first {
            for sub in self.inner.subscriptions.matching(keyed.event()) {
                sub.deliver(keyed.event());
            }
        }
        true
    }

    /// Alias of [`Relay::add`].
    pub fn publish(&self, event: Event) -> bool {
        self.add(event)
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Look up an event by id or UID. The newest of the pending and stored
    /// versions wins.
    pub async fn event(&self, key: &str) -> RelayResult<Option<Event>> {
        let pending = self.inner.queue.pending_by_key(key);
        let stored = self.inner.engine.load_one(&Uid::from(key)).await?;
        if let Some(ref event) = stored {
            self.inner.queue.touch([Uid::of(event)]);
        }
        Ok(match (pending, stored) {
            (Some(p), Some(s)) if s.created_at > p.created_at => Some(s),
            (Some(p), _) => Some(p),
            (None, s) => s,
        })
    }

    /// Latest event in a replaceable or addressable slot.
    pub async fn replaceable(
        &self,
        kind: u16,
        pubkey: &str,
        identifier: Option<&str>,
    ) -> RelayResult<Option<Event>> {
        let uid = Uid::replaceable(kind, pubkey, identifier.unwrap_or(""));
        self.event(uid.as_str()).await
    }

    /// Number of distinct events matching any filter, pending included.
    pub async fn count(&self, filters: &[Filter]) -> RelayResult<usize> {
        let mut ids = self.inner.engine.ids_for_filters(filters).await?;
        for event in self.inner.queue.match_pending(filters) {
            if !ids.contains(event.id.as_str()) {
                ids.insert(Uid::of(&event));
            }
        }
        Ok(ids.len())
    }

    /// One-shot query over pending and stored events, newest first.
    pub async fn filters(&self, filters: &[Filter]) -> RelayResult<Vec<Event>> {
        let pending = self.inner.queue.match_pending(filters);
        self.inner.merged(filters, pending).await
    }

    /// Open a live subscription.
    ///
    /// Stored and pending matches are delivered in the background, newest
    /// first, followed by EOSE. If that takes longer than the EOSE timeout,
    /// EOSE is sent early and the stored events follow when ready. Live
    /// matches are delivered from [`Relay::add`] until the subscription is
    /// closed.
    pub fn subscribe(&self, filters: Vec<Filter>, handlers: SubscriptionHandlers) -> Subscription {
        let entry = Arc::new(SubscriptionEntry::new(filters, handlers));
        self.inner.subscriptions.register(entry.clone());
        debug!(id = %entry.id, filters = entry.filters.len(), "subscription opened");

        let pending = self.inner.queue.match_pending(&entry.filters);
        let relay = self.clone();
        let catch_up = entry.clone();
        tokio::spawn(async move { relay.catch_up(catch_up, pending).await });

        Subscription::new(entry, &self.inner.subscriptions)
    }

    async fn catch_up(&self, entry: Arc<SubscriptionEntry>, pending: Vec<Event>) {
        let started = Instant::now();
        let mut fetch = Box::pin(self.inner.merged(&entry.filters, pending));

        let result = match tokio::time::timeout(self.inner.config.base_eose_timeout(), &mut fetch).await {
            Ok(result) => result,
            Err(_) => {
                warn!(id = %entry.id, "catch-up timed out, sending EOSE");
                entry.signal_eose();
                fetch.await
            }
        };

        match result {
            Ok(events) => {
                for event in &events {
                    if entry.is_closed() {
                        break;
                    }
                    entry.deliver_stored(event);
                }
                debug!(
                    id = %entry.id,
                    events = events.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "catch-up finished"
                );
            }
            Err(err) => {
                warn!(id = %entry.id, error = %err, "catch-up failed");
                entry.signal_error(&err);
            }
        }
        entry.finish_catch_up();
        entry.signal_eose();
    }

    // -----------------------------------------------------------------------
    // Deletes
    // -----------------------------------------------------------------------

    /// Delete one event by id or UID, stored and pending.
    pub async fn delete_event(&self, key: &str) -> RelayResult<bool> {
        let removed = self
            .inner
            .queue
            .remove_where(|e| e.uid().as_str() == key || e.id == key);
        let deleted = match self.inner.resolve(key).await? {
            Some(uid) => self.inner.delete_uid(&uid).await?,
            None => false,
        };
        let dropped = !removed.is_empty();
        self.inner.settle(removed).await?;
        Ok(deleted || dropped)
    }

    /// Delete the event in one replaceable or addressable slot.
    pub async fn delete_replaceable(
        &self,
        pubkey: &str,
        kind: u16,
        identifier: Option<&str>,
    ) -> RelayResult<bool> {
        require_replaceable(kind)?;
        let uid = Uid::replaceable(kind, pubkey, identifier.unwrap_or(""));
        self.delete_event(uid.as_str()).await
    }

    /// Delete every slot of `kind` owned by `pubkey`. Returns how many
    /// slots were cleared.
    pub async fn delete_all_replaceable(&self, pubkey: &str, kind: u16) -> RelayResult<usize> {
        require_replaceable(kind)?;
        let store = self.inner.store.as_ref();
        let by_author: HashSet<Uid> = store
            .keys_by_index(&IndexKey::Author(pubkey.to_string()))
            .await?
            .into_iter()
            .collect();
        let uids: Vec<Uid> = store
            .keys_by_index(&IndexKey::Kind(kind))
            .await?
            .into_iter()
            .filter(|uid| by_author.contains(uid))
            .collect();

        let removed = self
            .inner
            .queue
            .remove_where(|e| e.kind == kind && e.pubkey == pubkey);
        let mut gone: HashSet<Uid> = removed.iter().map(|e| e.uid().clone()).collect();
        for uid in uids {
            if self.inner.delete_uid(&uid).await? {
                gone.insert(uid);
            }
        }
        self.inner.settle(removed).await?;
        info!(pubkey, kind, deleted = gone.len(), "deleted replaceable slots");
        Ok(gone.len())
    }

    /// Delete everything matching any filter. Returns the number of
    /// distinct events removed.
    pub async fn delete_by_filters(&self, filters: &[Filter]) -> RelayResult<usize> {
        let uids = self.inner.engine.ids_for_filters(filters).await?;
        let removed = self.inner.queue.remove_where(|e| matches_any(filters, e));
        let mut gone: HashSet<Uid> = removed.iter().map(|e| e.uid().clone()).collect();

        for uid in &uids {
            let Some(target) = self.inner.resolve(uid.as_str()).await? else {
                continue;
            };
            let Some(record) = self.inner.store.get(&target).await? else {
                continue;
            };
            // Cached indexes may name a slot whose stored version no longer
            // matches.
            if !filters.iter().any(|f| selects(f, &record.event)) {
                continue;
            }
            if self.inner.delete_uid(&target).await? {
                gone.insert(target);
            }
        }
        self.inner.settle(removed).await?;
        info!(filters = filters.len(), deleted = gone.len(), "deleted by filters");
        Ok(gone.len())
    }

    /// Delete every stored and pending event and drop all caches.
    pub async fn delete_all_events(&self) -> RelayResult<()> {
        self.inner.store.clear().await?;
        let dropped = self.inner.queue.remove_where(|_| true);
        lock(&self.inner.index_cache).clear();
        lock(&self.inner.seen).clear();
        self.inner.lock_ephemeral().clear();
        info!(pending = dropped.len(), "deleted all events");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Maintenance
    // -----------------------------------------------------------------------

    /// Write one batch of pending events. A failed batch stays queued
    /// and is retried by the next flush.
    pub async fn flush(&self) -> RelayResult<FlushReport> {
        let _guard = self.inner.flush_lock.lock().await;
        let report = self.inner.queue.flush(self.inner.config.batch_write).await?;
        self.inner.reconcile(&report.flushed).await?;
        Ok(report)
    }

    /// Flush until nothing is pending. Returns the number of records
    /// written.
    pub async fn flush_all(&self) -> RelayResult<usize> {
        let mut written = 0;
        loop {
            let report = self.flush().await?;
            written += report.written;
            if report.remaining == 0 || report.taken == 0 {
                return Ok(written);
            }
        }
    }

    /// Trim the store to `max_events`, least recently used first, and
    /// forget the removed events.
    pub async fn prune(&self) -> RelayResult<PruneReport> {
        let _guard = self.inner.prune_lock.lock().await;
        let report = prune_last_used(
            self.inner.store.as_ref(),
            self.inner.config.max_events,
            self.inner.prune_skip.as_deref(),
        )
        .await?;
        for event in &report.removed {
            self.inner.forget(&KeyedEvent::new(event.clone()));
        }
        Ok(report)
    }

    /// Start the flush and prune timers. Does nothing if already running.
    pub fn start(&self) {
        let mut timers = lock(&self.inner.timers);
        if timers.is_some() {
            return;
        }

        let weak = Arc::downgrade(&self.inner);
        let interval = self.inner.config.write_interval();
        let flush = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(relay) = upgrade(&weak) else {
                    break;
                };
                if let Err(err) = relay.flush().await {
                    warn!(error = %err, "scheduled flush failed");
                }
            }
        });

        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.config.prune_interval();
        let prune = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(relay) = upgrade(&weak) else {
                    break;
                };
                if let Err(err) = relay.prune().await {
                    warn!(error = %err, "scheduled prune failed");
                }
            }
        });

        *timers = Some(Timers { flush, prune });
        info!(
            write_interval_ms = self.inner.config.write_interval_ms,
            prune_interval_ms = self.inner.config.prune_interval_ms,
            "engine started"
        );
    }

    /// Stop the timers. Waits for a flush or prune in progress to finish
    /// so no batch is abandoned halfway.
    pub async fn stop(&self) {
        let Some(timers) = lock(&self.inner.timers).take() else {
            return;
        };
        let _flush = self.inner.flush_lock.lock().await;
        let _prune = self.inner.prune_lock.lock().await;
        timers.flush.abort();
        timers.prune.abort();
        info!("engine stopped");
    }

    pub fn is_running(&self) -> bool {
        lock(&self.inner.timers).is_some()
    }
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay")
            .field("pending", &self.pending_len())
            .field("subscriptions", &self.subscription_count())
            .field("running", &self.is_running())
            .field("strategy", &self.inner.config.query_strategy)
            .finish()
    }
}

impl RelayInner {
    /// Record a published event in the seen map and the index cache.
    /// Returns `true` the first time its UID is seen. An older version of
    /// a known slot leaves both untouched.
    fn remember(&self, keyed: &KeyedEvent) -> bool {
        let previous = {
            let mut seen = lock(&self.seen);
            let previous = seen.get(keyed.uid()).cloned();
            let stale = previous
                .as_ref()
                .is_some_and(|old| keyed.created_at < old.created_at);
            if stale {
                return false;
            }
            seen.insert(keyed.uid().clone(), keyed.event().clone());
            previous
        };

        let first = previous.is_none();
        let mut cache = lock(&self.index_cache);
        if let Some(old) = previous {
            cache.remove_event(&KeyedEvent::new(old));
        }
        cache.add_event_to_indexes(keyed);
        first
    }

    /// Keep events read from the store in the seen map, unless a newer
    /// version is already there.
    fn remember_stored(&self, events: &[Event]) {
        let mut seen = lock(&self.seen);
        for event in events {
            let uid = Uid::of(event);
            let newer = seen
                .get(&uid)
                .map_or(true, |known| event.created_at >= known.created_at);
            if newer {
                seen.insert(uid, event.clone());
            }
        }
    }

    /// Stored and pending matches merged by UID, the newest version of
    /// each kept, pending winning ties. Newest first, cut to the smallest
    /// `limit`.
    async fn merged(&self, filters: &[Filter], pending: Vec<Event>) -> RelayResult<Vec<Event>> {
        let stored = self.engine.events_for_filters(filters).await?;
        self.remember_stored(&stored);
        self.queue.touch(stored.iter().map(Uid::of));

        let mut merged: HashMap<Uid, Event> = stored.into_iter().map(|e| (Uid::of(&e), e)).collect();
        for event in pending {
            let uid = Uid::of(&event);
            let newer = merged
                .get(&uid)
                .map_or(true, |known| event.created_at >= known.created_at);
            if newer {
                merged.insert(uid, event);
            }
        }

        let mut events: Vec<Event> = merged.into_values().collect();
        events.sort_by(by_recency);
        if let Some(limit) = min_limit(filters) {
            events.truncate(limit);
        }
        Ok(events)
    }

    /// Bring the seen map and the index cache in line with what a flush
    /// stored. The transform or the replaceable-write policy may have
    /// kept another version of an event, or none at all.
    async fn reconcile(&self, flushed: &[Event]) -> RelayResult<()> {
        if flushed.is_empty() {
            return Ok(());
        }
        let batch: Vec<KeyedEvent> = flushed.iter().cloned().map(KeyedEvent::new).collect();
        let uids: Vec<Uid> = batch.iter().map(|k| k.uid().clone()).collect();
        let records = self.store.get_batch(&uids).await?;

        let mut changed = 0usize;
        for (keyed, record) in batch.iter().zip(records) {
            let stored = record.map(|r| r.event);
            if stored.as_ref() == Some(keyed.event()) {
                continue;
            }
            changed += 1;

            let mut seen = lock(&self.seen);
            // A newer version published while the batch was in flight
            // keeps its place.
            let newer = seen
                .get(keyed.uid())
                .filter(|current| current.id != keyed.id)
                .cloned();
            let mut cache = lock(&self.index_cache);
            cache.remove_event(keyed);
            if let Some(ref event) = stored {
                cache.add_event_to_indexes(&KeyedEvent::new(event.clone()));
            }
            match newer {
                Some(event) => cache.add_event_to_indexes(&KeyedEvent::new(event)),
                None => match stored {
                    Some(event) => {
                        seen.insert(keyed.uid().clone(), event);
                    }
                    None => {
                        seen.remove(keyed.uid());
                    }
                },
            }
        }
        if changed > 0 {
            debug!(changed, "flushed events differ from the stored versions");
        }
        Ok(())
    }

    /// Stored UID for an id or UID.
    async fn resolve(&self, key: &str) -> RelayResult<Option<Uid>> {
        let uid = Uid::from(key);
        if self.store.get(&uid).await?.is_some() {
            return Ok(Some(uid));
        }
        if uid.is_address() {
            return Ok(None);
        }
        Ok(self
            .store
            .keys_by_index(&IndexKey::Id(key.to_string()))
            .await?
            .into_iter()
            .next())
    }

    /// Delete one stored record and forget it. Returns `false` if nothing
    /// was stored under `uid`.
    async fn delete_uid(&self, uid: &Uid) -> RelayResult<bool> {
        let Some(record) = self.store.get(uid).await? else {
            lock(&self.seen).remove(uid);
            return Ok(false);
        };
        let deleted = self.store.delete(uid).await?;
        self.store.delete_used(uid).await?;
        self.forget(&KeyedEvent::new(record.event));
        Ok(deleted)
    }

    /// Clean up after pending events were dropped. A slot that still has a
    /// stored version keeps its index entries and is reloaded from the
    /// store on the next read.
    async fn settle(&self, removed: Vec<KeyedEvent>) -> RelayResult<()> {
        for keyed in removed {
            if self.store.get(keyed.uid()).await?.is_some() {
                lock(&self.seen).remove(keyed.uid());
            } else {
                self.forget(&keyed);
            }
        }
        Ok(())
    }

    fn forget(&self, keyed: &KeyedEvent) {
        lock(&self.index_cache).remove_event(keyed);
        lock(&self.seen).remove(keyed.uid());
    }

    fn lock_ephemeral(&self) -> MutexGuard<'_, RecentIds> {
        lock(&self.ephemeral)
    }
}

/// Whether `filter` selects `event` for deletion. An `ids` filter selects
/// by id or UID alone, matching how it resolves.
fn selects(filter: &Filter, event: &Event) -> bool {
    match filter.ids {
        Some(ref ids) => {
            let uid = Uid::of(event);
            ids.iter().any(|id| *id == event.id || id.as_str() == uid.as_str())
        }
        None => filter.matches(event),
    }
}

fn require_replaceable(kind: u16) -> RelayResult<()> {
    if KindClass::of(kind).is_keyed_by_address() {
        Ok(())
    } else {
        Err(RelayError::NotReplaceable { kind })
    }
}

fn upgrade(weak: &Weak<RelayInner>) -> Option<Relay> {
    weak.upgrade().map(|inner| Relay { inner })
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
