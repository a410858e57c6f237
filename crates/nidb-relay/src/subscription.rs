use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};

use serde::{Deserialize, Serialize};
use tracing::debug;

use nidb_types::{matches_any, Event, Filter};

use crate::error::RelayError;

type EventFn = Box<dyn Fn(&Event) + Send + Sync>;
type SignalFn = Box<dyn Fn() + Send + Sync>;
type ErrorFn = Box<dyn Fn(&RelayError) + Send + Sync>;

/// Optional capabilities an engine can advertise.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Feature {
    Subscribe,
    Search,
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Subscribe => f.write_str("subscribe"),
            Self::Search => f.write_str("search"),
        }
    }
}

/// Callbacks for one subscription. Any of them may be left out.
#[derive(Default)]
pub struct SubscriptionHandlers {
    event: Option<EventFn>,
    eose: Option<SignalFn>,
    error: Option<ErrorFn>,
    complete: Option<SignalFn>,
}

impl SubscriptionHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called for every stored and live event that matches.
    pub fn on_event(mut self, f: impl Fn(&Event) + Send + Sync + 'static) -> Self {
        self.event = Some(Box::new(f));
        self
    }

    /// Called once, when the stored events have been delivered or the
    /// catch-up timed out.
    pub fn on_eose(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.eose = Some(Box::new(f));
        self
    }

    /// Called if the catch-up fetch fails.
    pub fn on_error(mut self, f: impl Fn(&RelayError) + Send + Sync + 'static) -> Self {
        self.error = Some(Box::new(f));
        self
    }

    /// Called once, when the subscription is closed.
    pub fn on_complete(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.complete = Some(Box::new(f));
        self
    }
}

impl fmt::Debug for SubscriptionHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandlers")
            .field("event", &self.event.is_some())
            .field("eose", &self.eose.is_some())
            .field("error", &self.error.is_some())
            .field("complete", &self.complete.is_some())
            .finish()
    }
}

/// A registered subscription. Handlers are never called after `closed`
/// is set.
pub(crate) struct SubscriptionEntry {
    pub(crate) id: String,
    pub(crate) filters: Vec<Filter>,
    handlers: SubscriptionHandlers,
    closed: AtomicBool,
    eose_sent: AtomicBool,
    /// Ids delivered live while the catch-up is still running; `None`
    /// once it has finished.
    live_ids: Mutex<Option<HashSet<String>>>,
}

impl SubscriptionEntry {
    pub(crate) fn new(filters: Vec<Filter>, handlers: SubscriptionHandlers) -> Self {
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            filters,
            handlers,
            closed: AtomicBool::new(false),
            eose_sent: AtomicBool::new(false),
            live_ids: Mutex::new(Some(HashSet::new())),
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn matches(&self, event: &Event) -> bool {
        matches_any(&self.filters, event)
    }

    /// Deliver a live event.
    pub(crate) fn deliver(&self, event: &Event) {
        if let Some(ids) = self.live_ids().as_mut() {
            ids.insert(event.id.clone());
        }
        self.call_event(event);
    }

    /// Deliver a stored event from the catch-up, unless it already went out
    /// live.
    pub(crate) fn deliver_stored(&self, event: &Event) {
        let delivered = self
            .live_ids()
            .as_ref()
            .is_some_and(|ids| ids.contains(&event.id));
        if !delivered {
            self.call_event(event);
        }
    }

    pub(crate) fn finish_catch_up(&self) {
        self.live_ids().take();
    }

    fn call_event(&self, event: &Event) {
        if self.is_closed() {
            return;
        }
        if let Some(ref f) = self.handlers.event {
            f(event);
        }
    }

    fn live_ids(&self) -> MutexGuard<'_, Option<HashSet<String>>> {
        self.live_ids.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Signal end of stored events. Only the first call has any effect.
    pub(crate) fn signal_eose(&self) {
        if self.is_closed() || self.eose_sent.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(ref f) = self.handlers.eose {
            f();
        }
    }

    pub(crate) fn signal_error(&self, err: &RelayError) {
        if self.is_closed() {
            return;
        }
        if let Some(ref f) = self.handlers.error {
            f(err);
        }
    }

    /// Mark closed. Returns `true` for the call that closed it.
    fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        if let Some(ref f) = self.handlers.complete {
            f();
        }
        true
    }
}

/// Open subscriptions in registration order.
#[derive(Default)]
pub(crate) struct Registry {
    entries: RwLock<Vec<Arc<SubscriptionEntry>>>,
}

impl Registry {
    pub(crate) fn register(&self, entry: Arc<SubscriptionEntry>) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry);
    }

    /// Open subscriptions whose filters match `event`. The lock is released
    /// before any handler runs, so handlers may subscribe or close.
    pub(crate) fn matching(&self, event: &Event) -> Vec<Arc<SubscriptionEntry>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| !e.is_closed() && e.matches(event))
            .cloned()
            .collect()
    }

    fn remove(&self, id: &str) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|e| e.id != id);
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Handle to a live subscription.
///
/// Dropping the handle does not close the subscription; it stays
/// registered until [`Subscription::close`] is called.
pub struct Subscription {
    entry: Arc<SubscriptionEntry>,
    registry: Weak<Registry>,
}

impl Subscription {
    pub(crate) fn new(entry: Arc<SubscriptionEntry>, registry: &Arc<Registry>) -> Self {
        Self {
            entry,
            registry: Arc::downgrade(registry),
        }
    }

    pub fn id(&self) -> &str {
        &self.entry.id
    }

    pub fn filters(&self) -> &[Filter] {
        &self.entry.filters
    }

    pub fn is_closed(&self) -> bool {
        self.entry.is_closed()
    }

    /// Stop delivery, run the completion callback and unregister.
    /// Calling it again does nothing.
    pub fn close(&self) {
        if !self.entry.close() {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.entry.id);
        }
        debug!(id = %self.entry.id, "subscription closed");
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.entry.id)
            .field("filters", &self.entry.filters.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use nidb_types::EventBuilder;

    fn counter() -> (Arc<AtomicUsize>, impl Fn() + Send + Sync + 'static) {
        let n = Arc::new(AtomicUsize::new(0));
        let inner = n.clone();
        (n, move || {
            inner.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn open(filters: Vec<Filter>, handlers: SubscriptionHandlers) -> (Arc<Registry>, Subscription) {
        let registry = Arc::new(Registry::default());
        let entry = Arc::new(SubscriptionEntry::new(filters, handlers));
        registry.register(entry.clone());
        let sub = Subscription::new(entry, &registry);
        (registry, sub)
    }

    #[test]
    fn close_is_idempotent() {
        let (completed, on_complete) = counter();
        let (registry, sub) = open(vec![Filter::new().kinds([1])], SubscriptionHandlers::new().on_complete(on_complete));

        sub.close();
        sub.close();
        assert!(sub.is_closed());
        assert_eq!(completed.load(Ordering::SeqCst), 1);
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn eose_fires_once() {
        let (eose, on_eose) = counter();
        let entry = SubscriptionEntry::new(vec![], SubscriptionHandlers::new().on_eose(on_eose));
        entry.signal_eose();
        entry.signal_eose();
        assert_eq!(eose.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn no_delivery_after_close() {
        let (seen, on_seen) = counter();
        let (registry, sub) = open(
            vec![Filter::new().kinds([1])],
            SubscriptionHandlers::new().on_event(move |_| on_seen()),
        );
        let event = EventBuilder::new(1).build();
        let matching = registry.matching(&event);
        assert_eq!(matching.len(), 1);

        sub.close();
        matching[0].deliver(&event);
        assert_eq!(seen.load(Ordering::SeqCst), 0);
        assert!(registry.matching(&event).is_empty());
    }

    #[test]
    fn catch_up_skips_events_already_sent_live() {
        let (seen, on_seen) = counter();
        let entry = SubscriptionEntry::new(vec![], SubscriptionHandlers::new().on_event(move |_| on_seen()));
        let event = EventBuilder::new(1).build();

        entry.deliver(&event);
        entry.deliver_stored(&event);
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        entry.finish_catch_up();
        entry.deliver(&event);
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn matching_respects_filters() {
        let (registry, _sub) = open(vec![Filter::new().kinds([7])], SubscriptionHandlers::new());
        assert!(registry.matching(&EventBuilder::new(1).build()).is_empty());
        assert_eq!(registry.matching(&EventBuilder::new(7).build()).len(), 1);
    }

    #[test]
    fn ids_are_unique() {
        let a = SubscriptionEntry::new(vec![], SubscriptionHandlers::new());
        let b = SubscriptionEntry::new(vec![], SubscriptionHandlers::new());
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn feature_names() {
        assert_eq!(Feature::Subscribe.to_string(), "subscribe");
    }
}
