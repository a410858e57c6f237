use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};

use nidb_store::{add_events, update_used, EventStore};
use nidb_types::{matches_any, unix_timestamp, AcceptAll, Event, EventVerifier, Filter, KeyedEvent, Uid};

use crate::error::QueueResult;
use crate::transform::EventTransform;

/// Default maximum number of events written per flush.
pub const DEFAULT_BATCH_WRITE: usize = 1000;

type Clock = Arc<dyn Fn() -> u64 + Send + Sync>;

#[derive(Default)]
struct QueueState {
    /// Waiting to be flushed, oldest first.
    pending: VecDeque<KeyedEvent>,
    /// Taken by the flush in progress; visible until its write completes.
    in_flight: Vec<KeyedEvent>,
    /// Ids currently pending or in flight.
    queued_ids: HashSet<String>,
    /// UIDs awaiting a last-used update.
    touched: HashSet<Uid>,
}

/// What one flush did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Events taken off the queue.
    pub taken: usize,
    /// Records the store actually wrote after verification and the
    /// replaceable-write policy.
    pub written: usize,
    /// Last-used records updated.
    pub touched: usize,
    /// Events still pending after this flush.
    pub remaining: usize,
    /// The events taken, as they were queued. The store may hold a
    /// different version of each after the transform and the
    /// replaceable-write policy.
    pub flushed: Vec<Event>,
}

/// Buffer of events waiting to be written to the durable store.
///
/// All methods take `&self`; the state sits behind a mutex that is never
/// held across an `.await`.
pub struct WriteQueue {
    state: Mutex<QueueState>,
    store: Arc<dyn EventStore>,
    verifier: Arc<dyn EventVerifier>,
    transform: Mutex<Option<Arc<dyn EventTransform>>>,
    clock: Clock,
}

impl WriteQueue {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            store,
            verifier: Arc::new(AcceptAll),
            transform: Mutex::new(None),
            clock: Arc::new(unix_timestamp),
        }
    }

    /// Use `verifier` to validate events as they are flushed.
    pub fn with_verifier(mut self, verifier: Arc<dyn EventVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    /// Use `clock` (unix seconds) for last-used timestamps.
    pub fn with_clock(mut self, clock: impl Fn() -> u64 + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Install or remove the transform applied to each flushed batch.
    pub fn set_transform(&self, transform: Option<Arc<dyn EventTransform>>) {
        *self.transform.lock().unwrap_or_else(PoisonError::into_inner) = transform;
    }

    /// Queue one event. Returns `false` if its id is already queued.
    pub fn add_event(&self, event: KeyedEvent) -> bool {
        let mut state = self.lock();
        if !state.queued_ids.insert(event.id.clone()) {
            return false;
        }
        state.touched.insert(event.uid().clone());
        state.pending.push_back(event);
        true
    }

    /// Queue several events, skipping ids already queued. Returns how many
    /// were added.
    pub fn add_events(&self, events: impl IntoIterator<Item = KeyedEvent>) -> usize {
        let mut state = self.lock();
        let mut added = 0;
        for event in events {
            if !state.queued_ids.insert(event.id.clone()) {
                continue;
            }
            state.touched.insert(event.uid().clone());
            state.pending.push_back(event);
            added += 1;
        }
        added
    }

    /// Mark UIDs as used without queueing anything.
    pub fn touch(&self, uids: impl IntoIterator<Item = Uid>) {
        self.lock().touched.extend(uids);
    }

    /// Queued and in-flight events matching any of `filters`, oldest first.
    pub fn match_pending(&self, filters: &[Filter]) -> Vec<Event> {
        let state = self.lock();
        state
            .in_flight
            .iter()
            .chain(state.pending.iter())
            .filter(|e| matches_any(filters, e))
            .map(|e| e.event().clone())
            .collect()
    }

    /// Newest queued or in-flight event whose UID or id equals `key`.
    pub fn pending_by_key(&self, key: &str) -> Option<Event> {
        let state = self.lock();
        state
            .in_flight
            .iter()
            .chain(state.pending.iter())
            .filter(|e| e.uid().as_str() == key || e.id == key)
            .fold(None::<&KeyedEvent>, |best, e| match best {
                Some(b) if b.created_at > e.created_at => Some(b),
                _ => Some(e),
            })
            .map(|e| e.event().clone())
    }

    /// Number of events waiting to be flushed.
    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().pending.is_empty()
    }

    /// Drop every pending event.
    ///
    /// The set of queued ids is kept, so an id dropped here is still
    /// rejected as a duplicate until the queue next flushes.
    pub fn clear(&self) {
        self.lock().pending.clear();
    }

    /// Remove pending events selected by `pred` and free their ids. Events
    /// already in flight are left alone. Returns the removed events.
    pub fn remove_where(&self, pred: impl Fn(&KeyedEvent) -> bool) -> Vec<KeyedEvent> {
        let mut state = self.lock();
        let (removed, kept): (Vec<KeyedEvent>, Vec<KeyedEvent>) =
            state.pending.drain(..).partition(|e| pred(e));
        state.pending = kept.into();
        for event in &removed {
            state.queued_ids.remove(&event.id);
        }
        removed
    }

    /// Write up to `max` pending events, oldest first, then record last-used
    /// times for every touched UID.
    ///
    /// If the write fails the taken events go back to the front of the
    /// queue in their original order and the error goes to the caller.
    pub async fn flush(&self, max: usize) -> QueueResult<FlushReport> {
        let batch: Vec<KeyedEvent> = {
            let mut state = self.lock();
            let n = max.min(state.pending.len());
            let batch: Vec<KeyedEvent> = state.pending.drain(..n).collect();
            state.in_flight = batch.clone();
            batch
        };

        let mut report = FlushReport {
            taken: batch.len(),
            ..FlushReport::default()
        };

        if !batch.is_empty() {
            let result = self.write_batch(batch).await;
            let taken = std::mem::take(&mut self.lock().in_flight);

            match result {
                Ok(written) => {
                    let mut state = self.lock();
                    for event in &taken {
                        state.queued_ids.remove(&event.id);
                    }
                    report.written = written;
                    report.flushed = taken.into_iter().map(KeyedEvent::into_event).collect();
                }
                Err(err) => {
                    let mut state = self.lock();
                    for event in taken.into_iter().rev() {
                        state.pending.push_front(event);
                    }
                    warn!(error = %err, requeued = report.taken, "flush failed");
                    return Err(err);
                }
            }
        }

        let touched: Vec<Uid> = std::mem::take(&mut self.lock().touched).into_iter().collect();
        if !touched.is_empty() {
            let now = (self.clock)();
            if let Err(err) = update_used(self.store.as_ref(), &touched, now).await {
                self.lock().touched.extend(touched);
                return Err(err.into());
            }
            report.touched = touched.len();
        }

        report.remaining = self.len();
        if report.taken > 0 || report.touched > 0 {
            debug!(
                taken = report.taken,
                written = report.written,
                touched = report.touched,
                remaining = report.remaining,
                "flushed write queue"
            );
        }
        Ok(report)
    }

    async fn write_batch(&self, batch: Vec<KeyedEvent>) -> QueueResult<usize> {
        let mut events: Vec<Event> = batch.into_iter().map(KeyedEvent::into_event).collect();
        let transform = self
            .transform
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(transform) = transform {
            events = transform.transform(events).await?;
        }
        Ok(add_events(self.store.as_ref(), events, self.verifier.as_ref()).await?)
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for WriteQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("WriteQueue")
            .field("pending", &state.pending.len())
            .field("in_flight", &state.in_flight.len())
            .field("touched", &state.touched.len())
            .finish()
    }
}
