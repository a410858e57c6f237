use tracing::{debug, info};

use nidb_types::Event;

use crate::error::StoreResult;
use crate::traits::EventStore;

/// Outcome of a prune run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PruneReport {
    /// Events deleted from the store, oldest last-used first.
    pub removed: Vec<Event>,
    /// Records the skip predicate protected from eviction.
    pub skipped: usize,
}

impl PruneReport {
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty()
    }
}

/// Shrink the store to `max_events` records, evicting least recently used
/// first.
///
/// Does nothing when the store already holds `max_events` or fewer. A record
/// protected by `skip` does not count toward the number to remove, so a
/// heavily protected store can end above its target; the walk always ends
/// once every last-used record has been visited. Last-used records whose
/// event is already gone are dropped along the way.
pub async fn prune_last_used(
    store: &dyn EventStore,
    max_events: usize,
    skip: Option<&(dyn Fn(&Event) -> bool + Send + Sync)>,
) -> StoreResult<PruneReport> {
    let count = store.count().await?;
    let mut report = PruneReport::default();
    if count <= max_events {
        return Ok(report);
    }
    let mut overflow = count - max_events;
    info!(count, max_events, overflow, "pruning store");

    let mut used = store.all_used().await?;
    used.sort_by(|a, b| a.last_used.cmp(&b.last_used).then_with(|| a.uid.cmp(&b.uid)));

    for entry in used {
        if overflow == 0 {
            break;
        }
        let Some(record) = store.get(&entry.uid).await? else {
            store.delete_used(&entry.uid).await?;
            continue;
        };
        if skip.is_some_and(|protect| protect(&record.event)) {
            report.skipped += 1;
            continue;
        }
        store.delete(&entry.uid).await?;
        store.delete_used(&entry.uid).await?;
        report.removed.push(record.event);
        overflow -= 1;
    }

    if overflow > 0 {
        debug!(remaining = overflow, skipped = report.skipped, "prune stopped short of target");
    }
    info!(removed = report.removed.len(), skipped = report.skipped, "prune finished");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::{add_events, update_used};
    use crate::memory::InMemoryEventStore;
    use nidb_types::{AcceptAll, EventBuilder, Uid};

    /// Store `n` notes; note `i` was last used at time `i + 1`.
    async fn seeded(n: u64) -> (InMemoryEventStore, Vec<Event>) {
        let store = InMemoryEventStore::new();
        let events: Vec<Event> = (0..n)
            .map(|i| EventBuilder::new(1).created_at(1000 + i).content(i.to_string()).build())
            .collect();
        add_events(&store, events.clone(), &AcceptAll).await.unwrap();
        for (i, event) in events.iter().enumerate() {
            update_used(&store, [&event.uid()], i as u64 + 1).await.unwrap();
        }
        (store, events)
    }

    #[tokio::test]
    async fn noop_under_limit() {
        let (store, _) = seeded(5).await;
        let report = prune_last_used(&store, 10, None).await.unwrap();
        assert!(report.is_empty());
        assert_eq!(store.len(), 5);
    }

    #[tokio::test]
    async fn removes_least_recently_used() {
        let (store, events) = seeded(12).await;
        let report = prune_last_used(&store, 10, None).await.unwrap();

        assert_eq!(store.len(), 10);
        assert_eq!(report.removed, vec![events[0].clone(), events[1].clone()]);
        assert!(store.last_used(&events[0].uid()).is_none());
        assert!(store.last_used(&events[2].uid()).is_some());
    }

    #[tokio::test]
    async fn skipped_records_are_not_counted() {
        let (store, events) = seeded(12).await;
        let protected = events[0].id.clone();
        let skip = move |e: &Event| e.id == protected;
        let report = prune_last_used(&store, 10, Some(&skip)).await.unwrap();

        assert_eq!(report.skipped, 1);
        assert_eq!(report.removed, vec![events[1].clone(), events[2].clone()]);
        assert_eq!(store.len(), 10);
    }

    #[tokio::test]
    async fn protecting_everything_terminates() {
        let (store, _) = seeded(4).await;
        let skip = |_: &Event| true;
        let report = prune_last_used(&store, 1, Some(&skip)).await.unwrap();
        assert_eq!(report.skipped, 4);
        assert!(report.removed.is_empty());
        assert_eq!(store.len(), 4);
    }

    #[tokio::test]
    async fn dangling_used_records_are_cleaned() {
        let (store, events) = seeded(3).await;
        update_used(&store, [&Uid::from("gone")], 0).await.unwrap();
        let report = prune_last_used(&store, 2, None).await.unwrap();

        assert_eq!(report.removed, vec![events[0].clone()]);
        assert!(store.last_used(&Uid::from("gone")).is_none());
    }
}
