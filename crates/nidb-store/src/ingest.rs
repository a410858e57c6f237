use std::collections::HashMap;

use tracing::debug;

use nidb_types::{Event, EventVerifier, Uid};

use crate::error::StoreResult;
use crate::traits::{EventStore, StoredRecord};

/// Write a batch of events, applying the replaceable-write policy.
///
/// Events rejected by `verifier` are dropped without failing the batch.
/// Ephemeral events are never stored. For replaceable and addressable
/// events the `created_at` currently stored under each UID is read first,
/// and an event is written only if its `created_at` is not less than the
/// newest one seen so far for that UID, in the store or earlier in the
/// batch. Ties go to the later write.
///
/// Returns the number of records written.
pub async fn add_events(
    store: &dyn EventStore,
    events: Vec<Event>,
    verifier: &dyn EventVerifier,
) -> StoreResult<usize> {
    let total = events.len();
    let accepted: Vec<(Uid, Event)> = events
        .into_iter()
        .filter(|event| event.class().is_persisted())
        .filter(|event| {
            let ok = verifier.verify(event);
            if !ok {
                debug!(id = %event.id, "dropping event that failed verification");
            }
            ok
        })
        .map(|event| (event.uid(), event))
        .collect();

    let mut addresses: Vec<Uid> = accepted
        .iter()
        .filter(|(_, event)| event.class().is_keyed_by_address())
        .map(|(uid, _)| uid.clone())
        .collect();
    addresses.sort();
    addresses.dedup();

    let mut newest: HashMap<Uid, u64> = HashMap::new();
    let existing = store.get_batch(&addresses).await?;
    for (uid, record) in addresses.into_iter().zip(existing) {
        if let Some(record) = record {
            newest.insert(uid, record.event.created_at);
        }
    }

    let mut written = 0;
    for (uid, event) in accepted {
        if event.class().is_keyed_by_address() {
            if let Some(&current) = newest.get(&uid) {
                if event.created_at < current {
                    debug!(%uid, created_at = event.created_at, current, "skipping stale replaceable");
                    continue;
                }
            }
            newest.insert(uid, event.created_at);
        }
        store.put(StoredRecord::new(event)).await?;
        written += 1;
    }

    debug!(total, written, "ingested batch");
    Ok(written)
}

/// Write one event. Returns `true` if it was stored.
pub async fn add_event(
    store: &dyn EventStore,
    event: Event,
    verifier: &dyn EventVerifier,
) -> StoreResult<bool> {
    Ok(add_events(store, vec![event], verifier).await? == 1)
}

/// Record `now` as the last-used time of every UID.
pub async fn update_used<'a, I>(store: &dyn EventStore, uids: I, now: u64) -> StoreResult<()>
where
    I: IntoIterator<Item = &'a Uid>,
{
    for uid in uids {
        store.put_used(uid, now).await?;
    }
    Ok(())
}
