use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use nidb_types::{Event, Uid};

use crate::error::StoreResult;
use crate::traits::EventStore;

/// Reference to a replaceable or addressable slot.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AddressPointer {
    pub kind: u16,
    pub pubkey: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier: Option<String>,
}

impl AddressPointer {
    pub fn new(kind: u16, pubkey: impl Into<String>, identifier: Option<&str>) -> Self {
        Self {
            kind,
            pubkey: pubkey.into(),
            identifier: identifier.map(str::to_string),
        }
    }

    pub fn uid(&self) -> Uid {
        Uid::replaceable(self.kind, &self.pubkey, self.identifier.as_deref().unwrap_or(""))
    }
}

/// Load the events stored at each address, newest first.
///
/// Missing addresses are skipped; duplicate pointers yield one event.
pub async fn events_from_address_pointers(
    store: &dyn EventStore,
    pointers: &[AddressPointer],
) -> StoreResult<Vec<Event>> {
    let mut found: HashMap<Uid, Event> = HashMap::new();
    for pointer in pointers {
        let uid = pointer.uid();
        if found.contains_key(&uid) {
            continue;
        }
        if let Some(record) = store.get(&uid).await? {
            found.insert(uid, record.event);
        }
    }
    let mut events: Vec<Event> = found.into_values().collect();
    events.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
    Ok(events)
}

/// Number of stored events per kind.
pub async fn count_events_by_kind(store: &dyn EventStore) -> StoreResult<BTreeMap<u16, usize>> {
    let mut counts: BTreeMap<u16, usize> = BTreeMap::new();
    for record in store.all_records().await? {
        *counts.entry(record.event.kind).or_default() += 1;
    }
    Ok(counts)
}

/// Number of stored events per author.
pub async fn count_events_by_author(
    store: &dyn EventStore,
) -> StoreResult<BTreeMap<String, usize>> {
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for record in store.all_records().await? {
        *counts.entry(record.event.pubkey).or_default() += 1;
    }
    Ok(counts)
}

/// Number of stored events.
pub async fn count_events(store: &dyn EventStore) -> StoreResult<usize> {
    store.count().await
}
