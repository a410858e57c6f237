use std::collections::{BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use nidb_types::Uid;

use crate::error::{StoreError, StoreResult};
use crate::traits::{EventStore, IndexKey, Position, StoredRecord, UsedRecord};

#[derive(Default)]
struct Tables {
    records: HashMap<Uid, StoredRecord>,
    by_time: BTreeSet<Position>,
    by_key: HashMap<IndexKey, BTreeSet<Position>>,
    used: HashMap<Uid, u64>,
}

impl Tables {
    fn unindex(&mut self, record: &StoredRecord) {
        let pos = record.position();
        self.by_time.remove(&pos);
        for key in record.index_keys() {
            if let Some(set) = self.by_key.get_mut(&key) {
                set.remove(&pos);
                if set.is_empty() {
                    self.by_key.remove(&key);
                }
            }
        }
    }

    fn index(&mut self, record: &StoredRecord) {
        let pos = record.position();
        self.by_time.insert(pos.clone());
        for key in record.index_keys() {
            self.by_key.entry(key).or_default().insert(pos.clone());
        }
    }
}

/// In-memory event store with ordered secondary indexes.
///
/// Intended for tests and embedding. Every index is a `BTreeSet` of
/// [`Position`]s so range and descending scans come straight off the set.
/// Failures can be injected with [`fail_next_writes`](Self::fail_next_writes)
/// and [`fail_next_reads`](Self::fail_next_reads).
pub struct InMemoryEventStore {
    tables: RwLock<Tables>,
    failing_writes: AtomicUsize,
    failing_reads: AtomicUsize,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            failing_writes: AtomicUsize::new(0),
            failing_reads: AtomicUsize::new(0),
        }
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().records.is_empty()
    }

    /// Last-used timestamp recorded for `uid`.
    pub fn last_used(&self, uid: &Uid) -> Option<u64> {
        self.read().used.get(uid).copied()
    }

    /// Make the next `n` write operations fail.
    pub fn fail_next_writes(&self, n: usize) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` read operations fail.
    pub fn fail_next_reads(&self, n: usize) {
        self.failing_reads.store(n, Ordering::SeqCst);
    }

    fn check_write(&self, op: &str) -> StoreResult<()> {
        if take_one(&self.failing_writes) {
            return Err(StoreError::WriteFailed(format!("{op}: injected failure")));
        }
        Ok(())
    }

    fn check_read(&self, op: &str) -> StoreResult<()> {
        if take_one(&self.failing_reads) {
            return Err(StoreError::ReadFailed(format!("{op}: injected failure")));
        }
        Ok(())
    }

    fn read(&self) -> RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn get(&self, uid: &Uid) -> StoreResult<Option<StoredRecord>> {
        self.check_read("get")?;
        Ok(self.read().records.get(uid).cloned())
    }

    async fn put(&self, record: StoredRecord) -> StoreResult<()> {
        self.check_write("put")?;
        let uid = record.uid();
        let mut tables = self.write();
        if let Some(old) = tables.records.remove(&uid) {
            tables.unindex(&old);
        }
        tables.index(&record);
        tables.records.insert(uid, record);
        Ok(())
    }

    async fn delete(&self, uid: &Uid) -> StoreResult<bool> {
        self.check_write("delete")?;
        let mut tables = self.write();
        match tables.records.remove(uid) {
            Some(old) => {
                tables.unindex(&old);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn clear(&self) -> StoreResult<()> {
        self.check_write("clear")?;
        let mut tables = self.write();
        tables.records.clear();
        tables.by_time.clear();
        tables.by_key.clear();
        Ok(())
    }

    async fn count(&self) -> StoreResult<usize> {
        self.check_read("count")?;
        Ok(self.len())
    }

    async fn keys_by_index(&self, key: &IndexKey) -> StoreResult<Vec<Uid>> {
        self.check_read("keys_by_index")?;
        let tables = self.read();
        Ok(tables
            .by_key
            .get(key)
            .map(|set| set.iter().map(|pos| pos.uid.clone()).collect())
            .unwrap_or_default())
    }

    async fn keys_by_time_range(
        &self,
        since: Option<u64>,
        until: Option<u64>,
        reverse: bool,
    ) -> StoreResult<Vec<Uid>> {
        self.check_read("keys_by_time_range")?;
        let tables = self.read();
        let in_range = tables.by_time.iter().filter(|pos| {
            since.map_or(true, |s| pos.created_at >= s) && until.map_or(true, |u| pos.created_at <= u)
        });
        let uids = if reverse {
            in_range.rev().map(|pos| pos.uid.clone()).collect()
        } else {
            in_range.map(|pos| pos.uid.clone()).collect()
        };
        Ok(uids)
    }

    async fn scan_index(
        &self,
        key: &IndexKey,
        before: Option<&Position>,
        page: usize,
    ) -> StoreResult<Vec<Position>> {
        self.check_read("scan_index")?;
        let tables = self.read();
        let Some(set) = tables.by_key.get(key) else {
            return Ok(Vec::new());
        };
        let lower: Bound<&Position> = Bound::Unbounded;
        let upper = match before {
            Some(pos) => Bound::Excluded(pos),
            None => Bound::Unbounded,
        };
        Ok(set
            .range((lower, upper))
            .rev()
            .take(page)
            .cloned()
            .collect())
    }

    async fn all_records(&self) -> StoreResult<Vec<StoredRecord>> {
        self.check_read("all_records")?;
        Ok(self.read().records.values().cloned().collect())
    }

    async fn put_used(&self, uid: &Uid, last_used: u64) -> StoreResult<()> {
        self.check_write("put_used")?;
        self.write().used.insert(uid.clone(), last_used);
        Ok(())
    }

    async fn delete_used(&self, uid: &Uid) -> StoreResult<bool> {
        self.check_write("delete_used")?;
        Ok(self.write().used.remove(uid).is_some())
    }

    async fn all_used(&self) -> StoreResult<Vec<UsedRecord>> {
        self.check_read("all_used")?;
        Ok(self
            .read()
            .used
            .iter()
            .map(|(uid, last_used)| UsedRecord {
                uid: uid.clone(),
                last_used: *last_used,
            })
            .collect())
    }
}

impl std::fmt::Debug for InMemoryEventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tables = self.read();
        f.debug_struct("InMemoryEventStore")
            .field("record_count", &tables.records.len())
            .field("index_count", &tables.by_key.len())
            .field("used_count", &tables.used.len())
            .finish()
    }
}
