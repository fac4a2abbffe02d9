//! In-memory queue store.

use crate::error::{StoreError, StoreResult};
use crate::QueueStore;
use outbox_types::{EntryId, EntryPatch, EntryStatus, NewEntry, QueueEntry};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

#[derive(Default)]
struct Inner {
    next_seq: u64,
    entries: BTreeMap<u64, QueueEntry>,
    index: HashMap<EntryId, u64>,
}

/// Queue store that lives only as long as the process. Same ordering and
/// atomicity guarantees as the SQLite store, minus durability.
#[derive(Default)]
pub struct MemoryQueueStore {
    inner: Mutex<Inner>,
}

impl MemoryQueueStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> StoreResult<MutexGuard<'_, Inner>> {
        self.inner.lock().map_err(|_| StoreError::Poisoned)
    }
}

impl QueueStore for MemoryQueueStore {
    fn enqueue(&self, new: NewEntry) -> StoreResult<EntryId> {
        let entry = QueueEntry::from_new(EntryId::new(), new);
        let id = entry.id;
        let mut inner = self.inner()?;
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.entries.insert(seq, entry);
        inner.index.insert(id, seq);
        Ok(id)
    }

    fn drain_ordered(&self) -> StoreResult<Vec<QueueEntry>> {
        Ok(self.inner()?.entries.values().cloned().collect())
    }

    fn get(&self, id: &EntryId) -> StoreResult<Option<QueueEntry>> {
        let inner = self.inner()?;
        Ok(inner
            .index
            .get(id)
            .and_then(|seq| inner.entries.get(seq))
            .cloned())
    }

    fn update(&self, id: &EntryId, patch: &EntryPatch) -> StoreResult<()> {
        let mut inner = self.inner()?;
        let seq = *inner
            .index
            .get(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        match inner.entries.get_mut(&seq) {
            Some(entry) => {
                entry.apply(patch);
                Ok(())
            }
            None => Err(StoreError::NotFound(id.to_string())),
        }
    }

    fn remove(&self, id: &EntryId) -> StoreResult<bool> {
        let mut inner = self.inner()?;
        match inner.index.remove(id) {
            Some(seq) => Ok(inner.entries.remove(&seq).is_some()),
            None => Ok(false),
        }
    }

    fn len(&self) -> StoreResult<usize> {
        Ok(self.inner()?.entries.len())
    }

    fn recover_in_flight(&self) -> StoreResult<usize> {
        let mut inner = self.inner()?;
        let mut reset = 0;
        for entry in inner.entries.values_mut() {
            if entry.status == EntryStatus::InFlight {
                entry.status = EntryStatus::Pending;
                reset += 1;
            }
        }
        Ok(reset)
    }
}
