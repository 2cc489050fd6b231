use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::db::{RecordKind, Store, StoreRow};
use crate::error::IngestError;

type Key = (RecordKind, usize);

/// Read-through TTL cache for `list_recent` results. Constructed once and
/// shared; the pipeline clears it around every cycle.
pub struct RecentCache {
    ttl: Duration,
    entries: Mutex<HashMap<Key, (Instant, Arc<Vec<StoreRow>>)>>,
}

impl RecentCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<Key, (Instant, Arc<Vec<StoreRow>>)>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Cached rows for `(kind, limit)`, or the loader's result on a miss or
    /// an expired entry. Loader errors are returned and nothing is cached.
    pub fn get_or_load<F>(&self, kind: RecordKind, limit: usize, load: F) -> Result<Arc<Vec<StoreRow>>, IngestError>
    where
        F: FnOnce() -> Result<Vec<StoreRow>, IngestError>,
    {
        let key = (kind, limit);
        if let Some((at, rows)) = self.entries().get(&key) {
            if at.elapsed() < self.ttl {
                return Ok(Arc::clone(rows));
            }
        }

        debug!(kind = kind.table(), limit, "recent cache miss");
        let rows = Arc::new(load()?);
        self.entries().insert(key, (Instant::now(), Arc::clone(&rows)));
        Ok(rows)
    }

    pub fn list_recent(&self, store: &Store, kind: RecordKind, limit: usize) -> Result<Arc<Vec<StoreRow>>, IngestError> {
        self.get_or_load(kind, limit, || store.list_recent(kind, limit))
    }

    pub fn invalidate(&self) {
        let mut entries = self.entries();
        if !entries.is_empty() {
            debug!(entries = entries.len(), "recent cache invalidated");
        }
        entries.clear();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries().len()
    }
}
