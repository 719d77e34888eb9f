use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;

use crate::catalog::Catalog;
use crate::error::StoreError;
use crate::key::Key;
use crate::traits::{Backend, Provider, WriteBatch};

/// In-memory backend.
///
/// All data lives in `BTreeMap`s behind a mutex; nothing touches disk.
/// Ideal for testing and prototyping.
///
/// # Example
///
/// ```
/// use kvbind_store::{Backend, Key, MemoryBackend, RecordWrite, WriteBatch};
/// use serde_json::json;
///
/// let backend = MemoryBackend::new();
/// backend
///     .commit(WriteBatch {
///         writes: vec![RecordWrite {
///             collection: "books".into(),
///             key: Key::Int(1),
///             value: Some(json!({"title": "A"})),
///         }],
///         ..Default::default()
///     })
///     .unwrap();
///
/// let book = backend.get("books", &Key::Int(1)).unwrap().unwrap();
/// assert_eq!(book["title"], "A");
/// ```
#[derive(Default)]
pub struct MemoryBackend {
    inner: Mutex<MemoryState>,
}

#[derive(Default, Clone)]
struct MemoryState {
    catalog: Option<Catalog>,
    records: BTreeMap<String, BTreeMap<Key, Value>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of records across all collections.
    pub fn record_count(&self) -> usize {
        self.lock()
            .map(|s| s.records.values().map(BTreeMap::len).sum())
            .unwrap_or(0)
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Backend("memory backend lock poisoned".into()))
    }
}

impl Backend for MemoryBackend {
    fn load_catalog(&self) -> Result<Option<Catalog>, StoreError> {
        Ok(self.lock()?.catalog.clone())
    }

    fn get(&self, collection: &str, key: &Key) -> Result<Option<Value>, StoreError> {
        Ok(self
            .lock()?
            .records
            .get(collection)
            .and_then(|c| c.get(key))
            .cloned())
    }

    fn scan(&self, collection: &str) -> Result<Vec<(Key, Value)>, StoreError> {
        Ok(self
            .lock()?
            .records
            .get(collection)
            .map(|c| c.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    fn commit(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        // Nothing here can fail halfway, so mutating in place is atomic
        // as far as other lock holders can tell.
        for collection in batch.cleared {
            state.records.remove(&collection);
        }
        for write in batch.writes {
            let records = state.records.entry(write.collection).or_default();
            match write.value {
                Some(value) => {
                    records.insert(write.key, value);
                }
                None => {
                    records.remove(&write.key);
                }
            }
        }
        if let Some(catalog) = batch.catalog {
            state.catalog = Some(catalog);
        }
        Ok(())
    }
}

/// Hands out one shared [`MemoryBackend`] per store name.
///
/// Two factories built on clones of the same provider see the same data,
/// which is how tests simulate a process restart.
#[derive(Clone, Default)]
pub struct MemoryProvider {
    stores: Arc<Mutex<HashMap<String, Arc<MemoryBackend>>>>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Direct access to a store's backend, if it has been opened.
    pub fn backend(&self, name: &str) -> Option<Arc<MemoryBackend>> {
        self.stores.lock().ok()?.get(name).cloned()
    }
}

impl Provider for MemoryProvider {
    fn open(&self, name: &str) -> Result<Arc<dyn Backend>, StoreError> {
        let mut stores = self
            .stores
            .lock()
            .map_err(|_| StoreError::Backend("memory provider lock poisoned".into()))?;
        let backend = stores
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryBackend::new()))
            .clone();
        Ok(backend)
    }
}
