use std::collections::{BTreeMap, BTreeSet};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::OwnedMutexGuard;
use tracing::debug;

use crate::catalog::{Catalog, CollectionMeta, IndexMeta};
use crate::error::{validate_name, StoreError};
use crate::key::Key;
use crate::traits::{Backend, RecordWrite, WriteBatch};

/// Whether a transaction may write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionMode {
    ReadOnly,
    /// Serialized per store: at most one read-write transaction runs at a time.
    ReadWrite,
}

#[derive(Debug)]
enum Scope {
    All,
    Only(BTreeSet<String>),
}

/// A unit of work over a set of collections.
///
/// Reads see the committed state plus this transaction's own staged writes.
/// Writes are staged in memory and handed to the backend as one atomic batch
/// by [`Transaction::commit`]. Dropping a transaction without committing
/// aborts it; nothing it staged becomes visible.
pub struct Transaction {
    backend: Arc<dyn Backend>,
    store: String,
    catalog: Catalog,
    scope: Scope,
    mode: TransactionMode,
    pending: BTreeMap<String, BTreeMap<Key, Option<Value>>>,
    cleared: BTreeSet<String>,
    catalog_dirty: bool,
    finished: bool,
    _write_guard: Option<OwnedMutexGuard<()>>,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("store", &self.store)
            .field("mode", &self.mode)
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

impl Transaction {
    /// Begin a transaction scoped to `collections`.
    ///
    /// Every scoped collection must exist in the catalog. A read-write
    /// transaction must be given the store's write guard.
    pub(crate) fn begin(
        backend: Arc<dyn Backend>,
        store: &str,
        collections: &[&str],
        mode: TransactionMode,
        write_guard: Option<OwnedMutexGuard<()>>,
    ) -> Result<Self, StoreError> {
        let catalog = backend.load_catalog()?.unwrap_or_default();
        let mut scope = BTreeSet::new();
        for name in collections {
            if !catalog.has_collection(name) {
                return Err(StoreError::UnknownCollection(name.to_string()));
            }
            scope.insert(name.to_string());
        }
        Ok(Self {
            backend,
            store: store.to_string(),
            catalog,
            scope: Scope::Only(scope),
            mode,
            pending: BTreeMap::new(),
            cleared: BTreeSet::new(),
            catalog_dirty: false,
            finished: false,
            _write_guard: write_guard,
        })
    }

    pub fn mode(&self) -> TransactionMode {
        self.mode
    }

    /// Name of the store this transaction runs against.
    pub fn store_name(&self) -> &str {
        &self.store
    }

    /// Every collection in the store, as this transaction sees the catalog.
    pub fn collection_names(&self) -> Vec<String> {
        self.catalog.collection_names()
    }

    pub fn has_collection(&self, name: &str) -> bool {
        self.catalog.has_collection(name)
    }

    // ── Reads ───────────────────────────────────────────────────────

    /// Read one record.
    pub fn get(&self, collection: &str, key: &Key) -> Result<Option<Value>, StoreError> {
        self.check_scope(collection)?;
        if let Some(staged) = self.pending.get(collection).and_then(|p| p.get(key)) {
            return Ok(staged.clone());
        }
        if self.cleared.contains(collection) {
            return Ok(None);
        }
        self.backend.get(collection, key)
    }

    /// All records of a collection, in key order.
    pub fn get_all(&self, collection: &str) -> Result<Vec<Value>, StoreError> {
        Ok(self.entries(collection)?.into_values().collect())
    }

    /// Iterate over `(key, record)` pairs in key order.
    ///
    /// The cursor walks a snapshot taken when it is opened; writes made
    /// afterwards through this transaction are not reflected.
    pub fn cursor(&self, collection: &str) -> Result<Cursor, StoreError> {
        let entries: Vec<(Key, Value)> = self.entries(collection)?.into_iter().collect();
        Ok(Cursor {
            inner: entries.into_iter(),
        })
    }

    pub fn count(&self, collection: &str) -> Result<usize, StoreError> {
        Ok(self.entries(collection)?.len())
    }

    /// Names of the indexes defined on a collection.
    pub fn index_names(&self, collection: &str) -> Result<Vec<String>, StoreError> {
        self.check_scope(collection)?;
        Ok(self.meta(collection)?.indexes.keys().cloned().collect())
    }

    /// All records whose indexed field equals `value`, in key order.
    ///
    /// Records without the indexed field are not part of the index.
    pub fn get_all_by_index(
        &self,
        collection: &str,
        index: &str,
        value: &Value,
    ) -> Result<Vec<Value>, StoreError> {
        self.check_scope(collection)?;
        let key_path = self
            .meta(collection)?
            .indexes
            .get(index)
            .map(|i| i.key_path.clone())
            .ok_or_else(|| StoreError::UnknownIndex {
                collection: collection.to_string(),
                index: index.to_string(),
            })?;
        Ok(self
            .entries(collection)?
            .into_values()
            .filter(|record| lookup_path(record, &key_path) == Some(value))
            .collect())
    }

    // ── Writes ──────────────────────────────────────────────────────

    /// Insert or replace a record and return its key.
    ///
    /// Without an explicit key the collection's generator assigns the next
    /// integer.
    pub fn put(
        &mut self,
        collection: &str,
        value: Value,
        key: Option<Key>,
    ) -> Result<Key, StoreError> {
        self.check_writable()?;
        self.check_scope(collection)?;
        let meta = self
            .catalog
            .collections
            .get_mut(collection)
            .ok_or_else(|| StoreError::UnknownCollection(collection.to_string()))?;
        let before = (meta.next_key, meta.exhausted);
        let key = match key {
            Some(key) => {
                meta.observe(&key);
                key
            }
            None => meta.generate(collection)?,
        };
        if (meta.next_key, meta.exhausted) != before {
            self.catalog_dirty = true;
        }
        self.pending
            .entry(collection.to_string())
            .or_default()
            .insert(key.clone(), Some(value));
        Ok(key)
    }

    /// Delete a record. Deleting a missing key is not an error.
    pub fn delete(&mut self, collection: &str, key: &Key) -> Result<(), StoreError> {
        self.check_writable()?;
        self.check_scope(collection)?;
        self.pending
            .entry(collection.to_string())
            .or_default()
            .insert(key.clone(), None);
        Ok(())
    }

    /// Remove every record in a collection. The key generator is kept.
    pub fn clear(&mut self, collection: &str) -> Result<(), StoreError> {
        self.check_writable()?;
        self.check_scope(collection)?;
        self.pending.remove(collection);
        self.cleared.insert(collection.to_string());
        Ok(())
    }

    /// Apply all staged writes atomically.
    pub fn commit(mut self) -> Result<(), StoreError> {
        let batch = self.take_batch();
        self.finished = true;
        if batch.is_empty() {
            return Ok(());
        }
        let writes = batch.writes.len();
        self.backend.commit(batch)?;
        debug!(store = %self.store, writes, "transaction committed");
        Ok(())
    }

    /// Discard all staged writes. Equivalent to dropping the transaction.
    pub fn abort(self) {}

    // ── Internals ───────────────────────────────────────────────────

    fn check_writable(&self) -> Result<(), StoreError> {
        match self.mode {
            TransactionMode::ReadOnly => Err(StoreError::ReadOnly),
            TransactionMode::ReadWrite => Ok(()),
        }
    }

    fn check_scope(&self, collection: &str) -> Result<(), StoreError> {
        if !self.catalog.has_collection(collection) {
            return Err(StoreError::UnknownCollection(collection.to_string()));
        }
        match &self.scope {
            Scope::All => Ok(()),
            Scope::Only(names) if names.contains(collection) => Ok(()),
            Scope::Only(_) => Err(StoreError::OutOfScope(collection.to_string())),
        }
    }

    fn meta(&self, collection: &str) -> Result<&CollectionMeta, StoreError> {
        self.catalog
            .collections
            .get(collection)
            .ok_or_else(|| StoreError::UnknownCollection(collection.to_string()))
    }

    /// Committed records merged with the staged overlay.
    fn entries(&self, collection: &str) -> Result<BTreeMap<Key, Value>, StoreError> {
        self.check_scope(collection)?;
        let mut merged: BTreeMap<Key, Value> = if self.cleared.contains(collection) {
            BTreeMap::new()
        } else {
            self.backend.scan(collection)?.into_iter().collect()
        };
        if let Some(staged) = self.pending.get(collection) {
            for (key, value) in staged {
                match value {
                    Some(v) => {
                        merged.insert(key.clone(), v.clone());
                    }
                    None => {
                        merged.remove(key);
                    }
                }
            }
        }
        Ok(merged)
    }

    fn take_batch(&mut self) -> WriteBatch {
        if self.mode == TransactionMode::ReadOnly {
            return WriteBatch::default();
        }
        let writes = std::mem::take(&mut self.pending)
            .into_iter()
            .flat_map(|(collection, records)| {
                records.into_iter().map(move |(key, value)| RecordWrite {
                    collection: collection.clone(),
                    key,
                    value,
                })
            })
            .collect();
        WriteBatch {
            catalog: self.catalog_dirty.then(|| self.catalog.clone()),
            cleared: std::mem::take(&mut self.cleared).into_iter().collect(),
            writes,
        }
    }

    fn has_staged_changes(&self) -> bool {
        self.catalog_dirty || !self.pending.is_empty() || !self.cleared.is_empty()
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.finished && self.has_staged_changes() {
            debug!(store = %self.store, "transaction aborted, staged writes discarded");
        }
    }
}

/// Resolve a dotted key path such as `titleInfo.title` inside a record.
fn lookup_path<'a>(record: &'a Value, key_path: &str) -> Option<&'a Value> {
    key_path
        .split('.')
        .try_fold(record, |node, segment| node.as_object()?.get(segment))
}

/// Snapshot iterator returned by [`Transaction::cursor`].
#[derive(Debug)]
pub struct Cursor {
    inner: std::vec::IntoIter<(Key, Value)>,
}

impl Iterator for Cursor {
    type Item = (Key, Value);

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl DoubleEndedIterator for Cursor {
    fn next_back(&mut self) -> Option<Self::Item> {
        self.inner.next_back()
    }
}

impl ExactSizeIterator for Cursor {}

// ── Upgrade transaction ─────────────────────────────────────────────

/// The transaction an [`UpgradeHandler`](crate::UpgradeHandler) runs in.
///
/// Scoped to every collection, always writable, and the only place where
/// collections and indexes can be created. Collections are never deleted.
/// The factory commits it (together with the new version) only when the
/// handler succeeds.
pub struct UpgradeTransaction {
    txn: Transaction,
    old_version: u32,
    new_version: u32,
}

impl UpgradeTransaction {
    pub(crate) fn begin(
        backend: Arc<dyn Backend>,
        store: &str,
        old_version: u32,
        new_version: u32,
        write_guard: OwnedMutexGuard<()>,
    ) -> Result<Self, StoreError> {
        let catalog = backend.load_catalog()?.unwrap_or_default();
        let txn = Transaction {
            backend,
            store: store.to_string(),
            catalog,
            scope: Scope::All,
            mode: TransactionMode::ReadWrite,
            pending: BTreeMap::new(),
            cleared: BTreeSet::new(),
            catalog_dirty: false,
            finished: false,
            _write_guard: Some(write_guard),
        };
        Ok(Self {
            txn,
            old_version,
            new_version,
        })
    }

    /// Version persisted before this upgrade; `0` for a new store.
    pub fn old_version(&self) -> u32 {
        self.old_version
    }

    /// Version the store will have once this upgrade commits.
    pub fn new_version(&self) -> u32 {
        self.new_version
    }

    /// Create a collection. Returns `false` if it already existed.
    pub fn create_collection(&mut self, name: &str) -> Result<bool, StoreError> {
        validate_name(name)?;
        if self.txn.catalog.has_collection(name) {
            return Ok(false);
        }
        self.txn
            .catalog
            .collections
            .insert(name.to_string(), CollectionMeta::default());
        self.txn.catalog_dirty = true;
        debug!(store = %self.txn.store, collection = name, "collection created");
        Ok(true)
    }

    /// Define an index on `key_path`. Returns `false` if the name was taken.
    pub fn create_index(
        &mut self,
        collection: &str,
        name: &str,
        key_path: &str,
    ) -> Result<bool, StoreError> {
        validate_name(name)?;
        if key_path.is_empty() || key_path.split('.').any(str::is_empty) {
            return Err(StoreError::InvalidName(key_path.to_string()));
        }
        let meta = self
            .txn
            .catalog
            .collections
            .get_mut(collection)
            .ok_or_else(|| StoreError::UnknownCollection(collection.to_string()))?;
        if meta.indexes.contains_key(name) {
            return Ok(false);
        }
        meta.indexes.insert(
            name.to_string(),
            IndexMeta {
                key_path: key_path.to_string(),
            },
        );
        self.txn.catalog_dirty = true;
        Ok(true)
    }

    /// Commit everything with the catalog stamped at the new version.
    pub(crate) fn commit(mut self) -> Result<(), StoreError> {
        self.txn.catalog.version = self.new_version;
        self.txn.catalog_dirty = true;
        self.txn.commit()
    }
}

impl Deref for UpgradeTransaction {
    type Target = Transaction;

    fn deref(&self) -> &Transaction {
        &self.txn
    }
}

impl DerefMut for UpgradeTransaction {
    fn deref_mut(&mut self) -> &mut Transaction {
        &mut self.txn
    }
}
