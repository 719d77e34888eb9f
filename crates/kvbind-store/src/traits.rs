use std::sync::Arc;

use serde_json::Value;

use crate::catalog::Catalog;
use crate::error::StoreError;
use crate::key::Key;

/// One staged record change: `Some` writes the value, `None` deletes it.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordWrite {
    pub collection: String,
    pub key: Key,
    pub value: Option<Value>,
}

/// Everything a transaction commits, applied atomically by [`Backend::commit`].
///
/// Order of application: `cleared` collections are emptied first, then
/// `writes` run in sequence, then the catalog (if any) is replaced.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    pub catalog: Option<Catalog>,
    pub cleared: Vec<String>,
    pub writes: Vec<RecordWrite>,
}

impl WriteBatch {
    pub fn is_empty(&self) -> bool {
        self.catalog.is_none() && self.cleared.is_empty() && self.writes.is_empty()
    }
}

/// Storage for a single named store.
///
/// Backends are dumb: they hold records and the catalog and apply batches
/// atomically. Scoping, key generation and version arbitration live above
/// them in [`Transaction`](crate::Transaction) and [`Factory`](crate::Factory).
pub trait Backend: Send + Sync {
    /// Load the persisted catalog, or `None` for a store that was never opened.
    fn load_catalog(&self) -> Result<Option<Catalog>, StoreError>;

    /// Read one record.
    fn get(&self, collection: &str, key: &Key) -> Result<Option<Value>, StoreError>;

    /// All records of a collection in key order.
    fn scan(&self, collection: &str) -> Result<Vec<(Key, Value)>, StoreError>;

    /// Apply a batch. Either every change lands or none does.
    fn commit(&self, batch: WriteBatch) -> Result<(), StoreError>;
}

/// Opens the backend for a store name.
///
/// Implementations must hand out the same underlying storage for the same
/// name, so that reopening a store observes what earlier connections wrote.
pub trait Provider: Send + Sync {
    fn open(&self, name: &str) -> Result<Arc<dyn Backend>, StoreError>;
}
