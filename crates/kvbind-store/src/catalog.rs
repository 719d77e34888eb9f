use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::key::Key;

/// Persisted per-store metadata: the schema version and the collections.
///
/// Encoded with `postcard` and stored next to the records, so it commits in
/// the same backend transaction as the data it describes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Catalog {
    /// Schema version. `0` means the store has never been opened.
    pub version: u32,
    /// Collections by name.
    pub collections: BTreeMap<String, CollectionMeta>,
}

/// Metadata for one collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionMeta {
    /// Next key handed out by the auto-increment generator.
    pub next_key: i64,
    /// Set once the generator has handed out or seen `i64::MAX`.
    pub exhausted: bool,
    /// Indexes by name.
    pub indexes: BTreeMap<String, IndexMeta>,
}

/// A secondary index definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexMeta {
    /// Dotted path into the record, e.g. `titleInfo.title`.
    pub key_path: String,
}

impl Default for CollectionMeta {
    fn default() -> Self {
        Self {
            next_key: 1,
            exhausted: false,
            indexes: BTreeMap::new(),
        }
    }
}

impl Catalog {
    pub fn encode(&self) -> Result<Vec<u8>, StoreError> {
        Ok(postcard::to_allocvec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        Ok(postcard::from_bytes(bytes)?)
    }

    pub fn has_collection(&self, name: &str) -> bool {
        self.collections.contains_key(name)
    }

    pub fn collection_names(&self) -> Vec<String> {
        self.collections.keys().cloned().collect()
    }
}

impl CollectionMeta {
    /// Take the next generated key. `i64::MAX` is the last one.
    pub(crate) fn generate(&mut self, collection: &str) -> Result<Key, StoreError> {
        if self.exhausted {
            return Err(StoreError::KeyGenerator(collection.to_string()));
        }
        let key = self.next_key;
        self.advance_past(key);
        Ok(Key::Int(key))
    }

    /// Account for an explicitly supplied key.
    ///
    /// Integer keys at or above the generator push it past them; text keys
    /// leave it alone. An explicit `i64::MAX` is stored like any other key
    /// and only exhausts the generator.
    pub(crate) fn observe(&mut self, key: &Key) {
        if let Key::Int(k) = key {
            if !self.exhausted && *k >= self.next_key {
                self.advance_past(*k);
            }
        }
    }

    fn advance_past(&mut self, key: i64) {
        match key.checked_add(1) {
            Some(next) => self.next_key = next,
            None => self.exhausted = true,
        }
    }
}
