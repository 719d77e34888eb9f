//! Pure-Rust durable backend using [`redb`](https://docs.rs/redb).
//!
//! One redb file per store, named `<store>.redb` inside the provider's
//! directory. Every [`WriteBatch`] is applied in a single redb write
//! transaction, so a commit is all-or-nothing even across a crash.
//!
//! Enable with `features = ["redb"]`.
//!
//! ```no_run
//! use kvbind_store::{Factory, OpenRequest, RedbProvider};
//!
//! # async fn demo() -> Result<(), kvbind_store::StoreError> {
//! let factory = Factory::new(RedbProvider::new("/var/lib/myapp"));
//! let db = factory.open("library", OpenRequest::new(1)).await?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use redb::{Database, ReadableTable, TableDefinition};
use serde_json::Value;

use crate::catalog::Catalog;
use crate::error::StoreError;
use crate::key::Key;
use crate::traits::{Backend, Provider, WriteBatch};

// ── Table definitions ───────────────────────────────────────────────

const RECORD_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("kv_records");
const META_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("kv_meta");

const CATALOG_KEY: &str = "catalog";

fn err(e: impl Display) -> StoreError {
    StoreError::Backend(e.to_string())
}

// ── Backend ─────────────────────────────────────────────────────────

/// A store persisted in one redb database.
pub struct RedbBackend {
    db: Database,
}

impl RedbBackend {
    /// Open or create a redb database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = Database::create(path).map_err(err)?;
        Self::init(db)
    }

    /// Create an in-memory redb database (for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let db = Database::builder()
            .create_with_backend(redb::backends::InMemoryBackend::new())
            .map_err(err)?;
        Self::init(db)
    }

    fn init(db: Database) -> Result<Self, StoreError> {
        // Read transactions cannot open missing tables, so create both up front.
        let txn = db.begin_write().map_err(err)?;
        txn.open_table(RECORD_TABLE).map_err(err)?;
        txn.open_table(META_TABLE).map_err(err)?;
        txn.commit().map_err(err)?;
        Ok(Self { db })
    }
}

impl Backend for RedbBackend {
    fn load_catalog(&self) -> Result<Option<Catalog>, StoreError> {
        let txn = self.db.begin_read().map_err(err)?;
        let table = txn.open_table(META_TABLE).map_err(err)?;
        match table.get(CATALOG_KEY).map_err(err)? {
            Some(guard) => Ok(Some(Catalog::decode(guard.value())?)),
            None => Ok(None),
        }
    }

    fn get(&self, collection: &str, key: &Key) -> Result<Option<Value>, StoreError> {
        let txn = self.db.begin_read().map_err(err)?;
        let table = txn.open_table(RECORD_TABLE).map_err(err)?;
        match table
            .get(record_key(collection, key).as_slice())
            .map_err(err)?
        {
            Some(guard) => Ok(Some(serde_json::from_slice(guard.value())?)),
            None => Ok(None),
        }
    }

    fn scan(&self, collection: &str) -> Result<Vec<(Key, Value)>, StoreError> {
        let txn = self.db.begin_read().map_err(err)?;
        let table = txn.open_table(RECORD_TABLE).map_err(err)?;

        let lower = collection_prefix(collection);
        let upper = collection_prefix_upper(collection);
        let range = table
            .range(lower.as_slice()..upper.as_slice())
            .map_err(err)?;

        let mut out = Vec::new();
        for item in range {
            let (key_guard, value_guard) = item.map_err(err)?;
            let key = Key::from_bytes(&key_guard.value()[lower.len()..])?;
            out.push((key, serde_json::from_slice(value_guard.value())?));
        }
        Ok(out)
    }

    fn commit(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let txn = self.db.begin_write().map_err(err)?;
        {
            let mut records = txn.open_table(RECORD_TABLE).map_err(err)?;

            for collection in &batch.cleared {
                let lower = collection_prefix(collection);
                let upper = collection_prefix_upper(collection);
                // Collect first: the table cannot be mutated while a range is live.
                let doomed: Vec<Vec<u8>> = records
                    .range(lower.as_slice()..upper.as_slice())
                    .map_err(err)?
                    .map(|item| item.map(|(k, _)| k.value().to_vec()).map_err(err))
                    .collect::<Result<_, _>>()?;
                for key in &doomed {
                    records.remove(key.as_slice()).map_err(err)?;
                }
            }

            for write in &batch.writes {
                let key = record_key(&write.collection, &write.key);
                match &write.value {
                    Some(value) => {
                        let bytes = serde_json::to_vec(value)?;
                        records
                            .insert(key.as_slice(), bytes.as_slice())
                            .map_err(err)?;
                    }
                    None => {
                        records.remove(key.as_slice()).map_err(err)?;
                    }
                }
            }

            if let Some(catalog) = &batch.catalog {
                let mut meta = txn.open_table(META_TABLE).map_err(err)?;
                let bytes = catalog.encode()?;
                meta.insert(CATALOG_KEY, bytes.as_slice()).map_err(err)?;
            }
        }
        // An early return above drops `txn` uncommitted, which aborts it.
        txn.commit().map_err(err)?;
        Ok(())
    }
}

// ── Provider ────────────────────────────────────────────────────────

/// Maps each store name to `<dir>/<name>.redb`.
///
/// redb refuses to open the same file twice in one process, so opened
/// backends are cached and shared.
pub struct RedbProvider {
    dir: PathBuf,
    open: Mutex<HashMap<String, Arc<RedbBackend>>>,
}

impl RedbProvider {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            open: Mutex::new(HashMap::new()),
        }
    }

    /// Path of the file backing `name`.
    pub fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.redb"))
    }
}

impl Provider for RedbProvider {
    fn open(&self, name: &str) -> Result<Arc<dyn Backend>, StoreError> {
        if name.contains(|c| c == '/' || c == '\\') || name == "." || name == ".." {
            return Err(StoreError::InvalidName(name.to_string()));
        }
        let mut open = self
            .open
            .lock()
            .map_err(|_| StoreError::Backend("redb provider lock poisoned".into()))?;
        if let Some(backend) = open.get(name) {
            return Ok(backend.clone());
        }
        std::fs::create_dir_all(&self.dir).map_err(err)?;
        let backend = Arc::new(RedbBackend::open(self.path_for(name))?);
        open.insert(name.to_string(), backend.clone());
        Ok(backend)
    }
}

// ── Key encoding helpers ────────────────────────────────────────────

/// Record key: `collection \0 encoded-key`
fn record_key(collection: &str, key: &Key) -> Vec<u8> {
    let mut k = collection_prefix(collection);
    k.extend_from_slice(&key.to_bytes());
    k
}

/// Lower bound for all record keys in a collection.
fn collection_prefix(collection: &str) -> Vec<u8> {
    let mut k = Vec::with_capacity(collection.len() + 10);
    k.extend_from_slice(collection.as_bytes());
    k.push(0);
    k
}

/// Upper bound (exclusive) for all record keys in a collection.
fn collection_prefix_upper(collection: &str) -> Vec<u8> {
    let mut k = Vec::with_capacity(collection.len() + 1);
    k.extend_from_slice(collection.as_bytes());
    k.push(1);
    k
}
