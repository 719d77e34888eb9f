use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;

use crate::error::StoreError;
use crate::factory::StoreEntry;
use crate::key::Key;
use crate::transaction::{Transaction, TransactionMode};

/// A live connection to an open store.
///
/// Clones share the connection. It closes on [`Database::close`] or when
/// the last clone is dropped; after that every operation fails with
/// [`StoreError::Closed`].
#[derive(Clone)]
pub struct Database {
    conn: Arc<Connection>,
}

struct Connection {
    id: u64,
    version: u32,
    entry: Arc<StoreEntry>,
    closed: AtomicBool,
}

impl Connection {
    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.entry.release(self.id);
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.name())
            .field("version", &self.version())
            .field("connection", &self.conn.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Database {
    pub(crate) fn new(entry: Arc<StoreEntry>, id: u64, version: u32) -> Self {
        Self {
            conn: Arc::new(Connection {
                id,
                version,
                entry,
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.conn.entry.name
    }

    /// Version this connection was opened at.
    pub fn version(&self) -> u32 {
        self.conn.version
    }

    pub fn is_closed(&self) -> bool {
        self.conn.closed.load(Ordering::Acquire)
    }

    /// Close the connection for every clone. Idempotent.
    ///
    /// Transactions already started keep running to completion.
    pub fn close(&self) {
        self.conn.close();
    }

    pub fn collection_names(&self) -> Result<Vec<String>, StoreError> {
        self.check_open()?;
        Ok(self
            .conn
            .entry
            .backend
            .load_catalog()?
            .map(|c| c.collection_names())
            .unwrap_or_default())
    }

    /// Start a transaction over `scope`.
    ///
    /// Read-write transactions wait for any other read-write transaction on
    /// the same store to finish.
    pub async fn transaction(
        &self,
        scope: &[&str],
        mode: TransactionMode,
    ) -> Result<Transaction, StoreError> {
        self.check_open()?;
        let guard = match mode {
            TransactionMode::ReadOnly => None,
            TransactionMode::ReadWrite => {
                Some(self.conn.entry.write_lock.clone().lock_owned().await)
            }
        };
        self.check_open()?;
        Transaction::begin(
            self.conn.entry.backend.clone(),
            self.name(),
            scope,
            mode,
            guard,
        )
    }

    /// Read one record.
    pub async fn get(&self, collection: &str, key: &Key) -> Result<Option<Value>, StoreError> {
        self.transaction(&[collection], TransactionMode::ReadOnly)
            .await?
            .get(collection, key)
    }

    /// Insert or replace a record in its own transaction and return its key.
    pub async fn put(
        &self,
        collection: &str,
        value: Value,
        key: Option<Key>,
    ) -> Result<Key, StoreError> {
        let mut txn = self
            .transaction(&[collection], TransactionMode::ReadWrite)
            .await?;
        let key = txn.put(collection, value, key)?;
        txn.commit()?;
        Ok(key)
    }

    pub async fn delete(&self, collection: &str, key: &Key) -> Result<(), StoreError> {
        let mut txn = self
            .transaction(&[collection], TransactionMode::ReadWrite)
            .await?;
        txn.delete(collection, key)?;
        txn.commit()
    }

    pub async fn get_all(&self, collection: &str) -> Result<Vec<Value>, StoreError> {
        self.transaction(&[collection], TransactionMode::ReadOnly)
            .await?
            .get_all(collection)
    }

    pub async fn count(&self, collection: &str) -> Result<usize, StoreError> {
        self.transaction(&[collection], TransactionMode::ReadOnly)
            .await?
            .count(collection)
    }

    fn check_open(&self) -> Result<(), StoreError> {
        if self.is_closed() {
            return Err(StoreError::Closed(self.name().to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::error::BoxError;
    use crate::factory::{Factory, OpenRequest, UpgradeHandler};
    use crate::transaction::UpgradeTransaction;

    struct Books;

    #[async_trait]
    impl UpgradeHandler for Books {
        async fn upgrade(&self, txn: &mut UpgradeTransaction) -> Result<(), BoxError> {
            txn.create_collection("books")?;
            Ok(())
        }
    }

    async fn open_books() -> (Factory, Database) {
        let factory = Factory::memory();
        let db = factory
            .open("lib", OpenRequest::new(1).upgrade(Arc::new(Books)))
            .await
            .unwrap();
        (factory, db)
    }

    #[tokio::test]
    async fn put_get_delete() {
        let (_factory, db) = open_books().await;
        let key = db.put("books", json!({"title": "A"}), None).await.unwrap();
        assert_eq!(key, Key::Int(1));
        assert_eq!(
            db.get("books", &key).await.unwrap(),
            Some(json!({"title": "A"}))
        );
        assert_eq!(db.count("books").await.unwrap(), 1);

        db.delete("books", &key).await.unwrap();
        assert!(db.get("books", &key).await.unwrap().is_none());
        assert!(db.get_all("books").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn explicit_keys_replace() {
        let (_factory, db) = open_books().await;
        let key = Key::from("progress");
        db.put("books", json!(1), Some(key.clone())).await.unwrap();
        db.put("books", json!(2), Some(key.clone())).await.unwrap();
        assert_eq!(db.get("books", &key).await.unwrap(), Some(json!(2)));
        assert_eq!(db.put("books", json!(3), None).await.unwrap(), Key::Int(1));
    }

    #[tokio::test]
    async fn closed_handle_rejects_operations() {
        let (factory, db) = open_books().await;
        let clone = db.clone();
        db.close();
        db.close();
        assert!(clone.is_closed());
        assert_eq!(factory.open_connections("lib"), 0);
        assert!(matches!(
            clone.get("books", &Key::Int(1)).await,
            Err(StoreError::Closed(name)) if name == "lib"
        ));
        assert!(matches!(
            clone.collection_names(),
            Err(StoreError::Closed(_))
        ));
    }

    #[tokio::test]
    async fn dropping_last_clone_closes() {
        let (factory, db) = open_books().await;
        let clone = db.clone();
        drop(db);
        assert_eq!(factory.open_connections("lib"), 1);
        drop(clone);
        assert_eq!(factory.open_connections("lib"), 0);
    }

    #[tokio::test]
    async fn collection_names_reflect_catalog() {
        let (_factory, db) = open_books().await;
        assert_eq!(db.collection_names().unwrap(), vec!["books".to_string()]);
        assert!(matches!(
            db.get("ghosts", &Key::Int(1)).await,
            Err(StoreError::UnknownCollection(_))
        ));
    }
}
