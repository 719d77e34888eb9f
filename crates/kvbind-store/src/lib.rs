//! # kvbind-store
//!
//! Versioned, transactional key-value stores for [`kvbind`](https://docs.rs/kvbind).
//!
//! A store is a named set of collections holding JSON records under
//! integer or text keys. Every store carries a version; opening it at a
//! newer version runs an [`UpgradeHandler`] inside one atomic
//! [`UpgradeTransaction`], after the [`Factory`] has asked every older
//! connection to step aside.
//!
//! ## Quick Start
//!
//! ```
//! use std::sync::Arc;
//!
//! use kvbind_store::{async_trait, BoxError, Factory, OpenRequest, UpgradeHandler, UpgradeTransaction};
//! use serde_json::json;
//!
//! struct CreateBooks;
//!
//! #[async_trait]
//! impl UpgradeHandler for CreateBooks {
//!     async fn upgrade(&self, txn: &mut UpgradeTransaction) -> Result<(), BoxError> {
//!         txn.create_collection("books")?;
//!         Ok(())
//!     }
//! }
//!
//! # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
//! let factory = Factory::memory();
//! let db = factory
//!     .open("library", OpenRequest::new(1).upgrade(Arc::new(CreateBooks)))
//!     .await
//!     .unwrap();
//!
//! let key = db.put("books", json!({"title": "A"}), None).await.unwrap();
//! let book = db.get("books", &key).await.unwrap().unwrap();
//! assert_eq!(book["title"], "A");
//! # });
//! ```
//!
//! ## Backends
//!
//! | Backend | Feature flag | Use case |
//! |---------|-------------|----------|
//! | [`MemoryProvider`] | *(always available)* | Testing, prototyping |
//! | `RedbProvider` | `redb` | Durable, pure-Rust, one file per store |

mod catalog;
mod database;
mod error;
mod factory;
mod key;
mod memory;
#[cfg(feature = "redb")]
mod redb;
mod traits;
mod transaction;

pub use async_trait::async_trait;
pub use catalog::{Catalog, CollectionMeta, IndexMeta};
pub use database::Database;
pub use error::{BoxError, StoreError};
pub use factory::{
    Factory, OpenRequest, UpgradeHandler, VersionChangeCallback, VersionChangeEvent,
};
pub use key::Key;
pub use memory::{MemoryBackend, MemoryProvider};
#[cfg(feature = "redb")]
pub use redb::{RedbBackend, RedbProvider};
pub use traits::{Backend, Provider, RecordWrite, WriteBatch};
pub use transaction::{Cursor, Transaction, TransactionMode, UpgradeTransaction};
