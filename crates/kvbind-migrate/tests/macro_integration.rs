//! Integration tests for the proc macro and the full migration pipeline.
//!
//! Tests the complete flow: define steps with `#[migration]`, register them,
//! open a store at v1, then reopen at v3 and watch the chain run.

use std::sync::Arc;

use kvbind_migrate::{
    migration, BoxError, MigrationEngine, MigrationStep, StoreDescriptor, UpgradeTransaction,
};
use kvbind_store::{Factory, Key, MemoryProvider, OpenRequest, StoreError};
use serde_json::json;

// ── Migration functions using macros ─────────────────────────────────

#[migration(version = 2)]
async fn add_readers(txn: &mut UpgradeTransaction) -> Result<(), BoxError> {
    txn.create_collection("readers")?;
    txn.put("readers", json!({"name": "ada"}), Some(Key::from("ada")))?;
    Ok(())
}

#[migration(version = 3, name = "count books")]
fn count_books(txn: &mut UpgradeTransaction) -> Result<(), StoreError> {
    let books = txn.count("books")?;
    txn.put("meta", json!({"books": books}), Some(Key::from("stats")))?;
    Ok(())
}

#[migration(version = 4)]
fn always_fails(_txn: &mut UpgradeTransaction) -> Result<(), BoxError> {
    Err("refusing".into())
}

/// The engine a release at `version` ships: only the steps written so far.
fn engine(version: u32) -> MigrationEngine {
    let mut engine = MigrationEngine::new(
        StoreDescriptor::new("lib", version).collections(["books", "meta"]),
    );
    let shipped = [
        register_add_readers(),
        register_count_books(),
        register_always_fails(),
    ];
    for step in shipped {
        if step.version() <= version {
            engine.register(step);
        }
    }
    engine
}

// ── Tests ─────────────────────────────────────────────────────────────

#[test]
fn macro_generates_step_metadata() {
    assert_eq!(AddReadersMigration.version(), 2);
    assert_eq!(AddReadersMigration.name(), "add_readers");
    assert_eq!(CountBooksMigration.version(), 3);
    assert_eq!(CountBooksMigration.name(), "count books");
}

#[tokio::test]
async fn v1_then_v3_runs_two_and_three() {
    let provider = MemoryProvider::new();

    let db = Factory::new(provider.clone())
        .open("lib", OpenRequest::new(1).upgrade(Arc::new(engine(1))))
        .await
        .unwrap();
    assert_eq!(db.collection_names().unwrap(), vec!["books", "meta"]);
    db.put("books", json!({"title": "A"}), None).await.unwrap();
    db.put("books", json!({"title": "B"}), None).await.unwrap();
    drop(db);

    let db = Factory::new(provider)
        .open("lib", OpenRequest::new(3).upgrade(Arc::new(engine(3))))
        .await
        .unwrap();
    assert_eq!(db.version(), 3);
    assert_eq!(db.collection_names().unwrap(), vec!["books", "meta", "readers"]);
    assert_eq!(
        db.get("readers", &Key::from("ada")).await.unwrap(),
        Some(json!({"name": "ada"}))
    );
    assert_eq!(
        db.get("meta", &Key::from("stats")).await.unwrap(),
        Some(json!({"books": 2}))
    );
}

#[tokio::test]
async fn failing_macro_step_rolls_back() {
    let factory = Factory::memory();
    factory
        .open("lib", OpenRequest::new(3).upgrade(Arc::new(engine(3))))
        .await
        .unwrap()
        .close();

    let err = factory
        .open("lib", OpenRequest::new(4).upgrade(Arc::new(engine(4))))
        .await
        .unwrap_err();
    let cause = err
        .upgrade_source()
        .and_then(|e| e.downcast_ref::<kvbind_migrate::MigrationError>());
    assert!(matches!(
        cause,
        Some(kvbind_migrate::MigrationError::Step { version: 4, name, .. }) if name == "always_fails"
    ));
    assert_eq!(factory.stored_version("lib").unwrap(), 3);
}
