//! End-to-end upgrade scenarios against the in-memory factory.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use kvbind_migrate::{from_fn, MigrationEngine, NestField, StoreDescriptor};
use kvbind_store::{Factory, Key, MemoryProvider, OpenRequest};
use serde_json::json;

fn fixed_clock() -> u64 {
    1_700_000_000_000
}

fn books(version: u32) -> MigrationEngine {
    MigrationEngine::new(StoreDescriptor::new("library", version).collection("books"))
        .with_step(NestField::new(2, "books", "title", "titleInfo").with_clock(fixed_clock))
}

#[tokio::test]
async fn books_title_is_nested_on_v2() {
    let provider = MemoryProvider::new();
    let db = Factory::new(provider.clone())
        .open("library", OpenRequest::new(1).upgrade(Arc::new(books(1))))
        .await
        .unwrap();
    let a = db.put("books", json!({"title": "A"}), None).await.unwrap();
    let other = db.put("books", json!({"other": 1}), None).await.unwrap();
    drop(db);

    let db = Factory::new(provider)
        .open("library", OpenRequest::new(2).upgrade(Arc::new(books(2))))
        .await
        .unwrap();
    assert_eq!(
        db.get("books", &a).await.unwrap(),
        Some(json!({"titleInfo": {"title": "A", "time": 1_700_000_000_000u64}}))
    );
    assert_eq!(db.get("books", &other).await.unwrap(), Some(json!({"other": 1})));
}

#[tokio::test]
async fn fresh_store_provisions_then_runs_all_steps() {
    let seen = Arc::new(AtomicUsize::new(0));
    let engine = MigrationEngine::new(StoreDescriptor::new("library", 2).collection("books"))
        .with_step(from_fn(1, "seed", |txn| {
            // Provisioned collections are already visible here.
            txn.put("books", json!({"title": "seeded"}), Some(Key::Int(10)))?;
            Ok(())
        }))
        .with_step(from_fn(2, "observe", {
            let seen = seen.clone();
            move |txn| {
                seen.store(txn.count("books")?, Ordering::SeqCst);
                Ok(())
            }
        }));

    let factory = Factory::memory();
    let db = factory
        .open("library", OpenRequest::new(2).upgrade(Arc::new(engine)))
        .await
        .unwrap();
    assert_eq!(seen.load(Ordering::SeqCst), 1);
    assert_eq!(db.put("books", json!({}), None).await.unwrap(), Key::Int(11));
}

#[tokio::test]
async fn reopen_at_same_version_runs_nothing() {
    let runs = Arc::new(AtomicUsize::new(0));
    let engine = Arc::new(
        MigrationEngine::new(StoreDescriptor::new("library", 1).collection("books")).with_step(
            from_fn(1, "count", {
                let runs = runs.clone();
                move |_| {
                    runs.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        ),
    );

    let factory = Factory::memory();
    for _ in 0..3 {
        factory
            .open("library", OpenRequest::new(1).upgrade(engine.clone()))
            .await
            .unwrap()
            .close();
    }
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn undeclared_collections_survive_upgrades() {
    let factory = Factory::memory();
    let v1 = MigrationEngine::new(StoreDescriptor::new("library", 1).collections(["books", "legacy"]));
    let db = factory
        .open("library", OpenRequest::new(1).upgrade(Arc::new(v1)))
        .await
        .unwrap();
    db.put("legacy", json!("old"), None).await.unwrap();
    db.close();

    // The v2 descriptor forgot `legacy`; the store keeps it anyway.
    let v2 = MigrationEngine::new(StoreDescriptor::new("library", 2).collections(["books", "loans"]));
    let db = factory
        .open("library", OpenRequest::new(2).upgrade(Arc::new(v2)))
        .await
        .unwrap();
    assert_eq!(
        db.collection_names().unwrap(),
        vec!["books", "legacy", "loans"]
    );
    assert_eq!(db.get_all("legacy").await.unwrap(), vec![json!("old")]);
}

#[tokio::test]
async fn failed_step_keeps_old_version_and_data() {
    let factory = Factory::memory();
    let db = factory
        .open("library", OpenRequest::new(1).upgrade(Arc::new(books(1))))
        .await
        .unwrap();
    let key = db.put("books", json!({"title": "A"}), None).await.unwrap();
    db.close();

    let engine = books(3).with_step(from_fn(3, "explode", |_| Err("boom".into())));
    assert!(factory
        .open("library", OpenRequest::new(3).upgrade(Arc::new(engine)))
        .await
        .is_err());

    assert_eq!(factory.stored_version("library").unwrap(), 1);
    let db = factory
        .open("library", OpenRequest::new(1))
        .await
        .unwrap();
    // Step 2 ran before step 3 failed, but none of it was kept.
    assert_eq!(db.get("books", &key).await.unwrap(), Some(json!({"title": "A"})));
}
