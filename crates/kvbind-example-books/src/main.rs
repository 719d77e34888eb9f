//! # Reading List Example
//!
//! Walks one application through a release cycle:
//!
//! 1. **Version 1** opens the library and stores a few books
//! 2. **Version 2** (configured from `books.toml`) opens alongside it; the
//!    old instance is told it blocks the upgrade and shuts down
//! 3. **Migration** nests every book's title and seeds a readers collection
//! 4. **Binding** keeps reading progress in sync with a record, including
//!    a re-read when the window becomes visible again
//!
//! Run: `RUST_LOG=debug cargo run -p kvbind-example-books`

use std::time::Duration;

use kvbind::{
    BindConfig, Binding, BindingEvent, BoxError, ConnectionManager, Factory, Key, LifecycleSignal,
    NestField, UpgradeTransaction, Visibility, VisibilityState,
};
use kvbind_migrate::migration;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing_subscriber::EnvFilter;

const CONFIG: &str = include_str!("../books.toml");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Progress {
    book: i64,
    page: u32,
}

#[migration(version = 2, name = "seed readers")]
fn seed_readers(txn: &mut UpgradeTransaction) -> Result<(), BoxError> {
    txn.put("readers", json!({"name": "Ada"}), Some(Key::from("ada")))?;
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("=== Reading List Example ===\n");

    let factory = Factory::memory();
    let v1 = demo_first_release(&factory).await?;
    let v2 = demo_upgrade(&factory, v1).await?;
    demo_binding(&v2).await?;

    println!("\n=== Done! ===");
    Ok(())
}

// ── Section 1: First release ─────────────────────────────────────

async fn demo_first_release(
    factory: &Factory,
) -> Result<ConnectionManager, Box<dyn std::error::Error>> {
    println!("1. Version 1 stores some books...\n");

    let config = BindConfig::new("library", 1).store("books");
    let manager = ConnectionManager::builder(factory.clone(), config).build()?;
    let db = manager.connect().await?;

    for title in ["Dune", "Solaris", "Neuromancer"] {
        let key = db.put("books", json!({"title": title}), None).await?;
        println!("   Stored {title:?} under key {key}");
    }
    Ok(manager)
}

// ── Section 2: Upgrade while the old version is open ─────────────

async fn demo_upgrade(
    factory: &Factory,
    old: ConnectionManager,
) -> Result<ConnectionManager, Box<dyn std::error::Error>> {
    println!("\n2. Version 2 opens while version 1 is still running...\n");

    // The old instance reacts to "you are blocking" by going away, the
    // way a stale window would reload.
    let mut old_signals = old.subscribe_signals();
    let old_instance = old.clone();
    let watcher = tokio::spawn(async move {
        while let Ok(signal) = old_signals.recv().await {
            if let LifecycleSignal::Blocking { message, event } = signal {
                println!(
                    "   [v1] {message} (v{} -> v{})",
                    event.old_version, event.new_version
                );
                old_instance.shutdown();
                break;
            }
        }
    });

    let config = BindConfig::from_toml_str(CONFIG)?;
    config.check_upgrade_from(old.config())?;
    let manager = ConnectionManager::builder(factory.clone(), config)
        .pipeline(NestField::new(2, "books", "title", "titleInfo"))
        .pipeline_boxed(register_seed_readers())
        .build()?;

    let mut signals = manager.subscribe_signals();
    let db = manager.connect().await?;
    watcher.await?;
    while let Ok(signal) = signals.try_recv() {
        match signal {
            LifecycleSignal::Blocked { message, .. } => println!("   [v2] {message}"),
            LifecycleSignal::Connected => println!("   [v2] connected"),
            other => println!("   [v2] {other:?}"),
        }
    }

    println!("\n3. Migrated data at version {}...\n", db.version());
    for book in db.get_all("books").await? {
        println!("   {book}");
    }
    println!("   readers: {}", db.count("readers").await?);
    println!("   old instance state: {:?}", old.state());
    Ok(manager)
}

// ── Section 3: Binding ───────────────────────────────────────────

async fn demo_binding(manager: &ConnectionManager) -> Result<(), Box<dyn std::error::Error>> {
    println!("\n4. Binding reading progress...\n");

    let db = manager.connect().await?;
    let progress = manager
        .bind(
            Binding::<Progress>::json("readers", "ada-progress").debounce(Duration::from_millis(50)),
            Progress { book: 1, page: 0 },
        )
        .await?;
    let mut events = progress.events();
    while let Ok(event) = events.recv().await {
        if let BindingEvent::Read { found } = event {
            println!("   Mounted, record found: {found}");
            break;
        }
    }

    for page in [10, 11, 12] {
        progress.update(|p| p.page = page);
    }
    while let Ok(event) = events.recv().await {
        if let BindingEvent::Written { key } = event {
            println!("   Wrote progress under {key}: {:?}", progress.get());
            break;
        }
    }

    // Another window moves the bookmark while this one is hidden.
    let mut visibility = Visibility::new(manager.refresh_trigger());
    visibility.set(VisibilityState::Hidden);
    db.put(
        "readers",
        json!({"book": 2, "page": 3}),
        Some(Key::from("ada-progress")),
    )
    .await?;
    visibility.set(VisibilityState::Visible);

    while let Ok(event) = events.recv().await {
        if let BindingEvent::Read { found: true } = event {
            println!("   Re-read after becoming visible: {:?}", progress.get());
            break;
        }
    }

    progress.unmount().await;
    manager.shutdown();
    Ok(())
}
