//! # kvbind
//!
//! Bind application state to records in a versioned local key-value store.
//!
//! kvbind opens one store per application, upgrades it through an ordered
//! pipeline of migration steps, and keeps in-memory values in sync with
//! individual records: reads on mount and whenever the application becomes
//! visible again, debounced writes whenever the value changes.
//!
//! ## Quick Start
//!
//! ```
//! use kvbind::{Binding, BindConfig, ConnectionManager, Factory};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Clone, Serialize, Deserialize)]
//! struct Settings {
//!     theme: String,
//! }
//!
//! # tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap().block_on(async {
//! let config = BindConfig::new("notes-app", 1).store("settings");
//! let manager = ConnectionManager::builder(Factory::memory(), config)
//!     .build()
//!     .unwrap();
//!
//! let settings = manager
//!     .bind(
//!         Binding::<Settings>::json("settings", "current"),
//!         Settings { theme: "light".into() },
//!     )
//!     .await
//!     .unwrap();
//!
//! settings.update(|s| s.theme = "dark".into());
//! assert_eq!(settings.get().theme, "dark");
//! settings.unmount().await;
//! # });
//! ```
//!
//! ## How It Works
//!
//! | Piece | Role |
//! |-------|------|
//! | [`ConnectionManager`] | Opens the store once, runs migrations, reports lifecycle signals |
//! | [`MigrationEngine`] | Provisions declared collections, then runs pending steps in version order |
//! | [`Binding`] | Syncs one value with one record; never reads and writes at once |
//! | [`RefreshTrigger`] / [`Visibility`] | Re-read every binding when the app becomes visible |
//!
//! Opening at a newer version asks older connections to close. They get a
//! [`LifecycleSignal::Blocking`]; while any stay open the opener gets a
//! [`LifecycleSignal::Blocked`]. A failed step aborts the whole upgrade and
//! leaves the store at its previous version.

mod binding;
mod config;
mod connection;
mod error;
mod refresh;
mod signal;

pub use binding::{Binding, BindingEvent, BindingHandle, BindingOptions, Phase};
pub use config::{AlertMessages, BindConfig, ConfigError};
pub use connection::{ConnectionManager, ConnectionManagerBuilder, ConnectionState};
pub use error::Error;
pub use refresh::{RefreshReason, RefreshTrigger, Visibility, VisibilityState};
pub use signal::{LifecycleSignal, SignalBus};

pub use kvbind_migrate::{
    from_fn, update_each, MigrationEngine, MigrationError, MigrationStep, NestField,
    StoreDescriptor, UpgradeReport,
};
#[cfg(feature = "redb")]
pub use kvbind_store::RedbProvider;
pub use kvbind_store::{
    async_trait, BoxError, Database, Factory, Key, MemoryProvider, OpenRequest, StoreError,
    Transaction, TransactionMode, UpgradeTransaction, VersionChangeEvent,
};

#[cfg(feature = "macros")]
pub use kvbind_migrate::migration;
