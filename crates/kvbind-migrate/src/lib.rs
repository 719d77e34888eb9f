//! # kvbind-migrate
//!
//! Ordered, atomic schema migrations for [`kvbind-store`](https://docs.rs/kvbind-store).
//!
//! A [`StoreDescriptor`] says which collections a store has at its target
//! version. A [`MigrationEngine`] holds the descriptor plus a list of
//! [`MigrationStep`]s and is plugged into `Factory::open` as the upgrade
//! handler. When a store is opened at a newer version the engine runs
//! inside the store's single upgrade transaction.
//!
//! ## How It Works
//!
//! 1. **Provisioning**: every declared collection the store lacks is created.
//!    Collections are never deleted.
//! 2. **Dispatch**: every step with `version > old` runs, in ascending
//!    version order, each awaited before the next.
//! 3. **Commit**: the new version and all writes commit together. Any error
//!    discards the lot and the store stays at `old`.
//!
//! ## Key Concepts
//!
//! - **Forward only**: versions only grow and collections only accrete.
//! - **Idempotent reopen**: opening at the stored version runs nothing.
//! - **Shape tolerant**: record helpers skip records that lack the fields a
//!   step expects.

mod descriptor;
mod engine;
mod error;
pub mod records;
mod step;

pub use descriptor::StoreDescriptor;
pub use engine::{MigrationEngine, UpgradeReport};
pub use error::MigrationError;
pub use records::{update_each, NestField};
pub use step::{from_fn, FnStep, MigrationStep};

// Used by code generated from `#[migration]`.
pub use async_trait::async_trait;
pub use kvbind_store::{BoxError, UpgradeTransaction};

// Re-export proc macros when the `macros` feature is enabled.
#[cfg(feature = "macros")]
pub use kvbind_migrate_macros::migration;
