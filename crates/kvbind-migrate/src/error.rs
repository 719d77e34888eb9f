use kvbind_store::{BoxError, StoreError};
use thiserror::Error;

/// Error during migration.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// The store descriptor is malformed or shrinks a previous one.
    #[error("invalid store descriptor: {0}")]
    InvalidDescriptor(String),

    /// A migration step failed; the upgrade transaction is discarded.
    #[error("migration step v{version} `{name}` failed: {source}")]
    Step {
        version: u32,
        name: String,
        #[source]
        source: BoxError,
    },

    /// The engine was asked to run an upgrade it was not built for.
    #[error("cannot upgrade from v{from} to v{to}: engine targets v{target}")]
    VersionMismatch { from: u32, to: u32, target: u32 },

    /// The underlying store rejected an operation.
    #[error(transparent)]
    Store(#[from] StoreError),
}
