use kvbind_migrate::MigrationError;
use kvbind_store::{BoxError, StoreError};
use thiserror::Error;

use crate::config::ConfigError;

/// Errors surfaced by the connection manager and bindings.
#[derive(Debug, Error)]
pub enum Error {
    /// The store could not be opened.
    #[error("failed to open store `{name}`: {source}")]
    Open {
        name: String,
        #[source]
        source: StoreError,
    },

    /// A migration step (or provisioning) failed during the upgrade; the
    /// store was left at its previous version.
    #[error("migration to v{version} failed: {source}")]
    Migration {
        version: u32,
        #[source]
        source: MigrationError,
    },

    /// A binding read failed.
    #[error("read of `{collection}`/{key} failed: {source}")]
    Read {
        collection: String,
        key: String,
        #[source]
        source: BoxError,
    },

    /// A binding write (projection or put) failed.
    #[error("write of `{collection}`/{key} failed: {source}")]
    Write {
        collection: String,
        key: String,
        #[source]
        source: BoxError,
    },

    /// The connection is not ready: it failed, was shut down, or the
    /// manager is still opening it.
    #[error("connection not ready: {0}")]
    NotReady(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl Error {
    /// Classify a failed open, pulling migration failures out of the
    /// aborted upgrade.
    pub(crate) fn from_open(name: &str, err: StoreError) -> Self {
        match err {
            StoreError::UpgradeAborted { version, source } => {
                match source.downcast::<MigrationError>() {
                    Ok(migration) => Self::Migration {
                        version,
                        source: *migration,
                    },
                    Err(source) => Self::Open {
                        name: name.to_string(),
                        source: StoreError::UpgradeAborted { version, source },
                    },
                }
            }
            other => Self::Open {
                name: name.to_string(),
                source: other,
            },
        }
    }
}
