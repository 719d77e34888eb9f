use thiserror::Error;

/// Boxed error used for failures raised by user code (upgrade handlers,
/// migration steps, projections).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors returned by store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The connection this handle belongs to has been closed.
    #[error("connection to store `{0}` is closed")]
    Closed(String),

    /// The collection is not part of the store's catalog.
    #[error("collection `{0}` does not exist")]
    UnknownCollection(String),

    /// The collection exists but was not requested when the transaction began.
    #[error("collection `{0}` is not in the transaction scope")]
    OutOfScope(String),

    /// The index is not defined on the collection.
    #[error("index `{index}` does not exist on collection `{collection}`")]
    UnknownIndex { collection: String, index: String },

    /// A write was attempted in a read-only transaction.
    #[error("transaction is read-only")]
    ReadOnly,

    /// Versions are positive integers.
    #[error("version must be a positive integer")]
    InvalidVersion,

    /// The requested version is older than what is persisted.
    #[error("requested version {requested} is lower than the stored version {stored}")]
    VersionTooLow { requested: u32, stored: u32 },

    /// Store, collection and index names must be non-empty and NUL-free.
    #[error("invalid name `{0}`")]
    InvalidName(String),

    /// The upgrade handler failed; nothing was committed.
    #[error("upgrade to v{version} aborted: {source}")]
    UpgradeAborted {
        version: u32,
        #[source]
        source: BoxError,
    },

    /// The collection's auto-increment generator ran out of keys.
    #[error("key generator exhausted for collection `{0}`")]
    KeyGenerator(String),

    /// Catalog or record (de)serialization failed.
    #[error("codec error: {0}")]
    Codec(String),

    /// Failure reported by the storage backend.
    #[error("backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Returns the upgrade failure cause when this error aborted an upgrade.
    pub fn upgrade_source(&self) -> Option<&BoxError> {
        match self {
            Self::UpgradeAborted { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Codec(e.to_string())
    }
}

impl From<postcard::Error> for StoreError {
    fn from(e: postcard::Error) -> Self {
        Self::Codec(e.to_string())
    }
}

/// Validate a store, collection or index name.
pub(crate) fn validate_name(name: &str) -> Result<(), StoreError> {
    if name.is_empty() || name.contains('\0') {
        return Err(StoreError::InvalidName(name.to_string()));
    }
    Ok(())
}
