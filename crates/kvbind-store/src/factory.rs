use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::database::Database;
use crate::error::{validate_name, BoxError, StoreError};
use crate::memory::MemoryProvider;
use crate::traits::{Backend, Provider};
use crate::transaction::UpgradeTransaction;

/// Delivered to `on_blocked` / `on_blocking` when a connection asks for a
/// newer version than the one stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionChangeEvent {
    pub old_version: u32,
    pub new_version: u32,
}

/// Callback for version-change notifications.
pub type VersionChangeCallback = Arc<dyn Fn(VersionChangeEvent) + Send + Sync>;

/// Runs inside the upgrade transaction when a store is opened at a newer
/// version. Returning an error aborts the upgrade; nothing is committed.
#[async_trait]
pub trait UpgradeHandler: Send + Sync {
    async fn upgrade(&self, txn: &mut UpgradeTransaction) -> Result<(), BoxError>;
}

/// Parameters of [`Factory::open`].
#[derive(Clone)]
pub struct OpenRequest {
    pub version: u32,
    pub upgrade: Option<Arc<dyn UpgradeHandler>>,
    /// Called on the opener when other connections keep the upgrade waiting.
    pub on_blocked: Option<VersionChangeCallback>,
    /// Called on this connection, once open, when someone else wants to
    /// upgrade the store.
    pub on_blocking: Option<VersionChangeCallback>,
}

impl OpenRequest {
    pub fn new(version: u32) -> Self {
        Self {
            version,
            upgrade: None,
            on_blocked: None,
            on_blocking: None,
        }
    }

    pub fn upgrade(mut self, handler: Arc<dyn UpgradeHandler>) -> Self {
        self.upgrade = Some(handler);
        self
    }

    pub fn on_blocked(mut self, f: impl Fn(VersionChangeEvent) + Send + Sync + 'static) -> Self {
        self.on_blocked = Some(Arc::new(f));
        self
    }

    pub fn on_blocking(mut self, f: impl Fn(VersionChangeEvent) + Send + Sync + 'static) -> Self {
        self.on_blocking = Some(Arc::new(f));
        self
    }
}

impl fmt::Debug for OpenRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenRequest")
            .field("version", &self.version)
            .field("upgrade", &self.upgrade.is_some())
            .field("on_blocked", &self.on_blocked.is_some())
            .field("on_blocking", &self.on_blocking.is_some())
            .finish()
    }
}

// ── Per-store bookkeeping ───────────────────────────────────────────

struct ConnectionSlot {
    on_version_change: Option<VersionChangeCallback>,
}

/// Shared state of one store name inside a factory.
pub(crate) struct StoreEntry {
    pub(crate) name: String,
    pub(crate) backend: Arc<dyn Backend>,
    /// Serializes read-write and upgrade transactions.
    pub(crate) write_lock: Arc<tokio::sync::Mutex<()>>,
    /// One version handshake at a time.
    open_queue: tokio::sync::Mutex<()>,
    connections: Mutex<BTreeMap<u64, ConnectionSlot>>,
    open_count: watch::Sender<usize>,
}

impl StoreEntry {
    fn new(name: &str, backend: Arc<dyn Backend>) -> Self {
        Self {
            name: name.to_string(),
            backend,
            write_lock: Arc::new(tokio::sync::Mutex::new(())),
            open_queue: tokio::sync::Mutex::new(()),
            connections: Mutex::new(BTreeMap::new()),
            open_count: watch::Sender::new(0),
        }
    }

    fn register(&self, id: u64, on_version_change: Option<VersionChangeCallback>) {
        let mut connections = self
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        connections.insert(id, ConnectionSlot { on_version_change });
        self.open_count.send_replace(connections.len());
    }

    pub(crate) fn release(&self, id: u64) {
        let mut connections = self
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if connections.remove(&id).is_some() {
            self.open_count.send_replace(connections.len());
            debug!(store = %self.name, connection = id, "connection closed");
        }
    }

    fn open_connections(&self) -> usize {
        *self.open_count.borrow()
    }

    fn version_change_callbacks(&self) -> Vec<VersionChangeCallback> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter_map(|slot| slot.on_version_change.clone())
            .collect()
    }

    fn stored_version(&self) -> Result<u32, StoreError> {
        Ok(self.backend.load_catalog()?.map_or(0, |c| c.version))
    }
}

// ── Factory ─────────────────────────────────────────────────────────

/// Opens versioned stores and arbitrates version changes between the
/// connections it hands out.
///
/// Cheap to clone; clones share connections and stores.
#[derive(Clone)]
pub struct Factory {
    inner: Arc<FactoryInner>,
}

struct FactoryInner {
    provider: Box<dyn Provider>,
    stores: Mutex<HashMap<String, Arc<StoreEntry>>>,
    next_connection: AtomicU64,
}

impl Factory {
    pub fn new(provider: impl Provider + 'static) -> Self {
        Self {
            inner: Arc::new(FactoryInner {
                provider: Box::new(provider),
                stores: Mutex::new(HashMap::new()),
                next_connection: AtomicU64::new(1),
            }),
        }
    }

    /// A factory over fresh in-memory storage.
    pub fn memory() -> Self {
        Self::new(MemoryProvider::new())
    }

    /// Open a connection to `name` at `request.version`.
    ///
    /// When the stored version is older, every other open connection of the
    /// store gets `on_blocking`; if any stays open the requester gets
    /// `on_blocked` and this call waits until they have all closed. The
    /// upgrade handler then runs in a single [`UpgradeTransaction`] that
    /// commits together with the new version, or not at all.
    pub async fn open(&self, name: &str, request: OpenRequest) -> Result<Database, StoreError> {
        validate_name(name)?;
        if request.version == 0 {
            return Err(StoreError::InvalidVersion);
        }
        let entry = self.entry(name)?;
        let queued = entry.open_queue.lock().await;

        let stored = entry.stored_version()?;
        if request.version < stored {
            return Err(StoreError::VersionTooLow {
                requested: request.version,
                stored,
            });
        }

        if request.version > stored {
            let event = VersionChangeEvent {
                old_version: stored,
                new_version: request.version,
            };
            self.wait_for_others(&entry, event, &request).await;
            run_upgrade(&entry, event, request.upgrade.as_deref()).await?;
        }

        let id = self.inner.next_connection.fetch_add(1, Ordering::Relaxed);
        entry.register(id, request.on_blocking);
        debug!(store = name, version = request.version, connection = id, "connection opened");
        drop(queued);
        Ok(Database::new(entry, id, request.version))
    }

    /// Version persisted for `name`; `0` when the store was never opened.
    pub fn stored_version(&self, name: &str) -> Result<u32, StoreError> {
        validate_name(name)?;
        self.entry(name)?.stored_version()
    }

    /// Number of connections to `name` that are still open.
    pub fn open_connections(&self, name: &str) -> usize {
        self.inner
            .stores
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .map_or(0, |entry| entry.open_connections())
    }

    fn entry(&self, name: &str) -> Result<Arc<StoreEntry>, StoreError> {
        let mut stores = self
            .inner
            .stores
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = stores.get(name) {
            return Ok(entry.clone());
        }
        let backend = self.inner.provider.open(name)?;
        let entry = Arc::new(StoreEntry::new(name, backend));
        stores.insert(name.to_string(), entry.clone());
        Ok(entry)
    }

    async fn wait_for_others(
        &self,
        entry: &StoreEntry,
        event: VersionChangeEvent,
        request: &OpenRequest,
    ) {
        // Callbacks may close their connection synchronously, so none run
        // under the connections lock.
        for notify in entry.version_change_callbacks() {
            notify(event);
        }

        let mut open = entry.open_count.subscribe();
        let remaining = *open.borrow_and_update();
        if remaining == 0 {
            return;
        }
        warn!(
            store = %entry.name,
            old_version = event.old_version,
            new_version = event.new_version,
            open = remaining,
            "version change blocked by open connections"
        );
        if let Some(blocked) = &request.on_blocked {
            blocked(event);
        }
        // The sender lives in `entry`, which outlives this wait.
        let _ = open.wait_for(|n| *n == 0).await;
        debug!(store = %entry.name, "version change unblocked");
    }
}

async fn run_upgrade(
    entry: &StoreEntry,
    event: VersionChangeEvent,
    handler: Option<&dyn UpgradeHandler>,
) -> Result<(), StoreError> {
    let guard = entry.write_lock.clone().lock_owned().await;
    let mut txn = UpgradeTransaction::begin(
        entry.backend.clone(),
        &entry.name,
        event.old_version,
        event.new_version,
        guard,
    )?;

    if let Some(handler) = handler {
        if let Err(source) = handler.upgrade(&mut txn).await {
            drop(txn);
            warn!(
                store = %entry.name,
                old_version = event.old_version,
                new_version = event.new_version,
                error = %source,
                "upgrade aborted"
            );
            return Err(StoreError::UpgradeAborted {
                version: event.new_version,
                source,
            });
        }
    }

    txn.commit()?;
    info!(
        store = %entry.name,
        old_version = event.old_version,
        new_version = event.new_version,
        "store upgraded"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn new_store_gets_requested_version() {
        let factory = Factory::memory();
        assert_eq!(factory.stored_version("lib").unwrap(), 0);
        let db = factory.open("lib", OpenRequest::new(3)).await.unwrap();
        assert_eq!(db.version(), 3);
        assert_eq!(factory.stored_version("lib").unwrap(), 3);
        assert_eq!(factory.open_connections("lib"), 1);
    }

    #[tokio::test]
    async fn rejects_bad_versions_and_names() {
        let factory = Factory::memory();
        assert!(matches!(
            factory.open("lib", OpenRequest::new(0)).await,
            Err(StoreError::InvalidVersion)
        ));
        assert!(matches!(
            factory.open("", OpenRequest::new(1)).await,
            Err(StoreError::InvalidName(_))
        ));

        let db = factory.open("lib", OpenRequest::new(2)).await.unwrap();
        db.close();
        assert!(matches!(
            factory.open("lib", OpenRequest::new(1)).await,
            Err(StoreError::VersionTooLow {
                requested: 1,
                stored: 2
            })
        ));
    }

    #[tokio::test]
    async fn same_version_skips_handler() {
        struct AlwaysFails;

        #[async_trait]
        impl UpgradeHandler for AlwaysFails {
            async fn upgrade(&self, _txn: &mut UpgradeTransaction) -> Result<(), BoxError> {
                Err("must not run".into())
            }
        }

        let factory = Factory::memory();
        factory.open("lib", OpenRequest::new(1)).await.unwrap().close();
        let db = factory
            .open("lib", OpenRequest::new(1).upgrade(Arc::new(AlwaysFails)))
            .await
            .unwrap();
        assert_eq!(db.version(), 1);
    }
}
