//! Application-wide connection to one store.
//!
//! A [`ConnectionManager`] opens the configured store exactly once, runs the
//! migration pipeline during that open, and exposes the handle to the rest
//! of the application. Version-change notifications from the store become
//! [`LifecycleSignal`]s; nothing in here talks to a user directly.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use kvbind_migrate::{MigrationEngine, MigrationStep};
use kvbind_store::{Database, Factory, OpenRequest};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::binding::{Binding, BindingHandle};
use crate::config::BindConfig;
use crate::error::Error;
use crate::refresh::RefreshTrigger;
use crate::signal::{LifecycleSignal, SignalBus};

/// Where the connection is in its lifecycle.
///
/// `Unopened -> Opening -> Ready | Failed`. Shutdown moves any state to
/// `Closed`, which is final.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Unopened,
    Opening,
    Ready,
    Failed(String),
    Closed,
}

impl ConnectionState {
    /// Whether opening has finished, one way or the other.
    pub fn is_settled(&self) -> bool {
        !matches!(self, Self::Unopened | Self::Opening)
    }
}

/// Builder for [`ConnectionManager`].
pub struct ConnectionManagerBuilder {
    factory: Factory,
    config: BindConfig,
    steps: Vec<Box<dyn MigrationStep>>,
    refresh: Option<RefreshTrigger>,
    signals: Option<SignalBus>,
}

impl ConnectionManagerBuilder {
    /// Add a migration step to the pipeline.
    pub fn pipeline(mut self, step: impl MigrationStep + 'static) -> Self {
        self.steps.push(Box::new(step));
        self
    }

    /// Add an already boxed step, such as one from a `register_*` function.
    pub fn pipeline_boxed(mut self, step: Box<dyn MigrationStep>) -> Self {
        self.steps.push(step);
        self
    }

    /// Share a refresh trigger with bindings created elsewhere.
    pub fn refresh_trigger(mut self, trigger: RefreshTrigger) -> Self {
        self.refresh = Some(trigger);
        self
    }

    pub fn signals(mut self, bus: SignalBus) -> Self {
        self.signals = Some(bus);
        self
    }

    /// Validate the configuration and assemble the manager. Nothing is
    /// opened yet.
    pub fn build(self) -> Result<ConnectionManager, Error> {
        self.config.validate()?;
        let mut engine = MigrationEngine::new(self.config.descriptor());
        for step in self.steps {
            engine.register(step);
        }
        debug!(
            db = %self.config.db_name,
            version = self.config.current_version,
            steps = engine.registered_steps().len(),
            "connection manager built"
        );
        Ok(ConnectionManager {
            inner: Arc::new(Inner {
                factory: self.factory,
                config: self.config,
                engine: Arc::new(engine),
                state: watch::Sender::new(ConnectionState::Unopened),
                handle: OnceLock::new(),
                started: AtomicBool::new(false),
                signals: self.signals.unwrap_or_default(),
                refresh: self.refresh.unwrap_or_default(),
            }),
        })
    }
}

/// Owns the application's single connection to its store.
///
/// Cheap to clone; all clones share the same connection.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

struct Inner {
    factory: Factory,
    config: BindConfig,
    engine: Arc<MigrationEngine>,
    state: watch::Sender<ConnectionState>,
    handle: OnceLock<Database>,
    started: AtomicBool,
    signals: SignalBus,
    refresh: RefreshTrigger,
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("db", &self.inner.config.db_name)
            .field("version", &self.inner.config.current_version)
            .field("state", &*self.inner.state.borrow())
            .finish()
    }
}

impl ConnectionManager {
    pub fn builder(factory: Factory, config: BindConfig) -> ConnectionManagerBuilder {
        ConnectionManagerBuilder {
            factory,
            config,
            steps: Vec::new(),
            refresh: None,
            signals: None,
        }
    }

    pub fn config(&self) -> &BindConfig {
        &self.inner.config
    }

    /// Open the store, or wait for the open already in progress.
    ///
    /// Only the first call opens. It gets the detailed error on failure;
    /// every later call sees [`Error::NotReady`] carrying the same message.
    pub async fn connect(&self) -> Result<Database, Error> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return self.wait_ready().await;
        }
        self.open().await
    }

    /// Open in the background.
    pub fn start(&self) -> JoinHandle<Result<Database, Error>> {
        let this = self.clone();
        tokio::spawn(async move { this.connect().await })
    }

    /// Wait until opening settles and return the handle if it succeeded.
    ///
    /// Waits indefinitely if nobody ever calls [`connect`](Self::connect)
    /// or [`start`](Self::start).
    pub async fn wait_ready(&self) -> Result<Database, Error> {
        let mut rx = self.inner.state.subscribe();
        let state = rx
            .wait_for(ConnectionState::is_settled)
            .await
            .map(|s| s.clone())
            .map_err(|_| Error::NotReady("connection manager dropped".into()))?;
        self.resolve(&state)
    }

    /// The handle, if the connection is ready right now.
    pub fn handle(&self) -> Option<Database> {
        match *self.inner.state.borrow() {
            ConnectionState::Ready => self.inner.handle.get().cloned(),
            _ => None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn subscribe_signals(&self) -> broadcast::Receiver<LifecycleSignal> {
        self.inner.signals.subscribe()
    }

    pub fn refresh_trigger(&self) -> RefreshTrigger {
        self.inner.refresh.clone()
    }

    /// Render-gate helper: `ready` with the handle once connected,
    /// otherwise `fallback` with the current state.
    pub fn render<R>(
        &self,
        fallback: impl FnOnce(&ConnectionState) -> R,
        ready: impl FnOnce(&Database) -> R,
    ) -> R {
        match self.handle() {
            Some(db) => ready(&db),
            None => fallback(&self.state()),
        }
    }

    /// Mount a binding on this connection, connecting first if needed.
    pub async fn bind<T>(&self, binding: Binding<T>, initial: T) -> Result<BindingHandle<T>, Error>
    where
        T: Send + Sync + 'static,
    {
        let db = self.connect().await?;
        Ok(binding.spawn(db, initial, &self.inner.refresh))
    }

    /// Close the connection. Later calls to `connect` fail with
    /// [`Error::NotReady`].
    pub fn shutdown(&self) {
        self.inner.started.store(true, Ordering::SeqCst);
        // Closed goes first: an open finishing after this point sees it
        // and closes its own handle.
        self.set_state(ConnectionState::Closed);
        if let Some(db) = self.inner.handle.get() {
            db.close();
        }
        info!(db = %self.inner.config.db_name, "connection shut down");
    }

    // ── Opening ─────────────────────────────────────────────────────

    async fn open(&self) -> Result<Database, Error> {
        let config = &self.inner.config;
        if !self.transition(ConnectionState::Unopened, ConnectionState::Opening) {
            return Err(Error::NotReady("connection was shut down".into()));
        }
        info!(db = %config.db_name, version = config.current_version, "opening store");

        let blocked_bus = self.inner.signals.clone();
        let blocked_message = config.alert_messages.blocked.clone();
        let blocking_bus = self.inner.signals.clone();
        let blocking_message = config.alert_messages.blocking.clone();

        let request = OpenRequest::new(config.current_version)
            .upgrade(self.inner.engine.clone())
            .on_blocked(move |event| {
                warn!(
                    old_version = event.old_version,
                    new_version = event.new_version,
                    "upgrade blocked by other connections"
                );
                blocked_bus.publish(LifecycleSignal::Blocked {
                    message: blocked_message.clone(),
                    event,
                });
            })
            .on_blocking(move |event| {
                warn!(
                    old_version = event.old_version,
                    new_version = event.new_version,
                    "this connection is blocking an upgrade"
                );
                blocking_bus.publish(LifecycleSignal::Blocking {
                    message: blocking_message.clone(),
                    event,
                });
            });

        match self.inner.factory.open(&config.db_name, request).await {
            Ok(db) => {
                // The handle is stored before the state flips so a racing
                // shutdown always finds one of the two.
                let db = self.inner.handle.get_or_init(|| db).clone();
                if !self.transition(ConnectionState::Opening, ConnectionState::Ready) {
                    db.close();
                    return Err(Error::NotReady("connection was shut down".into()));
                }
                self.inner.signals.publish(LifecycleSignal::Connected);
                info!(db = %config.db_name, version = db.version(), "store ready");
                Ok(db)
            }
            Err(e) => {
                let err = Error::from_open(&config.db_name, e);
                error!(db = %config.db_name, error = %err, "failed to open store");
                let message = err.to_string();
                if self.transition(ConnectionState::Opening, ConnectionState::Failed(message.clone())) {
                    self.inner
                        .signals
                        .publish(LifecycleSignal::Error { message });
                }
                Err(err)
            }
        }
    }

    fn resolve(&self, state: &ConnectionState) -> Result<Database, Error> {
        match state {
            ConnectionState::Ready => self
                .inner
                .handle
                .get()
                .cloned()
                .ok_or_else(|| Error::NotReady("handle missing".into())),
            ConnectionState::Failed(message) => Err(Error::NotReady(message.clone())),
            ConnectionState::Closed => Err(Error::NotReady("connection was shut down".into())),
            ConnectionState::Unopened | ConnectionState::Opening => {
                Err(Error::NotReady("still opening".into()))
            }
        }
    }

    fn set_state(&self, state: ConnectionState) {
        debug!(db = %self.inner.config.db_name, ?state, "connection state");
        self.inner.state.send_replace(state);
    }

    /// Move `from -> to` atomically; false if the state was no longer `from`.
    fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        let db = &self.inner.config.db_name;
        self.inner.state.send_if_modified(|state| {
            if *state != from {
                debug!(%db, ?state, wanted = ?to, "state transition skipped");
                return false;
            }
            debug!(%db, state = ?to, "connection state");
            *state = to;
            true
        })
    }
}
