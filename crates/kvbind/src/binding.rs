//! Two-way binding between one in-memory value and one stored record.
//!
//! A mounted binding runs as a single task that owns the record's
//! [`Phase`]. It reads on mount and on every refresh trigger, and writes
//! (debounced) whenever the bound value changes outside a read.
//!
//! Reads and writes never overlap. A change made while a read is in
//! flight, including the read callback's own update, is not written back.
//! A refresh that arrives while a write is still waiting out its debounce
//! cancels that write.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use kvbind_store::{BoxError, Database, Key};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

use crate::error::Error;
use crate::refresh::{RefreshReason, RefreshTrigger};

type ReadFn<T> = Box<dyn FnMut(Option<Value>) -> Option<T> + Send>;
type WriteFn<T> = Box<dyn Fn(&T) -> Result<Value, BoxError> + Send + Sync>;

/// What the binding task is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Reading,
    Writing,
}

/// Outcome notifications from a binding task.
#[derive(Debug, Clone)]
pub enum BindingEvent {
    /// A read finished; `found` is whether the record existed.
    Read { found: bool },
    /// The bound value was stored under `key`.
    Written { key: Key },
    ReadFailed(Arc<Error>),
    WriteFailed(Arc<Error>),
    /// A pending write was dropped because a refresh came first.
    WriteSuppressed,
}

#[derive(Debug, Clone)]
pub struct BindingOptions {
    /// Quiet period after the last change before it is written.
    pub debounce: Duration,
}

impl Default for BindingOptions {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(200),
        }
    }
}

/// A binding definition: which record, and how to map it to and from `T`.
pub struct Binding<T> {
    collection: String,
    key: Key,
    options: BindingOptions,
    on_read: ReadFn<T>,
    on_write: WriteFn<T>,
}

impl<T> fmt::Debug for Binding<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binding")
            .field("collection", &self.collection)
            .field("key", &self.key)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl<T> Binding<T>
where
    T: Send + Sync + 'static,
{
    /// `on_read` receives the stored record (`None` when there is none) and
    /// returns the new bound value, or `None` to keep the current one.
    /// `on_write` projects the bound value into the record to store.
    pub fn new(
        collection: impl Into<String>,
        key: impl Into<Key>,
        on_read: impl FnMut(Option<Value>) -> Option<T> + Send + 'static,
        on_write: impl Fn(&T) -> Result<Value, BoxError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            collection: collection.into(),
            key: key.into(),
            options: BindingOptions::default(),
            on_read: Box::new(on_read),
            on_write: Box::new(on_write),
        }
    }

    pub fn with_options(mut self, options: BindingOptions) -> Self {
        self.options = options;
        self
    }

    pub fn debounce(mut self, debounce: Duration) -> Self {
        self.options.debounce = debounce;
        self
    }

    /// Mount the binding: start its task and run the initial read.
    ///
    /// Dropping the returned handle unmounts it.
    pub fn spawn(self, db: Database, initial: T, refresh: &RefreshTrigger) -> BindingHandle<T> {
        let value = Arc::new(watch::Sender::new(initial));
        let (phase, phase_rx) = watch::channel(Phase::Idle);
        let (events, _) = broadcast::channel(64);
        let (commands, commands_rx) = mpsc::unbounded_channel();

        let task = BindingTask {
            db,
            collection: self.collection,
            key: self.key,
            options: self.options,
            on_read: self.on_read,
            on_write: self.on_write,
            value: value.clone(),
            phase,
            events: events.clone(),
        };
        let join = tokio::spawn(task.run(value.subscribe(), Some(refresh.subscribe()), commands_rx));

        BindingHandle {
            value,
            phase: phase_rx,
            events,
            commands,
            task: Some(join),
        }
    }
}

impl<T> Binding<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// A binding that stores `T` as its JSON form.
    ///
    /// Records that do not deserialize into `T` are ignored (logged) and
    /// leave the bound value unchanged.
    pub fn json(collection: impl Into<String>, key: impl Into<Key>) -> Self {
        let collection = collection.into();
        let key = key.into();
        let label = format!("{collection}/{key}");
        Self::new(
            collection,
            key,
            move |record| {
                let record = record?;
                match serde_json::from_value(record) {
                    Ok(value) => Some(value),
                    Err(e) => {
                        warn!(record = %label, error = %e, "stored record does not match bound type");
                        None
                    }
                }
            },
            |value| Ok(serde_json::to_value(value)?),
        )
    }
}

enum Command {
    Refresh,
    Unmount,
}

/// Handle to a mounted binding.
pub struct BindingHandle<T> {
    value: Arc<watch::Sender<T>>,
    phase: watch::Receiver<Phase>,
    events: broadcast::Sender<BindingEvent>,
    commands: mpsc::UnboundedSender<Command>,
    task: Option<JoinHandle<()>>,
}

impl<T> BindingHandle<T> {
    /// Current bound value.
    pub fn get(&self) -> T
    where
        T: Clone,
    {
        self.value.borrow().clone()
    }

    /// Replace the bound value; schedules a write unless a read is running.
    pub fn set(&self, value: T) {
        self.value.send_replace(value);
    }

    /// Modify the bound value in place.
    pub fn update(&self, f: impl FnOnce(&mut T)) {
        self.value.send_modify(f);
    }

    /// Watch the bound value.
    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.value.subscribe()
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    pub fn events(&self) -> broadcast::Receiver<BindingEvent> {
        self.events.subscribe()
    }

    /// Re-read this binding's record now.
    pub fn refresh(&self) {
        let _ = self.commands.send(Command::Refresh);
    }

    /// Stop the task and wait for it. An in-flight read or write finishes
    /// first; a pending debounced write is dropped.
    pub async fn unmount(mut self) {
        let _ = self.commands.send(Command::Unmount);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

// ── Task ────────────────────────────────────────────────────────────

struct BindingTask<T> {
    db: Database,
    collection: String,
    key: Key,
    options: BindingOptions,
    on_read: ReadFn<T>,
    on_write: WriteFn<T>,
    value: Arc<watch::Sender<T>>,
    phase: watch::Sender<Phase>,
    events: broadcast::Sender<BindingEvent>,
}

impl<T> BindingTask<T>
where
    T: Send + Sync + 'static,
{
    async fn run(
        mut self,
        mut changes: watch::Receiver<T>,
        mut refresh: Option<broadcast::Receiver<RefreshReason>>,
        mut commands: mpsc::UnboundedReceiver<Command>,
    ) {
        debug!(collection = %self.collection, key = %self.key, "binding mounted");
        self.read(&mut changes).await;

        let mut deadline: Option<Instant> = None;
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Refresh) => {
                        self.cancel_pending(&mut deadline);
                        self.read(&mut changes).await;
                    }
                    Some(Command::Unmount) | None => break,
                },
                reason = next_refresh(&mut refresh) => {
                    debug!(collection = %self.collection, key = %self.key, ?reason, "refresh triggered");
                    self.cancel_pending(&mut deadline);
                    self.read(&mut changes).await;
                }
                changed = changes.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    changes.borrow_and_update();
                    deadline = Some(Instant::now() + self.options.debounce);
                }
                () = wait_until(deadline) => {
                    deadline = None;
                    self.write(&mut changes).await;
                }
            }
        }

        if deadline.is_some() {
            debug!(collection = %self.collection, key = %self.key, "pending write dropped on unmount");
        }
        self.phase.send_replace(Phase::Idle);
        debug!(collection = %self.collection, key = %self.key, "binding unmounted");
    }

    fn cancel_pending(&self, deadline: &mut Option<Instant>) {
        if deadline.take().is_some() {
            debug!(collection = %self.collection, key = %self.key, "pending write cancelled by refresh");
            self.emit(BindingEvent::WriteSuppressed);
        }
    }

    async fn read(&mut self, changes: &mut watch::Receiver<T>) {
        self.phase.send_replace(Phase::Reading);
        match self.db.get(&self.collection, &self.key).await {
            Ok(record) => {
                let found = record.is_some();
                if let Some(value) = (self.on_read)(record) {
                    self.value.send_replace(value);
                }
                debug!(collection = %self.collection, key = %self.key, found, "binding read");
                self.emit(BindingEvent::Read { found });
            }
            Err(e) => {
                warn!(collection = %self.collection, key = %self.key, error = %e, "binding read failed");
                self.emit(BindingEvent::ReadFailed(Arc::new(Error::Read {
                    collection: self.collection.clone(),
                    key: self.key.to_string(),
                    source: e.into(),
                })));
            }
        }
        // Whatever changed while reading, including the read result, is
        // not written back.
        changes.borrow_and_update();
        self.phase.send_replace(Phase::Idle);
    }

    async fn write(&mut self, changes: &mut watch::Receiver<T>) {
        self.phase.send_replace(Phase::Writing);
        let projected = {
            let current = changes.borrow_and_update();
            (self.on_write)(&current)
        };
        let result = match projected {
            Ok(record) => self
                .db
                .put(&self.collection, record, Some(self.key.clone()))
                .await
                .map_err(BoxError::from),
            Err(e) => Err(e),
        };
        match result {
            Ok(key) => {
                debug!(collection = %self.collection, key = %key, "binding written");
                self.emit(BindingEvent::Written { key });
            }
            Err(e) => {
                warn!(collection = %self.collection, key = %self.key, error = %e, "binding write failed");
                self.emit(BindingEvent::WriteFailed(Arc::new(Error::Write {
                    collection: self.collection.clone(),
                    key: self.key.to_string(),
                    source: e,
                })));
            }
        }
        self.phase.send_replace(Phase::Idle);
    }

    fn emit(&self, event: BindingEvent) {
        let _ = self.events.send(event);
    }
}

/// Next refresh reason. Pends forever once the trigger is gone.
async fn next_refresh(rx: &mut Option<broadcast::Receiver<RefreshReason>>) -> RefreshReason {
    loop {
        let Some(inner) = rx.as_mut() else {
            return std::future::pending().await;
        };
        match inner.recv().await {
            Ok(reason) => return reason,
            // Missed some; the next buffered one still means "refresh".
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => *rx = None,
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;
    use serde_json::json;

    use super::*;
    use crate::refresh::RefreshTrigger;
    use kvbind_store::{async_trait, Factory, OpenRequest, UpgradeHandler, UpgradeTransaction};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Progress {
        page: u32,
    }

    struct Prefs;

    #[async_trait]
    impl UpgradeHandler for Prefs {
        async fn upgrade(&self, txn: &mut UpgradeTransaction) -> Result<(), BoxError> {
            txn.create_collection("prefs")?;
            Ok(())
        }
    }

    async fn db() -> Database {
        Factory::memory()
            .open("app", OpenRequest::new(1).upgrade(Arc::new(Prefs)))
            .await
            .unwrap()
    }

    async fn next_matching(
        rx: &mut broadcast::Receiver<BindingEvent>,
        pred: impl Fn(&BindingEvent) -> bool,
    ) -> BindingEvent {
        loop {
            let event = rx.recv().await.unwrap();
            if pred(&event) {
                return event;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn mount_reads_existing_record() {
        let db = db().await;
        db.put("prefs", json!({"page": 7}), Some(Key::from("progress")))
            .await
            .unwrap();

        let trigger = RefreshTrigger::new();
        let handle = Binding::<Progress>::json("prefs", "progress").spawn(
            db,
            Progress { page: 0 },
            &trigger,
        );
        let mut events = handle.events();
        assert!(matches!(
            events.recv().await.unwrap(),
            BindingEvent::Read { found: true }
        ));
        assert_eq!(handle.get(), Progress { page: 7 });
        assert_eq!(handle.phase(), Phase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_record_keeps_initial_value() {
        let db = db().await;
        let trigger = RefreshTrigger::new();
        let handle = Binding::<Progress>::json("prefs", "progress").spawn(
            db.clone(),
            Progress { page: 3 },
            &trigger,
        );
        let mut events = handle.events();
        assert!(matches!(
            events.recv().await.unwrap(),
            BindingEvent::Read { found: false }
        ));
        assert_eq!(handle.get(), Progress { page: 3 });

        // The read alone never writes anything back.
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(db.get("prefs", &Key::from("progress")).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn changes_are_debounced_into_one_write() {
        let db = db().await;
        let trigger = RefreshTrigger::new();
        let handle = Binding::<Progress>::json("prefs", "progress").spawn(
            db.clone(),
            Progress { page: 0 },
            &trigger,
        );
        let mut events = handle.events();
        next_matching(&mut events, |e| matches!(e, BindingEvent::Read { .. })).await;

        handle.set(Progress { page: 1 });
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.update(|p| p.page = 2);

        let written = next_matching(&mut events, |e| matches!(e, BindingEvent::Written { .. })).await;
        assert!(matches!(written, BindingEvent::Written { key } if key == Key::from("progress")));
        assert_eq!(
            db.get("prefs", &Key::from("progress")).await.unwrap(),
            Some(json!({"page": 2}))
        );
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_cancels_pending_write() {
        let db = db().await;
        db.put("prefs", json!({"page": 9}), Some(Key::from("progress")))
            .await
            .unwrap();
        let trigger = RefreshTrigger::new();
        let handle = Binding::<Progress>::json("prefs", "progress").spawn(
            db.clone(),
            Progress { page: 0 },
            &trigger,
        );
        let mut events = handle.events();
        next_matching(&mut events, |e| matches!(e, BindingEvent::Read { .. })).await;

        handle.set(Progress { page: 100 });
        tokio::task::yield_now().await;
        trigger.fire(RefreshReason::VisibilityRegained);

        assert!(matches!(
            events.recv().await.unwrap(),
            BindingEvent::WriteSuppressed
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            BindingEvent::Read { found: true }
        ));
        assert_eq!(handle.get(), Progress { page: 9 });

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(
            db.get("prefs", &Key::from("progress")).await.unwrap(),
            Some(json!({"page": 9}))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn projection_failure_is_reported() {
        let db = db().await;
        let trigger = RefreshTrigger::new();
        let handle = Binding::new(
            "prefs",
            "progress",
            |_| None,
            |page: &u32| {
                if *page > 10 {
                    Err("page out of range".into())
                } else {
                    Ok(json!(page))
                }
            },
        )
        .spawn(db.clone(), 0u32, &trigger);
        let mut events = handle.events();
        next_matching(&mut events, |e| matches!(e, BindingEvent::Read { .. })).await;

        handle.set(11);
        let failed = next_matching(&mut events, |e| matches!(e, BindingEvent::WriteFailed(_))).await;
        let BindingEvent::WriteFailed(err) = failed else {
            unreachable!()
        };
        assert!(matches!(*err, Error::Write { .. }));
        assert_eq!(handle.get(), 11);
        assert_eq!(handle.phase(), Phase::Idle);
        assert!(db.get("prefs", &Key::from("progress")).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn unmount_drops_pending_write() {
        let db = db().await;
        let trigger = RefreshTrigger::new();
        let handle = Binding::<Progress>::json("prefs", "progress").spawn(
            db.clone(),
            Progress { page: 0 },
            &trigger,
        );
        let mut events = handle.events();
        next_matching(&mut events, |e| matches!(e, BindingEvent::Read { .. })).await;

        handle.set(Progress { page: 5 });
        tokio::task::yield_now().await;
        handle.unmount().await;

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(db.get("prefs", &Key::from("progress")).await.unwrap().is_none());
        assert_eq!(trigger.fire(RefreshReason::Manual), 0);
    }
}
