use kvbind_store::VersionChangeEvent;
use tokio::sync::broadcast;

/// Lifecycle notifications for whatever presents alerts or status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleSignal {
    /// The store is open and the handle is available.
    Connected,
    /// Our upgrade waits for older connections to close.
    Blocked {
        message: String,
        event: VersionChangeEvent,
    },
    /// Our open connection holds up a newer one's upgrade.
    Blocking {
        message: String,
        event: VersionChangeEvent,
    },
    /// Opening failed; the manager stays failed.
    Error { message: String },
}

/// Fan-out of [`LifecycleSignal`]s. Signals sent with no subscriber are
/// dropped; late subscribers only see later signals.
#[derive(Debug, Clone)]
pub struct SignalBus {
    tx: broadcast::Sender<LifecycleSignal>,
}

impl SignalBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, signal: LifecycleSignal) {
        // No receivers is fine.
        let _ = self.tx.send(signal);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleSignal> {
        self.tx.subscribe()
    }
}

impl Default for SignalBus {
    fn default() -> Self {
        Self::new(32)
    }
}
