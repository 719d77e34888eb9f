//! Shared test helpers: a backend wrapper whose reads and writes can be
//! made to fail or to stall.

#![allow(dead_code)]

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use kvbind::{Factory, Key, MemoryProvider, StoreError};
use kvbind_store::{Backend, Catalog, Provider, WriteBatch};
use serde_json::Value;
use tokio::sync::oneshot;

#[derive(Default)]
pub struct Controls {
    pub fail_reads: AtomicBool,
    pub fail_writes: AtomicBool,
    gate: Mutex<Option<Gate>>,
}

struct Gate {
    entered: oneshot::Sender<()>,
    release: mpsc::Receiver<()>,
}

/// The test's side of a stalled read.
pub struct ReadGate {
    pub entered: oneshot::Receiver<()>,
    pub release: mpsc::Sender<()>,
}

impl Controls {
    /// Make the next record read block until released.
    pub fn gate_next_read(&self) -> ReadGate {
        let (entered_tx, entered_rx) = oneshot::channel();
        let (release_tx, release_rx) = mpsc::channel();
        *self.gate.lock().unwrap() = Some(Gate {
            entered: entered_tx,
            release: release_rx,
        });
        ReadGate {
            entered: entered_rx,
            release: release_tx,
        }
    }
}

struct ControlledBackend {
    inner: Arc<dyn Backend>,
    controls: Arc<Controls>,
}

impl Backend for ControlledBackend {
    fn load_catalog(&self) -> Result<Option<Catalog>, StoreError> {
        self.inner.load_catalog()
    }

    fn get(&self, collection: &str, key: &Key) -> Result<Option<Value>, StoreError> {
        let gate = self.controls.gate.lock().unwrap().take();
        if let Some(gate) = gate {
            let _ = gate.entered.send(());
            let _ = gate.release.recv();
        }
        if self.controls.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("injected read failure".into()));
        }
        self.inner.get(collection, key)
    }

    fn scan(&self, collection: &str) -> Result<Vec<(Key, Value)>, StoreError> {
        self.inner.scan(collection)
    }

    fn commit(&self, batch: WriteBatch) -> Result<(), StoreError> {
        if self.controls.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("injected write failure".into()));
        }
        self.inner.commit(batch)
    }
}

struct ControlledProvider {
    inner: MemoryProvider,
    controls: Arc<Controls>,
}

impl Provider for ControlledProvider {
    fn open(&self, name: &str) -> Result<Arc<dyn Backend>, StoreError> {
        Ok(Arc::new(ControlledBackend {
            inner: self.inner.open(name)?,
            controls: self.controls.clone(),
        }))
    }
}

pub fn controlled_factory() -> (Factory, Arc<Controls>) {
    let controls = Arc::new(Controls::default());
    let factory = Factory::new(ControlledProvider {
        inner: MemoryProvider::new(),
        controls: controls.clone(),
    });
    (factory, controls)
}

/// Fail the test instead of hanging when something never happens.
pub async fn within<F: Future>(f: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), f)
        .await
        .expect("timed out")
}
