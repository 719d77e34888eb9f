use std::fmt;

use async_trait::async_trait;
use kvbind_store::{BoxError, UpgradeHandler, UpgradeTransaction};
use tracing::{debug, info, warn};

use crate::descriptor::StoreDescriptor;
use crate::error::MigrationError;
use crate::step::MigrationStep;

/// What an upgrade did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeReport {
    pub from: u32,
    pub to: u32,
    /// Collections created by provisioning, in declaration order.
    pub created_collections: Vec<String>,
    /// Versions of the steps that ran, in the order they ran.
    pub applied_steps: Vec<u32>,
}

/// Provisions collections and runs migration steps inside an upgrade.
///
/// Steps are kept sorted by version. Registering two steps with the same
/// version is allowed; they run in registration order.
///
/// An upgrade from `old` to `new`:
///
/// 1. creates every declared collection the store does not have yet,
/// 2. runs each step with `version > old`, ascending, one at a time.
///
/// A step registered above the target version still runs; registration
/// logs it at `warn!`.
///
/// Everything happens in the single [`UpgradeTransaction`] the store hands
/// over, so a failing step leaves the store exactly as it was.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
///
/// use kvbind_migrate::{from_fn, MigrationEngine, StoreDescriptor};
/// use kvbind_store::{Factory, OpenRequest};
///
/// # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
/// let mut engine = MigrationEngine::new(StoreDescriptor::new("lib", 2).collection("books"));
/// engine.register(Box::new(from_fn(2, "seed", |txn| {
///     txn.put("books", serde_json::json!({"title": "A"}), None)?;
///     Ok(())
/// })));
///
/// let db = Factory::memory()
///     .open("lib", OpenRequest::new(2).upgrade(Arc::new(engine)))
///     .await
///     .unwrap();
/// assert_eq!(db.count("books").await.unwrap(), 1);
/// # });
/// ```
pub struct MigrationEngine {
    descriptor: StoreDescriptor,
    steps: Vec<Box<dyn MigrationStep>>,
}

impl fmt::Debug for MigrationEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationEngine")
            .field("descriptor", &self.descriptor)
            .field("steps", &self.registered_steps())
            .finish()
    }
}

impl MigrationEngine {
    pub fn new(descriptor: StoreDescriptor) -> Self {
        Self {
            descriptor,
            steps: Vec::new(),
        }
    }

    pub fn descriptor(&self) -> &StoreDescriptor {
        &self.descriptor
    }

    /// The version upgrades end at.
    pub fn target_version(&self) -> u32 {
        self.descriptor.version
    }

    /// Register a migration step.
    pub fn register(&mut self, step: Box<dyn MigrationStep>) {
        let version = step.version();
        if self.steps.iter().any(|s| s.version() == version) {
            warn!(
                version,
                name = step.name(),
                "duplicate migration version; steps run in registration order"
            );
        }
        if version > self.descriptor.version {
            warn!(
                version,
                target = self.descriptor.version,
                "step is above the target version; it still runs on upgrade"
            );
        }
        self.steps.push(step);
        // Stable: equal versions keep registration order.
        self.steps.sort_by_key(|s| s.version());
    }

    /// Builder-style [`register`](Self::register).
    pub fn with_step(mut self, step: impl MigrationStep + 'static) -> Self {
        self.register(Box::new(step));
        self
    }

    /// All registered steps as `(version, name)` pairs, in run order.
    pub fn registered_steps(&self) -> Vec<(u32, String)> {
        self.steps
            .iter()
            .map(|s| (s.version(), s.name().to_string()))
            .collect()
    }

    /// Versions of the steps an upgrade from `old` would run.
    pub fn plan(&self, old: u32) -> Vec<u32> {
        self.pending(old).map(|s| s.version()).collect()
    }

    pub fn validate(&self) -> Result<(), MigrationError> {
        self.descriptor.validate()
    }

    /// Run provisioning and the pending steps inside `txn`.
    pub async fn upgrade(
        &self,
        txn: &mut UpgradeTransaction,
    ) -> Result<UpgradeReport, MigrationError> {
        self.validate()?;
        let (from, to) = (txn.old_version(), txn.new_version());
        if to != self.descriptor.version {
            return Err(MigrationError::VersionMismatch {
                from,
                to,
                target: self.descriptor.version,
            });
        }

        let mut created_collections = Vec::new();
        for name in &self.descriptor.collections {
            if txn.create_collection(name)? {
                created_collections.push(name.clone());
            }
        }
        for existing in txn.collection_names() {
            if !self.descriptor.declares(&existing) {
                debug!(
                    store = %self.descriptor.name,
                    collection = %existing,
                    "collection not declared; kept as is"
                );
            }
        }

        let mut applied_steps = Vec::new();
        for step in self.pending(from) {
            let version = step.version();
            debug!(store = %self.descriptor.name, version, name = step.name(), "applying migration step");
            step.apply(txn)
                .await
                .map_err(|source| MigrationError::Step {
                    version,
                    name: step.name().to_string(),
                    source,
                })?;
            applied_steps.push(version);
        }

        info!(
            store = %self.descriptor.name,
            from,
            to,
            created = created_collections.len(),
            applied = applied_steps.len(),
            "upgrade complete"
        );
        Ok(UpgradeReport {
            from,
            to,
            created_collections,
            applied_steps,
        })
    }

    fn pending(&self, old: u32) -> impl Iterator<Item = &dyn MigrationStep> {
        self.steps
            .iter()
            .map(|s| s.as_ref())
            .filter(move |s| s.version() > old)
    }
}

#[async_trait]
impl UpgradeHandler for MigrationEngine {
    async fn upgrade(&self, txn: &mut UpgradeTransaction) -> Result<(), BoxError> {
        MigrationEngine::upgrade(self, txn).await?;
        Ok(())
    }
}
