use async_trait::async_trait;
use kvbind_store::{BoxError, UpgradeTransaction};

/// A versioned unit of schema or data transformation.
///
/// A step runs during an upgrade when the store's old version is below
/// [`version`](MigrationStep::version) and the target is at or above it.
/// It must only touch the transaction it is given; if it fails, the whole
/// upgrade is discarded.
#[async_trait]
pub trait MigrationStep: Send + Sync {
    /// The version this step brings the store to.
    fn version(&self) -> u32;

    /// Label used in logs and errors.
    fn name(&self) -> &str {
        "unnamed"
    }

    async fn apply(&self, txn: &mut UpgradeTransaction) -> Result<(), BoxError>;
}

/// A step backed by a synchronous closure.
pub struct FnStep<F> {
    version: u32,
    name: String,
    f: F,
}

/// Build a step from a closure.
///
/// ```
/// use kvbind_migrate::{from_fn, MigrationStep};
///
/// let step = from_fn(2, "create readers", |txn| {
///     txn.create_collection("readers")?;
///     Ok(())
/// });
/// assert_eq!(step.version(), 2);
/// ```
pub fn from_fn<F>(version: u32, name: impl Into<String>, f: F) -> FnStep<F>
where
    F: Fn(&mut UpgradeTransaction) -> Result<(), BoxError> + Send + Sync,
{
    FnStep {
        version,
        name: name.into(),
        f,
    }
}

#[async_trait]
impl<F> MigrationStep for FnStep<F>
where
    F: Fn(&mut UpgradeTransaction) -> Result<(), BoxError> + Send + Sync,
{
    fn version(&self) -> u32 {
        self.version
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn apply(&self, txn: &mut UpgradeTransaction) -> Result<(), BoxError> {
        (self.f)(txn)
    }
}
