//! Record-level helpers for migration steps.
//!
//! Data migrations usually rewrite every record of a collection that has a
//! given shape and leave the rest alone. [`update_each`] does the walking;
//! [`NestField`] is a ready-made step built on it.

use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use kvbind_store::{BoxError, StoreError, Transaction, UpgradeTransaction};
use serde_json::{Map, Value};

use crate::step::MigrationStep;

/// Rewrite records of `collection` in place.
///
/// `f` sees each record in key order and returns `Some(new)` to replace it
/// or `None` to leave it untouched. Returns how many records were replaced.
pub fn update_each<F>(
    txn: &mut Transaction,
    collection: &str,
    mut f: F,
) -> Result<usize, StoreError>
where
    F: FnMut(&Value) -> Option<Value>,
{
    let mut updated = 0;
    for (key, record) in txn.cursor(collection)? {
        if let Some(new) = f(&record) {
            txn.put(collection, new, Some(key))?;
            updated += 1;
        }
    }
    Ok(updated)
}

/// Moves a top-level field into a nested object stamped with the migration
/// time: `{title: "A"}` becomes `{titleInfo: {title: "A", time: 1700000000000}}`.
///
/// Records without the field, and records that are not objects, are left
/// exactly as they are.
pub struct NestField {
    version: u32,
    collection: String,
    field: String,
    into: String,
    name: String,
    clock: fn() -> u64,
}

impl NestField {
    pub fn new(
        version: u32,
        collection: impl Into<String>,
        field: impl Into<String>,
        into: impl Into<String>,
    ) -> Self {
        let field = field.into();
        let into = into.into();
        Self {
            version,
            collection: collection.into(),
            name: format!("nest `{field}` into `{into}`"),
            field,
            into,
            clock: unix_millis,
        }
    }

    /// Replace the timestamp source (milliseconds since the Unix epoch).
    pub fn with_clock(mut self, clock: fn() -> u64) -> Self {
        self.clock = clock;
        self
    }

    fn nest(&self, record: &Value, time: u64) -> Option<Value> {
        let object = record.as_object()?;
        let value = object.get(&self.field)?;

        let mut info = Map::new();
        info.insert(self.field.clone(), value.clone());
        info.insert("time".into(), Value::from(time));

        let mut out = object.clone();
        out.remove(&self.field);
        out.insert(self.into.clone(), Value::Object(info));
        Some(Value::Object(out))
    }
}

#[async_trait]
impl MigrationStep for NestField {
    fn version(&self) -> u32 {
        self.version
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn apply(&self, txn: &mut UpgradeTransaction) -> Result<(), BoxError> {
        let time = (self.clock)();
        let updated = update_each(txn, &self.collection, |record| self.nest(record, time))?;
        tracing::debug!(collection = %self.collection, updated, "nested field");
        Ok(())
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
