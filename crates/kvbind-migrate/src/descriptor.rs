use std::collections::BTreeSet;

use crate::error::MigrationError;

/// What a store should look like at a given version.
///
/// The collection list only ever grows: a descriptor for a newer version
/// must keep every collection an older one declared, because upgrades never
/// delete collections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreDescriptor {
    pub name: String,
    pub version: u32,
    pub collections: Vec<String>,
}

impl StoreDescriptor {
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            version,
            collections: Vec::new(),
        }
    }

    /// Declare a collection.
    pub fn collection(mut self, name: impl Into<String>) -> Self {
        self.collections.push(name.into());
        self
    }

    pub fn collections<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.collections.extend(names.into_iter().map(Into::into));
        self
    }

    /// Check the name, version and collection names.
    pub fn validate(&self) -> Result<(), MigrationError> {
        if self.name.is_empty() || self.name.contains('\0') {
            return Err(MigrationError::InvalidDescriptor(format!(
                "invalid store name `{}`",
                self.name
            )));
        }
        if self.version == 0 {
            return Err(MigrationError::InvalidDescriptor(
                "version must be at least 1".into(),
            ));
        }
        let mut seen = BTreeSet::new();
        for name in &self.collections {
            if name.is_empty() || name.contains('\0') {
                return Err(MigrationError::InvalidDescriptor(format!(
                    "invalid collection name `{name}`"
                )));
            }
            if !seen.insert(name.as_str()) {
                return Err(MigrationError::InvalidDescriptor(format!(
                    "collection `{name}` declared twice"
                )));
            }
        }
        Ok(())
    }

    /// Check that this descriptor is a valid successor of `previous`.
    ///
    /// Meant for release-time checks by callers that still have the last
    /// shipped descriptor. Upgrades themselves never need it: collections
    /// a descriptor omits are kept anyway.
    pub fn check_extends(&self, previous: &StoreDescriptor) -> Result<(), MigrationError> {
        if self.name != previous.name {
            return Err(MigrationError::InvalidDescriptor(format!(
                "store renamed from `{}` to `{}`",
                previous.name, self.name
            )));
        }
        if self.version < previous.version {
            return Err(MigrationError::InvalidDescriptor(format!(
                "version went backwards from {} to {}",
                previous.version, self.version
            )));
        }
        if let Some(dropped) = previous
            .collections
            .iter()
            .find(|c| !self.collections.contains(c))
        {
            return Err(MigrationError::InvalidDescriptor(format!(
                "collection `{dropped}` was removed; collections are never deleted"
            )));
        }
        Ok(())
    }

    pub fn declares(&self, collection: &str) -> bool {
        self.collections.iter().any(|c| c == collection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_and_validate() {
        let d = StoreDescriptor::new("lib", 2)
            .collection("books")
            .collections(["readers", "loans"]);
        assert_eq!(d.collections, vec!["books", "readers", "loans"]);
        assert!(d.validate().is_ok());
        assert!(d.declares("loans"));
        assert!(!d.declares("authors"));
    }

    #[test]
    fn rejects_malformed_descriptors() {
        for bad in [
            StoreDescriptor::new("", 1),
            StoreDescriptor::new("lib", 0),
            StoreDescriptor::new("lib", 1).collection(""),
            StoreDescriptor::new("lib", 1).collection("a\0b"),
            StoreDescriptor::new("lib", 1).collection("x").collection("x"),
        ] {
            assert!(
                matches!(bad.validate(), Err(MigrationError::InvalidDescriptor(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn collections_only_accrete() {
        let v1 = StoreDescriptor::new("lib", 1).collection("books");
        let v2 = StoreDescriptor::new("lib", 2).collections(["books", "readers"]);
        assert!(v2.check_extends(&v1).is_ok());

        let shrunk = StoreDescriptor::new("lib", 3).collection("readers");
        assert!(shrunk.check_extends(&v2).is_err());
        assert!(v1.check_extends(&v2).is_err());
        assert!(StoreDescriptor::new("other", 2)
            .collection("books")
            .check_extends(&v1)
            .is_err());
    }
}
