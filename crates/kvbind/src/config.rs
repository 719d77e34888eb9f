//! Connection configuration.
//!
//! Usually built in code, but it can also be loaded from TOML:
//!
//! ```toml
//! db_name = "library"
//! current_version = 2
//! store_names = ["books", "readers"]
//!
//! [alert_messages]
//! blocked = "Close the other tabs to finish updating."
//! ```

use std::path::Path;

use kvbind_migrate::StoreDescriptor;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from loading or validating a [`BindConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// User-facing texts published with blocked / blocking signals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertMessages {
    /// Shown to a connection whose upgrade waits on older connections.
    pub blocked: String,
    /// Shown to a connection that holds up someone else's upgrade.
    pub blocking: String,
}

impl Default for AlertMessages {
    fn default() -> Self {
        Self {
            blocked: "The database upgrade is blocked. Please close all other tabs of this application.".into(),
            blocking: "A newer version of this application needs to upgrade the database. Please reload this tab.".into(),
        }
    }
}

/// Everything the connection manager needs to open a store, captured once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindConfig {
    pub db_name: String,
    pub current_version: u32,
    #[serde(default)]
    pub store_names: Vec<String>,
    #[serde(default)]
    pub alert_messages: AlertMessages,
}

impl BindConfig {
    pub fn new(db_name: impl Into<String>, current_version: u32) -> Self {
        Self {
            db_name: db_name.into(),
            current_version,
            store_names: Vec::new(),
            alert_messages: AlertMessages::default(),
        }
    }

    /// Declare a collection.
    pub fn store(mut self, name: impl Into<String>) -> Self {
        self.store_names.push(name.into());
        self
    }

    pub fn alert_messages(mut self, messages: AlertMessages) -> Self {
        self.alert_messages = messages;
        self
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.descriptor()
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    /// The store descriptor the migration engine provisions.
    pub fn descriptor(&self) -> StoreDescriptor {
        StoreDescriptor::new(self.db_name.clone(), self.current_version)
            .collections(self.store_names.iter().cloned())
    }

    /// Check that this config can replace `previous` in a new release:
    /// same store, no lower version, no collection dropped.
    pub fn check_upgrade_from(&self, previous: &BindConfig) -> Result<(), ConfigError> {
        self.descriptor()
            .check_extends(&previous.descriptor())
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }
}
