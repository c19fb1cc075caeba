//! Persisted configuration documents.
//!
//! The engine reads and writes two JSON documents through a [`ConfigStore`]:
//! the module document (required) and the button document (optional, created
//! by discovery).

pub mod documents;
pub mod json;
pub mod memory;

use serde_json::Value;

use crate::error::{BridgeError, Result};

pub use documents::{
    ButtonConfig, ButtonEntry, ChannelEntry, DiscoveredInfo, DiscoveredLink, ImpactedModule,
    ModuleConfig, ModuleEntry, OutputEntry,
};
pub use json::JsonFileStore;
pub use memory::MemoryStore;

/// Which document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ConfigKind {
    Module,
    Button,
}

impl ConfigKind {
    /// File name used by [`JsonFileStore`].
    pub fn file_name(self) -> &'static str {
        match self {
            ConfigKind::Module => "nikobus_module_config.json",
            ConfigKind::Button => "nikobus_button_config.json",
        }
    }

    /// Whether a missing document is fatal.
    pub fn is_required(self) -> bool {
        matches!(self, ConfigKind::Module)
    }
}

/// Load/write access to configuration documents.
pub trait ConfigStore: Send + Sync {
    /// `Ok(None)` when the document does not exist yet.
    fn load(&self, kind: ConfigKind) -> Result<Option<Value>>;

    fn write(&self, kind: ConfigKind, document: &Value) -> Result<()>;
}

/// Load and deserialize the module document; missing is an error.
pub fn load_module_config(store: &dyn ConfigStore) -> Result<ModuleConfig> {
    match store.load(ConfigKind::Module)? {
        Some(value) => Ok(serde_json::from_value(value)?),
        None => Err(BridgeError::MissingConfig(
            ConfigKind::Module.file_name().to_string(),
        )),
    }
}

/// Load the button document, or an empty one when it does not exist yet.
pub fn load_button_config(store: &dyn ConfigStore) -> Result<ButtonConfig> {
    match store.load(ConfigKind::Button)? {
        Some(value) => Ok(serde_json::from_value(value)?),
        None => Ok(ButtonConfig::default()),
    }
}

pub fn write_module_config(store: &dyn ConfigStore, config: &ModuleConfig) -> Result<()> {
    store.write(ConfigKind::Module, &serde_json::to_value(config)?)
}

pub fn write_button_config(store: &dyn ConfigStore, config: &ButtonConfig) -> Result<()> {
    store.write(ConfigKind::Button, &serde_json::to_value(config)?)
}
