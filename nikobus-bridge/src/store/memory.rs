//! In-memory document store.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde_json::Value;

use super::{ConfigKind, ConfigStore};
use crate::error::Result;

/// Keeps documents in memory; used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    documents: Mutex<HashMap<ConfigKind, Value>>,
    writes: Mutex<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded with a module document.
    pub fn with_modules(document: Value) -> Self {
        let store = Self::new();
        store.documents.lock().insert(ConfigKind::Module, document);
        store
    }

    /// Number of `write` calls so far.
    pub fn write_count(&self) -> usize {
        *self.writes.lock()
    }
}

impl ConfigStore for MemoryStore {
    fn load(&self, kind: ConfigKind) -> Result<Option<Value>> {
        Ok(self.documents.lock().get(&kind).cloned())
    }

    fn write(&self, kind: ConfigKind, document: &Value) -> Result<()> {
        self.documents.lock().insert(kind, document.clone());
        *self.writes.lock() += 1;
        Ok(())
    }
}
