//! JSON files in a configuration directory.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use log::{debug, info};
use serde_json::Value;

use super::{ConfigKind, ConfigStore};
use crate::error::{BridgeError, Result};

/// Stores each document as pretty-printed JSON in `dir`.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, kind: ConfigKind) -> PathBuf {
        self.dir.join(kind.file_name())
    }
}

impl ConfigStore for JsonFileStore {
    fn load(&self, kind: ConfigKind) -> Result<Option<Value>> {
        let path = self.path(kind);
        if !path.exists() {
            debug!("{} not found at {}", kind.file_name(), path.display());
            return Ok(None);
        }
        let contents = fs::read_to_string(&path)?;
        let value = serde_json::from_str(&contents).map_err(|e| {
            BridgeError::Data(format!("{} is not valid JSON: {}", path.display(), e))
        })?;
        Ok(Some(value))
    }

    fn write(&self, kind: ConfigKind, document: &Value) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path(kind);
        // Write next to the target, then rename over it.
        let tmp = path.with_extension("json.tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            let text = serde_json::to_string_pretty(document)?;
            file.write_all(text.as_bytes())?;
            file.write_all(b"\n")?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        info!("Wrote {}", path.display());
        Ok(())
    }
}
