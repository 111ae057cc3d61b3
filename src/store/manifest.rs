//! `library.json` manifest.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use super::atomic::write_atomic;
use crate::error::{StoreError, StoreResult};

/// Library-wide settings stored next to the `images/` directory.
///
/// Unknown keys (for example the image list written by older versions) are
/// kept in `extra` and written back unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LibraryManifest {
    pub library_name: String,
    /// Project name to project file, relative to the library root.
    pub projects: BTreeMap<String, String>,
    pub metadata: Map<String, Value>,
    /// Saved tag filters, name to expression.
    pub filters: Map<String, Value>,
    pub active_caption_profile: String,
    pub caption_profiles: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl LibraryManifest {
    #[must_use]
    pub fn new(library_name: impl Into<String>) -> Self {
        Self {
            library_name: library_name.into(),
            ..Self::default()
        }
    }

    /// Read a manifest; a missing file yields the default manifest.
    pub fn load(path: &Path) -> StoreResult<Self> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                log::debug!("No manifest at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(e) => return Err(StoreError::io(path, e)),
        };
        serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt {
            identity: "library.json".into(),
            reason: e.to_string(),
        })
    }

    /// Write the manifest atomically.
    pub fn save(&self, path: &Path) -> StoreResult<()> {
        let mut bytes = serde_json::to_vec_pretty(self).map_err(|e| StoreError::Corrupt {
            identity: "library.json".into(),
            reason: e.to_string(),
        })?;
        bytes.push(b'\n');
        write_atomic(path, &bytes).map_err(|e| StoreError::io(path, e))
    }

    /// Expression of a saved filter, if it exists and is a string.
    #[must_use]
    pub fn saved_filter(&self, name: &str) -> Option<&str> {
        self.filters.get(name).and_then(Value::as_str)
    }

    pub fn set_saved_filter(&mut self, name: impl Into<String>, expression: impl Into<String>) {
        self.filters
            .insert(name.into(), Value::String(expression.into()));
    }

    pub fn remove_saved_filter(&mut self, name: &str) -> bool {
        self.filters.remove(name).is_some()
    }
}
