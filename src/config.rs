//! Persisted plugin registry - the enabled/disabled map inside the host's
//! config document.
//!
//! The document lives at `<install-root>/config.json` and is shared with the
//! rest of the host: this module only owns the top-level `plugins` field
//! (plugin name -> bool) and must leave every other field exactly as found.
//! Each mutation is a full read-modify-write cycle so fields written by other
//! host components between our writes survive.
//!
//! The store also keeps an in-memory mirror of the enabled map. The mirror is
//! the source of truth for decisions made during this process's lifetime; the
//! file is the source of truth for the next process start.

use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use crate::plugins::PluginError;

/// File name of the host config document under the install root.
pub const CONFIG_FILE: &str = "config.json";

/// Read-modify-write access to the persisted plugin registry plus the
/// in-memory mirror of the enabled map.
///
/// Cheap to clone; all clones share one mirror and one write lock, so every
/// read-modify-write cycle in this process is serialized through a single
/// writer.
#[derive(Clone)]
pub struct ConfigStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    path: PathBuf,
    enabled: Mutex<HashMap<String, bool>>,
}

impl ConfigStore {
    /// Open the store backed by the document at `path`, initializing the
    /// in-memory mirror from whatever is currently on disk.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let enabled = enabled_map_of(&read_document_at(&path));
        debug!(path = ?path, plugins = enabled.len(), "Opened plugin registry");
        Self {
            inner: Arc::new(StoreInner {
                path,
                enabled: Mutex::new(enabled),
            }),
        }
    }

    /// Load and parse the full config document from disk.
    ///
    /// A missing file or a parse failure yields an empty document - a fresh
    /// install has no config yet, and a corrupt one must not take the host
    /// down.
    pub fn read_document(&self) -> Map<String, Value> {
        read_document_at(&self.inner.path)
    }

    /// Whether the mirror currently marks `name` enabled.
    pub fn plugin_enabled(&self, name: &str) -> bool {
        self.inner
            .enabled
            .lock()
            .map(|map| map.get(name).copied().unwrap_or(false))
            .unwrap_or(false)
    }

    /// Snapshot of the in-memory enabled map.
    pub fn enabled_map(&self) -> HashMap<String, bool> {
        self.inner
            .enabled
            .lock()
            .map(|map| map.clone())
            .unwrap_or_default()
    }

    /// Flip one plugin's enabled flag in both the mirror and the document.
    ///
    /// Entries are never removed: a disabled plugin keeps its tombstone so
    /// re-enabling does not require a reinstall. The whole cycle runs under
    /// the store's write lock.
    pub fn set_plugin_enabled(&self, name: &str, enabled: bool) -> Result<(), PluginError> {
        let mut mirror = self
            .inner
            .enabled
            .lock()
            .map_err(|_| PluginError::Io("plugin registry lock poisoned".to_string()))?;

        let mut document = read_document_at(&self.inner.path);
        let plugins = document
            .entry("plugins".to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !plugins.is_object() {
            warn!(path = ?self.inner.path, "Config field 'plugins' is not an object, resetting");
            *plugins = Value::Object(Map::new());
        }
        if let Some(map) = plugins.as_object_mut() {
            map.insert(name.to_string(), Value::Bool(enabled));
        }

        write_document_at(&self.inner.path, &document)?;
        mirror.insert(name.to_string(), enabled);
        debug!(plugin = %name, enabled, "Updated plugin registry");
        Ok(())
    }
}

fn read_document_at(path: &Path) -> Map<String, Value> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(_) => return Map::new(),
    };
    match serde_json::from_str::<Value>(&content) {
        Ok(Value::Object(map)) => map,
        Ok(_) => {
            warn!(path = ?path, "Config document is not a JSON object, treating as empty");
            Map::new()
        }
        Err(e) => {
            warn!(path = ?path, error = %e, "Failed to parse config document, treating as empty");
            Map::new()
        }
    }
}

fn write_document_at(path: &Path, document: &Map<String, Value>) -> Result<(), PluginError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| PluginError::Io(e.to_string()))?;
    }
    let json = serde_json::to_string_pretty(&Value::Object(document.clone()))
        .map_err(|e| PluginError::Io(e.to_string()))?;
    fs::write(path, json).map_err(|e| PluginError::Io(e.to_string()))
}

fn enabled_map_of(document: &Map<String, Value>) -> HashMap<String, bool> {
    document
        .get("plugins")
        .and_then(Value::as_object)
        .map(|plugins| {
            plugins
                .iter()
                .map(|(name, value)| (name.clone(), value.as_bool().unwrap_or(false)))
                .collect()
        })
        .unwrap_or_default()
}
