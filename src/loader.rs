//! Startup plugin discovery, validation, and hand-off to the host.
//!
//! The loader runs once per host process start. It scans the module container
//! directory written by earlier install/uninstall runs, consults the registry
//! for each entry's enabled flag, and structurally validates every enabled
//! candidate's `plugin.json` descriptor before handing it to the host's
//! registration sink. One broken plugin never aborts discovery of the rest.
//!
//! A descriptor takes one of two shapes:
//! - a bare JSON string naming the init entry point (a plugin that is nothing
//!   but its initializer), or
//! - an object `{ "name": ..., "version": ..., "manifest": {...},
//!   "init": ... }` carrying full metadata.

use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config::ConfigStore;
use crate::plugins::PluginError;

/// Descriptor file expected at the root of each module directory.
pub const DESCRIPTOR_FILE: &str = "plugin.json";

/// A validated plugin, ready for the host's registration sink.
#[derive(Debug, Clone, PartialEq)]
pub enum PluginCandidate {
    /// A bare init entry point with no declared metadata.
    Callable { entry: String },
    /// A structured plugin with full metadata and a capability manifest.
    Structured {
        name: String,
        version: String,
        manifest: Map<String, Value>,
        init: String,
    },
}

impl PluginCandidate {
    /// The plugin's declared name, if it has one.
    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Callable { .. } => None,
            Self::Structured { name, .. } => Some(name),
        }
    }
}

/// The host's plugin registration sink. Whatever the host does with a
/// candidate - and whether that succeeds - is its own concern.
pub trait PluginHost {
    fn register(&mut self, plugin: PluginCandidate);
}

/// Scans the module container at startup and feeds enabled, valid plugins to
/// the host.
pub struct PluginLoader {
    modules_dir: PathBuf,
    config: ConfigStore,
}

impl PluginLoader {
    pub fn new(modules_dir: impl Into<PathBuf>, config: ConfigStore) -> Self {
        Self {
            modules_dir: modules_dir.into(),
            config,
        }
    }

    /// Enumerate module directories, load each enabled plugin, and register
    /// the valid ones with `host`.
    ///
    /// Per-candidate failures are logged and collected; the scan always runs
    /// to completion. A missing container directory yields no plugins - a
    /// fresh install has none.
    pub fn load_enabled_plugins(&self, host: &mut dyn PluginHost) -> Vec<PluginError> {
        let entries = match fs::read_dir(&self.modules_dir) {
            Ok(entries) => entries,
            Err(_) => {
                debug!(path = ?self.modules_dir, "Module container missing, no plugins to load");
                return Vec::new();
            }
        };

        let mut errors = Vec::new();
        let mut loaded = 0usize;
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }
            if !entry.path().is_dir() {
                continue;
            }
            if !self.config.plugin_enabled(&name) {
                debug!(plugin = %name, "Skipping disabled plugin");
                continue;
            }

            match load_candidate(&entry.path()) {
                Ok(candidate) => {
                    info!(plugin = %name, "Loaded plugin");
                    host.register(candidate);
                    loaded += 1;
                }
                Err(e) => {
                    warn!(plugin = %name, error = %e, "Failed to load plugin");
                    errors.push(e);
                }
            }
        }

        info!(loaded, failed = errors.len(), "Plugin scan complete");
        errors
    }
}

/// Read and structurally validate one module directory's descriptor.
fn load_candidate(dir: &Path) -> Result<PluginCandidate, PluginError> {
    let path = dir.join(DESCRIPTOR_FILE);
    let content = fs::read_to_string(&path)
        .map_err(|e| PluginError::InvalidPlugin(format!("missing {DESCRIPTOR_FILE}: {e}")))?;
    let value: Value = serde_json::from_str(&content)
        .map_err(|e| PluginError::InvalidPlugin(format!("unparsable {DESCRIPTOR_FILE}: {e}")))?;
    validate_candidate(value)
}

/// Accept a bare entry-point string or a full `{name, version, manifest,
/// init}` object; reject every other shape.
fn validate_candidate(value: Value) -> Result<PluginCandidate, PluginError> {
    match value {
        Value::String(entry) => Ok(PluginCandidate::Callable { entry }),
        Value::Object(fields) => {
            let name = string_field(&fields, "name")?;
            let version = string_field(&fields, "version")?;
            let init = string_field(&fields, "init")?;
            let manifest = fields
                .get("manifest")
                .and_then(Value::as_object)
                .cloned()
                .ok_or_else(|| {
                    PluginError::InvalidPlugin("descriptor field 'manifest' must be an object".to_string())
                })?;
            Ok(PluginCandidate::Structured {
                name,
                version,
                manifest,
                init,
            })
        }
        other => Err(PluginError::InvalidPlugin(format!(
            "descriptor must be a string or an object, got {}",
            json_type_name(&other)
        ))),
    }
}

fn string_field(fields: &Map<String, Value>, key: &str) -> Result<String, PluginError> {
    fields
        .get(key)
        .and_then(Value::as_str)
        .map(ToOwned::to_owned)
        .ok_or_else(|| {
            PluginError::InvalidPlugin(format!("descriptor field '{key}' must be a string"))
        })
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a bool",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CONFIG_FILE;
    use serde_json::json;
    use tempfile::TempDir;

    /// Records every candidate the loader hands over.
    #[derive(Default)]
    struct RecordingHost {
        registered: Vec<PluginCandidate>,
    }

    impl PluginHost for RecordingHost {
        fn register(&mut self, plugin: PluginCandidate) {
            self.registered.push(plugin);
        }
    }

    fn write_descriptor(modules_dir: &Path, name: &str, descriptor: &Value) {
        let dir = modules_dir.join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join(DESCRIPTOR_FILE),
            serde_json::to_string_pretty(descriptor).unwrap(),
        )
        .unwrap();
    }

    fn structured_descriptor(name: &str) -> Value {
        json!({
            "name": name,
            "version": "1.0.0",
            "manifest": {"permissions": ["http"]},
            "init": "index.js"
        })
    }

    fn loader_in(dir: &TempDir) -> (PluginLoader, ConfigStore) {
        let config = ConfigStore::open(dir.path().join(CONFIG_FILE));
        let loader = PluginLoader::new(dir.path().join("node_modules"), config.clone());
        (loader, config)
    }

    #[test]
    fn test_validate_bare_entry_string() {
        let candidate = validate_candidate(json!("index.js")).unwrap();
        assert_eq!(
            candidate,
            PluginCandidate::Callable {
                entry: "index.js".to_string()
            }
        );
        assert_eq!(candidate.name(), None);
    }

    #[test]
    fn test_validate_structured_object() {
        let candidate = validate_candidate(structured_descriptor("demo")).unwrap();
        assert_eq!(candidate.name(), Some("demo"));
        match candidate {
            PluginCandidate::Structured { version, init, manifest, .. } => {
                assert_eq!(version, "1.0.0");
                assert_eq!(init, "index.js");
                assert!(manifest.contains_key("permissions"));
            }
            other => panic!("expected structured candidate, got {other:?}"),
        }
    }

    #[test]
    fn test_validate_rejects_missing_init() {
        let err = validate_candidate(json!({
            "name": "demo",
            "version": "1.0.0",
            "manifest": {}
        }))
        .unwrap_err();
        assert!(err.to_string().contains("init"));
    }

    #[test]
    fn test_validate_rejects_non_object_manifest() {
        let err = validate_candidate(json!({
            "name": "demo",
            "version": "1.0.0",
            "manifest": "nope",
            "init": "index.js"
        }))
        .unwrap_err();
        assert!(err.to_string().contains("manifest"));
    }

    #[test]
    fn test_validate_rejects_other_shapes() {
        assert!(validate_candidate(json!(42)).is_err());
        assert!(validate_candidate(json!(["index.js"])).is_err());
        assert!(validate_candidate(json!(null)).is_err());
    }

    #[test]
    fn test_missing_container_yields_nothing() {
        let dir = TempDir::new().unwrap();
        let (loader, _) = loader_in(&dir);
        let mut host = RecordingHost::default();
        let errors = loader.load_enabled_plugins(&mut host);
        assert!(errors.is_empty());
        assert!(host.registered.is_empty());
    }

    #[test]
    fn test_scan_isolates_failures_and_skips_disabled() {
        let dir = TempDir::new().unwrap();
        let (loader, config) = loader_in(&dir);
        let modules = dir.path().join("node_modules");

        // Three entries: two enabled, one of those invalid.
        write_descriptor(&modules, "good", &structured_descriptor("good"));
        write_descriptor(&modules, "broken", &json!({"name": "broken"}));
        write_descriptor(&modules, "dormant", &structured_descriptor("dormant"));
        config.set_plugin_enabled("good", true).unwrap();
        config.set_plugin_enabled("broken", true).unwrap();
        config.set_plugin_enabled("dormant", false).unwrap();

        let mut host = RecordingHost::default();
        let errors = loader.load_enabled_plugins(&mut host);

        assert_eq!(host.registered.len(), 1);
        assert_eq!(host.registered[0].name(), Some("good"));
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], PluginError::InvalidPlugin(_)));
    }

    #[test]
    fn test_scan_skips_hidden_entries() {
        let dir = TempDir::new().unwrap();
        let (loader, config) = loader_in(&dir);
        let modules = dir.path().join("node_modules");

        write_descriptor(&modules, ".bin", &structured_descriptor("bin"));
        config.set_plugin_enabled(".bin", true).unwrap();

        let mut host = RecordingHost::default();
        let errors = loader.load_enabled_plugins(&mut host);
        assert!(errors.is_empty());
        assert!(host.registered.is_empty());
    }

    #[test]
    fn test_scan_skips_unregistered_entries_without_reading_them() {
        let dir = TempDir::new().unwrap();
        let (loader, _) = loader_in(&dir);
        let modules = dir.path().join("node_modules");

        // Present on disk but never enabled; descriptor is garbage, which
        // must not matter because it is never read.
        let entry = modules.join("untracked");
        fs::create_dir_all(&entry).unwrap();
        fs::write(entry.join(DESCRIPTOR_FILE), "not json").unwrap();

        let mut host = RecordingHost::default();
        let errors = loader.load_enabled_plugins(&mut host);
        assert!(errors.is_empty());
        assert!(host.registered.is_empty());
    }

    #[test]
    fn test_missing_descriptor_is_collected_not_fatal() {
        let dir = TempDir::new().unwrap();
        let (loader, config) = loader_in(&dir);
        let modules = dir.path().join("node_modules");

        fs::create_dir_all(modules.join("empty")).unwrap();
        write_descriptor(&modules, "good", &json!("init.js"));
        config.set_plugin_enabled("empty", true).unwrap();
        config.set_plugin_enabled("good", true).unwrap();

        let mut host = RecordingHost::default();
        let errors = loader.load_enabled_plugins(&mut host);
        assert_eq!(errors.len(), 1);
        assert_eq!(host.registered.len(), 1);
    }
}
