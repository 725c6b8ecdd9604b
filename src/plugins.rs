//! Plugin install/uninstall orchestration and enable/disable toggling.
//!
//! Installation shells out to an external package-fetching tool (npm by
//! default) which materializes the module under `<install-root>/node_modules`.
//! Install and uninstall both return an error-terminated sequence of output
//! chunks: a status line, the tool's live stderr, then exactly one completion
//! message or terminal error. State changes land in the [`ConfigStore`]
//! registry; none of them take effect until the host server restarts.
//!
//! Tool invocation contract: `install <identifier> --global-style
//! --loglevel=error --json [--dry-run]` with the install root as working
//! directory. Exit code 0 is success; on success stdout is JSON whose
//! `dependencies` object is keyed by the installed module name.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::config::{ConfigStore, CONFIG_FILE};
use crate::loader::PluginLoader;

/// Module container directory under the install root. Each immediate
/// subdirectory is one installed plugin.
pub const MODULES_DIR: &str = "node_modules";

/// Default external package-fetching tool.
pub const DEFAULT_TOOL: &str = "npm";

/// One element of an install/uninstall output sequence: a chunk of bytes to
/// relay to the caller, or the terminal error.
pub type OutputChunk = Result<Vec<u8>, PluginError>;

/// Errors surfaced by the plugin subsystem.
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error("plugin name is required")]
    NameRequired,

    #[error("Plugin is not installed: {0}")]
    NotInstalled(String),

    #[error("Failed to install \"{0}\". Check the error output above for details.")]
    InstallFailed(String),

    #[error("Invalid plugin: {0}")]
    InvalidPlugin(String),

    #[error("IO error: {0}")]
    Io(String),
}

/// Options for [`PluginManager::install`].
#[derive(Debug, Clone, Copy, Default)]
pub struct InstallOptions {
    /// Ask the tool to resolve without writing anything; a dry run never
    /// touches the registry.
    pub dry_run: bool,
}

/// Manages plugin installation, removal, and enabled state for one install
/// root.
pub struct PluginManager {
    root: PathBuf,
    modules_dir: PathBuf,
    tool: String,
    config: ConfigStore,
}

impl PluginManager {
    /// Create a manager rooted at `root`, creating the module container
    /// directory if absent and loading the registry mirror from disk.
    pub fn new(root: impl Into<PathBuf>, tool: impl Into<String>) -> Result<Self, PluginError> {
        let root = root.into();
        let modules_dir = root.join(MODULES_DIR);
        std::fs::create_dir_all(&modules_dir).map_err(|e| {
            PluginError::Io(format!(
                "Failed to create {}: {}",
                modules_dir.display(),
                e
            ))
        })?;
        let config = ConfigStore::open(root.join(CONFIG_FILE));
        Ok(Self {
            root,
            modules_dir,
            tool: tool.into(),
            config,
        })
    }

    /// The registry backing this manager.
    pub fn config(&self) -> &ConfigStore {
        &self.config
    }

    /// The module container directory.
    pub fn modules_dir(&self) -> &Path {
        &self.modules_dir
    }

    /// A startup loader over the same module container and registry.
    pub fn loader(&self) -> PluginLoader {
        PluginLoader::new(&self.modules_dir, self.config.clone())
    }

    /// Install a plugin by spawning the external tool against the install
    /// root.
    ///
    /// The returned sequence yields, in order: an `Installing ...` status
    /// line, the tool's stderr relayed live, and one terminal element - the
    /// completion message on success, the error otherwise. On success the
    /// resolved module name is marked enabled in the registry; a dry run
    /// skips that and the completion message but still ends normally.
    pub fn install(&self, identifier: &str, options: InstallOptions) -> mpsc::Receiver<OutputChunk> {
        let (tx, rx) = mpsc::channel(32);
        let identifier = identifier.trim().to_string();
        if identifier.is_empty() {
            let _ = tx.try_send(Err(PluginError::NameRequired));
            return rx;
        }

        let root = self.root.clone();
        let tool = self.tool.clone();
        let config = self.config.clone();
        tokio::spawn(async move {
            if let Err(e) = run_install(&root, &tool, config, &identifier, options, &tx).await {
                let _ = tx.send(Err(e)).await;
            }
        });
        rx
    }

    /// Remove a plugin's module directory and mark it disabled.
    ///
    /// A directory that is already gone counts as removed; any other
    /// filesystem error terminates the sequence and leaves the registry
    /// untouched.
    pub fn uninstall(&self, name: &str) -> mpsc::Receiver<OutputChunk> {
        let (tx, rx) = mpsc::channel(4);
        let name = name.trim().to_string();
        if name.is_empty() {
            let _ = tx.try_send(Err(PluginError::NameRequired));
            return rx;
        }

        let dir = self.modules_dir.join(&name);
        let config = self.config.clone();
        tokio::spawn(async move {
            if let Err(e) = run_uninstall(&dir, &name, config, &tx).await {
                let _ = tx.send(Err(e)).await;
            }
        });
        rx
    }

    /// Flip a plugin's enabled flag.
    ///
    /// Fails when the module directory does not exist, even if the registry
    /// still carries an entry for the name - presence on disk is the ground
    /// truth for "installed".
    pub fn set_enabled(&self, name: &str, enabled: bool) -> Result<String, PluginError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(PluginError::NameRequired);
        }
        if !self.modules_dir.join(name).is_dir() {
            return Err(PluginError::NotInstalled(name.to_string()));
        }

        self.config.set_plugin_enabled(name, enabled)?;
        info!(plugin = %name, enabled, "Toggled plugin");
        let state = if enabled { "enabled" } else { "disabled" };
        Ok(format!(
            "\"{name}\" has been {state}. Restart to apply the change."
        ))
    }
}

async fn run_install(
    root: &Path,
    tool: &str,
    config: ConfigStore,
    identifier: &str,
    options: InstallOptions,
    tx: &mpsc::Sender<OutputChunk>,
) -> Result<(), PluginError> {
    let _ = tx
        .send(Ok(format!("Installing {identifier}...\n").into_bytes()))
        .await;

    let mut cmd = Command::new(tool);
    cmd.arg("install")
        .arg(identifier)
        .arg("--global-style")
        .arg("--loglevel=error")
        .arg("--json");
    if options.dry_run {
        cmd.arg("--dry-run");
    }
    cmd.current_dir(root)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd
        .spawn()
        .map_err(|e| PluginError::Io(format!("Failed to spawn '{tool}': {e}")))?;
    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| PluginError::Io("child stdout was not captured".to_string()))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| PluginError::Io("child stderr was not captured".to_string()))?;

    // Relay stderr live, buffer stdout fully, and wait for exit - all three
    // concurrently. Completion requires both the exit status and stdout EOF;
    // the two are independent events and may land in either order, so they
    // are joined rather than awaited in sequence.
    let relay = async {
        let mut buf = [0u8; 4096];
        loop {
            match stderr.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx.send(Ok(buf[..n].to_vec())).await.is_err() {
                        break;
                    }
                }
            }
        }
    };
    let collect = async {
        let mut report = Vec::new();
        let _ = stdout.read_to_end(&mut report).await;
        report
    };
    let (status, report, ()) = tokio::join!(child.wait(), collect, relay);
    let status = status.map_err(|e| PluginError::Io(e.to_string()))?;

    if options.dry_run {
        debug!(plugin = %identifier, code = ?status.code(), "Dry-run install finished");
        return Ok(());
    }
    if !status.success() {
        return Err(PluginError::InstallFailed(identifier.to_string()));
    }

    let (name, display) = resolve_module_name(&report, identifier);
    config.set_plugin_enabled(&name, true)?;
    info!(plugin = %name, "Installed plugin");
    let _ = tx
        .send(Ok(format!(
            "\"{display}\" has been installed. Restart to enable the plugin.\n"
        )
        .into_bytes()))
        .await;
    Ok(())
}

async fn run_uninstall(
    dir: &Path,
    name: &str,
    config: ConfigStore,
    tx: &mpsc::Sender<OutputChunk>,
) -> Result<(), PluginError> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(plugin = %name, "Module directory already absent");
        }
        Err(e) => {
            return Err(PluginError::Io(format!(
                "Failed to remove {}: {}",
                dir.display(),
                e
            )));
        }
    }

    config.set_plugin_enabled(name, false)?;
    info!(plugin = %name, "Uninstalled plugin");
    let _ = tx
        .send(Ok(format!(
            "\"{name}\" has been uninstalled. Restart to disable the plugin.\n"
        )
        .into_bytes()))
        .await;
    Ok(())
}

/// Shape of the tool's `--json` report, reduced to what name resolution
/// needs.
#[derive(Debug, Deserialize)]
struct InstallReport {
    #[serde(default)]
    dependencies: BTreeMap<String, ReportDependency>,
}

#[derive(Debug, Deserialize)]
struct ReportDependency {
    #[serde(default)]
    version: Option<String>,
}

/// Resolve the installed module's registry name and display string from the
/// tool's JSON report: the first `dependencies` key is the canonical name,
/// its `version` field completes the `name@version` display form.
///
/// When the report is unparsable or missing those fields, fall back to the
/// last path segment of the original identifier (covers URL and scoped/alias
/// identifiers), with no version suffix.
fn resolve_module_name(report: &[u8], identifier: &str) -> (String, String) {
    if let Ok(report) = serde_json::from_slice::<InstallReport>(report) {
        if let Some((name, dep)) = report.dependencies.into_iter().next() {
            let display = match dep.version {
                Some(version) => format!("{name}@{version}"),
                None => name.clone(),
            };
            return (name, display);
        }
    }

    let name = identifier
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(identifier)
        .to_string();
    (name.clone(), name)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
