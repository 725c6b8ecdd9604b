//! modhost - administrative CLI for the plugin subsystem.

use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use modhost::loader::{PluginCandidate, PluginHost};
use modhost::plugins::{InstallOptions, OutputChunk, PluginManager, DEFAULT_TOOL};
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(name = "modhost")]
#[command(author, version, about = "Plugin management for the modhost server")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Install root holding config.json and node_modules (default: ~/.modhost)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// External package-fetching tool to invoke for installs
    #[arg(long, global = true, default_value = DEFAULT_TOOL)]
    tool: String,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Install a plugin and enable it for the next restart
    Install {
        /// Plugin name, scoped package, or URL understood by the tool
        name: String,

        /// Resolve only; do not install or enable anything
        #[arg(long)]
        dry_run: bool,
    },

    /// Remove a plugin's module directory and disable it
    Uninstall {
        /// Installed plugin name
        name: String,
    },

    /// Enable an installed plugin
    Enable {
        /// Installed plugin name
        name: String,
    },

    /// Disable an installed plugin
    Disable {
        /// Installed plugin name
        name: String,
    },

    /// List installed plugins with their enabled state
    List,

    /// Scan and validate enabled plugins the way host startup does
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        "modhost=debug"
    } else {
        "modhost=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let root = cli.root.unwrap_or_else(default_root);
    let manager = PluginManager::new(&root, &cli.tool)?;

    match cli.command {
        Commands::Install { name, dry_run } => {
            drain_to_stdout(manager.install(&name, InstallOptions { dry_run })).await
        }
        Commands::Uninstall { name } => drain_to_stdout(manager.uninstall(&name)).await,
        Commands::Enable { name } => {
            println!("{}", manager.set_enabled(&name, true)?);
            Ok(())
        }
        Commands::Disable { name } => {
            println!("{}", manager.set_enabled(&name, false)?);
            Ok(())
        }
        Commands::List => cmd_list(&manager),
        Commands::Check => cmd_check(&manager),
    }
}

/// Default install root: `~/.modhost`, or the current directory when no home
/// directory is available.
fn default_root() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".modhost"))
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Relay an install/uninstall output sequence to stdout as it arrives; a
/// terminal error becomes the process exit status.
async fn drain_to_stdout(mut rx: mpsc::Receiver<OutputChunk>) -> anyhow::Result<()> {
    let mut stdout = std::io::stdout();
    while let Some(chunk) = rx.recv().await {
        let bytes = chunk?;
        stdout.write_all(&bytes)?;
        stdout.flush()?;
    }
    Ok(())
}

/// List module directories with their registry state.
fn cmd_list(manager: &PluginManager) -> anyhow::Result<()> {
    let enabled = manager.config().enabled_map();
    let mut entries: Vec<_> = std::fs::read_dir(manager.modules_dir())?
        .flatten()
        .filter(|entry| entry.path().is_dir())
        .map(|entry| entry.file_name().to_string_lossy().to_string())
        .filter(|name| !name.starts_with('.'))
        .collect();
    entries.sort();

    if entries.is_empty() {
        println!("No plugins installed.");
        return Ok(());
    }
    for name in entries {
        let state = if enabled.get(&name).copied().unwrap_or(false) {
            "enabled"
        } else {
            "disabled"
        };
        println!("{name}  [{state}]");
    }
    Ok(())
}

/// Run the startup scan against a sink that just prints what would load.
fn cmd_check(manager: &PluginManager) -> anyhow::Result<()> {
    struct PrintingHost;
    impl PluginHost for PrintingHost {
        fn register(&mut self, plugin: PluginCandidate) {
            match plugin {
                PluginCandidate::Callable { entry } => {
                    println!("would load: <unnamed> (init entry: {entry})");
                }
                PluginCandidate::Structured { name, version, .. } => {
                    println!("would load: {name}@{version}");
                }
            }
        }
    }

    let errors = manager.loader().load_enabled_plugins(&mut PrintingHost);
    info!(failures = errors.len(), "Startup scan finished");
    for error in &errors {
        eprintln!("failed: {error}");
    }
    Ok(())
}
