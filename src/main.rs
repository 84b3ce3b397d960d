use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, anyhow};
use clap::{Parser, Subcommand};
use treewatch::{ChangeKind, FileChangeListener, FileMonitor, Settings, logging};

#[derive(Parser)]
#[command(name = "treewatch")]
#[command(about = "Watch directory trees and report changed files by extension")]
struct Cli {
    /// Settings file (defaults to the nearest .treewatch/settings.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch directories recursively and print matching file changes
    Watch {
        /// Root directories (override configured roots)
        dirs: Vec<PathBuf>,

        /// Extension to report, repeatable (added to configured selectors)
        #[arg(short, long = "ext")]
        ext: Vec<String>,

        /// Stop after this many event batches (overrides config)
        #[arg(long)]
        max_batches: Option<usize>,
    },

    /// Show current configuration
    Config,

    /// Initialize configuration file
    Init {
        /// Force overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },
}

/// Prints one line per change.
struct PrintListener;

impl PrintListener {
    fn print(kind: ChangeKind, path: &Path) {
        println!("{kind} {}", path.display());
    }
}

impl FileChangeListener for PrintListener {
    fn file_added(&self, path: &Path) {
        Self::print(ChangeKind::Added, path);
    }

    fn file_removed(&self, path: &Path) {
        Self::print(ChangeKind::Removed, path);
    }

    fn file_changed(&self, path: &Path) {
        Self::print(ChangeKind::Changed, path);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Commands::Init { force } = cli.command {
        let path = Settings::init_config_file(force)
            .map_err(|e| anyhow!("failed to write configuration: {e}"))?;
        println!("Created default configuration at: {}", path.display());
        return Ok(());
    }

    let loaded = match &cli.config {
        Some(path) => Settings::load_from(path),
        None => Settings::load(),
    };
    let settings = loaded.map_err(|e| anyhow!("configuration error: {e}"))?;
    logging::init_with_config(&settings.logging);

    match cli.command {
        Commands::Config => {
            let toml_str = toml::to_string_pretty(&settings)?;
            println!("{toml_str}");
            Ok(())
        }
        Commands::Watch {
            dirs,
            ext,
            max_batches,
        } => watch(settings, dirs, ext, max_batches).await,
        Commands::Init { .. } => unreachable!("handled before loading settings"),
    }
}

async fn watch(
    mut settings: Settings,
    dirs: Vec<PathBuf>,
    ext: Vec<String>,
    max_batches: Option<usize>,
) -> anyhow::Result<()> {
    // CLI arguments win over settings
    if !dirs.is_empty() {
        settings.roots = dirs;
    }
    if settings.roots.is_empty() {
        settings.roots.push(std::env::current_dir()?);
    }
    settings.selectors.extend(ext);
    if max_batches.is_some() {
        settings.max_batches = max_batches;
    }
    if settings.selectors.is_empty() {
        eprintln!("Warning: no extensions selected, nothing will be reported");
    }

    let monitor = Arc::new(FileMonitor::from_settings(&settings));
    monitor.add_listener(Arc::new(PrintListener));
    monitor.start().context("failed to start monitor")?;

    for root in monitor.watched_roots() {
        eprintln!("Watching {}", root.display());
    }

    let worker = Arc::clone(&monitor);
    let budget = settings.max_batches;
    let mut task = tokio::task::spawn_blocking(move || match budget {
        Some(count) => worker.run_batches(count),
        None => worker.run(),
    });

    tokio::select! {
        result = &mut task => {
            result??;
        }
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for Ctrl-C")?;
            eprintln!("Stopping");
            monitor.stop();
            task.await??;
        }
    }

    monitor.stop();
    Ok(())
}
