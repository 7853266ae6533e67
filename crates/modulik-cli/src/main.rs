//! modulik CLI - run a module under supervision and call it from the terminal.

mod session;

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use modulik_core::{Config, ModuleHandle, WorkerEntry};

/// Worker binary used when `--worker` is not given.
const DEFAULT_WORKER: &str = "modulik-json-worker";

#[derive(Parser)]
#[command(name = "modulik")]
#[command(about = "Run a module in a restartable worker process and call it from stdin")]
#[command(version)]
struct Cli {
    /// Path to the module source
    source: PathBuf,

    /// Worker binary that loads the module
    #[arg(long)]
    worker: Option<PathBuf>,

    /// Extra files or directories whose changes restart the module
    #[arg(long = "watch")]
    watch: Vec<PathBuf>,

    /// Transpiler the worker should load the module with
    #[arg(long)]
    transpiler: Option<String>,

    /// Never restart on file changes
    #[arg(long)]
    disabled: bool,

    /// Suppress lifecycle notices
    #[arg(short, long)]
    quiet: bool,

    /// Debounce window for file changes, in milliseconds
    #[arg(long, default_value = "100")]
    debounce: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Lifecycle notices are logged at info under the "modulik" target.
    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("modulik=info".parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    if !cli.source.exists() {
        anyhow::bail!("Module source not found: {}", cli.source.display());
    }

    let worker = match cli.worker {
        Some(path) => WorkerEntry::new(path),
        None => WorkerEntry::discover(DEFAULT_WORKER)?,
    };

    let mut config = Config::new(&cli.source, worker)
        .disabled(cli.disabled)
        .quiet(cli.quiet)
        .with_debounce(Duration::from_millis(cli.debounce));
    if let Some(transpiler) = cli.transpiler {
        config = config.with_transpiler(transpiler);
    }
    for path in cli.watch {
        config = config.watch(path);
    }

    let handle = ModuleHandle::launch(config)?;
    session::run(&handle).await
}
