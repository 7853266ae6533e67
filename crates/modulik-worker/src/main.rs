//! modulik JSON worker: serves a JSON module source to a modulik host.
//!
//! Usage: `modulik-json-worker <source> [transpiler]`

mod builtins;
mod source;

use modulik_core::worker::{self, TRANSPILER_MISSING_EXIT_CODE, WorkerEnv};

/// The only transpiler this worker can load.
const JSON_TRANSPILER: &str = "json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout carries the bridge; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let env = WorkerEnv::from_args()?;
    if let Some(transpiler) = env.transpiler.as_deref()
        && transpiler != JSON_TRANSPILER
    {
        tracing::error!("Cannot load transpiler \"{}\"", transpiler);
        std::process::exit(TRANSPILER_MISSING_EXIT_CODE);
    }

    let module = source::load(&env.source)?;
    worker::serve(module).await?;

    // Stdin is read on a blocking thread that would keep the runtime alive.
    std::process::exit(0);
}
