//! Lifecycle notices emitted by the supervisor.

use crate::config::Config;

/// A lifecycle line worth telling the user about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Ready,
    Restarting,
    Failed,
    TranspilerMissing,
    SerializationFailed,
    /// Buffered calls were dropped because their export is no longer callable.
    BufferedExecutionsTerminated { function_id: String, count: usize },
    CannotRestartKilled,
}

/// Formats notices through `tracing`, labelled with the module file name.
#[derive(Debug, Clone)]
pub(crate) struct Logger {
    module: String,
    transpiler: Option<String>,
    quiet: bool,
}

impl Logger {
    pub(crate) fn new(config: &Config) -> Self {
        Self {
            module: config.module_name(),
            transpiler: config.transpiler.clone(),
            quiet: config.quiet,
        }
    }

    pub(crate) fn notice(&self, notice: &Notice) {
        if self.quiet {
            return;
        }

        let module = self.module.as_str();
        match notice {
            Notice::Ready => tracing::info!(target: "modulik", module, "Ready."),
            Notice::Restarting => tracing::info!(target: "modulik", module, "Restarting.."),
            Notice::Failed => tracing::error!(target: "modulik", module, "Exited unexpectedly"),
            Notice::TranspilerMissing => tracing::error!(
                target: "modulik",
                module,
                "\"{}\" transpiler is enabled but the worker could not load it. Did you forget to install it?",
                self.transpiler.as_deref().unwrap_or("unknown")
            ),
            Notice::SerializationFailed => tracing::error!(
                target: "modulik",
                module,
                "Value exported from the module is not serializable"
            ),
            Notice::BufferedExecutionsTerminated { function_id, count } => tracing::error!(
                target: "modulik",
                module,
                function_id = function_id.as_str(),
                count,
                "There were executions buffered, but the export is not a function anymore. Buffered executions have been rejected."
            ),
            Notice::CannotRestartKilled => {
                tracing::error!(target: "modulik", module, "Module killed - cannot restart")
            }
        }
    }
}
