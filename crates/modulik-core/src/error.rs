//! Error types for modulik-core.

use thiserror::Error;

/// Result type for modulik-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Message used when buffered calls target an export that is no longer callable.
pub const NOT_A_FUNCTION: &str = "Module is not a function. Cannot execute.";

/// Message used when the module's exported value cannot cross the process boundary.
pub const EXPORT_NOT_SERIALIZABLE: &str = "Value exported from your module is not serializable";

/// Message used when a function result cannot cross the process boundary.
pub const RESULT_NOT_SERIALIZABLE: &str =
    "Execution result of function exported from your module is not serializable";

/// Message used when a callback result cannot cross the process boundary.
pub const CALLBACK_RESULT_NOT_SERIALIZABLE: &str =
    "Execution result of a callback argument of your module is not serializable";

/// Infrastructure errors: IPC, process spawning, watching, configuration.
#[derive(Debug, Error)]
pub enum Error {
    /// A value could not be encoded or failed its round-trip check.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// IPC communication error with a worker process.
    #[error("IPC error: {0}")]
    Ipc(String),

    /// The worker entry could not be started.
    #[error("failed to spawn worker: {0}")]
    Spawn(String),

    /// File watching could not be set up.
    #[error("file watch error: {0}")]
    Watch(String),

    /// The configuration is unusable.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors observed by callers of a managed module.
///
/// These are cloned into every waiter of a module future, so they carry
/// messages rather than sources.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModuleError {
    /// The module was killed before it ever became ready.
    #[error("Module unavailable")]
    Unavailable,

    /// The worker process exited unexpectedly.
    #[error("Module exited unexpectedly")]
    Failure,

    /// The worker could not load the requested transpiler (exit code 2).
    #[error("Transpiler module not found")]
    TranspilerMissing,

    /// An export or a result is not representable across the boundary.
    #[error("{0}")]
    Serialization(String),

    /// A call targeted a non-callable or removed export.
    #[error("{0}")]
    InvalidModuleType(String),

    /// A call was made after the module had been killed.
    #[error("Cannot execute killed module")]
    Killed,

    /// An error raised by the worker, forwarded verbatim.
    #[error("{0}")]
    Worker(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_error_messages() {
        assert_eq!(ModuleError::Killed.to_string(), "Cannot execute killed module");
        assert_eq!(ModuleError::Unavailable.to_string(), "Module unavailable");
        assert_eq!(
            ModuleError::InvalidModuleType(NOT_A_FUNCTION.to_string()).to_string(),
            NOT_A_FUNCTION
        );
        assert_eq!(ModuleError::Worker("boom".to_string()).to_string(), "boom");
    }
}
