//! Configuration for a supervised module.
//!
//! A [`Config`] is finalized once, before launch, and read-only afterwards.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Environment variable overriding the worker entry location.
pub const WORKER_PATH_ENV: &str = "MODULIK_WORKER_PATH";

/// Default debounce window for source change notifications.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(100);

/// Default grace period between the termination signal and a forced kill.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// The executable that hosts the managed module.
///
/// It is invoked as `<program> <args>... <module path> [<transpiler>]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerEntry {
    /// Worker executable.
    pub program: PathBuf,
    /// Fixed leading arguments.
    pub args: Vec<OsString>,
}

impl WorkerEntry {
    /// Create an entry for the given executable.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Append a fixed leading argument.
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Locate a worker binary by name.
    ///
    /// Looks in the following order:
    /// 1. `MODULIK_WORKER_PATH` environment variable
    /// 2. Same directory as the current executable
    /// 3. System PATH
    pub fn discover(name: &str) -> Result<Self> {
        if let Ok(path) = std::env::var(WORKER_PATH_ENV) {
            let path = PathBuf::from(path);
            if path.exists() {
                return Ok(Self::new(path));
            }
        }

        let file_name = if cfg!(windows) {
            format!("{name}.exe")
        } else {
            name.to_string()
        };

        if let Ok(exe_path) = std::env::current_exe()
            && let Some(exe_dir) = exe_path.parent()
        {
            let candidate = exe_dir.join(&file_name);
            if candidate.exists() {
                return Ok(Self::new(candidate));
            }
        }

        if let Ok(path) = which::which(&file_name) {
            return Ok(Self::new(path));
        }

        Err(Error::Config(format!(
            "could not find worker binary '{name}'. Set {WORKER_PATH_ENV} or ensure it's in PATH."
        )))
    }
}

/// Configuration of one supervised module.
#[derive(Debug, Clone)]
pub struct Config {
    /// Module source handed to the worker entry.
    pub path: PathBuf,
    /// Worker entry hosting the module.
    pub worker: WorkerEntry,
    /// Optional transpiler directive forwarded to the worker.
    pub transpiler: Option<String>,
    /// Extra paths whose changes restart the module.
    pub watch: Vec<PathBuf>,
    /// Skip filesystem watching entirely.
    pub disabled: bool,
    /// Suppress lifecycle notices.
    pub quiet: bool,
    /// Debounce window for change notifications.
    pub debounce: Duration,
    /// Grace period before a stopping worker is force-killed.
    pub stop_timeout: Duration,
}

impl Config {
    /// Create a configuration with defaults for everything but the module and its worker.
    pub fn new(path: impl Into<PathBuf>, worker: WorkerEntry) -> Self {
        Self {
            path: path.into(),
            worker,
            transpiler: None,
            watch: Vec::new(),
            disabled: false,
            quiet: false,
            debounce: DEFAULT_DEBOUNCE,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }

    pub fn with_transpiler(mut self, transpiler: impl Into<String>) -> Self {
        self.transpiler = Some(transpiler.into());
        self
    }

    pub fn watch(mut self, path: impl Into<PathBuf>) -> Self {
        self.watch.push(path.into());
        self
    }

    pub fn disabled(mut self, disabled: bool) -> Self {
        self.disabled = disabled;
        self
    }

    pub fn quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn with_stop_timeout(mut self, stop_timeout: Duration) -> Self {
        self.stop_timeout = stop_timeout;
        self
    }

    /// Validate the configuration and make every path absolute.
    pub fn finalize(mut self) -> Result<Self> {
        if self.path.as_os_str().is_empty() {
            return Err(Error::Config("invalid module path".to_string()));
        }
        if self.worker.program.as_os_str().is_empty() {
            return Err(Error::Config("invalid worker entry".to_string()));
        }

        self.path = absolutize(&self.path)?;
        let mut watch = Vec::with_capacity(self.watch.len() + 1);
        for path in std::iter::once(&self.path).chain(self.watch.iter()) {
            let path = absolutize(path)?;
            if !watch.contains(&path) {
                watch.push(path);
            }
        }
        self.watch = watch;

        Ok(self)
    }

    /// File name of the module, used to label log lines.
    pub fn module_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| self.path.display().to_string())
    }
}

fn absolutize(path: &Path) -> Result<PathBuf> {
    if let Ok(canonical) = path.canonicalize() {
        return Ok(canonical);
    }
    Ok(std::path::absolute(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finalize_includes_module_path_once() {
        let temp = tempfile::TempDir::new().unwrap();
        let module = temp.path().join("module.json");
        std::fs::write(&module, "1").unwrap();

        let config = Config::new(&module, WorkerEntry::new("worker"))
            .watch(&module)
            .watch(temp.path())
            .finalize()
            .unwrap();

        let module = module.canonicalize().unwrap();
        assert_eq!(config.path, module);
        assert_eq!(config.watch.len(), 2);
        assert_eq!(config.watch[0], module);
        assert_eq!(config.module_name(), "module.json");
    }

    #[test]
    fn test_finalize_rejects_empty_path() {
        let result = Config::new("", WorkerEntry::new("worker")).finalize();
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_relative_paths_become_absolute() {
        let config = Config::new("does/not/exist.json", WorkerEntry::new("worker"))
            .finalize()
            .unwrap();
        assert!(config.path.is_absolute());
        assert!(config.watch.iter().all(|path| path.is_absolute()));
    }
}
