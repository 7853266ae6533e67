//! Runtime for worker binaries.
//!
//! A worker declares its exports as a [`WorkerModule`] and hands it to
//! [`serve`], which reports readiness and answers calls over stdin/stdout.
//!
//! ```no_run
//! use modulik_core::worker::{self, Function, WorkerModule};
//!
//! #[tokio::main]
//! async fn main() -> modulik_core::Result<()> {
//!     let greet = Function::new(|args| async move {
//!         let name = args.value(0).and_then(|v| v.as_str()).unwrap_or("world").to_string();
//!         Ok::<_, String>(format!("Hello, {name}!"))
//!     });
//!     worker::serve(WorkerModule::function(greet)).await
//! }
//! ```

mod callbacks;

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use crate::bridge::args::unmarshal;
use crate::bridge::{
    Arg, DEFAULT_FUNCTION_ID, ExecutionOutcome, FUNCTION_MARKER, HostMessage, ReadinessData,
    WorkerMessage, guard, read_message, write_message,
};
use crate::error::{Error, NOT_A_FUNCTION, RESULT_NOT_SERIALIZABLE, Result};

pub use crate::state::TRANSPILER_MISSING_EXIT_CODE;
pub use callbacks::RemoteCallback;

use callbacks::CallbackRegistry;

/// A call argument as received by a worker.
pub type WorkerArg = Arg<RemoteCallback>;

/// What a worker was asked to load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerEnv {
    /// Module source path.
    pub source: PathBuf,
    /// Transpiler directive, if any.
    pub transpiler: Option<String>,
}

impl WorkerEnv {
    /// Parse the process arguments: `<source> [transpiler]`.
    pub fn from_args() -> Result<Self> {
        Self::parse(std::env::args_os().skip(1))
    }

    pub fn parse(args: impl IntoIterator<Item = OsString>) -> Result<Self> {
        let mut args = args.into_iter();
        let source = args
            .next()
            .map(PathBuf::from)
            .ok_or_else(|| Error::Config("missing module source argument".to_string()))?;
        let transpiler = args.next().map(|t| t.to_string_lossy().to_string());
        Ok(Self { source, transpiler })
    }
}

/// Arguments of one call.
#[derive(Debug, Clone, Default)]
pub struct CallArgs {
    args: Vec<WorkerArg>,
}

impl CallArgs {
    pub fn new(args: Vec<WorkerArg>) -> Self {
        Self { args }
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&WorkerArg> {
        self.args.get(index)
    }

    /// The plain value at `index`.
    pub fn value(&self, index: usize) -> Option<&Value> {
        self.get(index).and_then(Arg::as_value)
    }

    /// The top-level callback at `index`.
    pub fn callback(&self, index: usize) -> Option<&RemoteCallback> {
        self.get(index).and_then(Arg::as_callback)
    }

    pub fn iter(&self) -> impl Iterator<Item = &WorkerArg> {
        self.args.iter()
    }

    pub fn into_inner(self) -> Vec<WorkerArg> {
        self.args
    }
}

type FunctionFn = dyn Fn(CallArgs) -> BoxFuture<'static, ExecutionOutcome> + Send + Sync;

/// An exported function.
#[derive(Clone)]
pub struct Function {
    inner: Arc<FunctionFn>,
}

impl Function {
    /// Wrap an async function. Its result is checked before it is sent back.
    pub fn new<F, Fut, T, E>(f: F) -> Self
    where
        F: Fn(CallArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        T: Serialize + DeserializeOwned + PartialEq,
        E: fmt::Display,
    {
        Self {
            inner: Arc::new(move |args| {
                f(args)
                    .map(|result| ExecutionOutcome::from_result(result, RESULT_NOT_SERIALIZABLE))
                    .boxed()
            }),
        }
    }

    fn invoke(&self, args: CallArgs) -> BoxFuture<'static, ExecutionOutcome> {
        (self.inner)(args)
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Function").finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
enum Export {
    /// `None` when the value failed its round-trip check.
    Value(Option<Value>),
    Function(Function),
}

impl Export {
    fn value<T>(value: &T) -> Self
    where
        T: Serialize + DeserializeOwned + PartialEq,
    {
        Export::Value(guard::verify(value).ok())
    }
}

#[derive(Debug, Clone)]
enum Shape {
    Single(Export),
    Named(BTreeMap<String, Export>),
}

/// The export surface of a worker.
#[derive(Debug, Clone)]
pub struct WorkerModule {
    shape: Shape,
}

impl WorkerModule {
    /// Export a single value.
    pub fn value<T>(value: &T) -> Self
    where
        T: Serialize + DeserializeOwned + PartialEq,
    {
        Self {
            shape: Shape::Single(Export::value(value)),
        }
    }

    /// Export a single (default) function.
    pub fn function(function: Function) -> Self {
        Self {
            shape: Shape::Single(Export::Function(function)),
        }
    }

    /// Start an empty set of named exports.
    pub fn named() -> Self {
        Self {
            shape: Shape::Named(BTreeMap::new()),
        }
    }

    /// Add a named value export.
    pub fn with_value<T>(self, name: impl Into<String>, value: &T) -> Self
    where
        T: Serialize + DeserializeOwned + PartialEq,
    {
        self.with(name.into(), Export::value(value))
    }

    /// Add a named function export.
    pub fn with_function(self, name: impl Into<String>, function: Function) -> Self {
        self.with(name.into(), Export::Function(function))
    }

    fn with(mut self, name: String, export: Export) -> Self {
        if !matches!(self.shape, Shape::Named(_)) {
            self.shape = Shape::Named(BTreeMap::new());
        }
        if let Shape::Named(exports) = &mut self.shape {
            exports.insert(name, export);
        }
        self
    }

    /// The readiness report for this module.
    pub fn readiness(&self) -> ReadinessData {
        match &self.shape {
            Shape::Single(Export::Function(_)) => ReadinessData {
                body: Some(Value::String(FUNCTION_MARKER.to_string())),
                serializable: true,
                exported_function_ids: [DEFAULT_FUNCTION_ID.to_string()].into(),
            },
            Shape::Single(Export::Value(value)) => ReadinessData {
                body: value.clone(),
                serializable: value.is_some(),
                exported_function_ids: Default::default(),
            },
            Shape::Named(exports) => {
                let mut body = Map::new();
                let mut serializable = true;
                let mut exported_function_ids = std::collections::BTreeSet::new();
                for (name, export) in exports {
                    match export {
                        Export::Function(_) => {
                            exported_function_ids.insert(name.clone());
                            body.insert(name.clone(), Value::String(FUNCTION_MARKER.to_string()));
                        }
                        Export::Value(Some(value)) => {
                            body.insert(name.clone(), value.clone());
                        }
                        Export::Value(None) => serializable = false,
                    }
                }
                ReadinessData {
                    body: serializable.then_some(Value::Object(body)),
                    serializable,
                    exported_function_ids,
                }
            }
        }
    }

    fn function_for(&self, function_id: &str) -> Option<&Function> {
        match &self.shape {
            Shape::Single(Export::Function(function)) if function_id == DEFAULT_FUNCTION_ID => {
                Some(function)
            }
            Shape::Named(exports) => match exports.get(function_id) {
                Some(Export::Function(function)) => Some(function),
                _ => None,
            },
            _ => None,
        }
    }
}

/// Serve `module` over stdin/stdout until the host closes stdin or sends SIGTERM.
pub async fn serve(module: WorkerModule) -> Result<()> {
    let stdin = tokio::io::stdin();
    let stdout = tokio::io::stdout();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            result = serve_on(module, stdin, stdout) => result,
            _ = terminate.recv() => {
                tracing::debug!("Received SIGTERM, shutting down");
                Ok(())
            }
        }
    }

    #[cfg(not(unix))]
    {
        serve_on(module, stdin, stdout).await
    }
}

/// Serve `module` over an arbitrary byte stream pair.
pub async fn serve_on<R, W>(module: WorkerModule, mut reader: R, writer: W) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (outbox, mut outgoing) = mpsc::unbounded_channel::<WorkerMessage>();
    tokio::spawn(async move {
        let mut writer = writer;
        while let Some(message) = outgoing.recv().await {
            if let Err(e) = write_message(&mut writer, &message).await {
                tracing::error!("Failed to answer host: {}", e);
                break;
            }
        }
    });

    let callbacks = CallbackRegistry::new(outbox.clone());
    callbacks.clear();

    let module = Arc::new(module);
    let _ = outbox.send(WorkerMessage::Ready(module.readiness()));

    while let Some(message) = read_message::<_, HostMessage>(&mut reader).await? {
        match message {
            HostMessage::Execute {
                function_id,
                execution_id,
                args,
            } => {
                let args = unmarshal(args, |id| callbacks.register(id));
                let module = Arc::clone(&module);
                let outbox = outbox.clone();
                tokio::spawn(async move {
                    let result = match module.function_for(&function_id) {
                        Some(function) => function.invoke(CallArgs::new(args)).await,
                        None => ExecutionOutcome::failure(NOT_A_FUNCTION),
                    };
                    let _ = outbox.send(WorkerMessage::ExecutionResult {
                        execution_id,
                        result,
                    });
                });
            }
            HostMessage::CallbackExecutionResult {
                execution_id,
                result,
            } => callbacks.complete(execution_id, result),
        }
    }

    tracing::debug!("Host closed the connection");
    Ok(())
}
