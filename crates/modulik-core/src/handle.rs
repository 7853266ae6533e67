//! Caller-facing handle to a supervised module.
//!
//! The module is exposed as a future that is replaced on every restart cycle.
//! A generation settles at most once. A generation superseded while still
//! pending hands its waiters over to the next one.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::bridge::{Arg, DEFAULT_FUNCTION_ID, FUNCTION_MARKER, ReadinessData};
use crate::config::Config;
use crate::error::{Error, ModuleError, Result};
use crate::state::RestartAck;
use crate::supervisor::{Event, Supervisor};

/// Buffer size of the lifecycle event stream.
const LIFECYCLE_CHANNEL_CAPACITY: usize = 64;

/// Lifecycle notifications of a supervised module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// A restart cycle began; the module future was replaced.
    Restart,
    /// The module future resolved.
    Ready,
    /// The module future was rejected.
    Failed(ModuleError),
}

/// State of one module generation.
#[derive(Debug, Clone)]
pub(crate) enum Settlement {
    Pending,
    Ready(ReadinessData),
    Failed(ModuleError),
    /// Replaced before settling; waiters move on to the successor.
    Superseded(watch::Receiver<Settlement>),
}

/// Supervisor side of the module future.
#[derive(Debug)]
pub(crate) struct ModuleSlot {
    current: watch::Sender<Settlement>,
    generations: watch::Sender<watch::Receiver<Settlement>>,
}

impl ModuleSlot {
    pub(crate) fn new() -> (Self, watch::Receiver<watch::Receiver<Settlement>>) {
        let (current, first) = watch::channel(Settlement::Pending);
        let (generations, generations_rx) = watch::channel(first);
        (
            Self {
                current,
                generations,
            },
            generations_rx,
        )
    }

    /// Start a new generation.
    pub(crate) fn recreate(&mut self) {
        let (next, next_rx) = watch::channel(Settlement::Pending);
        let previous = std::mem::replace(&mut self.current, next);
        let successor = next_rx.clone();
        previous.send_if_modified(|settlement| match settlement {
            Settlement::Pending => {
                *settlement = Settlement::Superseded(successor);
                true
            }
            _ => false,
        });
        self.generations.send_replace(next_rx);
    }

    pub(crate) fn resolve(&self, readiness: ReadinessData) -> bool {
        self.settle(Settlement::Ready(readiness))
    }

    pub(crate) fn reject(&self, error: ModuleError) -> bool {
        self.settle(Settlement::Failed(error))
    }

    fn settle(&self, outcome: Settlement) -> bool {
        self.current.send_if_modified(|settlement| match settlement {
            Settlement::Pending => {
                *settlement = outcome;
                true
            }
            _ => false,
        })
    }
}

/// Follow a generation (and its successors) until it settles.
async fn settled(mut generation: watch::Receiver<Settlement>) -> std::result::Result<ReadinessData, ModuleError> {
    loop {
        let settlement = generation
            .wait_for(|settlement| !matches!(settlement, Settlement::Pending))
            .await
            .map(|settlement| settlement.clone());
        match settlement {
            Ok(Settlement::Ready(readiness)) => return Ok(readiness),
            Ok(Settlement::Failed(error)) => return Err(error),
            Ok(Settlement::Superseded(next)) => generation = next,
            Ok(Settlement::Pending) => {}
            // The supervisor is gone without settling this generation.
            Err(_) => return Err(ModuleError::Unavailable),
        }
    }
}

/// Proxy forwarding calls to one exported function of the current worker.
///
/// A proxy outlives restarts: calls always reach the current incarnation.
#[derive(Debug, Clone)]
pub struct FunctionProxy {
    function_id: Arc<str>,
    events: mpsc::UnboundedSender<Event>,
}

impl FunctionProxy {
    fn new(function_id: &str, events: &mpsc::UnboundedSender<Event>) -> Self {
        Self {
            function_id: Arc::from(function_id),
            events: events.clone(),
        }
    }

    /// `"default"` or the export name.
    pub fn function_id(&self) -> &str {
        &self.function_id
    }

    /// Call the function. Resolves with the worker's result.
    pub async fn call(&self, args: Vec<Arg>) -> std::result::Result<Value, ModuleError> {
        let (reply, result) = oneshot::channel();
        self.events
            .send(Event::Execute {
                function_id: self.function_id.to_string(),
                args,
                reply,
            })
            .map_err(|_| ModuleError::Killed)?;
        result.await.map_err(|_| ModuleError::Killed)?
    }

    /// Call with plain values and decode the result.
    pub async fn call_as<T: DeserializeOwned>(
        &self,
        args: impl IntoIterator<Item = Value>,
    ) -> std::result::Result<T, ModuleError> {
        let value = self.call(args.into_iter().map(Arg::Value).collect()).await?;
        serde_json::from_value(value).map_err(|e| ModuleError::Serialization(e.to_string()))
    }
}

/// Named exports of a module exporting at least one named function.
#[derive(Debug, Clone, Default)]
pub struct Exports {
    values: Map<String, Value>,
    functions: BTreeMap<String, FunctionProxy>,
}

impl Exports {
    pub fn value(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn function(&self, name: &str) -> Option<&FunctionProxy> {
        self.functions.get(name)
    }

    pub fn function_names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }
}

/// The current export surface of a module.
#[derive(Debug, Clone)]
pub enum Module {
    /// A plain exported value.
    Value(Value),
    /// A single (default) exported function.
    Function(FunctionProxy),
    /// Named exports, some of them functions.
    Exports(Exports),
}

impl Module {
    fn from_readiness(readiness: ReadinessData, events: &mpsc::UnboundedSender<Event>) -> Self {
        // A lone default function; a `default` among named exports stays named.
        let single_function = readiness.exported_function_ids.len() == 1
            && !matches!(readiness.body, Some(Value::Object(_)));
        if single_function && readiness.is_callable(DEFAULT_FUNCTION_ID) {
            return Module::Function(FunctionProxy::new(DEFAULT_FUNCTION_ID, events));
        }
        if !readiness.exports_functions() {
            return Module::Value(readiness.body.unwrap_or(Value::Null));
        }

        let mut exports = Exports::default();
        if let Some(Value::Object(body)) = readiness.body {
            for (name, value) in body {
                let is_function = value.as_str() == Some(FUNCTION_MARKER);
                if !(is_function && readiness.exported_function_ids.contains(&name)) {
                    exports.values.insert(name, value);
                }
            }
        }
        for name in &readiness.exported_function_ids {
            exports
                .functions
                .insert(name.clone(), FunctionProxy::new(name, events));
        }
        Module::Exports(exports)
    }

    /// The exported value, if the module exports a plain value.
    pub fn value(&self) -> Option<&Value> {
        match self {
            Module::Value(value) => Some(value),
            _ => None,
        }
    }

    /// The default function, if the module exports one.
    pub fn as_function(&self) -> Option<&FunctionProxy> {
        match self {
            Module::Function(proxy) => Some(proxy),
            _ => None,
        }
    }

    /// A function by id: `"default"` or a named export.
    pub fn function(&self, name: &str) -> Option<&FunctionProxy> {
        match self {
            Module::Function(proxy) if name == DEFAULT_FUNCTION_ID => Some(proxy),
            Module::Exports(exports) => exports.function(name),
            _ => None,
        }
    }
}

/// Handle to a module running under supervision.
///
/// Dropping the handle kills the module.
#[derive(Debug)]
pub struct ModuleHandle {
    events: mpsc::UnboundedSender<Event>,
    generations: watch::Receiver<watch::Receiver<Settlement>>,
    lifecycle: broadcast::Sender<LifecycleEvent>,
}

impl ModuleHandle {
    /// Start supervising the module described by `config`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn launch(config: Config) -> Result<Self> {
        let config = config.finalize()?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Config(format!("no tokio runtime: {}", e)))?;

        let (events, events_rx) = mpsc::unbounded_channel();
        let (slot, generations) = ModuleSlot::new();
        let (lifecycle, _) = broadcast::channel(LIFECYCLE_CHANNEL_CAPACITY);

        tracing::debug!(module = %config.path.display(), "Launching module");
        let supervisor = Supervisor::new(config, events.clone(), slot, lifecycle.clone());
        runtime.spawn(supervisor.run(events_rx));
        let _ = events.send(Event::Start);

        Ok(Self {
            events,
            generations,
            lifecycle,
        })
    }

    /// The current module.
    ///
    /// The returned future follows restarts that begin before it settles.
    pub fn module(&self) -> impl Future<Output = std::result::Result<Module, ModuleError>> + Send + 'static {
        let generation = self.generations.borrow().clone();
        let events = self.events.clone();
        async move {
            let readiness = settled(generation).await?;
            Ok(Module::from_readiness(readiness, &events))
        }
    }

    /// Restart the worker and wait for the new module.
    ///
    /// Restarting a killed module is a no-op.
    pub async fn restart(&self) -> std::result::Result<(), ModuleError> {
        let (reply, ack) = oneshot::channel();
        if self.events.send(Event::Restart { reply }).is_err() {
            return Ok(());
        }
        match ack.await {
            Ok(Ok(RestartAck::Respawning)) => self.module().await.map(|_| ()),
            Ok(Ok(RestartAck::Ignored)) | Err(_) => Ok(()),
            Ok(Err(error)) => Err(error),
        }
    }

    /// Stop the worker and the watcher for good. Idempotent.
    pub async fn kill(&self) {
        let (reply, done) = oneshot::channel();
        if self.events.send(Event::Kill { reply }).is_ok() {
            let _ = done.await;
        }
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.lifecycle.subscribe()
    }
}

impl Drop for ModuleHandle {
    fn drop(&mut self) {
        let _ = self.events.send(Event::HandleDropped);
    }
}
